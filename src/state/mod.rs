mod audit_db;
mod branches_db;
mod campaigns_db;
mod entities_db;
mod rules_db;
mod state_interface;
mod versions_db;

pub use audit_db::{
    export as export_audit, AuditEntry, AuditFilter, AuditOperation, AuditPage, AuditRecord,
    ExportFormat,
};
pub use branches_db::{
    build_hierarchy, AncestryBranch, BranchInput, BranchNode, BranchRow, BranchUpdate,
    ForkOutcome,
};
pub use campaigns_db::{
    add_member, advance_world_time, check_advance, create_campaign, create_world, get_campaign,
    get_world, membership_role, CampaignRow, WorldRow,
};
pub use entities_db::{get_row as entity_row, EntityRow};
pub use rules_db::LinkRow;
pub use state_interface::{ChangeSet, MergePreview, MergeResult, StateInterface};
pub use versions_db::{resolve_from_candidates, StoredVersion};
