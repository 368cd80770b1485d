use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::info;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::schema::branches;
use crate::state::audit_db::{self, AuditOperation, AuditRecord};
use crate::state::versions_db;

#[derive(Identifiable, Queryable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = branches)]
#[serde(rename_all = "camelCase")]
pub struct BranchRow {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub description: Option<String>,
    pub diverged_at: Option<DateTime<Utc>>,
    pub is_pinned: bool,
    pub color: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl BranchRow {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(Insertable)]
#[diesel(table_name = branches)]
struct NewBranch {
    id: Uuid,
    campaign_id: Uuid,
    parent_id: Option<Uuid>,
    name: String,
    description: Option<String>,
    diverged_at: Option<DateTime<Utc>>,
    is_pinned: bool,
    color: Option<String>,
    tags: Vec<String>,
}

/// Creation parameters; everything beyond the name is optional.
#[derive(Debug, Clone, Default)]
pub struct BranchInput {
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
    pub diverged_at: Option<DateTime<Utc>>,
    pub is_pinned: bool,
    pub color: Option<String>,
    pub tags: Vec<String>,
}

/// Updatable metadata. Parentage is fixed at creation; only fork makes
/// children.
#[derive(Debug, Clone, Default)]
pub struct BranchUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_pinned: Option<bool>,
    pub color: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// One step of a branch's ancestry walk, child first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AncestryBranch {
    pub branch_id: Uuid,
    pub diverged_at: Option<DateTime<Utc>>,
}

/// `#rrggbb`, lowercase or upper.
pub(crate) fn check_color(color: &str) -> Result<(), String> {
    let rest = color
        .strip_prefix('#')
        .ok_or_else(|| format!("color '{color}' must start with '#'"))?;
    if rest.len() != 6 || !rest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("color '{color}' is not a hex color"));
    }
    Ok(())
}

pub fn get(conn: &mut PgConnection, id: Uuid) -> CoreResult<BranchRow> {
    use crate::schema::branches::dsl as branches;

    branches::branches
        .find(id)
        .filter(branches::deleted_at.is_null())
        .first(conn)
        .optional()?
        .ok_or(CoreError::BranchNotFound(id))
}

fn live_branches(conn: &mut PgConnection, campaign_id: Uuid) -> CoreResult<Vec<BranchRow>> {
    use crate::schema::branches::dsl as branches;

    Ok(branches::branches
        .filter(branches::campaign_id.eq(campaign_id))
        .filter(branches::deleted_at.is_null())
        .order(branches::created_at.asc())
        .load(conn)?)
}

fn name_taken(
    conn: &mut PgConnection,
    campaign_id: Uuid,
    name: &str,
    ignore: Option<Uuid>,
) -> CoreResult<bool> {
    use crate::schema::branches::dsl as branches;

    let mut query = branches::branches
        .filter(branches::campaign_id.eq(campaign_id))
        .filter(branches::deleted_at.is_null())
        .filter(branches::name.eq(name))
        .into_boxed();
    if let Some(ignore) = ignore {
        query = query.filter(branches::id.ne(ignore));
    }
    Ok(query.count().get_result::<i64>(conn)? > 0)
}

fn check_input(conn: &mut PgConnection, campaign_id: Uuid, input: &BranchInput) -> CoreResult<()> {
    if input.name.trim().is_empty() {
        return Err(CoreError::validation("branch name cannot be empty"));
    }
    if name_taken(conn, campaign_id, &input.name, None)? {
        return Err(CoreError::validation(format!(
            "branch name '{}' is already used in this campaign",
            input.name
        )));
    }
    if let Some(color) = &input.color {
        check_color(color).map_err(CoreError::Validation)?;
    }
    if let Some(diverged_at) = input.diverged_at {
        // divergedAt is world time, so "now" is the campaign clock
        let current = crate::state::campaigns_db::get_campaign(conn, campaign_id)?
            .current_world_time;
        if matches!(current, Some(now) if diverged_at > now) {
            return Err(CoreError::validation(
                "divergedAt cannot be past the campaign's current world time",
            ));
        }
    }
    if let Some(parent_id) = input.parent_id {
        let parent = get(conn, parent_id)?;
        if parent.campaign_id != campaign_id {
            return Err(CoreError::validation(
                "parent branch belongs to a different campaign",
            ));
        }
    }
    Ok(())
}

pub fn create(
    conn: &mut PgConnection,
    campaign_id: Uuid,
    input: BranchInput,
    actor: Uuid,
) -> CoreResult<BranchRow> {
    use crate::schema::branches::dsl as branches;

    conn.transaction(|conn| {
        check_input(conn, campaign_id, &input)?;
        let row: BranchRow = diesel::insert_into(branches::branches)
            .values(NewBranch {
                id: Uuid::new_v4(),
                campaign_id,
                parent_id: input.parent_id,
                name: input.name,
                description: input.description,
                diverged_at: input.diverged_at,
                is_pinned: input.is_pinned,
                color: input.color,
                tags: input.tags,
            })
            .get_result(conn)?;
        audit_db::record(
            conn,
            AuditRecord::new("branch", row.id, AuditOperation::Create, actor)
                .with_states(None, Some(serde_json::to_value(&row).unwrap_or_default())),
        )?;
        Ok(row)
    })
}

pub fn update(
    conn: &mut PgConnection,
    id: Uuid,
    changes: BranchUpdate,
    actor: Uuid,
) -> CoreResult<BranchRow> {
    use crate::schema::branches::dsl as branches;

    conn.transaction(|conn| {
        let before = get(conn, id)?;
        if let Some(name) = &changes.name {
            if name.trim().is_empty() {
                return Err(CoreError::validation("branch name cannot be empty"));
            }
            if name_taken(conn, before.campaign_id, name, Some(id))? {
                return Err(CoreError::validation(format!(
                    "branch name '{name}' is already used in this campaign"
                )));
            }
        }
        if let Some(color) = &changes.color {
            check_color(color).map_err(CoreError::Validation)?;
        }

        let row: BranchRow = diesel::update(branches::branches.find(id))
            .set((
                branches::name.eq(changes.name.unwrap_or(before.name.clone())),
                branches::description.eq(changes
                    .description
                    .clone()
                    .or(before.description.clone())),
                branches::is_pinned.eq(changes.is_pinned.unwrap_or(before.is_pinned)),
                branches::color.eq(changes.color.clone().or(before.color.clone())),
                branches::tags.eq(changes.tags.unwrap_or(before.tags.clone())),
            ))
            .get_result(conn)?;
        audit_db::record(
            conn,
            AuditRecord::new("branch", id, AuditOperation::Update, actor).with_states(
                Some(serde_json::to_value(&before).unwrap_or_default()),
                Some(serde_json::to_value(&row).unwrap_or_default()),
            ),
        )?;
        Ok(row)
    })
}

/// Soft-deletes a branch. Roots and branches with live children refuse.
pub fn delete(conn: &mut PgConnection, id: Uuid, actor: Uuid) -> CoreResult<()> {
    use crate::schema::branches::dsl as branches;

    conn.transaction(|conn| {
        let row = get(conn, id)?;
        if row.is_root() {
            return Err(CoreError::validation("the root branch cannot be deleted"));
        }
        let live_children: i64 = branches::branches
            .filter(branches::parent_id.eq(id))
            .filter(branches::deleted_at.is_null())
            .count()
            .get_result(conn)?;
        if live_children > 0 {
            return Err(CoreError::validation(format!(
                "branch '{}' still has {live_children} live child branch(es)",
                row.name
            )));
        }
        diesel::update(branches::branches.find(id))
            .set(branches::deleted_at.eq(Some(Utc::now())))
            .execute(conn)?;
        audit_db::record(
            conn,
            AuditRecord::new("branch", id, AuditOperation::Delete, actor)
                .with_states(Some(serde_json::to_value(&row).unwrap_or_default()), None),
        )?;
        Ok(())
    })
}

/// Ancestry `[branch, parent, ..., root]` from already-loaded rows. A parent
/// that is missing or soft-deleted ends the walk there, and a repeated id
/// (impossible by construction, but the walk is defensive) does too.
pub fn ancestry_from_rows(rows: &[BranchRow], branch_id: Uuid) -> CoreResult<Vec<AncestryBranch>> {
    let by_id: HashMap<Uuid, &BranchRow> = rows.iter().map(|row| (row.id, row)).collect();
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(branch_id);

    while let Some(id) = current {
        if !seen.insert(id) {
            return Err(CoreError::integrity(format!(
                "branch ancestry of {branch_id} loops at {id}"
            )));
        }
        let Some(row) = by_id.get(&id).filter(|row| row.is_live()) else {
            break;
        };
        chain.push(AncestryBranch {
            branch_id: row.id,
            diverged_at: row.diverged_at,
        });
        current = row.parent_id;
    }

    if chain.is_empty() {
        return Err(CoreError::BranchNotFound(branch_id));
    }
    Ok(chain)
}

pub fn ancestry(conn: &mut PgConnection, branch_id: Uuid) -> CoreResult<Vec<AncestryBranch>> {
    let branch = get(conn, branch_id)?;
    let rows = live_branches(conn, branch.campaign_id)?;
    ancestry_from_rows(&rows, branch_id)
}

/// One node of the branch tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchNode {
    pub branch: BranchRow,
    pub children: Vec<BranchNode>,
}

/// Builds the campaign's branch tree. A live branch whose parent is deleted
/// or missing surfaces as an extra root rather than disappearing.
pub fn build_hierarchy(rows: &[BranchRow]) -> Vec<BranchNode> {
    let live_ids: HashSet<Uuid> = rows
        .iter()
        .filter(|row| row.is_live())
        .map(|row| row.id)
        .collect();
    let mut children_of: HashMap<Uuid, Vec<&BranchRow>> = HashMap::new();
    let mut roots: Vec<&BranchRow> = Vec::new();

    for row in rows.iter().filter(|row| row.is_live()) {
        match row.parent_id {
            Some(parent_id) if live_ids.contains(&parent_id) => {
                children_of.entry(parent_id).or_default().push(row);
            }
            _ => roots.push(row),
        }
    }

    fn build(row: &BranchRow, children_of: &HashMap<Uuid, Vec<&BranchRow>>) -> BranchNode {
        let children = children_of
            .get(&row.id)
            .map(|children| {
                children
                    .iter()
                    .map(|child| build(child, children_of))
                    .collect()
            })
            .unwrap_or_default();
        BranchNode {
            branch: row.clone(),
            children,
        }
    }

    roots.into_iter().map(|row| build(row, &children_of)).collect()
}

pub fn hierarchy(conn: &mut PgConnection, campaign_id: Uuid) -> CoreResult<Vec<BranchNode>> {
    let rows = live_branches(conn, campaign_id)?;
    Ok(build_hierarchy(&rows))
}

/// Result of a fork.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkOutcome {
    pub branch: BranchRow,
    pub versions_copied: usize,
}

/// Creates a child branch at `world_time` and copies every entity version
/// resolvable in the source's ancestry at that time, byte for byte. One
/// transaction; any failure rolls the whole fork back.
pub fn fork(
    conn: &mut PgConnection,
    source_branch_id: Uuid,
    name: String,
    description: Option<String>,
    world_time: DateTime<Utc>,
    actor: Uuid,
) -> CoreResult<ForkOutcome> {
    conn.transaction(|conn| {
        let source = get(conn, source_branch_id)?;
        let branch = create(
            conn,
            source.campaign_id,
            BranchInput {
                name,
                description,
                parent_id: Some(source_branch_id),
                diverged_at: Some(world_time),
                ..BranchInput::default()
            },
            actor,
        )?;

        let chain = ancestry(conn, source_branch_id)?;
        let by_entity = versions_db::load_chain_candidates(conn, &chain, world_time)?;

        let mut versions_copied = 0;
        for (entity, candidates) in by_entity {
            let Some(resolved) =
                versions_db::resolve_from_candidates(&chain, &candidates, world_time)
            else {
                continue;
            };
            versions_db::insert_raw(
                conn,
                entity,
                branch.id,
                world_time,
                resolved.version,
                resolved.payload_gz,
                actor,
            )?;
            versions_copied += 1;
        }

        audit_db::record(
            conn,
            AuditRecord::new("branch", branch.id, AuditOperation::Fork, actor).with_reason(
                format!(
                    "forked from '{}' at {}, {versions_copied} version(s) copied",
                    source.name,
                    world_time.to_rfc3339()
                ),
            ),
        )?;
        info!(
            "forked branch '{}' from '{}' ({versions_copied} version(s))",
            branch.name, source.name
        );
        Ok(ForkOutcome {
            branch,
            versions_copied,
        })
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn row(id: Uuid, parent_id: Option<Uuid>, name: &str) -> BranchRow {
        BranchRow {
            id,
            campaign_id: Uuid::nil(),
            parent_id,
            name: name.to_string(),
            description: None,
            diverged_at: parent_id
                .map(|_| Utc.with_ymd_and_hms(4707, 3, 10, 0, 0, 0).unwrap()),
            is_pinned: false,
            color: None,
            tags: Vec::new(),
            created_at: Utc.with_ymd_and_hms(4707, 1, 1, 0, 0, 0).unwrap(),
            deleted_at: None,
        }
    }

    #[test]
    fn colors_must_be_hex() {
        assert!(check_color("#a1B2c3").is_ok());
        assert!(check_color("a1b2c3").is_err());
        assert!(check_color("#a1b2c").is_err());
        assert!(check_color("#a1b2cg").is_err());
    }

    #[test]
    fn ancestry_runs_child_to_root() {
        let root = Uuid::new_v4();
        let mid = Uuid::new_v4();
        let leaf = Uuid::new_v4();
        let rows = vec![
            row(root, None, "main"),
            row(mid, Some(root), "what-if"),
            row(leaf, Some(mid), "deeper"),
        ];
        let chain = ancestry_from_rows(&rows, leaf).unwrap();
        assert_eq!(
            chain.iter().map(|link| link.branch_id).collect::<Vec<_>>(),
            vec![leaf, mid, root]
        );
        assert!(chain[0].diverged_at.is_some());
        assert!(chain[2].diverged_at.is_none());
    }

    #[test]
    fn ancestry_of_unknown_branches_is_not_found() {
        let rows = vec![row(Uuid::new_v4(), None, "main")];
        assert!(matches!(
            ancestry_from_rows(&rows, Uuid::new_v4()),
            Err(CoreError::BranchNotFound(_))
        ));
    }

    #[test]
    fn hierarchy_nests_children_under_parents() {
        let root = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let rows = vec![
            row(root, None, "main"),
            row(a, Some(root), "a"),
            row(b, Some(a), "b"),
        ];
        let tree = build_hierarchy(&rows);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].branch.name, "main");
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].children[0].branch.name, "b");
    }

    #[test]
    fn orphaned_branches_surface_as_roots() {
        let root = Uuid::new_v4();
        let orphan = Uuid::new_v4();
        let mut deleted_root = row(root, None, "main");
        deleted_root.deleted_at = Some(Utc::now());
        let rows = vec![deleted_root, row(orphan, Some(root), "survivor")];
        let tree = build_hierarchy(&rows);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].branch.name, "survivor");
        assert!(tree[0].children.is_empty());
    }

    #[test]
    fn hierarchy_skips_soft_deleted_branches() {
        let root = Uuid::new_v4();
        let gone = Uuid::new_v4();
        let mut deleted = row(gone, Some(root), "gone");
        deleted.deleted_at = Some(Utc::now());
        let rows = vec![row(root, None, "main"), deleted];
        let tree = build_hierarchy(&rows);
        assert_eq!(tree.len(), 1);
        assert!(tree[0].children.is_empty());
    }
}
