use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::schema::audit_log;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, DbEnum, Serialize, Deserialize, strum::Display,
)]
#[ExistingTypePath = "crate::schema::sql_types::AuditOp"]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOperation {
    Create,
    Update,
    Delete,
    Archive,
    Restore,
    Fork,
    Merge,
}

#[derive(Insertable)]
#[diesel(table_name = audit_log)]
pub(crate) struct NewAuditEntry {
    pub entity_type: String,
    pub entity_id: Uuid,
    pub operation: AuditOperation,
    pub actor_id: Uuid,
    pub previous_state: Option<serde_json::Value>,
    pub new_state: Option<serde_json::Value>,
    pub diff: Option<serde_json::Value>,
    pub reason: Option<String>,
}

/// One append-only record of a mutation. `entity_type` is free-form text so
/// branch and campaign operations audit alongside versioned entities.
#[derive(Identifiable, Queryable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = audit_log)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub operation: AuditOperation,
    pub actor_id: Uuid,
    pub previous_state: Option<serde_json::Value>,
    pub new_state: Option<serde_json::Value>,
    pub diff: Option<serde_json::Value>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What to record; the store fills ids and timestamps.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub entity_type: String,
    pub entity_id: Uuid,
    pub operation: AuditOperation,
    pub actor: Uuid,
    pub previous_state: Option<serde_json::Value>,
    pub new_state: Option<serde_json::Value>,
    pub reason: Option<String>,
}

impl AuditRecord {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: Uuid,
        operation: AuditOperation,
        actor: Uuid,
    ) -> Self {
        AuditRecord {
            entity_type: entity_type.into(),
            entity_id,
            operation,
            actor,
            previous_state: None,
            new_state: None,
            reason: None,
        }
    }

    pub fn with_states(
        mut self,
        previous: Option<serde_json::Value>,
        new: Option<serde_json::Value>,
    ) -> Self {
        self.previous_state = previous;
        self.new_state = new;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Appends one entry. Callers run this inside the mutation's transaction so
/// the audit trail and the change commit or roll back together.
pub fn record(conn: &mut PgConnection, entry: AuditRecord) -> CoreResult<AuditEntry> {
    use crate::schema::audit_log::dsl as audit;

    let diff = match (&entry.previous_state, &entry.new_state) {
        (Some(previous), Some(new)) => Some(crate::merge::payload_diff(previous, new)),
        _ => None,
    };
    let row: AuditEntry = diesel::insert_into(audit::audit_log)
        .values(NewAuditEntry {
            entity_type: entry.entity_type,
            entity_id: entry.entity_id,
            operation: entry.operation,
            actor_id: entry.actor,
            previous_state: entry.previous_state,
            new_state: entry.new_state,
            diff,
            reason: entry.reason,
        })
        .get_result(conn)?;
    Ok(row)
}

/// Query filter; all fields conjunctive.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<Uuid>,
    pub entity_type: Option<String>,
    pub entity_id: Option<Uuid>,
    pub operation: Option<AuditOperation>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// One page of audit results, newest first. `next_cursor` is the id to pass
/// back to continue the scan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPage {
    pub entries: Vec<AuditEntry>,
    pub next_cursor: Option<i64>,
}

macro_rules! filtered_audit_query {
    ($filter:expr) => {{
        use crate::schema::audit_log::dsl as audit;

        let mut query = audit::audit_log.into_boxed();
        if let Some(actor) = $filter.actor {
            query = query.filter(audit::actor_id.eq(actor));
        }
        if let Some(entity_type) = &$filter.entity_type {
            query = query.filter(audit::entity_type.eq(entity_type.clone()));
        }
        if let Some(entity_id) = $filter.entity_id {
            query = query.filter(audit::entity_id.eq(entity_id));
        }
        if let Some(operation) = $filter.operation {
            query = query.filter(audit::operation.eq(operation));
        }
        if let Some(from) = $filter.from {
            query = query.filter(audit::created_at.ge(from));
        }
        if let Some(to) = $filter.to {
            query = query.filter(audit::created_at.le(to));
        }
        query
    }};
}

/// Cursor-paginated scan, newest first.
pub fn query(
    conn: &mut PgConnection,
    filter: &AuditFilter,
    cursor: Option<i64>,
    limit: i64,
) -> CoreResult<AuditPage> {
    use crate::schema::audit_log::dsl as audit;

    let mut q = filtered_audit_query!(filter);
    if let Some(cursor) = cursor {
        q = q.filter(audit::id.lt(cursor));
    }
    let entries: Vec<AuditEntry> = q.order(audit::id.desc()).limit(limit).load(conn)?;
    let next_cursor = if entries.len() as i64 == limit {
        entries.last().map(|entry| entry.id)
    } else {
        None
    };
    Ok(AuditPage {
        entries,
        next_cursor,
    })
}

pub fn count(conn: &mut PgConnection, filter: &AuditFilter) -> CoreResult<i64> {
    let q = filtered_audit_query!(filter);
    Ok(q.count().get_result(conn)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

/// Serializes entries for export. Pure over already-loaded rows so the
/// role-gated query decides what the caller may see.
pub fn export(entries: &[AuditEntry], format: ExportFormat) -> CoreResult<Vec<u8>> {
    match format {
        ExportFormat::Json => serde_json::to_vec_pretty(entries)
            .map_err(|err| CoreError::integrity(format!("audit export failed: {err}"))),
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            writer
                .write_record([
                    "id",
                    "entityType",
                    "entityId",
                    "operation",
                    "actorId",
                    "reason",
                    "diff",
                    "createdAt",
                ])
                .map_err(csv_error)?;
            for entry in entries {
                writer
                    .write_record([
                        entry.id.to_string(),
                        entry.entity_type.clone(),
                        entry.entity_id.to_string(),
                        entry.operation.to_string(),
                        entry.actor_id.to_string(),
                        entry.reason.clone().unwrap_or_default(),
                        entry
                            .diff
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default(),
                        entry.created_at.to_rfc3339(),
                    ])
                    .map_err(csv_error)?;
            }
            writer
                .into_inner()
                .map_err(|err| CoreError::integrity(format!("audit export failed: {err}")))
        }
    }
}

fn csv_error(err: csv::Error) -> CoreError {
    CoreError::integrity(format!("audit export failed: {err}"))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn entry(id: i64, operation: AuditOperation) -> AuditEntry {
        AuditEntry {
            id,
            entity_type: "settlement".to_string(),
            entity_id: Uuid::nil(),
            operation,
            actor_id: Uuid::nil(),
            previous_state: Some(json!({"level": 3})),
            new_state: Some(json!({"level": 4})),
            diff: Some(json!({"level": {"from": 3, "to": 4}})),
            reason: Some("kingdom decree".to_string()),
            created_at: Utc.with_ymd_and_hms(4707, 3, 15, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn csv_export_has_a_header_and_one_line_per_entry() {
        let bytes = export(
            &[entry(1, AuditOperation::Update), entry(2, AuditOperation::Fork)],
            ExportFormat::Csv,
        )
        .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.trim_end().lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id,entityType,entityId,operation"));
        assert!(lines[1].contains("UPDATE"));
        assert!(lines[1].contains("kingdom decree"));
        assert!(lines[2].contains("FORK"));
    }

    #[test]
    fn json_export_roundtrips_the_entries() {
        let entries = vec![entry(1, AuditOperation::Create)];
        let bytes = export(&entries, ExportFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed[0]["id"], json!(1));
        assert_eq!(parsed[0]["operation"], json!("CREATE"));
        assert_eq!(parsed[0]["diff"]["level"]["to"], json!(4));
    }
}
