//! Append-only mutation log.
//!
//! Entries are ordered by their append position (`seq`); replay to peers
//! walks them in that order, which preserves per-entity ordering.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use tidefeed_shared::types::{EntityType, MutationAction};

use crate::database::{conversion_error, not_found, ts_from_sql, ts_to_sql, Database};
use crate::error::Result;
use crate::models::MutationLogEntry;

const ENTRY_COLUMNS: &str =
    "seq, id, entity_type, entity_id, action, timestamp, conflict_resolved, payload";

impl Database {
    /// Durably append one entry. Returns the entry with its `seq` filled in.
    ///
    /// The call only returns `Ok` once SQLite has committed the row; a failure
    /// here must fail the user action that produced the entry.
    pub fn append_mutation(&self, entry: &MutationLogEntry) -> Result<MutationLogEntry> {
        append_entry(self.conn(), entry)
    }

    /// Entries not yet resolved, in append order, optionally filtered by entity type.
    pub fn pending_mutations(&self, entity_type: Option<EntityType>) -> Result<Vec<MutationLogEntry>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM mutation_log
             WHERE conflict_resolved = 0 AND (?1 IS NULL OR entity_type = ?1)
             ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![entity_type.map(|t| t.as_str())], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Unresolved entries for one entity, in append order.
    pub fn pending_for_entity(&self, entity_id: &str) -> Result<Vec<MutationLogEntry>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM mutation_log
             WHERE conflict_resolved = 0 AND entity_id = ?1
             ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![entity_id], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn get_mutation(&self, id: Uuid) -> Result<MutationLogEntry> {
        self.conn()
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM mutation_log WHERE id = ?1"),
                params![id.to_string()],
                row_to_entry,
            )
            .map_err(not_found)
    }

    /// Mark one entry resolved. Returns `false` if it was already resolved or unknown.
    pub fn mark_mutation_resolved(&self, id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE mutation_log SET conflict_resolved = 1 WHERE id = ?1 AND conflict_resolved = 0",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Most recent entry for an entity regardless of state.
    pub fn latest_mutation_for(&self, entity_id: &str) -> Result<Option<MutationLogEntry>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM mutation_log
                     WHERE entity_id = ?1 ORDER BY seq DESC LIMIT 1"
                ),
                params![entity_id],
                row_to_entry,
            )
            .optional()?)
    }
}

/// Append inside an open transaction (or on a bare connection).
pub(crate) fn append_entry(conn: &Connection, entry: &MutationLogEntry) -> Result<MutationLogEntry> {
    conn.execute(
        "INSERT INTO mutation_log (id, entity_type, entity_id, action, timestamp, conflict_resolved, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.id.to_string(),
            entry.entity_type.as_str(),
            entry.entity_id,
            entry.action.as_str(),
            ts_to_sql(&entry.timestamp),
            entry.conflict_resolved as i32,
            serde_json::to_string(&entry.payload)?,
        ],
    )?;

    tracing::debug!(
        entry = %entry.id,
        entity = %entry.entity_id,
        action = %entry.action,
        "mutation appended"
    );

    Ok(MutationLogEntry {
        seq: conn.last_insert_rowid(),
        ..entry.clone()
    })
}

/// Resolve every unresolved entry of `action` for an entity. Returns how many changed.
pub(crate) fn resolve_entity_entries(
    conn: &Connection,
    entity_id: &str,
    action: Option<MutationAction>,
) -> Result<usize> {
    let affected = conn.execute(
        "UPDATE mutation_log SET conflict_resolved = 1
         WHERE entity_id = ?1 AND conflict_resolved = 0 AND (?2 IS NULL OR action = ?2)",
        params![entity_id, action.map(|a| a.as_str())],
    )?;
    Ok(affected)
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MutationLogEntry> {
    let seq: i64 = row.get(0)?;
    let id_str: String = row.get(1)?;
    let entity_type_str: String = row.get(2)?;
    let entity_id: String = row.get(3)?;
    let action_str: String = row.get(4)?;
    let ts_str: String = row.get(5)?;
    let resolved: i32 = row.get(6)?;
    let payload_str: String = row.get(7)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion_error(1, e))?;
    let entity_type = entity_type_str
        .parse::<EntityType>()
        .map_err(|e| conversion_error(2, std::io::Error::other(e)))?;
    let action = action_str
        .parse::<MutationAction>()
        .map_err(|e| conversion_error(4, std::io::Error::other(e)))?;
    let timestamp = ts_from_sql(5, &ts_str)?;
    let payload = serde_json::from_str(&payload_str).map_err(|e| conversion_error(7, e))?;

    Ok(MutationLogEntry {
        id,
        seq,
        entity_type,
        entity_id,
        action,
        timestamp,
        conflict_resolved: resolved != 0,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_db;
    use serde_json::json;

    fn entry(entity: &str, action: MutationAction) -> MutationLogEntry {
        MutationLogEntry::new(EntityType::Post, entity, action, json!({"n": entity}))
    }

    #[test]
    fn append_assigns_increasing_seq() {
        let (db, _dir) = test_db();
        let a = db.append_mutation(&entry("a", MutationAction::Create)).unwrap();
        let b = db.append_mutation(&entry("a", MutationAction::Update)).unwrap();
        assert!(b.seq > a.seq);
    }

    #[test]
    fn pending_is_in_append_order_and_filterable() {
        let (db, _dir) = test_db();
        let first = db.append_mutation(&entry("a", MutationAction::Create)).unwrap();
        db.append_mutation(&MutationLogEntry::new(
            EntityType::Profile,
            "me",
            MutationAction::Update,
            json!({}),
        ))
        .unwrap();
        let third = db.append_mutation(&entry("a", MutationAction::Update)).unwrap();

        let all = db.pending_mutations(None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, first.id);
        assert_eq!(all[2].id, third.id);

        let posts = db.pending_mutations(Some(EntityType::Post)).unwrap();
        assert_eq!(posts.len(), 2);
    }

    #[test]
    fn mark_resolved_removes_from_pending() {
        let (db, _dir) = test_db();
        let e = db.append_mutation(&entry("a", MutationAction::Create)).unwrap();
        assert!(db.mark_mutation_resolved(e.id).unwrap());
        assert!(!db.mark_mutation_resolved(e.id).unwrap());
        assert!(db.pending_mutations(None).unwrap().is_empty());

        // the entry itself is never deleted
        let stored = db.get_mutation(e.id).unwrap();
        assert!(stored.conflict_resolved);
        assert_eq!(stored.payload, json!({"n": "a"}));
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.db");
        let id = {
            let db = Database::open_at(&path).unwrap();
            db.append_mutation(&entry("x", MutationAction::Delete)).unwrap().id
        };
        let db = Database::open_at(&path).unwrap();
        let pending = db.pending_mutations(None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].action, MutationAction::Delete);
    }

    #[test]
    fn unknown_entry_is_not_found() {
        let (db, _dir) = test_db();
        assert!(matches!(
            db.get_mutation(Uuid::new_v4()),
            Err(crate::StoreError::NotFound)
        ));
    }
}
