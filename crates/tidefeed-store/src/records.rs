//! The local record store.
//!
//! Central invariant: a remote write to a record that still carries a local,
//! unsynced modification is never applied directly. It goes through the
//! installed [`ConflictStrategy`](crate::ConflictStrategy).

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use tidefeed_shared::types::{ContentId, EntityType, MutationAction, UserId};

use crate::conflict::{record_conflict, ConflictDecision};
use crate::database::{conversion_error, ts_from_sql, ts_to_sql, Database};
use crate::error::{Result, StoreError};
use crate::models::{MutationLogEntry, Origin, Record, RecordConflict, UpsertOutcome};
use crate::mutation_log::append_entry;

const RECORD_COLUMNS: &str = "content_id, kind, owner_id, payload, synced, modified, deleted, \
                              last_modified_at, local_created_at, conflict";

impl Database {
    /// Insert or update a record.
    ///
    /// * `Origin::Local` marks the record modified/unsynced and appends a
    ///   create/update/delete entry to the mutation log in the same transaction.
    /// * `Origin::Remote` inserts unknown records, overwrites clean ones when the
    ///   incoming version is not older, and hands locally modified ones to the
    ///   conflict strategy.
    pub fn upsert_record(&self, record: &Record, origin: Origin) -> Result<UpsertOutcome> {
        let tx = self.conn().unchecked_transaction()?;
        let content_id = resolve_alias_in(&tx, &record.content_id)?;
        let existing = load_record(&tx, &content_id)?;

        let outcome = match origin {
            Origin::Local => {
                let now = Utc::now();
                let action = match &existing {
                    _ if record.deleted => MutationAction::Delete,
                    Some(prev) if !prev.deleted => MutationAction::Update,
                    _ => MutationAction::Create,
                };

                let stored = Record {
                    content_id: content_id.clone(),
                    synced: false,
                    modified: true,
                    last_modified_at: now,
                    local_created_at: existing
                        .as_ref()
                        .and_then(|prev| prev.local_created_at)
                        .or(record.local_created_at)
                        .or(Some(now)),
                    // a local edit never discards a pending remote candidate
                    conflict: existing.as_ref().and_then(|prev| prev.conflict.clone()),
                    ..record.clone()
                };
                write_record(&tx, &stored)?;
                append_entry(
                    &tx,
                    &MutationLogEntry::new(
                        stored.kind,
                        content_id.as_str(),
                        action,
                        serde_json::to_value(stored.snapshot())?,
                    ),
                )?;

                if existing.is_some() {
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Inserted
                }
            }

            Origin::Remote => {
                let incoming = Record {
                    content_id: content_id.clone(),
                    synced: true,
                    modified: false,
                    conflict: None,
                    ..record.clone()
                };

                match existing {
                    None => {
                        write_record(&tx, &incoming)?;
                        UpsertOutcome::Inserted
                    }
                    Some(local) if local.modified => {
                        self.route_conflict(&tx, local, incoming)?
                    }
                    Some(local) => {
                        if same_version(&local, &incoming)
                            || incoming.last_modified_at < local.last_modified_at
                        {
                            UpsertOutcome::Unchanged
                        } else {
                            write_record(
                                &tx,
                                &Record {
                                    local_created_at: local.local_created_at,
                                    ..incoming
                                },
                            )?;
                            UpsertOutcome::Updated
                        }
                    }
                }
            }
        };

        tx.commit()?;

        tracing::debug!(
            content = %content_id,
            origin = ?origin,
            outcome = ?outcome,
            "record upserted"
        );
        Ok(outcome)
    }

    fn route_conflict(
        &self,
        tx: &Connection,
        local: Record,
        remote: Record,
    ) -> Result<UpsertOutcome> {
        if same_version(&local, &remote) {
            return Ok(UpsertOutcome::Unchanged);
        }

        match self.strategy().on_conflict(&local, &remote) {
            ConflictDecision::Defer => {
                record_conflict(tx, local, remote)?;
                Ok(UpsertOutcome::Conflicted)
            }
            ConflictDecision::AcceptRemote => {
                crate::mutation_log::resolve_entity_entries(tx, local.content_id.as_str(), None)?;
                write_record(
                    tx,
                    &Record {
                        local_created_at: local.local_created_at,
                        ..remote
                    },
                )?;
                Ok(UpsertOutcome::Updated)
            }
            ConflictDecision::Merge(payload) => {
                let merged = Record {
                    payload,
                    modified: true,
                    synced: false,
                    last_modified_at: Utc::now(),
                    conflict: None,
                    ..local
                };
                write_record(tx, &merged)?;
                append_entry(
                    tx,
                    &MutationLogEntry::new(
                        merged.kind,
                        merged.content_id.as_str(),
                        MutationAction::Update,
                        serde_json::to_value(merged.snapshot())?,
                    ),
                )?;
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    /// Fetch a live record. Soft-deleted records are not returned.
    pub fn get_record(&self, content_id: &ContentId) -> Result<Option<Record>> {
        let id = resolve_alias_in(self.conn(), content_id)?;
        Ok(load_record(self.conn(), &id)?.filter(|r| !r.deleted))
    }

    /// Fetch a record including soft-deleted ones.
    pub fn get_record_any(&self, content_id: &ContentId) -> Result<Option<Record>> {
        let id = resolve_alias_in(self.conn(), content_id)?;
        load_record(self.conn(), &id)
    }

    /// All records, most recent first (`local_created_at`, else `last_modified_at`).
    pub fn list_records(&self, include_deleted: bool) -> Result<Vec<Record>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE (?1 OR deleted = 0)
             ORDER BY COALESCE(local_created_at, last_modified_at) DESC, content_id ASC"
        ))?;
        let rows = stmt.query_map(params![include_deleted], row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Flag a record as acknowledged by a peer. A record with a pending
    /// conflict keeps `modified` so later remote writes still route to the resolver.
    pub fn mark_record_synced(&self, content_id: &ContentId) -> Result<bool> {
        let id = resolve_alias_in(self.conn(), content_id)?;
        let affected = self.conn().execute(
            "UPDATE records
             SET synced = 1,
                 modified = CASE WHEN conflict IS NULL THEN 0 ELSE modified END
             WHERE content_id = ?1",
            params![id.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Soft-delete a record as a local mutation (appends a `delete` entry).
    pub fn soft_delete_record(&self, content_id: &ContentId) -> Result<Record> {
        let mut record = self
            .get_record(content_id)?
            .ok_or(StoreError::NotFound)?;
        record.deleted = true;
        self.upsert_record(&record, Origin::Local)?;
        self.get_record_any(content_id)?.ok_or(StoreError::NotFound)
    }

    /// Hard-delete soft-deleted records that were acknowledged, or that have
    /// outlived the retention window. Returns the number of purged rows.
    pub fn purge_deleted(&self, retention: Duration) -> Result<usize> {
        let cutoff = ts_to_sql(&(Utc::now() - retention));
        let affected = self.conn().execute(
            "DELETE FROM records
             WHERE deleted = 1
               AND ((synced = 1 AND modified = 0) OR last_modified_at < ?1)",
            params![cutoff],
        )?;
        if affected > 0 {
            tracing::info!(purged = affected, "purged deleted records");
        }
        Ok(affected)
    }
}

fn same_version(a: &Record, b: &Record) -> bool {
    a.payload == b.payload && a.deleted == b.deleted && a.owner_id == b.owner_id
}

pub(crate) fn resolve_alias_in(conn: &Connection, id: &ContentId) -> Result<ContentId> {
    let target: Option<String> = conn
        .query_row(
            "SELECT content_id FROM id_aliases WHERE alias_id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(target.map(ContentId).unwrap_or_else(|| id.clone()))
}

pub(crate) fn load_record(conn: &Connection, id: &ContentId) -> Result<Option<Record>> {
    Ok(conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM records WHERE content_id = ?1"),
            params![id.as_str()],
            row_to_record,
        )
        .optional()?)
}

pub(crate) fn write_record(conn: &Connection, record: &Record) -> Result<()> {
    let conflict = record
        .conflict
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO records (content_id, kind, owner_id, payload, synced, modified, deleted,
                              last_modified_at, local_created_at, conflict)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(content_id) DO UPDATE SET
             kind = excluded.kind,
             owner_id = excluded.owner_id,
             payload = excluded.payload,
             synced = excluded.synced,
             modified = excluded.modified,
             deleted = excluded.deleted,
             last_modified_at = excluded.last_modified_at,
             local_created_at = excluded.local_created_at,
             conflict = excluded.conflict",
        params![
            record.content_id.as_str(),
            record.kind.as_str(),
            record.owner_id.to_hex(),
            serde_json::to_string(&record.payload)?,
            record.synced as i32,
            record.modified as i32,
            record.deleted as i32,
            ts_to_sql(&record.last_modified_at),
            record.local_created_at.as_ref().map(ts_to_sql),
            conflict,
        ],
    )?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let content_id: String = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let owner_hex: String = row.get(2)?;
    let payload_str: String = row.get(3)?;
    let synced: i32 = row.get(4)?;
    let modified: i32 = row.get(5)?;
    let deleted: i32 = row.get(6)?;
    let modified_str: String = row.get(7)?;
    let created_str: Option<String> = row.get(8)?;
    let conflict_str: Option<String> = row.get(9)?;

    let kind = kind_str
        .parse::<EntityType>()
        .map_err(|e| conversion_error(1, std::io::Error::other(e)))?;
    let owner_id = UserId::from_hex(&owner_hex).map_err(|e| conversion_error(2, e))?;
    let payload = serde_json::from_str(&payload_str).map_err(|e| conversion_error(3, e))?;
    let last_modified_at = ts_from_sql(7, &modified_str)?;
    let local_created_at = created_str
        .as_deref()
        .map(|s| ts_from_sql(8, s))
        .transpose()?;
    let conflict = conflict_str
        .as_deref()
        .map(serde_json::from_str::<RecordConflict>)
        .transpose()
        .map_err(|e| conversion_error(9, e))?;

    Ok(Record {
        content_id: ContentId(content_id),
        kind,
        owner_id,
        payload,
        synced: synced != 0,
        modified: modified != 0,
        deleted: deleted != 0,
        last_modified_at,
        local_created_at,
        conflict,
    })
}
