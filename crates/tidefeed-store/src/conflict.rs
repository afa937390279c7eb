//! Conflict detection and resolution.
//!
//! A remote write that lands on a record with unsynced local changes is handed
//! to a [`ConflictStrategy`]. The default, [`PreserveLocal`], never overwrites
//! local data: it parks the remote candidate on the record and waits for an
//! explicit [`Resolution`].

use chrono::Utc;
use rusqlite::Connection;

use tidefeed_shared::types::{ContentId, MutationAction};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{MutationLogEntry, Record, RecordConflict};
use crate::mutation_log::{append_entry, resolve_entity_entries};
use crate::records::{load_record, resolve_alias_in, write_record};

/// What to do with a remote write that collided with a local edit.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictDecision {
    /// Keep local data and record the remote version for later resolution.
    Defer,
    /// Drop the local edit and take the remote version.
    AcceptRemote,
    /// Replace the local payload with this merged payload.
    Merge(serde_json::Value),
}

/// Pluggable policy for concurrent local/remote edits.
pub trait ConflictStrategy: Send {
    fn name(&self) -> &'static str;

    fn on_conflict(&self, local: &Record, remote: &Record) -> ConflictDecision;
}

/// Never lose local data.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreserveLocal;

impl ConflictStrategy for PreserveLocal {
    fn name(&self) -> &'static str {
        "preserve-local"
    }

    fn on_conflict(&self, _local: &Record, _remote: &Record) -> ConflictDecision {
        ConflictDecision::Defer
    }
}

/// Outcome chosen by the user for a pending conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    Merged(serde_json::Value),
}

/// Park `remote` as the pending candidate on `local` and log a `conflict` entry.
///
/// A newer candidate replaces an older pending one; each arrival gets its own
/// unresolved log entry.
pub(crate) fn record_conflict(conn: &Connection, local: Record, remote: Record) -> Result<()> {
    let content_id = local.content_id.clone();
    let kind = local.kind;
    let parked = Record {
        conflict: Some(RecordConflict {
            remote_version: Box::new(remote.snapshot()),
            detected_at: Utc::now(),
        }),
        ..local
    };
    write_record(conn, &parked)?;

    append_entry(
        conn,
        &MutationLogEntry::new(
            kind,
            content_id.as_str(),
            MutationAction::Conflict,
            serde_json::json!({
                "local": parked.snapshot(),
                "remote": remote.snapshot(),
            }),
        ),
    )?;

    tracing::warn!(content = %content_id, "conflicting remote write deferred");
    Ok(())
}

impl Database {
    /// Apply a resolution to a record's pending conflict atomically: the record
    /// is rewritten, the conflict cleared and the entity's `conflict` entries
    /// marked resolved, or nothing changes.
    pub fn resolve_conflict(&self, content_id: &ContentId, resolution: Resolution) -> Result<Record> {
        let tx = self.conn().unchecked_transaction()?;
        let id = resolve_alias_in(&tx, content_id)?;
        let local = load_record(&tx, &id)?.ok_or(StoreError::NotFound)?;
        let conflict = local
            .conflict
            .clone()
            .ok_or_else(|| StoreError::NoConflict(id.to_string()))?;

        let now = Utc::now();
        let resolved = match &resolution {
            Resolution::KeepLocal => Record {
                modified: true,
                synced: false,
                last_modified_at: now,
                conflict: None,
                ..local.clone()
            },
            Resolution::KeepRemote => Record {
                content_id: id.clone(),
                synced: true,
                modified: false,
                local_created_at: local.local_created_at,
                conflict: None,
                ..*conflict.remote_version
            },
            Resolution::Merged(payload) => Record {
                payload: payload.clone(),
                modified: true,
                synced: false,
                last_modified_at: now,
                conflict: None,
                ..local.clone()
            },
        };

        resolve_entity_entries(&tx, id.as_str(), Some(MutationAction::Conflict))?;
        write_record(&tx, &resolved)?;

        match resolution {
            Resolution::KeepRemote => {
                // local edits are superseded; they must not be replayed
                resolve_entity_entries(&tx, id.as_str(), None)?;
            }
            Resolution::KeepLocal | Resolution::Merged(_) => {
                append_entry(
                    &tx,
                    &MutationLogEntry::new(
                        resolved.kind,
                        id.as_str(),
                        MutationAction::Update,
                        serde_json::to_value(resolved.snapshot())?,
                    ),
                )?;
            }
        }

        tx.commit()?;

        tracing::info!(content = %id, "conflict resolved");
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_db;
    use crate::models::{Origin, UpsertOutcome};
    use serde_json::json;
    use tidefeed_shared::types::{EntityType, UserId};

    fn post(text: &str) -> Record {
        Record::new(
            ContentId::from("p1"),
            EntityType::Post,
            UserId([4u8; 32]),
            json!({ "text": text }),
        )
    }

    fn conflicted_db() -> (Database, tempfile::TempDir) {
        let (db, dir) = test_db();
        db.upsert_record(&post("A"), Origin::Local).unwrap();
        assert_eq!(
            db.upsert_record(&post("B"), Origin::Remote).unwrap(),
            UpsertOutcome::Conflicted
        );
        (db, dir)
    }

    fn unresolved_conflicts(db: &Database) -> usize {
        db.pending_for_entity("p1")
            .unwrap()
            .into_iter()
            .filter(|e| e.action == MutationAction::Conflict)
            .count()
    }

    #[test]
    fn conflict_logs_an_unresolved_entry() {
        let (db, _dir) = conflicted_db();
        assert_eq!(unresolved_conflicts(&db), 1);
    }

    #[test]
    fn keep_remote_takes_candidate_and_clears_log() {
        let (db, _dir) = conflicted_db();
        let resolved = db
            .resolve_conflict(&ContentId::from("p1"), Resolution::KeepRemote)
            .unwrap();
        assert_eq!(resolved.payload, json!({"text": "B"}));
        assert!(resolved.conflict.is_none());
        assert!(!resolved.modified);
        assert!(db.pending_for_entity("p1").unwrap().is_empty());
    }

    #[test]
    fn keep_local_retains_data_and_queues_update() {
        let (db, _dir) = conflicted_db();
        let resolved = db
            .resolve_conflict(&ContentId::from("p1"), Resolution::KeepLocal)
            .unwrap();
        assert_eq!(resolved.payload, json!({"text": "A"}));
        assert!(resolved.conflict.is_none());
        assert_eq!(unresolved_conflicts(&db), 0);

        let last = db.latest_mutation_for("p1").unwrap().unwrap();
        assert_eq!(last.action, MutationAction::Update);
        assert!(!last.conflict_resolved);
    }

    #[test]
    fn merged_payload_is_stored_as_local_change() {
        let (db, _dir) = conflicted_db();
        let merged = json!({"text": "A+B"});
        let resolved = db
            .resolve_conflict(&ContentId::from("p1"), Resolution::Merged(merged.clone()))
            .unwrap();
        assert_eq!(resolved.payload, merged);
        assert!(resolved.modified);

        let stored = db.get_record(&ContentId::from("p1")).unwrap().unwrap();
        assert_eq!(stored.payload, merged);
        assert!(!stored.has_conflict());
    }

    #[test]
    fn newer_candidate_replaces_pending_one() {
        let (db, _dir) = conflicted_db();
        db.upsert_record(&post("C"), Origin::Remote).unwrap();

        let stored = db.get_record(&ContentId::from("p1")).unwrap().unwrap();
        let conflict = stored.conflict.unwrap();
        assert_eq!(conflict.remote_version.payload, json!({"text": "C"}));
        assert_eq!(stored.payload, json!({"text": "A"}));
        assert_eq!(unresolved_conflicts(&db), 2);

        db.resolve_conflict(&ContentId::from("p1"), Resolution::KeepRemote)
            .unwrap();
        assert_eq!(unresolved_conflicts(&db), 0);
    }

    #[test]
    fn resolving_without_conflict_is_an_error() {
        let (db, _dir) = test_db();
        db.upsert_record(&post("A"), Origin::Local).unwrap();
        assert!(matches!(
            db.resolve_conflict(&ContentId::from("p1"), Resolution::KeepLocal),
            Err(StoreError::NoConflict(_))
        ));
        assert!(matches!(
            db.resolve_conflict(&ContentId::from("nope"), Resolution::KeepLocal),
            Err(StoreError::NotFound)
        ));
    }

    struct TakeRemote;

    impl ConflictStrategy for TakeRemote {
        fn name(&self) -> &'static str {
            "take-remote"
        }

        fn on_conflict(&self, _local: &Record, _remote: &Record) -> ConflictDecision {
            ConflictDecision::AcceptRemote
        }
    }

    #[test]
    fn custom_strategy_can_accept_remote() {
        let (db, _dir) = test_db();
        let db = db.with_strategy(Box::new(TakeRemote));
        db.upsert_record(&post("A"), Origin::Local).unwrap();
        assert_eq!(
            db.upsert_record(&post("B"), Origin::Remote).unwrap(),
            UpsertOutcome::Updated
        );
        let stored = db.get_record(&ContentId::from("p1")).unwrap().unwrap();
        assert_eq!(stored.payload, json!({"text": "B"}));
        assert!(db.pending_for_entity("p1").unwrap().is_empty());
    }
}
