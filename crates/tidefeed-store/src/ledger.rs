//! Orchestrator bookkeeping: id aliases and the inbound idempotence ledger.

use chrono::{Duration, Utc};
use rusqlite::params;
use uuid::Uuid;

use tidefeed_shared::types::ContentId;

use crate::database::{ts_to_sql, Database};
use crate::error::Result;
use crate::records::resolve_alias_in;

impl Database {
    /// Map a peer-confirmed id onto the local key of the same record.
    /// Lookups through [`get_record`](Database::get_record) follow the alias.
    pub fn set_alias(&self, alias: &ContentId, content_id: &ContentId) -> Result<()> {
        if alias == content_id {
            return Ok(());
        }
        self.conn().execute(
            "INSERT INTO id_aliases (alias_id, content_id) VALUES (?1, ?2)
             ON CONFLICT(alias_id) DO UPDATE SET content_id = excluded.content_id",
            params![alias.as_str(), content_id.as_str()],
        )?;
        tracing::debug!(alias = %alias, content = %content_id, "alias recorded");
        Ok(())
    }

    pub fn resolve_alias(&self, id: &ContentId) -> Result<ContentId> {
        resolve_alias_in(self.conn(), id)
    }

    /// Record an inbound entry as applied. Returns `false` if it already was.
    pub fn mark_entry_applied(&self, entry_id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO applied_entries (entry_id, applied_at) VALUES (?1, ?2)",
            params![entry_id.to_string(), ts_to_sql(&Utc::now())],
        )?;
        Ok(affected > 0)
    }

    pub fn is_entry_applied(&self, entry_id: Uuid) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM applied_entries WHERE entry_id = ?1",
            params![entry_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Forget applied entries older than `older_than`. Past that window a
    /// redelivery is applied again, which the record upsert absorbs.
    pub fn prune_applied_entries(&self, older_than: Duration) -> Result<usize> {
        let cutoff = ts_to_sql(&(Utc::now() - older_than));
        let affected = self.conn().execute(
            "DELETE FROM applied_entries WHERE applied_at < ?1",
            params![cutoff],
        )?;
        if affected > 0 {
            tracing::debug!(pruned = affected, "pruned applied entries");
        }
        Ok(affected)
    }
}
