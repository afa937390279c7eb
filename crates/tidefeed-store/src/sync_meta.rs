//! The sync-meta singleton row.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use tidefeed_shared::types::{NetworkStatus, NodeId};

use crate::database::{conversion_error, ts_from_sql, ts_to_sql, Database};
use crate::error::Result;
use crate::models::SyncMeta;

const META_KEY: &str = "sync-meta";

impl Database {
    /// Load the singleton, creating it with a fresh device id on first use.
    /// The device id is stable for the lifetime of the database file.
    pub fn load_or_init_sync_meta(&self) -> Result<SyncMeta> {
        if let Some(meta) = self.sync_meta()? {
            return Ok(meta);
        }

        let device_id = NodeId::generate();
        self.conn().execute(
            "INSERT OR IGNORE INTO sync_meta (key, device_id, network_status) VALUES (?1, ?2, ?3)",
            params![META_KEY, device_id.as_str(), NetworkStatus::Offline.as_str()],
        )?;
        tracing::info!(device = %device_id, "sync meta initialised");

        // re-read: a concurrent initialiser may have won the insert
        Ok(self.sync_meta()?.unwrap_or(SyncMeta {
            device_id,
            last_sync_attempt_at: None,
            last_successful_sync_at: None,
            network_status: NetworkStatus::Offline,
        }))
    }

    pub fn sync_meta(&self) -> Result<Option<SyncMeta>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT device_id, last_sync_attempt_at, last_successful_sync_at, network_status
                 FROM sync_meta WHERE key = ?1",
                params![META_KEY],
                |row| {
                    let device_id: String = row.get(0)?;
                    let attempt: Option<String> = row.get(1)?;
                    let success: Option<String> = row.get(2)?;
                    let status: String = row.get(3)?;
                    Ok(SyncMeta {
                        device_id: NodeId(device_id),
                        last_sync_attempt_at: attempt.as_deref().map(|s| ts_from_sql(1, s)).transpose()?,
                        last_successful_sync_at: success
                            .as_deref()
                            .map(|s| ts_from_sql(2, s))
                            .transpose()?,
                        network_status: status
                            .parse()
                            .map_err(|e| conversion_error(3, std::io::Error::other(e)))?,
                    })
                },
            )
            .optional()?)
    }

    pub fn record_sync_attempt(&self) -> Result<()> {
        self.load_or_init_sync_meta()?;
        self.conn().execute(
            "UPDATE sync_meta SET last_sync_attempt_at = ?1 WHERE key = ?2",
            params![ts_to_sql(&Utc::now()), META_KEY],
        )?;
        Ok(())
    }

    pub fn record_sync_success(&self) -> Result<()> {
        self.load_or_init_sync_meta()?;
        self.conn().execute(
            "UPDATE sync_meta SET last_successful_sync_at = ?1 WHERE key = ?2",
            params![ts_to_sql(&Utc::now()), META_KEY],
        )?;
        Ok(())
    }

    pub fn set_network_status(&self, status: NetworkStatus) -> Result<()> {
        self.load_or_init_sync_meta()?;
        self.conn().execute(
            "UPDATE sync_meta SET network_status = ?1 WHERE key = ?2",
            params![status.as_str(), META_KEY],
        )?;
        tracing::debug!(status = %status, "network status stored");
        Ok(())
    }
}
