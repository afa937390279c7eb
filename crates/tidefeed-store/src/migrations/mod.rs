//! Schema migrations, tracked with `PRAGMA user_version`.
//!
//! Each step runs in its own transaction together with the version bump, so
//! a crash mid-upgrade leaves the database at the previous version.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Ordered upgrade steps; entry `i` moves the schema to version `i + 1`.
const STEPS: &[(&str, Step)] = &[("v001_initial", v001_initial::up)];

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let target = STEPS.len() as u32;

    if current > target {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than this build (v{target})"
        )));
    }

    for (version, (name, step)) in (1u32..).zip(STEPS).skip(current as usize) {
        tracing::info!(migration = *name, version, "applying migration");
        let tx = conn.unchecked_transaction()?;
        step(&tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    Ok(())
}
