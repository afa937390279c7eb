//! Per-user profile cache.
//!
//! Local edits are logged as `profile` mutations and replicated like posts.
//! Remote profiles are applied newest-wins on `updated_at`.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use tidefeed_shared::types::{ContentId, EntityType, MutationAction, UserId};

use crate::database::{conversion_error, ts_from_sql, ts_to_sql, Database};
use crate::error::Result;
use crate::models::{MutationLogEntry, Origin, Profile, UpsertOutcome};
use crate::mutation_log::append_entry;

impl Database {
    pub fn upsert_profile(&self, profile: &Profile, origin: Origin) -> Result<UpsertOutcome> {
        let tx = self.conn().unchecked_transaction()?;
        let existing = load_profile(&tx, &profile.user_id)?;

        let outcome = match origin {
            Origin::Local => {
                let stored = Profile {
                    updated_at: Utc::now(),
                    modified: true,
                    synced: false,
                    ..profile.clone()
                };
                write_profile(&tx, &stored)?;

                let action = if existing.is_some() {
                    MutationAction::Update
                } else {
                    MutationAction::Create
                };
                let snapshot = Profile {
                    modified: false,
                    synced: false,
                    ..stored
                };
                append_entry(
                    &tx,
                    &MutationLogEntry::new(
                        EntityType::Profile,
                        profile.user_id.to_hex(),
                        action,
                        serde_json::to_value(&snapshot)?,
                    ),
                )?;

                if existing.is_some() {
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Inserted
                }
            }
            Origin::Remote => {
                let incoming = Profile {
                    modified: false,
                    synced: true,
                    ..profile.clone()
                };
                match existing {
                    None => {
                        write_profile(&tx, &incoming)?;
                        UpsertOutcome::Inserted
                    }
                    Some(current) if current.updated_at >= incoming.updated_at => {
                        UpsertOutcome::Unchanged
                    }
                    Some(_) => {
                        write_profile(&tx, &incoming)?;
                        UpsertOutcome::Updated
                    }
                }
            }
        };

        tx.commit()?;
        tracing::debug!(user = %profile.user_id.short(), outcome = ?outcome, "profile upserted");
        Ok(outcome)
    }

    pub fn get_profile(&self, user_id: &UserId) -> Result<Option<Profile>> {
        load_profile(self.conn(), user_id)
    }

    pub fn mark_profile_synced(&self, user_id: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE profiles SET synced = 1, modified = 0 WHERE user_id = ?1",
            params![user_id.to_hex()],
        )?;
        Ok(affected > 0)
    }
}

fn load_profile(conn: &rusqlite::Connection, user_id: &UserId) -> Result<Option<Profile>> {
    Ok(conn
        .query_row(
            "SELECT user_id, display_name, bio, avatar_id, updated_at, modified, synced
             FROM profiles WHERE user_id = ?1",
            params![user_id.to_hex()],
            row_to_profile,
        )
        .optional()?)
}

fn write_profile(conn: &rusqlite::Connection, profile: &Profile) -> Result<()> {
    conn.execute(
        "INSERT INTO profiles (user_id, display_name, bio, avatar_id, updated_at, modified, synced)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(user_id) DO UPDATE SET
             display_name = excluded.display_name,
             bio = excluded.bio,
             avatar_id = excluded.avatar_id,
             updated_at = excluded.updated_at,
             modified = excluded.modified,
             synced = excluded.synced",
        params![
            profile.user_id.to_hex(),
            profile.display_name,
            profile.bio,
            profile.avatar_id.as_ref().map(|id| id.as_str()),
            ts_to_sql(&profile.updated_at),
            profile.modified as i32,
            profile.synced as i32,
        ],
    )?;
    Ok(())
}

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<Profile> {
    let user_hex: String = row.get(0)?;
    let updated_str: String = row.get(4)?;
    let avatar: Option<String> = row.get(3)?;
    let modified: i32 = row.get(5)?;
    let synced: i32 = row.get(6)?;

    Ok(Profile {
        user_id: UserId::from_hex(&user_hex).map_err(|e| conversion_error(0, e))?,
        display_name: row.get(1)?,
        bio: row.get(2)?,
        avatar_id: avatar.map(ContentId),
        updated_at: ts_from_sql(4, &updated_str)?,
        modified: modified != 0,
        synced: synced != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_db;
    use chrono::Duration;

    fn profile(name: &str) -> Profile {
        Profile {
            user_id: UserId([3u8; 32]),
            display_name: Some(name.into()),
            bio: None,
            avatar_id: None,
            updated_at: Utc::now(),
            modified: false,
            synced: false,
        }
    }

    #[test]
    fn local_edit_is_logged_as_profile_mutation() {
        let (db, _dir) = test_db();
        db.upsert_profile(&profile("ada"), Origin::Local).unwrap();
        db.upsert_profile(&profile("ada l."), Origin::Local).unwrap();

        let pending = db.pending_mutations(Some(EntityType::Profile)).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].action, MutationAction::Create);
        assert_eq!(pending[1].action, MutationAction::Update);
        assert_eq!(pending[1].payload["displayName"], "ada l.");

        let stored = db.get_profile(&UserId([3u8; 32])).unwrap().unwrap();
        assert!(stored.modified);
        assert!(db.mark_profile_synced(&stored.user_id).unwrap());
        assert!(!db.get_profile(&stored.user_id).unwrap().unwrap().modified);
    }

    #[test]
    fn remote_profile_is_newest_wins() {
        let (db, _dir) = test_db();
        db.upsert_profile(&profile("current"), Origin::Remote).unwrap();

        let mut old = profile("old");
        old.updated_at = Utc::now() - Duration::hours(2);
        assert_eq!(
            db.upsert_profile(&old, Origin::Remote).unwrap(),
            UpsertOutcome::Unchanged
        );

        let mut newer = profile("newer");
        newer.updated_at = Utc::now() + Duration::seconds(5);
        assert_eq!(
            db.upsert_profile(&newer, Origin::Remote).unwrap(),
            UpsertOutcome::Updated
        );
        let stored = db.get_profile(&newer.user_id).unwrap().unwrap();
        assert_eq!(stored.display_name.as_deref(), Some("newer"));
        assert!(db.pending_mutations(None).unwrap().is_empty());
    }
}
