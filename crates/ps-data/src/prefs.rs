//! SQLite-backed preference store

use ps_core::PreferenceStore;
use rusqlite::OptionalExtension;

use crate::db::Database;

/// Preferences kept in the `prefs` table of the metadata database
#[derive(Clone)]
pub struct SqlitePreferences {
    db: Database,
}

impl SqlitePreferences {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl PreferenceStore for SqlitePreferences {
    fn load(&self, key: &str) -> anyhow::Result<Option<String>> {
        let key = key.to_string();
        let value: Option<String> = self.db.call_blocking(move |conn| {
            Ok(conn
                .query_row("SELECT value FROM prefs WHERE key = ?1", [&key], |row| row.get(0))
                .optional()?)
        })?;
        Ok(value)
    }

    fn save(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.db.call_blocking(|conn| {
            conn.execute(
                "INSERT INTO prefs (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, value],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.db.call_blocking(|conn| {
            conn.execute("DELETE FROM prefs WHERE key = ?1", [key])?;
            Ok(())
        })?;
        Ok(())
    }
}
