use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::SyncError;

/// Local, crash-persistent view of each entity type, keyed by record id.
///
/// One physical table logically partitioned by `table_name`; never touches
/// the network. Mutations are single statements, so they are durable before
/// the call returns.
pub struct RecordStore<'c> {
    conn: &'c Connection,
}

impl<'c> RecordStore<'c> {
    /// Bind the store to an existing SQLite connection.
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Create the records table. Safe to call multiple times.
    pub fn init_schema(conn: &Connection) -> Result<(), SyncError> {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS records (
table_name TEXT NOT NULL,
record_id TEXT NOT NULL,
body TEXT NOT NULL, -- JSON
updated_at INTEGER NOT NULL, -- unix millis
PRIMARY KEY (table_name, record_id)
);
"#,
        )?;
        Ok(())
    }

    /// Last locally written body for a record, if any.
    pub fn get(&self, table: &str, id: &str) -> Result<Option<serde_json::Value>, SyncError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM records WHERE table_name=?1 AND record_id=?2",
                params![table, id],
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Upsert a record; used for optimistic local writes and for reconciling
    /// confirmed remote state.
    pub fn put(&self, table: &str, id: &str, body: &serde_json::Value) -> Result<(), SyncError> {
        self.conn.execute(
            "INSERT INTO records(table_name, record_id, body, updated_at)
VALUES (?1,?2,?3,?4)
ON CONFLICT(table_name, record_id) DO UPDATE SET
body=excluded.body,
updated_at=excluded.updated_at",
            params![table, id, body.to_string(), Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Remove the local copy. Returns whether a row existed.
    pub fn delete(&self, table: &str, id: &str) -> Result<bool, SyncError> {
        let n = self.conn.execute(
            "DELETE FROM records WHERE table_name=?1 AND record_id=?2",
            params![table, id],
        )?;
        Ok(n > 0)
    }

    /// Full scan of one entity type, `(id, body)` pairs ordered by id.
    pub fn list(&self, table: &str) -> Result<Vec<(String, serde_json::Value)>, SyncError> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, body FROM records WHERE table_name=?1 ORDER BY record_id ASC",
        )?;
        let rows = stmt.query_map(params![table], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, raw) = row?;
            out.push((id, serde_json::from_str(&raw)?));
        }
        Ok(out)
    }
}
