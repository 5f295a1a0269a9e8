use chrono::Utc;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Kind of deferred mutation captured in the log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Create => "CREATE",
            OpKind::Update => "UPDATE",
            OpKind::Delete => "DELETE",
        }
    }

    fn parse(s: &str) -> Option<OpKind> {
        match s {
            "CREATE" => Some(OpKind::Create),
            "UPDATE" => Some(OpKind::Update),
            "DELETE" => Some(OpKind::Delete),
            _ => None,
        }
    }
}

/// One queued mutation awaiting remote confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOp {
    pub op_id: i64,                         // AUTOINCREMENT identity, also the sequence
    pub table: String,                      // e.g., "tasks"
    pub kind: OpKind,                       // Create/Update/Delete
    pub record_id: String,                  // target record key
    pub payload: Option<serde_json::Value>, // full record / patch; None for Delete
    pub enqueued_at: i64,                   // unix millis, informational only
    pub retry_count: u32,                   // failed attempts so far
}

/// Durable FIFO-per-table log of outstanding mutations.
///
/// Ordering within a table is `op_id` ascending; AUTOINCREMENT rowids are
/// never reused, so the id doubles as the monotonic sequence number. No
/// ordering is guaranteed across tables.
pub struct OpLog<'c> {
    conn: &'c Connection,
}

impl<'c> OpLog<'c> {
    /// Bind the log to an existing SQLite connection.
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Create the pending-ops table and its dequeue index.
    /// Safe to call multiple times.
    pub fn init_schema(conn: &Connection) -> Result<(), SyncError> {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS pending_ops (
op_id INTEGER PRIMARY KEY AUTOINCREMENT,
table_name TEXT NOT NULL,
op_kind TEXT NOT NULL CHECK(op_kind IN ('CREATE','UPDATE','DELETE')),
record_id TEXT NOT NULL,
payload TEXT, -- JSON (nullable for DELETE)
enqueued_at INTEGER NOT NULL,
retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_pending_ops_table
ON pending_ops(table_name, op_id);
"#,
        )?;
        Ok(())
    }

    /// Append a mutation. A single INSERT statement, so the entry is either
    /// fully durable or absent after a crash.
    pub fn enqueue(
        &self,
        kind: OpKind,
        table: &str,
        record_id: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<i64, SyncError> {
        self.conn.execute(
            "INSERT INTO pending_ops
(table_name, op_kind, record_id, payload, enqueued_at, retry_count)
VALUES (?1,?2,?3,?4,?5,0)",
            params![
                table,
                kind.as_str(),
                record_id,
                payload.map(|v| v.to_string()),
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Up to `limit` oldest entries for one table, in enqueue order.
    /// Entries are not removed; removal happens only via [`OpLog::ack`].
    pub fn dequeue_batch(&self, table: &str, limit: i64) -> Result<Vec<PendingOp>, SyncError> {
        let mut stmt = self.conn.prepare(
            "SELECT op_id, table_name, op_kind, record_id, payload, enqueued_at, retry_count
FROM pending_ops
WHERE table_name=?1
ORDER BY op_id ASC
LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![table, limit], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<String>>(4)?,
                r.get::<_, i64>(5)?,
                r.get::<_, u32>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (op_id, table, kind_raw, record_id, payload_raw, enqueued_at, retry_count) = row?;
            let kind =
                OpKind::parse(&kind_raw).ok_or(SyncError::State("unknown op kind in log"))?;
            let payload = match payload_raw {
                Some(raw) => Some(serde_json::from_str(&raw)?),
                None => None,
            };
            out.push(PendingOp {
                op_id,
                table,
                kind,
                record_id,
                payload,
                enqueued_at,
                retry_count,
            });
        }
        Ok(out)
    }

    /// Durably remove an entry once its remote effect is confirmed (or the
    /// entry is being dropped after classification).
    pub fn ack(&self, op_id: i64) -> Result<(), SyncError> {
        let n = self
            .conn
            .execute("DELETE FROM pending_ops WHERE op_id=?1", params![op_id])?;
        if n == 0 {
            return Err(SyncError::State("ack for unknown op id"));
        }
        Ok(())
    }

    /// Increment and persist the retry counter, returning the new count.
    pub fn mark_failed(&self, op_id: i64) -> Result<u32, SyncError> {
        let n = self.conn.execute(
            "UPDATE pending_ops SET retry_count = retry_count + 1 WHERE op_id=?1",
            params![op_id],
        )?;
        if n == 0 {
            return Err(SyncError::State("mark_failed for unknown op id"));
        }
        let count: u32 = self.conn.query_row(
            "SELECT retry_count FROM pending_ops WHERE op_id=?1",
            params![op_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Tables that currently have queued work.
    pub fn tables_with_pending(&self) -> Result<Vec<String>, SyncError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT table_name FROM pending_ops ORDER BY table_name ASC")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;

        let mut out = Vec::new();
        for t in rows {
            out.push(t?);
        }
        Ok(out)
    }

    /// Number of queued entries for one table.
    pub fn pending_count(&self, table: &str) -> Result<i64, SyncError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_ops WHERE table_name=?1",
            params![table],
            |r| r.get(0),
        )?;
        Ok(count)
    }
}
