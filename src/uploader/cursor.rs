//! Durable upload state.
//!
//! `upload.db` holds one cursor row per registered journal table: the
//! `through` watermark is the highest row identifier known to be durably
//! uploaded. Every attempt, success or failure, is appended to the
//! attempt log together with the collector's captured output.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::Result;

/// Collector output is capped before it lands in the attempt log.
const OUTPUT_CAP: usize = 4096;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cursors (
    filename TEXT NOT NULL,
    tbl TEXT NOT NULL,
    through INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (filename, tbl)
);
CREATE TABLE IF NOT EXISTS uploads (
    timestamp INTEGER NOT NULL,
    success INTEGER NOT NULL,
    server_output TEXT
);
";

pub struct UploadDb {
    conn: Connection,
}

impl UploadDb {
    pub fn open(path: &Path) -> Result<UploadDb> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        conn.execute_batch(SCHEMA)?;
        Ok(UploadDb { conn })
    }

    pub fn open_in_memory() -> Result<UploadDb> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(UploadDb { conn })
    }

    pub fn through(&self, filename: &str, table: &str) -> Result<i64> {
        let v: Option<i64> = self
            .conn
            .query_row(
                "SELECT through FROM cursors WHERE filename = ?1 AND tbl = ?2",
                params![filename, table],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v.unwrap_or(0))
    }

    /// Advance the watermark. Watermarks never regress: a smaller value
    /// than the stored one is ignored.
    pub fn set_through(&self, filename: &str, table: &str, through: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cursors (filename, tbl, through) VALUES (?1, ?2, ?3) \
             ON CONFLICT(filename, tbl) DO UPDATE SET through = MAX(through, excluded.through)",
            params![filename, table, through],
        )?;
        Ok(())
    }

    pub fn record_attempt(&self, timestamp: i64, success: bool, output: &str) -> Result<()> {
        let mut capped = output.to_string();
        capped.truncate(OUTPUT_CAP);
        self.conn.execute(
            "INSERT INTO uploads (timestamp, success, server_output) VALUES (?1, ?2, ?3)",
            params![timestamp, success as i64, capped],
        )?;
        Ok(())
    }

    pub fn last_success(&self) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT MAX(timestamp) FROM uploads WHERE success = 1",
                [],
                |r| r.get(0),
            )
            .optional()?
            .flatten())
    }

    pub fn last_failure(&self) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT MAX(timestamp) FROM uploads WHERE success = 0",
                [],
                |r| r.get(0),
            )
            .optional()?
            .flatten())
    }

    pub fn attempts(&self) -> Result<Vec<(i64, bool)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT timestamp, success FROM uploads ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)? != 0)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
