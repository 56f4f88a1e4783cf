//! Bounded SQL-statement buffer bound to one store handle.
//!
//! Statements accumulate until the byte budget is hit, a caller forces a
//! flush, or the delayed-flush deadline passes; a flush executes the whole
//! batch inside a single transaction. Buffered statements execute in
//! insertion order. On a transaction error the batch is discarded and the
//! failure goes to the error sink (the log facade).

use std::time::{Duration, Instant};

use log::{error, trace};
use rusqlite::Connection;

use crate::errors::Result;

/// Byte budget for buffered statements, counting each statement plus a
/// terminating NUL.
pub const BUF_CAPACITY: usize = 64 * 1024;

/// Quote a string literal for inclusion in a buffered statement.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub struct SqlBuf {
    conn: Connection,
    stmts: Vec<String>,
    bytes: usize,
    cap: usize,
    /// Set when the first statement of the current batch was appended.
    first_append: Option<Instant>,
    flush_delay: Option<Duration>,
}

impl SqlBuf {
    pub fn new(conn: Connection) -> SqlBuf {
        SqlBuf::with_capacity(conn, BUF_CAPACITY)
    }

    pub fn with_capacity(conn: Connection, cap: usize) -> SqlBuf {
        SqlBuf {
            conn,
            stmts: Vec::new(),
            bytes: 0,
            cap,
            first_append: None,
            flush_delay: None,
        }
    }

    /// Direct access for reads and parameterised one-off statements.
    /// Callers must not leave a transaction open.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn into_conn(self) -> Connection {
        self.conn
    }

    /// Append `stmt`. When the buffer cannot hold it, or `force_flush` is
    /// set, the current batch executes first in one transaction; an
    /// oversize statement then executes standalone, otherwise the buffer
    /// restarts with `stmt`.
    pub fn append(&mut self, stmt: &str, force_flush: bool) -> Result<()> {
        let sz = stmt.len() + 1;
        if force_flush || self.bytes + sz > self.cap {
            self.flush()?;
        }
        if sz > self.cap {
            trace!("oversize statement ({} bytes), executing standalone", sz);
            if let Err(e) = self.conn.execute_batch(stmt) {
                error!("journal: standalone statement failed: {}: {}", e, stmt);
            }
            return Ok(());
        }
        if self.stmts.is_empty() {
            self.first_append = Some(Instant::now());
        }
        self.bytes += sz;
        self.stmts.push(stmt.to_string());
        Ok(())
    }

    /// Execute and clear the batch. A transaction spans exactly one flush;
    /// when the handle is already inside a transaction the statements
    /// execute without opening another one.
    pub fn flush(&mut self) -> Result<()> {
        if self.stmts.is_empty() {
            self.first_append = None;
            return Ok(());
        }
        let own_txn = self.conn.is_autocommit();
        if own_txn {
            if let Err(e) = self.conn.execute_batch("BEGIN") {
                error!("journal: BEGIN failed: {}", e);
                self.discard();
                return Ok(());
            }
        }
        for stmt in &self.stmts {
            if let Err(e) = self.conn.execute_batch(stmt) {
                error!("journal: batch statement failed: {}: {}", e, stmt);
                if own_txn {
                    let _ = self.conn.execute_batch("ROLLBACK");
                }
                self.discard();
                return Ok(());
            }
        }
        if own_txn {
            if let Err(e) = self.conn.execute_batch("COMMIT") {
                error!("journal: COMMIT failed: {}", e);
                let _ = self.conn.execute_batch("ROLLBACK");
            }
        }
        trace!("journal: flushed {} statements", self.stmts.len());
        self.discard();
        Ok(())
    }

    fn discard(&mut self) {
        self.stmts.clear();
        self.bytes = 0;
        self.first_append = None;
    }

    /// Schedule a flush at most `d` after the first buffered append.
    pub fn set_flush_delay(&mut self, d: Duration) {
        self.flush_delay = Some(d);
    }

    /// True when a delayed flush is owed.
    pub fn flush_due(&self) -> bool {
        match (self.first_append, self.flush_delay) {
            (Some(t0), Some(d)) => t0.elapsed() >= d,
            _ => false,
        }
    }

    /// Flush if the delayed-flush deadline has passed.
    pub fn flush_if_due(&mut self) -> Result<()> {
        if self.flush_due() {
            self.flush()?;
        }
        Ok(())
    }

    pub fn buffered(&self) -> usize {
        self.stmts.len()
    }

    /// Age of the oldest buffered statement.
    pub fn oldest(&self) -> Option<Duration> {
        self.first_append.map(|t| t.elapsed())
    }
}
