use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use rusqlite::{Connection, OptionalExtension};

use crate::errors::Result;

/// How long a writer waits on a locked store before giving up. Concurrent
/// attach of the same file is allowed; the engine serialises writers.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// One sqlite store file. Opening sets the busy timeout; `bootstrap`
/// creates whichever stream schema belongs to the file's name.
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    pub fn open(path: &Path) -> Result<Store> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Store {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn open_in_memory() -> Result<Store> {
        Ok(Store {
            conn: Connection::open_in_memory()?,
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_conn(self) -> Connection {
        self.conn
    }

    /// Create the schema for this store plus the per-store uuid table.
    pub fn bootstrap(&self, uuid: &str) -> Result<()> {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match name.as_str() {
            "access.db" => self.conn.execute_batch(ACCESS_SCHEMA)?,
            "battery.db" => self.conn.execute_batch(BATTERY_SCHEMA)?,
            "network.db" => self.conn.execute_batch(NETWORK_SCHEMA)?,
            "process.db" => self.conn.execute_batch(PROCESS_SCHEMA)?,
            _ => {}
        }
        self.conn.execute_batch(UUID_SCHEMA)?;
        let have: Option<String> = self
            .conn
            .query_row("SELECT uuid FROM uuid LIMIT 1", [], |r| r.get(0))
            .optional()?;
        if have.is_none() {
            self.conn
                .execute("INSERT INTO uuid (uuid) VALUES (?1)", [uuid])?;
            debug!("stamped {} with site uuid", self.path.display());
        }
        Ok(())
    }
}

pub const ACCESS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS files (
    uid INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT UNIQUE NOT NULL,
    application TEXT,
    file_group TEXT
);
CREATE TABLE IF NOT EXISTS log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uid INTEGER NOT NULL,
    time INTEGER NOT NULL,
    size_plus_one INTEGER NOT NULL
);
";

pub const BATTERY_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS batteries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device TEXT UNIQUE NOT NULL,
    voltage_design INTEGER,
    voltage_unit TEXT,
    reporting_design INTEGER,
    reporting_unit TEXT
);
CREATE TABLE IF NOT EXISTS battery_log (
    rid INTEGER PRIMARY KEY AUTOINCREMENT,
    id INTEGER NOT NULL,
    year INTEGER, yday INTEGER, hour INTEGER, min INTEGER, sec INTEGER,
    is_charging INTEGER,
    is_discharging INTEGER,
    voltage INTEGER,
    reporting INTEGER,
    last_full INTEGER
);
";

pub const NETWORK_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS connection_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    year INTEGER, yday INTEGER, hour INTEGER, min INTEGER, sec INTEGER,
    service_triple TEXT,
    network_triple TEXT,
    status TEXT,
    rx INTEGER,
    tx INTEGER
);
CREATE TABLE IF NOT EXISTS stats_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    year INTEGER, yday INTEGER, hour INTEGER, min INTEGER, sec INTEGER,
    service_triple TEXT,
    network_triple TEXT,
    time_active INTEGER,
    signal_strength INTEGER,
    sent INTEGER,
    received INTEGER
);
CREATE TABLE IF NOT EXISTS scans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    year INTEGER, yday INTEGER, hour INTEGER, min INTEGER, sec INTEGER
);
CREATE TABLE IF NOT EXISTS scan_log (
    rid INTEGER PRIMARY KEY AUTOINCREMENT,
    id INTEGER NOT NULL,
    status TEXT,
    last_seen INTEGER,
    service_triple TEXT,
    service_name TEXT,
    service_priority INTEGER,
    network_triple TEXT,
    network_name TEXT,
    network_priority INTEGER,
    signal_strength INTEGER,
    signal_strength_db INTEGER,
    station_id TEXT
);
";

pub const PROCESS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS process_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    year INTEGER, yday INTEGER, hour INTEGER, min INTEGER, sec INTEGER,
    name TEXT NOT NULL,
    status TEXT NOT NULL
);
";

pub const UUID_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS uuid (
    uuid TEXT PRIMARY KEY
);
";

/// The site identifier, persisted in `uuid.db` and mirrored into each
/// stream store. Generated once from the kernel's random uuid source.
pub fn site_uuid(state_dir: &Path) -> Result<String> {
    let store = Store::open(&state_dir.join("uuid.db"))?;
    store.conn.execute_batch(UUID_SCHEMA)?;
    let have: Option<String> = store
        .conn
        .query_row("SELECT uuid FROM uuid LIMIT 1", [], |r| r.get(0))
        .optional()?;
    if let Some(u) = have {
        return Ok(u);
    }
    let fresh = fs::read_to_string("/proc/sys/kernel/random/uuid")?
        .trim()
        .to_string();
    store
        .conn
        .execute("INSERT INTO uuid (uuid) VALUES (?1)", [&fresh])?;
    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.db");
        for _ in 0..2 {
            let store = Store::open(&path).unwrap();
            store.bootstrap("abc-123").unwrap();
        }
        let store = Store::open(&path).unwrap();
        let uuid: String = store
            .conn()
            .query_row("SELECT uuid FROM uuid", [], |r| r.get(0))
            .unwrap();
        assert_eq!(uuid, "abc-123");
    }

    #[test]
    fn site_uuid_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let a = site_uuid(dir.path()).unwrap();
        let b = site_uuid(dir.path()).unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }
}
