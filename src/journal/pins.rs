//! Pinned collector certificates.
//!
//! `ssl.db` holds the PEM the collector's TLS must chain to. The uploader
//! materialises the pin as a file next to the snapshot and hands its path
//! to the submitter; a pin installed via the command line is persisted
//! here so later runs keep enforcing it.

use std::path::{Path, PathBuf};

use rusqlite::OptionalExtension;

use super::store::Store;
use crate::errors::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pins (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pem TEXT NOT NULL
);
";

pub struct PinStore {
    store: Store,
}

impl PinStore {
    pub fn open(state_dir: &Path) -> Result<PinStore> {
        let store = Store::open(&state_dir.join("ssl.db"))?;
        store.conn().execute_batch(SCHEMA)?;
        Ok(PinStore { store })
    }

    /// Persist a pin, replacing any previous one.
    pub fn install(&self, pem: &str) -> Result<()> {
        self.store.conn().execute("DELETE FROM pins", [])?;
        self.store
            .conn()
            .execute("INSERT INTO pins (pem) VALUES (?1)", [pem])?;
        Ok(())
    }

    pub fn current(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .conn()
            .query_row("SELECT pem FROM pins ORDER BY id DESC LIMIT 1", [], |r| {
                r.get(0)
            })
            .optional()?)
    }

    /// Write the current pin beside the journals and return its path, for
    /// the submitter's `--cacert`.
    pub fn materialise(&self, state_dir: &Path) -> Result<Option<PathBuf>> {
        let pem = match self.current()? {
            Some(pem) => pem,
            None => return Ok(None),
        };
        let path = state_dir.join("collector-ca.pem");
        std::fs::write(&path, pem)?;
        Ok(Some(path))
    }
}
