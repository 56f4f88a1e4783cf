//! On-disk event journals.
//!
//! Every event stream gets its own sqlite store beneath the state
//! directory. All tables are rowid tables; the implicit rowid is the
//! monotone per-table identifier the upload scheduler uses as its
//! watermark. Each store also carries the site uuid so collector-side
//! idempotency can key on `(uuid, table, rowid)`.

pub mod pins;
pub mod sql_buf;
pub mod store;

use std::path::PathBuf;

pub use pins::PinStore;
pub use sql_buf::SqlBuf;
pub use store::Store;

use crate::errors::Result;
use crate::flags::Flags;

/// One uploadable table: which store file it lives in, its name, and
/// whether acknowledged rows are deleted.
#[derive(Debug, Clone)]
pub struct JournalTable {
    pub file: PathBuf,
    pub table: String,
    pub delete_on_ack: bool,
}

/// The registry handed to the upload scheduler at start-up. Reference
/// tables (`files`, `batteries`, `scans`) are uploaded but kept, since
/// later log rows refer to them; pure log tables are deleted on ack.
pub fn registry() -> Vec<JournalTable> {
    let flags = Flags::get();
    let t = |file: &str, table: &str, delete_on_ack: bool| JournalTable {
        file: flags.state_dir.join(file),
        table: table.to_string(),
        delete_on_ack,
    };
    vec![
        t("access.db", "files", false),
        t("access.db", "log", true),
        t("battery.db", "batteries", false),
        t("battery.db", "battery_log", true),
        t("network.db", "connection_log", true),
        t("network.db", "stats_log", true),
        t("network.db", "scans", false),
        t("network.db", "scan_log", true),
        t("process.db", "process_log", true),
    ]
}

/// Create the state directory and bootstrap every store's schema. Fatal at
/// start-up when the directory cannot be created.
pub fn init_stores() -> Result<()> {
    let flags = Flags::get();
    std::fs::create_dir_all(&flags.state_dir)?;
    let uuid = store::site_uuid(&flags.state_dir)?;
    for name in &[
        "access.db",
        "battery.db",
        "network.db",
        "process.db",
        "ssl.db",
        "log.db",
    ] {
        let store = Store::open(&flags.state_dir.join(name))?;
        store.bootstrap(&uuid)?;
    }
    Ok(())
}
