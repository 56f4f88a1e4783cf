//! Upload scheduler.
//!
//! Journal tables register at start-up; the uploader wakes periodically,
//! evaluates its predicate (allowlisted medium, link uptime, user
//! idleness, back-off windows) and, when it holds, snapshots every table
//! above its watermark, hands the snapshot to the collector submitter
//! subprocess, and on acknowledgment advances watermarks and deletes
//! acknowledged rows. Delivery is at-least-once: a crash between posting
//! and advancing re-sends the same row range, and the collector is
//! idempotent in `(uuid, table, rowid)`.

pub mod cursor;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use rusqlite::Connection;

pub use cursor::UploadDb;

use crate::errors::{Error, Result};
use crate::event::unix_now;
use crate::flags::Flags;
use crate::journal::JournalTable;
use crate::monitors::network::{Medium, SharedLink};

/// Minimum age of the default connection.
pub const LINK_MIN_UP: Duration = Duration::from_secs(5 * 60);
/// Minimum user idle time.
pub const IDLE_MIN: Duration = Duration::from_secs(2 * 60);
/// Success back-off window.
pub const SUCCESS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
/// Failure back-off: 5% of the success window.
pub const FAILURE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60 / 20);
/// Predicate re-evaluation cadence.
const WAKE_PERIOD: Duration = Duration::from_secs(30);

/// What the predicate needs to know about the world. The live
/// implementation reads the network monitor's shared link state and the
/// activity beacon; tests script it.
pub trait UploadEnv: Send {
    fn medium(&self) -> Option<Medium>;
    fn link_uptime(&self) -> Option<Duration>;
    fn idle(&self) -> Duration;
    fn now(&self) -> i64;
}

/// Timestamp of the last observed user activity, shared with the watcher.
#[derive(Clone, Default)]
pub struct ActivityBeacon {
    last: Arc<AtomicI64>,
}

impl ActivityBeacon {
    pub fn touch(&self) {
        self.last.store(unix_now(), Ordering::Relaxed);
    }

    pub fn idle(&self) -> Duration {
        let last = self.last.load(Ordering::Relaxed);
        if last == 0 {
            return Duration::from_secs(u64::MAX / 4);
        }
        Duration::from_secs((unix_now() - last).max(0) as u64)
    }
}

pub struct LiveEnv {
    pub link: SharedLink,
    pub beacon: ActivityBeacon,
}

impl UploadEnv for LiveEnv {
    fn medium(&self) -> Option<Medium> {
        self.link.lock().unwrap().link.map(|l| l.medium)
    }
    fn link_uptime(&self) -> Option<Duration> {
        self.link
            .lock()
            .unwrap()
            .link
            .map(|l| l.up_since.elapsed())
    }
    fn idle(&self) -> Duration {
        self.beacon.idle()
    }
    fn now(&self) -> i64 {
        unix_now()
    }
}

/// Collector-facing configuration, resolved from `Flags` for the daemon
/// and overridable in tests.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub submitter: String,
    pub collector_url: String,
    pub collector_ca: Option<PathBuf>,
    pub ack_token: String,
    pub state_dir: PathBuf,
}

impl UploaderConfig {
    pub fn from_flags() -> UploaderConfig {
        let flags = Flags::get();
        UploaderConfig {
            submitter: flags.submitter,
            collector_url: flags.collector_url,
            collector_ca: flags.collector_ca,
            ack_token: flags.ack_token,
            state_dir: flags.state_dir,
        }
    }
}

pub struct Uploader {
    tables: Vec<JournalTable>,
    db: UploadDb,
    env: Box<dyn UploadEnv>,
    config: UploaderConfig,
    site_uuid: String,
    in_progress: bool,
}

impl Uploader {
    pub fn new(
        tables: Vec<JournalTable>,
        db: UploadDb,
        env: Box<dyn UploadEnv>,
        config: UploaderConfig,
        site_uuid: String,
    ) -> Uploader {
        Uploader {
            tables,
            db,
            env,
            config,
            site_uuid,
            in_progress: false,
        }
    }

    /// All conditions must hold before an upload starts.
    pub fn predicate(&self) -> bool {
        if self.in_progress {
            return false;
        }
        match self.env.medium() {
            Some(Medium::Wired) | Some(Medium::Wlan) => {}
            _ => return false,
        }
        match self.env.link_uptime() {
            Some(up) if up >= LINK_MIN_UP => {}
            _ => return false,
        }
        if self.env.idle() < IDLE_MIN {
            return false;
        }
        let now = self.env.now();
        if let Ok(Some(t)) = self.db.last_success() {
            if now - t < SUCCESS_WINDOW.as_secs() as i64 {
                return false;
            }
        }
        if let Ok(Some(t)) = self.db.last_failure() {
            if now - t < FAILURE_WINDOW.as_secs() as i64 {
                return false;
            }
        }
        true
    }

    /// One upload cycle: snapshot, submit, advance. Returns whether any
    /// rows were staked.
    pub fn run_once(&mut self) -> Result<bool> {
        self.in_progress = true;
        let result = self.upload_cycle();
        self.in_progress = false;
        result
    }

    fn upload_cycle(&mut self) -> Result<bool> {
        let snapshot_path = self.config.state_dir.join("snapshot.db");
        let _ = std::fs::remove_file(&snapshot_path);
        let staked = self.build_snapshot(&snapshot_path)?;
        if staked.is_empty() {
            debug!("uploader: nothing above the watermarks");
            let _ = std::fs::remove_file(&snapshot_path);
            return Ok(false);
        }
        let output = self.submit(&snapshot_path);
        let now = self.env.now();
        match output {
            Ok(out) if out.contains(&self.config.ack_token) => {
                info!("uploader: collector acknowledged {} tables", staked.len());
                self.advance(&staked)?;
                self.db.record_attempt(now, true, &out)?;
            }
            Ok(out) => {
                warn!("uploader: no acknowledgement in collector output");
                self.db.record_attempt(now, false, &out)?;
            }
            Err(e) => {
                warn!("uploader: submitter failed: {}", e);
                self.db.record_attempt(now, false, &e.to_string())?;
            }
        }
        let _ = std::fs::remove_file(&snapshot_path);
        Ok(true)
    }

    /// Copy rows `through < rowid <= stake` of every registered table into
    /// deterministically named snapshot tables.
    fn build_snapshot(&mut self, snapshot_path: &Path) -> Result<Vec<Stake>> {
        let snap = Connection::open(snapshot_path)?;
        snap.execute_batch(
            "CREATE TABLE meta (uuid TEXT, filename TEXT, tbl TEXT, through INTEGER, stake INTEGER)",
        )?;
        let mut staked = Vec::new();
        for table in &self.tables {
            let filename = table.file.to_string_lossy().into_owned();
            let through = self.db.through(&filename, &table.table)?;
            snap.execute("ATTACH DATABASE ?1 AS src", [&filename])?;
            let stake: i64 = snap.query_row(
                &format!("SELECT COALESCE(MAX(rowid), 0) FROM src.{}", table.table),
                [],
                |r| r.get(0),
            )?;
            if stake > through {
                snap.execute(
                    &format!(
                        "CREATE TABLE snap_{} AS SELECT rowid AS orig_rowid, t.* \
                         FROM src.{} t WHERE rowid > {} AND rowid <= {}",
                        table.table, table.table, through, stake
                    ),
                    [],
                )?;
                snap.execute(
                    "INSERT INTO meta (uuid, filename, tbl, through, stake) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![self.site_uuid, filename, table.table, through, stake],
                )?;
                staked.push(Stake {
                    table: table.clone(),
                    stake,
                });
            }
            snap.execute_batch("DETACH DATABASE src")?;
        }
        Ok(staked)
    }

    /// Invoke the collector submitter and capture everything it prints.
    fn submit(&self, snapshot: &Path) -> Result<String> {
        let url = format!(
            "{}/{}",
            self.config.collector_url.trim_end_matches('/'),
            self.site_uuid
        );
        let mut cmd = Command::new(&self.config.submitter);
        if let Some(ca) = &self.config.collector_ca {
            cmd.arg("--cacert").arg(ca);
        }
        cmd.arg(snapshot).arg(&url);
        let out = cmd
            .output()
            .map_err(|e| Error::Other(format!("spawning {}: {}", self.config.submitter, e)))?;
        let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(text)
    }

    /// Acknowledged: delete uploaded rows where registered to, and move
    /// the watermarks up to the stakes.
    fn advance(&mut self, staked: &[Stake]) -> Result<()> {
        for s in staked {
            let filename = s.table.file.to_string_lossy().into_owned();
            if s.table.delete_on_ack {
                let conn = Connection::open(&s.table.file)?;
                conn.busy_timeout(Duration::from_secs(10))?;
                conn.execute_batch("BEGIN")?;
                let deleted = conn.execute(
                    &format!("DELETE FROM {} WHERE rowid <= {}", s.table.table, s.stake),
                    [],
                )?;
                conn.execute_batch("COMMIT")?;
                debug!(
                    "uploader: {}:{} deleted {} acknowledged rows",
                    filename, s.table.table, deleted
                );
            }
            self.db.set_through(&filename, &s.table.table, s.stake)?;
        }
        Ok(())
    }

    /// Worker loop: wait on the condition, re-evaluate the predicate, and
    /// upload when it holds.
    pub fn run(mut self, stop: Arc<(Mutex<bool>, Condvar)>) {
        loop {
            {
                let (lock, cond) = &*stop;
                let guard = lock.lock().unwrap();
                let (guard, _) = cond.wait_timeout(guard, WAKE_PERIOD).unwrap();
                if *guard {
                    break;
                }
            }
            if self.predicate() {
                if let Err(e) = self.run_once() {
                    warn!("uploader: cycle failed: {}", e);
                }
            }
        }
        debug!("uploader stopped");
    }

    #[cfg(test)]
    fn db(&self) -> &UploadDb {
        &self.db
    }
}

struct Stake {
    table: JournalTable,
    stake: i64,
}

/// Flip the stop flag and wake the uploader.
pub fn request_stop(stop: &Arc<(Mutex<bool>, Condvar)>) {
    let (lock, cond) = &**stop;
    *lock.lock().unwrap() = true;
    cond.notify_all();
}

/// Shared stop handle for the uploader loop.
pub fn stop_handle() -> Arc<(Mutex<bool>, Condvar)> {
    Arc::new((Mutex::new(false), Condvar::new()))
}
