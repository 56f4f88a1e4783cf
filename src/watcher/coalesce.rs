//! Event coalescing between the kernel stream and the access journal.
//!
//! Producers fold `(path, mask, time)` observations into the current one of
//! a pair of path-ordered notice maps. Every epoch (5 s) the consumer swaps
//! the maps and journals the drained side: one `log` row per path, carrying
//! the stable file id, the earliest observation time, and the file size
//! plus one (zero when the path no longer stats, meaning it was deleted by
//! observation time).

use std::collections::BTreeMap;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, warn};
use rusqlite::{params, OptionalExtension};

use crate::errors::Result;
use crate::event::{FileNotice, NoticeMask, TraceEvent};
use crate::journal::SqlBuf;

/// Interval between swaps of the current/other notice maps.
pub const EPOCH: Duration = Duration::from_secs(5);

struct MapsState {
    maps: [BTreeMap<PathBuf, FileNotice>; 2],
    cur: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<MapsState>,
    cond: Condvar,
}

#[derive(Clone)]
pub struct Coalescer {
    shared: Arc<Shared>,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new()
    }
}

impl Coalescer {
    pub fn new() -> Coalescer {
        Coalescer {
            shared: Arc::new(Shared {
                state: Mutex::new(MapsState {
                    maps: [BTreeMap::new(), BTreeMap::new()],
                    cur: 0,
                    shutdown: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Producer side: fold one observation into the current epoch.
    pub fn note(&self, path: &Path, mask: NoticeMask, when: i64) {
        let mut st = self.shared.state.lock().unwrap();
        let cur = st.cur;
        match st.maps[cur].get_mut(path) {
            Some(notice) => notice.merge(mask),
            None => {
                st.maps[cur].insert(
                    path.to_path_buf(),
                    FileNotice::new(path.to_path_buf(), mask, when),
                );
            }
        }
    }

    /// Ask the consumer to drain and exit.
    pub fn shutdown(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.shutdown = true;
        self.shared.cond.notify_all();
    }

    /// Consumer loop. Owns the access-journal buffer; also drains
    /// tracer-originated file events so the store keeps a single writer.
    pub fn run(&self, mut buf: SqlBuf, trace_rx: Receiver<TraceEvent>) {
        loop {
            let done = {
                let st = self.shared.state.lock().unwrap();
                let (st, _timeout) = self
                    .shared
                    .cond
                    .wait_timeout(st, EPOCH)
                    .unwrap();
                st.shutdown
            };
            while let Ok(ev) = trace_rx.try_recv() {
                if let Err(e) = self.absorb_trace_event(&mut buf, ev) {
                    warn!("coalesce: trace event dropped: {}", e);
                }
            }
            if let Err(e) = self.swap_and_process(&mut buf) {
                warn!("coalesce: epoch flush failed: {}", e);
            }
            if done {
                let _ = buf.flush();
                debug!("coalesce: drained, exiting");
                return;
            }
        }
    }

    /// Swap current/other if the current map is non-empty, then journal the
    /// drained map. One row per path per epoch.
    pub fn swap_and_process(&self, buf: &mut SqlBuf) -> Result<()> {
        let drained = {
            let mut st = self.shared.state.lock().unwrap();
            let cur = st.cur;
            if st.maps[cur].is_empty() {
                return Ok(());
            }
            st.cur = cur ^ 1;
            mem::take(&mut st.maps[cur])
        };
        for (_, notice) in drained {
            if let Err(e) = self.journal_notice(buf, &notice) {
                warn!("coalesce: {} not journalled: {}", notice.path.display(), e);
            }
        }
        buf.flush()?;
        Ok(())
    }

    fn journal_notice(&self, buf: &mut SqlBuf, notice: &FileNotice) -> Result<()> {
        let uid = file_id(buf, &notice.path, None)?;
        let size_plus_one = match std::fs::metadata(&notice.path) {
            Ok(md) => md.len() as i64 + 1,
            Err(_) => 0,
        };
        buf.append(
            &format!(
                "INSERT INTO log (uid, time, size_plus_one) VALUES ({}, {}, {})",
                uid, notice.first_seen, size_plus_one
            ),
            false,
        )?;
        Ok(())
    }

    /// Tracer events are attributed and partially two-path; they do not
    /// wait for an epoch boundary except where they coincide with watcher
    /// notices (open/close), which coalesce as usual.
    fn absorb_trace_event(&self, buf: &mut SqlBuf, ev: TraceEvent) -> Result<()> {
        match ev {
            TraceEvent::Open {
                path,
                when,
                application,
                ..
            } => {
                file_id(buf, &path, Some(&application))?;
                self.note(&path, NoticeMask::OPEN, when);
            }
            TraceEvent::Close {
                path,
                when,
                application,
            } => {
                file_id(buf, &path, Some(&application))?;
                self.note(&path, NoticeMask::CLOSE_WRITE, when);
            }
            TraceEvent::Unlink {
                path,
                when,
                application,
                ..
            } => {
                let uid = file_id(buf, &path, Some(&application))?;
                buf.append(
                    &format!(
                        "INSERT INTO log (uid, time, size_plus_one) VALUES ({}, {}, 0)",
                        uid, when
                    ),
                    false,
                )?;
            }
            TraceEvent::Rename {
                src,
                dest,
                stat,
                when,
                application,
            } => {
                let uid = file_id(buf, &src, Some(&application))?;
                let renamed = buf.conn().execute(
                    "UPDATE files SET filename = ?1 WHERE uid = ?2",
                    params![dest.to_string_lossy(), uid],
                );
                if renamed.is_err() {
                    // Destination name already known; keep both rows and
                    // let the log carry the observation.
                    debug!(
                        "rename target {} already indexed",
                        dest.to_string_lossy()
                    );
                }
                let size_plus_one = stat.map(|s| s.size + 1).unwrap_or(0);
                buf.append(
                    &format!(
                        "INSERT INTO log (uid, time, size_plus_one) VALUES ({}, {}, {})",
                        uid, when, size_plus_one
                    ),
                    false,
                )?;
            }
            TraceEvent::ProcessExit { .. } => {}
        }
        Ok(())
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        let st = self.shared.state.lock().unwrap();
        st.maps[st.cur].len()
    }
}

/// Resolve a path to its stable numeric file id, inserting the `files` row
/// the first time. An attributed observation fills `application` when the
/// column is still NULL.
fn file_id(buf: &SqlBuf, path: &Path, application: Option<&str>) -> Result<i64> {
    let name = path.to_string_lossy();
    let existing: Option<i64> = buf
        .conn()
        .query_row(
            "SELECT uid FROM files WHERE filename = ?1",
            params![name],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(uid) = existing {
        if let Some(app) = application {
            buf.conn().execute(
                "UPDATE files SET application = ?1 WHERE uid = ?2 AND application IS NULL",
                params![app, uid],
            )?;
        }
        return Ok(uid);
    }
    buf.conn().execute(
        "INSERT INTO files (filename, application) VALUES (?1, ?2)",
        params![name, application],
    )?;
    Ok(buf.conn().last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::store::ACCESS_SCHEMA;
    use rusqlite::Connection;
    use std::fs;
    use std::io::Write;

    fn access_buf() -> SqlBuf {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(ACCESS_SCHEMA).unwrap();
        SqlBuf::new(conn)
    }

    fn log_rows(buf: &SqlBuf) -> Vec<(i64, i64, i64)> {
        buf.conn()
            .prepare("SELECT uid, time, size_plus_one FROM log ORDER BY rowid")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn duplicate_observations_collapse_to_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        let mut f = fs::File::create(&file).unwrap();
        f.write_all(b"1234").unwrap();
        drop(f);

        let c = Coalescer::new();
        let mut buf = access_buf();
        c.note(&file, NoticeMask::OPEN, 100);
        c.note(&file, NoticeMask::CLOSE_WRITE, 105);
        c.note(&file, NoticeMask::OPEN, 110);
        assert_eq!(c.pending(), 1);

        c.swap_and_process(&mut buf).unwrap();
        let rows = log_rows(&buf);
        assert_eq!(rows.len(), 1);
        // Earliest observation wins; size is len+1.
        assert_eq!(rows[0].1, 100);
        assert_eq!(rows[0].2, 5);
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn missing_path_records_deleted() {
        let c = Coalescer::new();
        let mut buf = access_buf();
        c.note(Path::new("/no/such/file"), NoticeMask::DELETE, 7);
        c.swap_and_process(&mut buf).unwrap();
        let rows = log_rows(&buf);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].2, 0);
    }

    #[test]
    fn same_path_across_epochs_reuses_file_id() {
        let c = Coalescer::new();
        let mut buf = access_buf();
        c.note(Path::new("/e/f"), NoticeMask::OPEN, 1);
        c.swap_and_process(&mut buf).unwrap();
        c.note(Path::new("/e/f"), NoticeMask::OPEN, 2);
        c.swap_and_process(&mut buf).unwrap();
        let rows = log_rows(&buf);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, rows[1].0);
    }

    #[test]
    fn empty_epoch_does_not_swap() {
        let c = Coalescer::new();
        let mut buf = access_buf();
        c.swap_and_process(&mut buf).unwrap();
        assert!(log_rows(&buf).is_empty());
    }

    #[test]
    fn trace_open_attributes_application() {
        let c = Coalescer::new();
        let mut buf = access_buf();
        c.absorb_trace_event(
            &mut buf,
            TraceEvent::Open {
                path: PathBuf::from("/t/x"),
                flags: 0,
                stat: None,
                when: 5,
                application: "editor".into(),
            },
        )
        .unwrap();
        let app: Option<String> = buf
            .conn()
            .query_row(
                "SELECT application FROM files WHERE filename = '/t/x'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(app.as_deref(), Some("editor"));
        // The open itself coalesces with any watcher notice for the path.
        assert_eq!(c.pending(), 1);
    }

    #[test]
    fn trace_rename_moves_filename_and_logs_source() {
        let c = Coalescer::new();
        let mut buf = access_buf();
        let ev = TraceEvent::Rename {
            src: PathBuf::from("/t/x"),
            dest: PathBuf::from("/t/y"),
            stat: Some(crate::event::FileStat {
                size: 4,
                ino: 1,
                dev: 1,
                mode: 0o100644,
            }),
            when: 9,
            application: "mv".into(),
        };
        c.absorb_trace_event(&mut buf, ev).unwrap();
        buf.flush().unwrap();
        let name: String = buf
            .conn()
            .query_row("SELECT filename FROM files", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "/t/y");
        let rows = log_rows(&buf);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].2, 5);
    }
}
