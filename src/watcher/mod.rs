//! Recursive filesystem watcher.
//!
//! A scan worker walks directory subtrees and installs one kernel watch per
//! directory; the reader loop blocks on the event stream, resolves events
//! to absolute paths and feeds non-directory observations to the
//! coalescer. The daemon's own state directory is excluded. Watch-table
//! exhaustion is terminal: the daemon cannot meet its reporting contract
//! once the kernel refuses further watches.

pub mod coalesce;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use log::{debug, error, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

pub use coalesce::Coalescer;

use crate::errors::Result;
use crate::event::{unix_now, NoticeMask};
use crate::flags::Flags;
use crate::uploader::ActivityBeacon;

fn watch_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::OPEN
        | WatchMask::CLOSE_WRITE
        | WatchMask::CLOSE_NOWRITE
}

type WatchMap = Arc<Mutex<HashMap<WatchDescriptor, PathBuf>>>;

pub struct Watcher {
    inotify: Inotify,
    watches: Watches,
    /// Watch descriptor to path relative to the base root.
    map: WatchMap,
    scan_tx: Sender<PathBuf>,
    base: PathBuf,
    /// User-activity signal for the upload predicate.
    beacon: ActivityBeacon,
}

impl Watcher {
    /// Initialise the kernel stream, spawn the scan worker and enqueue the
    /// base subtree. Failure to initialise the stream is fatal at
    /// start-up.
    pub fn start(beacon: ActivityBeacon) -> Result<Watcher> {
        let flags = Flags::get();
        let mut inotify = Inotify::init()?;
        let watches = inotify.watches();
        let map: WatchMap = Arc::new(Mutex::new(HashMap::new()));
        let (scan_tx, scan_rx) = channel::<PathBuf>();

        let worker = ScanWorker {
            watches: watches.clone(),
            map: map.clone(),
            base: flags.base_dir.clone(),
            state_dir: flags.state_dir.clone(),
        };
        thread::Builder::new()
            .name("fs-scan".into())
            .spawn(move || worker.run(scan_rx))?;

        scan_tx
            .send(flags.base_dir.clone())
            .expect("scan worker just spawned");

        Ok(Watcher {
            inotify,
            watches,
            map,
            scan_tx,
            base: flags.base_dir,
            beacon,
        })
    }

    /// Reader loop; blocks on the kernel stream until the process exits.
    /// Interrupted reads retry.
    pub fn run_reader(mut self, coalescer: Coalescer) {
        let mut buffer = [0u8; 4096];
        loop {
            let events = match self.inotify.read_events_blocking(&mut buffer) {
                Ok(events) => events,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("watch stream read failed: {}", e);
                    return;
                }
            };
            for event in events {
                self.handle_event(&coalescer, event.wd, event.mask, event.name);
            }
        }
    }

    fn handle_event(
        &mut self,
        coalescer: &Coalescer,
        wd: WatchDescriptor,
        mask: EventMask,
        name: Option<&std::ffi::OsStr>,
    ) {
        if mask.contains(EventMask::Q_OVERFLOW) {
            warn!("kernel event queue overflowed; observations lost");
            return;
        }
        let dir = {
            let map = self.map.lock().unwrap();
            match map.get(&wd) {
                Some(rel) => self.base.join(rel),
                None => return,
            }
        };
        if mask.contains(EventMask::IGNORED) {
            self.map.lock().unwrap().remove(&wd);
            return;
        }
        if mask.contains(EventMask::DELETE_SELF) {
            let _ = self.watches.remove(wd);
            return;
        }
        let path = match name {
            Some(n) => dir.join(n),
            None => dir,
        };
        if mask.contains(EventMask::ISDIR) {
            if mask.contains(EventMask::CREATE) {
                let _ = self.scan_tx.send(path);
            }
            return;
        }
        if let Some(notice) = to_notice_mask(mask) {
            self.beacon.touch();
            coalescer.note(&path, notice, unix_now());
        }
    }
}

fn to_notice_mask(mask: EventMask) -> Option<NoticeMask> {
    let mut out = NoticeMask::empty();
    if mask.contains(EventMask::OPEN) {
        out |= NoticeMask::OPEN;
    }
    if mask.contains(EventMask::CLOSE_WRITE) {
        out |= NoticeMask::CLOSE_WRITE;
    }
    if mask.contains(EventMask::CLOSE_NOWRITE) {
        out |= NoticeMask::CLOSE_NOWRITE;
    }
    if mask.contains(EventMask::CREATE) {
        out |= NoticeMask::CREATE;
    }
    if mask.contains(EventMask::DELETE) {
        out |= NoticeMask::DELETE;
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

struct ScanWorker {
    watches: Watches,
    map: WatchMap,
    base: PathBuf,
    state_dir: PathBuf,
}

impl ScanWorker {
    fn run(mut self, rx: Receiver<PathBuf>) {
        while let Ok(dir) = rx.recv() {
            self.scan_subtree(&dir);
        }
    }

    /// Depth-first physical walk installing one watch per directory.
    /// Symbolic links and non-directories are skipped.
    fn scan_subtree(&mut self, root: &Path) {
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            if dir.starts_with(&self.state_dir) {
                continue;
            }
            match std::fs::symlink_metadata(&dir) {
                Ok(md) if md.file_type().is_dir() => {}
                _ => continue,
            }
            if !self.install_watch(&dir) {
                return;
            }
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                match std::fs::symlink_metadata(&path) {
                    Ok(md) if md.file_type().is_dir() => stack.push(path),
                    _ => {}
                }
            }
        }
    }

    /// Returns false when the kernel is out of watches, which is terminal.
    fn install_watch(&mut self, dir: &Path) -> bool {
        match self.watches.add(dir, watch_mask()) {
            Ok(wd) => {
                let rel = dir
                    .strip_prefix(&self.base)
                    .unwrap_or(Path::new(""))
                    .to_path_buf();
                debug!("watching {}", dir.display());
                self.map.lock().unwrap().insert(wd, rel);
                true
            }
            Err(e) => match e.raw_os_error() {
                Some(libc::EACCES) | Some(libc::ENOENT) | Some(libc::EPERM) => true,
                Some(libc::ENOSPC) => {
                    error!("kernel watch table exhausted at {}; shutting down", dir.display());
                    let _ = kill(Pid::this(), Signal::SIGTERM);
                    false
                }
                _ => {
                    warn!("watch on {} failed: {}", dir.display(), e);
                    true
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_mask_conversion_unions() {
        let m = to_notice_mask(EventMask::OPEN | EventMask::CLOSE_WRITE).unwrap();
        assert_eq!(m, NoticeMask::OPEN | NoticeMask::CLOSE_WRITE);
        assert!(to_notice_mask(EventMask::MOVED_TO).is_none());
    }

    #[test]
    fn scan_installs_watch_per_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::create_dir_all(dir.path().join("c")).unwrap();
        std::fs::write(dir.path().join("a/file.txt"), b"x").unwrap();
        // A symlinked directory must not be followed.
        let _ = std::os::unix::fs::symlink(dir.path().join("c"), dir.path().join("a/link"));

        let mut inotify = Inotify::init().unwrap();
        let map: WatchMap = Arc::new(Mutex::new(HashMap::new()));
        let mut worker = ScanWorker {
            watches: inotify.watches(),
            map: map.clone(),
            base: dir.path().to_path_buf(),
            state_dir: dir.path().join(".usaged"),
        };
        worker.scan_subtree(dir.path());
        // root, a, a/b and c, but not a/link.
        assert_eq!(map.lock().unwrap().len(), 4);
    }

    #[test]
    fn state_dir_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".usaged/sub")).unwrap();
        let mut inotify = Inotify::init().unwrap();
        let map: WatchMap = Arc::new(Mutex::new(HashMap::new()));
        let mut worker = ScanWorker {
            watches: inotify.watches(),
            map: map.clone(),
            base: dir.path().to_path_buf(),
            state_dir: dir.path().join(".usaged"),
        };
        worker.scan_subtree(dir.path());
        assert_eq!(map.lock().unwrap().len(), 1);
    }
}
