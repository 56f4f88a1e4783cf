use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use chrono::{Datelike, Local, TimeZone, Timelike};

bitflags! {
    /// Per-path observation mask. Mirrors the kernel inotify bits we watch
    /// plus the tracer-originated observations that have no inotify
    /// equivalent.
    pub struct NoticeMask: u32 {
        const OPEN          = 0x0000_0020;
        const CLOSE_WRITE   = 0x0000_0008;
        const CLOSE_NOWRITE = 0x0000_0010;
        const CREATE        = 0x0000_0100;
        const DELETE        = 0x0000_0200;
        const MOVED_FROM    = 0x0000_0040;
        const MOVED_TO      = 0x0000_0080;
    }
}

/// In-memory aggregation record for one path within a coalescing epoch.
/// Unique by path; the mask accumulates the union of everything observed
/// until the epoch flips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNotice {
    pub path: PathBuf,
    pub mask: NoticeMask,
    /// Unix seconds of the first observation in this epoch.
    pub first_seen: i64,
}

impl FileNotice {
    pub fn new(path: PathBuf, mask: NoticeMask, first_seen: i64) -> FileNotice {
        FileNotice {
            path,
            mask,
            first_seen,
        }
    }

    /// Fold another observation of the same path into this notice. The
    /// first observation time wins.
    pub fn merge(&mut self, mask: NoticeMask) {
        self.mask |= mask;
    }
}

/// Wall-clock timestamp split the way the journal tables store it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub year: i32,
    pub yday: u32,
    pub hour: u32,
    pub min: u32,
    pub sec: u32,
}

impl Stamp {
    pub fn now() -> Stamp {
        split(Local::now())
    }

    pub fn from_unix(secs: i64) -> Stamp {
        match Local.timestamp_opt(secs, 0) {
            chrono::LocalResult::Single(t) => split(t),
            // Ambiguous or out of range; fall back to the epoch.
            _ => split(chrono::Utc.timestamp_opt(0, 0).unwrap()),
        }
    }
}

fn split<T: Datelike + Timelike>(t: T) -> Stamp {
    Stamp {
        year: t.year(),
        yday: t.ordinal(),
        hour: t.hour(),
        min: t.minute(),
        sec: t.second(),
    }
}

pub fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Subset of `stat` the tracer saves across two-phase syscalls and the
/// journal needs for sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: i64,
    pub ino: u64,
    pub dev: u64,
    pub mode: u32,
}

impl From<libc::stat> for FileStat {
    fn from(st: libc::stat) -> FileStat {
        FileStat {
            size: st.st_size as i64,
            ino: st.st_ino as u64,
            dev: st.st_dev as u64,
            mode: st.st_mode as u32,
        }
    }
}

/// A file observation produced by the process tracer, already attributed
/// to the top-level traced process.
#[derive(Debug, Clone)]
pub enum TraceEvent {
    Open {
        path: PathBuf,
        flags: i32,
        stat: Option<FileStat>,
        when: i64,
        application: String,
    },
    Close {
        path: PathBuf,
        when: i64,
        application: String,
    },
    Unlink {
        path: PathBuf,
        stat: Option<FileStat>,
        when: i64,
        application: String,
    },
    Rename {
        src: PathBuf,
        dest: PathBuf,
        stat: Option<FileStat>,
        when: i64,
        application: String,
    },
    /// The last thread of a top-level process exited.
    ProcessExit { pid: i32, application: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_merge_unions_masks() {
        let mut n = FileNotice::new(PathBuf::from("/t/a"), NoticeMask::OPEN, 10);
        n.merge(NoticeMask::CLOSE_WRITE);
        n.merge(NoticeMask::OPEN);
        assert_eq!(n.mask, NoticeMask::OPEN | NoticeMask::CLOSE_WRITE);
        assert_eq!(n.first_seen, 10);
    }

    #[test]
    fn stamp_splits_epoch() {
        let s = Stamp::from_unix(0);
        // Jan 1 1970 in every timezone west of +14.
        assert!(s.year == 1970 || s.year == 1969);
        assert!(s.yday >= 1 && s.yday <= 366);
    }
}
