use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::options::Options;

lazy_static! {
    static ref FLAGS: Mutex<Option<Flags>> = Mutex::new(None);
}

/// Well-known session services we refuse to attach the tracer to, matched
/// by executable basename.
pub const DENYLIST: &[&str] = &[
    "dbus-daemon",
    "gvfsd",
    "gvfsd-fuse",
    "pulseaudio",
    "gnome-shell",
    "systemd",
    "Xorg",
    "Xwayland",
];

/// Runtime configuration, resolved once from the command line and the
/// environment. Immutable afterwards.
#[derive(Debug, Clone)]
pub struct Flags {
    /// Subtree the filesystem watcher follows.
    pub base_dir: PathBuf,
    /// Dot-named state directory beneath the base, holding the journals,
    /// the pidfile and upload.db. Excluded from watching.
    pub state_dir: PathBuf,
    pub no_fork: bool,
    pub collector_url: String,
    pub collector_ca: Option<PathBuf>,
    pub ack_token: String,
    pub submitter: String,
    pub denylist: Vec<String>,
    pub stats_grace: Duration,
    pub log_level: log::LevelFilter,
}

impl Flags {
    /// The resolved global flags. Panics if `init` has not run; `init` is
    /// the first thing `main` does.
    pub fn get() -> Flags {
        FLAGS
            .lock()
            .unwrap()
            .clone()
            .expect("flags not initialised")
    }

    pub fn init(opts: &Options) {
        let base_dir = match &opts.base_dir {
            Some(d) => d.clone(),
            None => home_dir(),
        };
        let state_dir = base_dir.join(".usaged");
        let mut denylist: Vec<String> = DENYLIST.iter().map(|s| s.to_string()).collect();
        denylist.extend(opts.deny.iter().cloned());
        let log_level = match opts.log_level.as_str() {
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Info,
        };
        let flags = Flags {
            base_dir,
            state_dir,
            no_fork: opts.no_fork,
            collector_url: opts.collector_url.clone(),
            collector_ca: opts.collector_ca.clone(),
            ack_token: opts.ack_token.clone(),
            submitter: opts.submitter.clone(),
            denylist,
            stats_grace: Duration::from_millis(opts.stats_grace_ms),
            log_level,
        };
        *FLAGS.lock().unwrap() = Some(flags);
    }

    /// Test hook: install flags pointing at a scratch directory.
    pub fn init_for_tests(base_dir: PathBuf) {
        let state_dir = base_dir.join(".usaged");
        *FLAGS.lock().unwrap() = Some(Flags {
            base_dir,
            state_dir,
            no_fork: true,
            collector_url: "https://collector.invalid/submit".into(),
            collector_ca: None,
            ack_token: "stored".into(),
            submitter: "true".into(),
            denylist: DENYLIST.iter().map(|s| s.to_string()).collect(),
            stats_grace: Duration::from_millis(500),
            log_level: log::LevelFilter::Debug,
        });
    }
}

fn home_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) if !h.is_empty() => PathBuf::from(h),
        _ => PathBuf::from("/"),
    }
}
