use std::path::PathBuf;

use structopt::StructOpt;

/// Command-line surface of the daemon.
#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "usaged", about = "per-user activity and usage logging daemon")]
pub struct Options {
    /// Stay in the foreground instead of daemonizing.
    #[structopt(long = "no-fork")]
    pub no_fork: bool,

    /// Base directory to watch. Defaults to the user's home directory.
    #[structopt(long = "base-dir", parse(from_os_str))]
    pub base_dir: Option<PathBuf>,

    /// Collector base URL the uploader posts snapshots to.
    #[structopt(long = "collector-url", default_value = "https://collector.invalid/submit")]
    pub collector_url: String,

    /// Path to the pinned collector CA certificate handed to the submitter.
    #[structopt(long = "collector-ca", parse(from_os_str))]
    pub collector_ca: Option<PathBuf>,

    /// Token the collector's response must contain for an upload to count
    /// as acknowledged.
    #[structopt(long = "ack-token", default_value = "stored")]
    pub ack_token: String,

    /// Submitter executable invoked to post a snapshot. Receives an
    /// optional `--cacert <pin>`, then the snapshot path and the
    /// destination URL.
    #[structopt(long = "submitter", default_value = "usaged-submit")]
    pub submitter: String,

    /// Extra executable basenames never to attach the tracer to, in
    /// addition to the built-in denylist.
    #[structopt(long = "deny")]
    pub deny: Vec<String>,

    /// Grace period in milliseconds for the synchronous statistics request
    /// issued while a connection is disconnecting.
    #[structopt(long = "stats-grace-ms", default_value = "500")]
    pub stats_grace_ms: u64,

    /// Log verbosity: error, warn, info, debug or trace.
    #[structopt(long = "log-level", default_value = "info")]
    pub log_level: String,
}
