use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type. Operational errors are logged and absorbed at the
/// worker loops; only start-up resource acquisition propagates out of
/// `main`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Os(#[from] nix::Error),

    #[error("journal error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("/proc error: {0}")]
    Proc(#[from] procfs::ProcError),

    #[error("daemon already running (pid {0})")]
    AlreadyRunning(i32),

    #[error("kernel watch table exhausted")]
    WatchesExhausted,

    #[error("tracee {0} vanished")]
    TraceeGone(i32),

    #[error("patch verification failed for {0}")]
    PatchVerification(PathBuf),

    #[error("library image unsuitable: {0}")]
    BadImage(String),

    #[error("upload rejected by collector: {0}")]
    UploadRejected(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors meaning the target process is gone, which terminate
    /// per-process work silently.
    pub fn is_vanished(&self) -> bool {
        match self {
            Error::Os(nix::Error::ESRCH) => true,
            Error::TraceeGone(_) => true,
            Error::Io(e) => e.raw_os_error() == Some(libc::ESRCH),
            _ => false,
        }
    }
}
