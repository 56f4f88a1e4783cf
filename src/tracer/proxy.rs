//! Signal-proxy child.
//!
//! The tracer spends its life inside `waitpid(-1)`. Other threads wake it
//! by sending a user signal to a dedicated traced child whose only job is
//! to stop: the stop surfaces through the tracer's wait, which then drains
//! its command queue. The proxy also guarantees the wait always has a
//! child, so `ECHILD` never terminates the loop.

use log::debug;
use nix::sys::ptrace;
use nix::sys::signal::{kill, raise, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::errors::{Error, Result};

pub struct Proxy {
    pid: Pid,
}

impl Proxy {
    pub fn spawn() -> Result<Proxy> {
        // The child only calls async-signal-safe functions before it
        // settles into its pause loop.
        match unsafe { fork() }? {
            ForkResult::Child => {
                let _ = ptrace::traceme();
                let _ = raise(Signal::SIGSTOP);
                loop {
                    unsafe { libc::pause() };
                }
            }
            ForkResult::Parent { child } => {
                match waitpid(child, None)? {
                    WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
                    other => {
                        return Err(Error::Other(format!(
                            "signal proxy failed to stop: {:?}",
                            other
                        )))
                    }
                }
                ptrace::cont(child, None)?;
                debug!("signal proxy running as {}", child);
                Ok(Proxy { pid: child })
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Wake the tracer's wait loop.
    pub fn poke(&self) {
        let _ = kill(self.pid, Signal::SIGUSR1);
    }

    /// Resume the proxy after its stop surfaced, suppressing the wake
    /// signal.
    pub fn resume(&self) {
        let _ = ptrace::cont(self.pid, None);
    }

    pub fn shutdown(&self) {
        let _ = kill(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
    }
}
