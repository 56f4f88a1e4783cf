//! Thread control blocks.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use nix::unistd::Pid;

use super::pcb::PcbWeak;
use super::shed::LoadRing;
use crate::event::FileStat;

pub type TcbRef = Rc<RefCell<Tcb>>;

/// Whether the tracer-child options could be set on this thread. On
/// kernels lacking the trace-clone family the tracer falls back to
/// explicit attach at clone exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionsState {
    Unset,
    Set,
    Unsupported,
}

pub struct Tcb {
    pub tid: Pid,
    pub pcb: PcbWeak,
    /// −1 iff the thread is not between syscall-entry and syscall-exit.
    pub outstanding_syscall: i64,
    /// Source path saved at entry for the two-phase syscalls (unlink,
    /// rename).
    pub saved_path: Option<PathBuf>,
    pub saved_stat: Option<FileStat>,
    pub options_state: OptionsState,
    /// Detach at the next stop.
    pub stop_tracing: bool,
    /// Shed by the load policy; detached at the next stop but remembered
    /// until the daemon quits.
    pub suspended: bool,
    /// Stop on every syscall. Set from attach until the process's library
    /// images are patched, and permanently when patch verification fails,
    /// so nothing is missed either way.
    pub full_syscall_trace: bool,
    /// The thread has stopped cleanly at least once since attach/exec, so
    /// options are set and its libraries have been examined.
    pub seen_first_stop: bool,
    pub ring: LoadRing,
    /// Interesting events this thread produced, for the shedding policy.
    pub interesting_events: u64,
}

impl Tcb {
    pub fn new(tid: Pid, pcb: PcbWeak) -> TcbRef {
        Rc::new(RefCell::new(Tcb {
            tid,
            pcb,
            outstanding_syscall: -1,
            saved_path: None,
            saved_stat: None,
            options_state: OptionsState::Unset,
            stop_tracing: false,
            suspended: false,
            full_syscall_trace: true,
            seen_first_stop: false,
            ring: LoadRing::default(),
            interesting_events: 0,
        }))
    }

    pub fn in_syscall(&self) -> bool {
        self.outstanding_syscall != -1
    }

    /// Clear the two-phase scratch state. Called at syscall exit.
    pub fn clear_saved(&mut self) {
        self.saved_path = None;
        self.saved_stat = None;
        self.outstanding_syscall = -1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Weak;

    #[test]
    fn fresh_tcb_is_between_syscalls() {
        let t = Tcb::new(Pid::from_raw(100), Weak::new());
        assert!(!t.borrow().in_syscall());
        assert_eq!(t.borrow().outstanding_syscall, -1);
    }

    #[test]
    fn clear_saved_restores_invariant() {
        let t = Tcb::new(Pid::from_raw(100), Weak::new());
        {
            let mut t = t.borrow_mut();
            t.outstanding_syscall = 87;
            t.saved_path = Some(PathBuf::from("/x"));
        }
        t.borrow_mut().clear_saved();
        assert!(!t.borrow().in_syscall());
        assert!(t.borrow().saved_path.is_none());
    }
}
