//! Centralised unix-signal fan-out.
//!
//! The daemon blocks its configurable signal mask before any worker thread
//! is spawned, so every thread inherits the blocked set. One fan-out thread
//! then waits on the set and broadcasts each delivery as an in-process
//! notice to the subscribers registered for that signal. Registration is
//! reference-counted per signal so subsystems can request and release
//! signals independently.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, warn};
use nix::sys::signal::{SigSet, SigmaskHow, Signal};

use crate::errors::Result;

/// What a subscriber receives for each delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigNotice {
    pub signal: Signal,
}

struct FanInner {
    /// Refcount per signal number.
    refs: HashMap<i32, usize>,
    /// Live subscriber channels, with the signal each one asked for.
    subs: Vec<(i32, Sender<SigNotice>)>,
}

#[derive(Clone)]
pub struct SignalFan {
    inner: Arc<Mutex<FanInner>>,
}

impl SignalFan {
    /// Block `mask` process-wide and start the fan-out thread. Must run
    /// before any worker thread is spawned so the mask is inherited.
    pub fn start(mask: &[Signal]) -> Result<SignalFan> {
        let mut set = SigSet::empty();
        for sig in mask {
            set.add(*sig);
        }
        set.thread_block()?;

        let fan = SignalFan {
            inner: Arc::new(Mutex::new(FanInner {
                refs: HashMap::new(),
                subs: Vec::new(),
            })),
        };
        let inner = fan.inner.clone();
        let wait_set = set;
        thread::Builder::new()
            .name("sigfan".into())
            .spawn(move || fan_loop(wait_set, inner))?;
        Ok(fan)
    }

    /// Subscribe to one signal. Bumps the signal's refcount and returns the
    /// notice channel; dropping the receiver releases the subscription on
    /// the next delivery attempt.
    pub fn register(&self, signal: Signal) -> Receiver<SigNotice> {
        let (tx, rx) = channel();
        let mut inner = self.inner.lock().unwrap();
        *inner.refs.entry(signal as i32).or_insert(0) += 1;
        inner.subs.push((signal as i32, tx));
        rx
    }

    /// Drop one reference to `signal`. Deliveries stop reaching
    /// subscribers once the count hits zero.
    pub fn release(&self, signal: Signal) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(count) = inner.refs.get_mut(&(signal as i32)) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.refs.remove(&(signal as i32));
                debug!("signal {:?} released by all subscribers", signal);
            }
        }
    }

    #[cfg(test)]
    fn broadcast(&self, signal: Signal) {
        deliver(&self.inner, signal);
    }
}

fn fan_loop(set: SigSet, inner: Arc<Mutex<FanInner>>) {
    loop {
        match set.wait() {
            Ok(signal) => deliver(&inner, signal),
            Err(e) => {
                warn!("sigwait failed: {}", e);
                return;
            }
        }
    }
}

fn deliver(inner: &Arc<Mutex<FanInner>>, signal: Signal) {
    let mut guard = inner.lock().unwrap();
    let registered = guard.refs.get(&(signal as i32)).copied().unwrap_or(0) > 0;
    if !registered {
        return;
    }
    // Prune subscribers whose receiving end is gone while broadcasting.
    guard
        .subs
        .retain(|(num, tx)| *num != signal as i32 || tx.send(SigNotice { signal }).is_ok());
}

/// Restore the default disposition for signals we do not fan out, matching
/// the per-thread unblocking the platform expects.
pub fn unblock_all_but(mask: &[Signal]) -> Result<()> {
    let mut unblock = SigSet::all();
    for sig in mask {
        unblock.remove(*sig);
    }
    nix::sys::signal::pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&unblock), None)?;
    Ok(())
}
