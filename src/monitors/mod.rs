//! Platform monitors.
//!
//! Battery and network sources vary wildly by platform IPC, so each
//! monitor is written against a small source trait and exposed to the
//! daemon through the common collector contract below. Monitor events land
//! in the shared journals.

pub mod network;
pub mod power;
pub mod service;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::errors::Result;

/// The contract every monitor implements. `tick` blocks on the monitor's
/// platform source for at most `timeout` and processes at most one batch
/// of notifications; the driver loop picks the timeout from the soonest
/// pending scheduled action.
pub trait Collector {
    fn name(&self) -> &'static str;
    fn start(&mut self) -> Result<()>;
    fn tick(&mut self, timeout: Duration) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    /// Soonest scheduled action, if the monitor keeps a timer queue.
    fn next_deadline(&self) -> Option<Instant> {
        None
    }
}

/// Default dispatch timeout when a monitor has nothing scheduled.
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Drive one collector until `stop` flips. Operational errors are logged
/// and absorbed; the loop only ends on shutdown.
pub fn drive(mut collector: Box<dyn Collector>, stop: Arc<AtomicBool>) {
    if let Err(e) = collector.start() {
        warn!("{}: failed to start: {}", collector.name(), e);
        return;
    }
    while !stop.load(Ordering::SeqCst) {
        let timeout = match collector.next_deadline() {
            Some(deadline) => deadline
                .checked_duration_since(Instant::now())
                .unwrap_or(Duration::from_millis(0))
                .min(IDLE_TICK),
            None => IDLE_TICK,
        };
        if let Err(e) = collector.tick(timeout) {
            warn!("{}: tick failed: {}", collector.name(), e);
        }
    }
    if let Err(e) = collector.flush() {
        warn!("{}: final flush failed: {}", collector.name(), e);
    }
    if let Err(e) = collector.stop() {
        warn!("{}: stop failed: {}", collector.name(), e);
    }
    debug!("{}: stopped", collector.name());
}
