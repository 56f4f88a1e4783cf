//! Per-user activity and filesystem-usage logging daemon.
//!
//! The daemon hosts several cooperating workers in one process: an inotify
//! watcher with a coalescing queue, battery/network/service monitors, a
//! ptrace supervisor that selectively intercepts file syscalls in traced
//! process trees, and an upload scheduler that ships journal rows to a
//! remote collector. Events land in per-stream sqlite journals beneath the
//! user's state directory.

#[macro_use]
extern crate lazy_static;

pub mod errors;
pub mod event;
pub mod flags;
pub mod journal;
pub mod monitors;
pub mod options;
pub mod pidfile;
pub mod sigfan;
pub mod tracer;
pub mod uploader;
pub mod watcher;

pub use errors::{Error, Result};
