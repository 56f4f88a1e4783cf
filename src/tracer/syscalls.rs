//! Interesting-syscall table and the entry/exit demultiplexer.
//!
//! Two-phase syscalls (unlink, rename and friends) resolve and stat their
//! source path at entry, while it still exists, and report at exit once
//! the result code is known. Descriptor results resolve through
//! `/proc/<tid>/fd`.

use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

use log::debug;
use nix::unistd::Pid;

use super::pcb::Pcb;
use super::regs::Registers;
use super::tcb::{OptionsState, Tcb};
use crate::event::{unix_now, FileStat, TraceEvent};

pub const SYS_MMAP: i64 = 9;
pub const SYS_CLONE: i64 = 56;
pub const SYS_OPEN: i64 = 2;
pub const SYS_CLOSE: i64 = 3;
pub const SYS_RENAME: i64 = 82;
pub const SYS_RMDIR: i64 = 84;
pub const SYS_UNLINK: i64 = 87;
pub const SYS_OPENAT: i64 = 257;
pub const SYS_UNLINKAT: i64 = 263;
pub const SYS_RENAMEAT: i64 = 264;
pub const SYS_RENAMEAT2: i64 = 316;

/// The numbers whose sites get patched and whose stops get reported.
pub const INTERESTING: [i64; 11] = [
    SYS_OPEN,
    SYS_CLOSE,
    SYS_RENAME,
    SYS_RMDIR,
    SYS_UNLINK,
    SYS_OPENAT,
    SYS_UNLINKAT,
    SYS_RENAMEAT,
    SYS_RENAMEAT2,
    SYS_CLONE,
    SYS_MMAP,
];

pub fn is_interesting(nr: i64) -> bool {
    INTERESTING.contains(&nr)
}

pub fn name(nr: i64) -> &'static str {
    match nr {
        SYS_MMAP => "mmap",
        SYS_CLONE => "clone",
        SYS_OPEN => "open",
        SYS_CLOSE => "close",
        SYS_RENAME => "rename",
        SYS_RMDIR => "rmdir",
        SYS_UNLINK => "unlink",
        SYS_OPENAT => "openat",
        SYS_UNLINKAT => "unlinkat",
        SYS_RENAMEAT => "renameat",
        SYS_RENAMEAT2 => "renameat2",
        _ => "?",
    }
}

const AT_FDCWD: i64 = -100;

/// What the tracer must do after a reported exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    None,
    /// clone() returned a child the kernel will not auto-attach.
    AttachChild(i32),
    /// A tracked library was mapped executable; re-run patching.
    Repatch,
}

/// Syscall-entry half: record the outstanding number and save the source
/// path and stat for the two-phase calls.
pub fn on_entry(tcb: &mut Tcb, pcb: &mut Pcb, regs: &Registers) {
    let nr = regs.syscallno();
    tcb.outstanding_syscall = nr;
    match nr {
        SYS_UNLINK | SYS_RMDIR | SYS_RENAME => {
            save_source(tcb, pcb, AT_FDCWD, regs.arg(0));
        }
        SYS_UNLINKAT | SYS_RENAMEAT | SYS_RENAMEAT2 => {
            save_source(tcb, pcb, regs.arg(0) as i32 as i64, regs.arg(1));
        }
        SYS_CLOSE => {
            // The descriptor is gone by exit time; resolve it now.
            tcb.saved_path = fd_path(tcb.tid, regs.arg(0) as i64);
        }
        _ => {}
    }
}

fn save_source(tcb: &mut Tcb, pcb: &mut Pcb, dirfd: i64, path_ptr: u64) {
    let raw = match pcb.read_c_str(path_ptr) {
        Ok(p) => p,
        Err(e) => {
            debug!("entry path read failed in {}: {}", tcb.tid, e);
            return;
        }
    };
    let resolved = resolve_at(tcb.tid, dirfd, &raw);
    tcb.saved_stat = stat_path(&resolved);
    tcb.saved_path = Some(resolved);
}

/// Syscall-exit half. Emits attributed events into `out`; the caller owns
/// delivery off the tracer thread.
pub fn on_exit(
    tcb: &mut Tcb,
    pcb: &mut Pcb,
    regs: &Registers,
    allow: &dyn Fn(&Path) -> bool,
    application: &str,
    out: &mut Vec<TraceEvent>,
) -> ExitAction {
    let nr = tcb.outstanding_syscall;
    let r = regs.syscall_result_signed();
    let mut action = ExitAction::None;
    match nr {
        SYS_OPEN | SYS_OPENAT => {
            if r >= 0 {
                let flags = if nr == SYS_OPEN {
                    regs.arg(1) as i32
                } else {
                    regs.arg(2) as i32
                };
                if let Some(path) = fd_path(tcb.tid, r) {
                    if patchable_library(pcb, &path) {
                        pcb.tracked_fds.insert(r as i32, path.clone());
                    }
                    if allow(&path) {
                        tcb.interesting_events += 1;
                        out.push(TraceEvent::Open {
                            stat: stat_path(&path),
                            path,
                            flags,
                            when: unix_now(),
                            application: application.to_string(),
                        });
                    }
                }
            }
        }
        SYS_CLOSE => {
            let fd = regs.arg(0) as i32;
            pcb.tracked_fds.remove(&fd);
            if r >= 0 {
                if let Some(path) = tcb.saved_path.take() {
                    if allow(&path) {
                        tcb.interesting_events += 1;
                        out.push(TraceEvent::Close {
                            path,
                            when: unix_now(),
                            application: application.to_string(),
                        });
                    }
                }
            }
        }
        SYS_UNLINK | SYS_UNLINKAT | SYS_RMDIR => {
            if r >= 0 {
                if let Some(path) = tcb.saved_path.take() {
                    if allow(&path) {
                        tcb.interesting_events += 1;
                        out.push(TraceEvent::Unlink {
                            path,
                            stat: tcb.saved_stat.take(),
                            when: unix_now(),
                            application: application.to_string(),
                        });
                    }
                }
            }
        }
        SYS_RENAME | SYS_RENAMEAT | SYS_RENAMEAT2 => {
            if r >= 0 {
                let (destfd, dest_ptr) = if nr == SYS_RENAME {
                    (AT_FDCWD, regs.arg(1))
                } else {
                    (regs.arg(2) as i32 as i64, regs.arg(3))
                };
                if let (Some(src), Ok(raw)) = (tcb.saved_path.take(), pcb.read_c_str(dest_ptr)) {
                    let dest = resolve_at(tcb.tid, destfd, &raw);
                    if allow(&src) || allow(&dest) {
                        tcb.interesting_events += 1;
                        out.push(TraceEvent::Rename {
                            src,
                            dest,
                            stat: tcb.saved_stat.take(),
                            when: unix_now(),
                            application: application.to_string(),
                        });
                    }
                }
            }
        }
        SYS_CLONE => {
            if r > 0 && tcb.options_state == OptionsState::Unsupported {
                action = ExitAction::AttachChild(r as i32);
            }
        }
        SYS_MMAP => {
            let prot = regs.arg(2) as i32;
            let fd = regs.arg(4) as i32;
            if r >= 0 && prot & libc::PROT_EXEC != 0 && pcb.tracked_fds.contains_key(&fd) {
                action = ExitAction::Repatch;
            }
        }
        _ => {}
    }
    tcb.clear_saved();
    action
}

fn patchable_library(pcb: &Pcb, path: &Path) -> bool {
    pcb.libraries.contains_key(path) || super::patch::is_library_of_interest(path)
}

/// Resolve a possibly relative tracee path against its cwd or an
/// at-descriptor through `/proc/<tid>/`.
pub fn resolve_at(tid: Pid, dirfd: i64, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return normalize(path);
    }
    let base = if dirfd == AT_FDCWD {
        std::fs::read_link(format!("/proc/{}/cwd", tid)).unwrap_or_else(|_| PathBuf::from("/"))
    } else {
        std::fs::read_link(format!("/proc/{}/fd/{}", tid, dirfd))
            .unwrap_or_else(|_| PathBuf::from("/"))
    };
    normalize(&base.join(path))
}

/// Resolve a descriptor to the path it names, if it still names one.
pub fn fd_path(tid: Pid, fd: i64) -> Option<PathBuf> {
    if fd < 0 {
        return None;
    }
    let p = std::fs::read_link(format!("/proc/{}/fd/{}", tid, fd)).ok()?;
    // Sockets, pipes and the like resolve to pseudo names.
    if p.is_absolute() {
        Some(p)
    } else {
        None
    }
}

fn stat_path(path: &Path) -> Option<FileStat> {
    let md = std::fs::metadata(path).ok()?;
    Some(FileStat {
        size: md.size() as i64,
        ino: md.ino(),
        dev: md.dev(),
        mode: md.mode(),
    })
}

/// Lexical canonicalisation: collapse `.` and `..` without touching the
/// filesystem, so paths of freshly unlinked files still normalise.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
