//! Process control blocks.
//!
//! One PCB per traced thread-group leader. The blocks form a forest:
//! children hold a weak back-pointer to their parent, parents a list of
//! weak child pointers. Events from any descendant are attributed to the
//! nearest root (user-registered) ancestor. A root whose own threads have
//! all exited survives as a zombie while it still has children.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::Instant;

use log::debug;
use nix::unistd::Pid;

use crate::errors::{Error, Result};

pub type PcbRef = Rc<RefCell<Pcb>>;
pub type PcbWeak = Weak<RefCell<Pcb>>;

/// Soft ceiling on cached process-memory handles; prune LRU above this.
pub const MEM_HANDLES_SOFT: usize = 96;
/// Hard ceiling; prune everything not in use above this.
pub const MEM_HANDLES_HARD: usize = 128;

/// Where a library image of interest is mapped in this process.
#[derive(Debug, Clone)]
pub struct LibMap {
    pub base: u64,
    pub len: u64,
    pub patched: bool,
}

pub struct Pcb {
    /// Thread-group leader.
    pub pid: Pid,
    pub exe: PathBuf,
    /// argv[0] plus the first two arguments.
    pub cmdline: Vec<String>,
    /// Set when the pid was explicitly handed to the tracer; cleared for
    /// discovered descendants.
    pub top_level: bool,
    pub parent: Option<PcbWeak>,
    pub children: Vec<PcbWeak>,
    /// Thread ids currently attached under this PCB.
    pub tids: Vec<Pid>,
    /// Per-library load state, keyed by on-disk image path.
    pub libraries: HashMap<PathBuf, LibMap>,
    /// Open descriptors in the target that name tracked library images; a
    /// subsequent executable mapping of one of these triggers patching.
    pub tracked_fds: HashMap<i32, PathBuf>,
    pub stop_tracing: bool,
    mem: Option<File>,
    mem_last_used: Instant,
    weak_self: PcbWeak,
}

impl Pcb {
    pub fn new(pid: Pid, top_level: bool, parent: Option<PcbWeak>) -> PcbRef {
        let pcb = Rc::new(RefCell::new(Pcb {
            pid,
            exe: PathBuf::new(),
            cmdline: Vec::new(),
            top_level,
            parent: parent.clone(),
            children: Vec::new(),
            tids: Vec::new(),
            libraries: HashMap::new(),
            tracked_fds: HashMap::new(),
            stop_tracing: false,
            mem: None,
            mem_last_used: Instant::now(),
            weak_self: Weak::new(),
        }));
        pcb.borrow_mut().weak_self = Rc::downgrade(&pcb);
        if let Some(parent) = parent.and_then(|w| w.upgrade()) {
            parent.borrow_mut().children.push(Rc::downgrade(&pcb));
        }
        debug!("created pcb for {} (top_level: {})", pid, top_level);
        pcb
    }

    pub fn self_ptr(&self) -> PcbWeak {
        self.weak_self.clone()
    }

    /// Re-read executable path and command line, keeping argv[0] and the
    /// first two arguments. Called at creation and after exec.
    pub fn refresh_identity(&mut self) -> Result<()> {
        let proc = procfs::process::Process::new(self.pid.as_raw())?;
        if let Ok(exe) = proc.exe() {
            self.exe = exe;
        }
        if let Ok(mut cmdline) = proc.cmdline() {
            cmdline.truncate(3);
            self.cmdline = cmdline;
        }
        Ok(())
    }

    /// Basename the journal attributes events to.
    pub fn application(&self) -> String {
        self.exe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("pid-{}", self.pid))
    }

    /// Nearest user-registered ancestor, or this PCB when none is marked.
    pub fn root(&self) -> Option<PcbRef> {
        if self.top_level {
            return self.weak_self.upgrade();
        }
        let mut cursor = self.parent.clone();
        let mut last = self.weak_self.clone();
        while let Some(p) = cursor.and_then(|w| w.upgrade()) {
            last = p.borrow().self_ptr();
            if p.borrow().top_level {
                return Some(p);
            }
            cursor = p.borrow().parent.clone();
        }
        last.upgrade()
    }

    pub fn remove_tid(&mut self, tid: Pid) {
        self.tids.retain(|t| *t != tid);
    }

    /// A zombie root lingers while user-registered and parenting live
    /// children, even with no threads of its own left.
    pub fn is_zombie_root(&self) -> bool {
        self.tids.is_empty() && self.top_level && self.live_children() > 0
    }

    pub fn live_children(&self) -> usize {
        self.children.iter().filter(|c| c.upgrade().is_some()).count()
    }

    /// Promote this PCB's children to its parent, preserving the forest
    /// invariant when the PCB dies.
    pub fn reparent_children(&mut self) {
        let grandparent = self.parent.clone();
        for child in self.children.drain(..) {
            if let Some(child) = child.upgrade() {
                child.borrow_mut().parent = grandparent.clone();
                if let Some(gp) = grandparent.as_ref().and_then(|w| w.upgrade()) {
                    gp.borrow_mut().children.push(Rc::downgrade(&child));
                }
            }
        }
    }

    // ---- process-memory handle -------------------------------------------

    pub fn open_mem(&mut self) -> Result<()> {
        if self.mem.is_none() {
            let f = File::options()
                .read(true)
                .write(true)
                .open(format!("/proc/{}/mem", self.pid))?;
            self.mem = Some(f);
        }
        self.mem_last_used = Instant::now();
        Ok(())
    }

    pub fn has_mem(&self) -> bool {
        self.mem.is_some()
    }

    pub fn mem_last_used(&self) -> Instant {
        self.mem_last_used
    }

    pub fn drop_mem(&mut self) {
        self.mem = None;
    }

    pub fn mem_read(&mut self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        self.open_mem()?;
        let f = self.mem.as_ref().expect("just opened");
        Ok(f.read_at(buf, addr)?)
    }

    pub fn mem_read_exact(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.open_mem()?;
        let f = self.mem.as_ref().expect("just opened");
        f.read_exact_at(buf, addr)?;
        Ok(())
    }

    pub fn mem_write(&mut self, addr: u64, buf: &[u8]) -> Result<()> {
        self.open_mem()?;
        let f = self.mem.as_ref().expect("just opened");
        f.write_all_at(buf, addr)?;
        Ok(())
    }

    /// Read a NUL-terminated string out of the target, bounded by the
    /// platform path limit.
    pub fn read_c_str(&mut self, addr: u64) -> Result<PathBuf> {
        let mut out: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 256];
        let mut pos = addr;
        while out.len() < libc::PATH_MAX as usize {
            let n = self.mem_read(pos, &mut chunk)?;
            if n == 0 {
                break;
            }
            match chunk[..n].iter().position(|b| *b == 0) {
                Some(i) => {
                    out.extend_from_slice(&chunk[..i]);
                    let s = String::from_utf8_lossy(&out).into_owned();
                    return Ok(PathBuf::from(s));
                }
                None => out.extend_from_slice(&chunk[..n]),
            }
            pos += n as u64;
        }
        Err(Error::Other(format!(
            "unterminated string at {:#x} in {}",
            addr, self.pid
        )))
    }
}

/// Prune cached memory handles across all PCBs: drop least-recently-used
/// handles beyond the soft ceiling, everything beyond the hard one.
pub fn prune_mem_handles(pcbs: &HashMap<i32, PcbRef>) {
    let mut open: Vec<(Instant, PcbRef)> = pcbs
        .values()
        .filter(|p| p.borrow().has_mem())
        .map(|p| (p.borrow().mem_last_used(), p.clone()))
        .collect();
    if open.len() <= MEM_HANDLES_SOFT {
        return;
    }
    open.sort_by_key(|(t, _)| *t);
    let keep = if open.len() > MEM_HANDLES_HARD {
        0
    } else {
        MEM_HANDLES_SOFT
    };
    let drop_n = open.len() - keep;
    for (_, pcb) in open.into_iter().take(drop_n) {
        pcb.borrow_mut().drop_mem();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forest_attribution_reaches_nearest_root() {
        let root = Pcb::new(Pid::from_raw(1), true, None);
        let mid = Pcb::new(Pid::from_raw(2), false, Some(Rc::downgrade(&root)));
        let leaf = Pcb::new(Pid::from_raw(3), false, Some(Rc::downgrade(&mid)));
        let attributed = leaf.borrow().root().unwrap();
        assert_eq!(attributed.borrow().pid, Pid::from_raw(1));
        assert_eq!(root.borrow().live_children(), 1);
    }

    #[test]
    fn reparent_preserves_forest() {
        let root = Pcb::new(Pid::from_raw(1), true, None);
        let mid = Pcb::new(Pid::from_raw(2), false, Some(Rc::downgrade(&root)));
        let leaf = Pcb::new(Pid::from_raw(3), false, Some(Rc::downgrade(&mid)));
        mid.borrow_mut().reparent_children();
        drop(mid);
        let attributed = leaf.borrow().root().unwrap();
        assert_eq!(attributed.borrow().pid, Pid::from_raw(1));
    }

    #[test]
    fn zombie_root_lingers_with_children() {
        let root = Pcb::new(Pid::from_raw(1), true, None);
        let _child = Pcb::new(Pid::from_raw(2), false, Some(Rc::downgrade(&root)));
        root.borrow_mut().tids.push(Pid::from_raw(1));
        root.borrow_mut().remove_tid(Pid::from_raw(1));
        assert!(root.borrow().is_zombie_root());
    }

    #[test]
    fn read_own_memory_c_str() {
        // /proc/self/mem allows self reads without ptrace.
        let pcb = Pcb::new(Pid::this(), false, None);
        let s = std::ffi::CString::new("/tmp/probe").unwrap();
        let addr = s.as_ptr() as u64;
        let read = pcb.borrow_mut().read_c_str(addr).unwrap();
        assert_eq!(read, PathBuf::from("/tmp/probe"));
    }

    #[test]
    fn refresh_identity_reads_self() {
        let pcb = Pcb::new(Pid::this(), true, None);
        pcb.borrow_mut().refresh_identity().unwrap();
        assert!(pcb.borrow().exe.is_absolute());
        assert!(pcb.borrow().cmdline.len() <= 3);
    }

    #[test]
    fn mem_handle_pruning_respects_ceilings() {
        // Synthetic PCBs on our own pid; handles all open.
        let mut pcbs = HashMap::new();
        for i in 0..(MEM_HANDLES_SOFT + 5) {
            let pcb = Pcb::new(Pid::this(), false, None);
            pcb.borrow_mut().open_mem().unwrap();
            pcbs.insert(i as i32, pcb);
        }
        prune_mem_handles(&pcbs);
        let open = pcbs.values().filter(|p| p.borrow().has_mem()).count();
        assert_eq!(open, MEM_HANDLES_SOFT);
    }
}
