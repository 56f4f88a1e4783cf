//! Process tracer.
//!
//! One thread owns every ptrace call. External requests arrive through a
//! FIFO command queue; callers wake the tracer's `waitpid` by signalling a
//! dedicated signal-proxy child. Attached process trees are tracked as a
//! PCB forest with per-thread TCBs; interesting syscalls are intercepted
//! by patching the targets' library images and the resulting events are
//! queued to the journal thread, attributed to the nearest user-registered
//! root.

pub mod patch;
pub mod pcb;
pub mod proxy;
pub mod regs;
pub mod shed;
pub mod syscalls;
pub mod tcb;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::errors::{Error, Result};
use crate::event::{unix_now, TraceEvent};
use crate::monitors::service::TracerControl;

use patch::PatchCache;
use pcb::{Pcb, PcbRef};
use proxy::Proxy;
use regs::Registers;
use shed::LoadRing;
use syscalls::ExitAction;
use tcb::{OptionsState, Tcb, TcbRef};

/// How long a caller waits for the tracer to confirm an attach.
const ATTACH_ACK_TIMEOUT: Duration = Duration::from_secs(10);

pub enum Command {
    Trace { pid: i32, ack: Sender<Result<()>> },
    Untrace { pid: i32 },
    Quit,
}

#[derive(Default)]
pub struct CommandQueue {
    q: Mutex<VecDeque<Command>>,
}

impl CommandQueue {
    fn push(&self, cmd: Command) {
        self.q.lock().unwrap().push_back(cmd);
    }

    fn pop(&self) -> Option<Command> {
        self.q.lock().unwrap().pop_front()
    }
}

/// Cross-thread face of the tracer.
#[derive(Clone)]
pub struct TracerHandle {
    queue: Arc<CommandQueue>,
    proxy_pid: Pid,
}

impl TracerHandle {
    /// Request an attach and wait for the tracer's confirmation.
    pub fn trace(&self, pid: i32) -> Result<()> {
        let (ack_tx, ack_rx) = channel();
        self.queue.push(Command::Trace { pid, ack: ack_tx });
        let _ = kill(self.proxy_pid, Signal::SIGUSR1);
        match ack_rx.recv_timeout(ATTACH_ACK_TIMEOUT) {
            Ok(result) => result,
            Err(_) => Err(Error::Other(format!("attach to {} timed out", pid))),
        }
    }

    pub fn untrace(&self, pid: i32) {
        self.queue.push(Command::Untrace { pid });
        let _ = kill(self.proxy_pid, Signal::SIGUSR1);
    }

    pub fn quit(&self) {
        self.queue.push(Command::Quit);
        let _ = kill(self.proxy_pid, Signal::SIGUSR1);
    }
}

impl TracerControl for TracerHandle {
    fn trace(&self, pid: i32) -> Result<()> {
        TracerHandle::trace(self, pid)
    }
    fn untrace(&self, pid: i32) -> Result<()> {
        TracerHandle::untrace(self, pid);
        Ok(())
    }
}

/// Spawn the tracer thread. `allow` filters paths of reported open/close
/// events; `sink` receives attributed file events for journalling off the
/// tracer thread.
pub fn spawn(
    sink: Sender<TraceEvent>,
    allow: Box<dyn Fn(&Path) -> bool + Send>,
) -> Result<(TracerHandle, JoinHandle<()>)> {
    let queue = Arc::new(CommandQueue::default());
    let (pid_tx, pid_rx) = channel();
    let thread_queue = queue.clone();
    let join = std::thread::Builder::new()
        .name("tracer".into())
        .spawn(move || {
            // The proxy must be forked by the tracer thread: its stops are
            // delivered to the thread that owns the attachment.
            let proxy = match Proxy::spawn() {
                Ok(p) => p,
                Err(e) => {
                    warn!("tracer: signal proxy failed: {}", e);
                    let _ = pid_tx.send(Err(e));
                    return;
                }
            };
            let _ = pid_tx.send(Ok(proxy.pid()));
            Tracer::new(thread_queue, proxy, sink, allow).run();
        })?;
    let proxy_pid = pid_rx
        .recv()
        .map_err(|_| Error::Other("tracer thread died during start".into()))??;
    Ok((TracerHandle { queue, proxy_pid }, join))
}

struct Tracer {
    queue: Arc<CommandQueue>,
    proxy: Proxy,
    sink: Sender<TraceEvent>,
    allow: Box<dyn Fn(&Path) -> bool + Send>,
    /// PCBs by thread-group leader.
    pcbs: HashMap<i32, PcbRef>,
    /// TCBs by thread id; mutated only by this thread.
    tcbs: HashMap<i32, TcbRef>,
    patches: PatchCache,
    global_ring: LoadRing,
    /// Shed thread ids, remembered so QUIT still drains them.
    suspended: HashSet<i32>,
    quitting: bool,
}

impl Tracer {
    fn new(
        queue: Arc<CommandQueue>,
        proxy: Proxy,
        sink: Sender<TraceEvent>,
        allow: Box<dyn Fn(&Path) -> bool + Send>,
    ) -> Tracer {
        Tracer {
            queue,
            proxy,
            sink,
            allow,
            pcbs: HashMap::new(),
            tcbs: HashMap::new(),
            patches: PatchCache::default(),
            global_ring: LoadRing::default(),
            suspended: HashSet::new(),
            quitting: false,
        }
    }

    fn run(mut self) {
        info!("tracer running");
        loop {
            self.drain_commands();
            if self.quitting && self.tcbs.is_empty() {
                break;
            }
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(status) => self.dispatch(status),
                Err(nix::Error::EINTR) => continue,
                Err(nix::Error::ECHILD) => {
                    // Only possible if the proxy died; nothing left to wait
                    // for until a command arrives.
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    warn!("tracer: waitpid failed: {}", e);
                    break;
                }
            }
        }
        self.proxy.shutdown();
        info!("tracer drained and stopped");
    }

    fn drain_commands(&mut self) {
        while let Some(cmd) = self.queue.pop() {
            match cmd {
                Command::Trace { pid, ack } => {
                    let result = self.cmd_trace(pid);
                    let _ = ack.send(result);
                }
                Command::Untrace { pid } => self.cmd_untrace(pid),
                Command::Quit => self.cmd_quit(),
            }
        }
    }

    // ---- commands --------------------------------------------------------

    fn cmd_trace(&mut self, pid: i32) -> Result<()> {
        let leader = thread_group_leader(pid)?;
        if let Some(pcb) = self.pcbs.get(&leader) {
            // A root request on a discovered descendant promotes it.
            let mut p = pcb.borrow_mut();
            p.top_level = true;
            p.parent = None;
            return Ok(());
        }
        let pcb = Pcb::new(Pid::from_raw(leader), true, None);
        if let Err(e) = pcb.borrow_mut().refresh_identity() {
            debug!("tracer: identity of {} unreadable: {}", leader, e);
        }
        ptrace::attach(Pid::from_raw(leader)).map_err(|e| {
            warn!("tracer: attach to {} failed: {}", leader, e);
            Error::Os(e)
        })?;
        // The memory handle is cached for patching and string reads.
        if let Err(e) = pcb.borrow_mut().open_mem() {
            debug!("tracer: mem handle for {} deferred: {}", leader, e);
        }
        pcb::prune_mem_handles(&self.pcbs);
        let tcb = Tcb::new(Pid::from_raw(leader), Rc::downgrade(&pcb));
        pcb.borrow_mut().tids.push(Pid::from_raw(leader));
        self.pcbs.insert(leader, pcb);
        self.tcbs.insert(leader, tcb);
        info!("tracer: attached to {}", leader);
        Ok(())
    }

    fn cmd_untrace(&mut self, pid: i32) {
        let leader = match thread_group_leader(pid) {
            Ok(l) => l,
            Err(_) => pid,
        };
        let pcb = match self.pcbs.get(&leader) {
            Some(p) => p.clone(),
            None => return,
        };
        self.mark_subtree_stop(&pcb);
        // Expedite: a stopped thread can be detached at once, a running
        // one at its next stop.
        let tids: Vec<Pid> = pcb.borrow().tids.clone();
        for tid in tids {
            let _ = kill(tid, Signal::SIGSTOP);
        }
    }

    fn mark_subtree_stop(&mut self, pcb: &PcbRef) {
        pcb.borrow_mut().stop_tracing = true;
        for tid in pcb.borrow().tids.iter() {
            if let Some(tcb) = self.tcbs.get(&tid.as_raw()) {
                tcb.borrow_mut().stop_tracing = true;
            }
        }
        let children: Vec<PcbRef> = pcb
            .borrow()
            .children
            .iter()
            .filter_map(|c| c.upgrade())
            .collect();
        for child in children {
            self.mark_subtree_stop(&child);
        }
    }

    fn cmd_quit(&mut self) {
        info!("tracer: quit requested, draining {} threads", self.tcbs.len());
        self.quitting = true;
        let tids: Vec<i32> = self.tcbs.keys().copied().collect();
        for tid in tids {
            if let Some(tcb) = self.tcbs.get(&tid) {
                tcb.borrow_mut().stop_tracing = true;
            }
            if kill(Pid::from_raw(tid), Signal::SIGSTOP).is_err() {
                // Already gone; synthesise the untrace.
                self.remove_thread(Pid::from_raw(tid));
            }
        }
    }

    // ---- wait dispatch ---------------------------------------------------

    fn dispatch(&mut self, status: WaitStatus) {
        let now = unix_now() as u64;
        self.global_ring.hit(now);
        match status {
            WaitStatus::Stopped(pid, _) if pid == self.proxy.pid() => {
                self.proxy.resume();
            }
            WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => {
                self.remove_thread(pid);
            }
            WaitStatus::PtraceEvent(pid, _, event) => self.handle_ptrace_event(pid, event),
            WaitStatus::PtraceSyscall(pid) => self.handle_syscall_stop(pid, now),
            WaitStatus::Stopped(pid, Signal::SIGTRAP) => self.handle_trap(pid, now),
            WaitStatus::Stopped(pid, Signal::SIGSTOP) => self.handle_sigstop(pid),
            WaitStatus::Stopped(pid, sig) => self.resume_thread(pid, Some(sig)),
            other => debug!("tracer: unhandled wait status {:?}", other),
        }
    }

    fn tcb_of(&self, pid: Pid) -> Option<TcbRef> {
        self.tcbs.get(&pid.as_raw()).cloned()
    }

    fn pcb_of_tcb(&self, tcb: &TcbRef) -> Option<PcbRef> {
        tcb.borrow().pcb.upgrade()
    }

    /// A stop from a thread we have no TCB for: the kernel auto-attached a
    /// child (trace-clone family) whose creation event we have not
    /// processed yet, or a sibling raced us. Index it by its thread group.
    fn adopt_unknown(&mut self, pid: Pid) -> Option<TcbRef> {
        let leader = thread_group_leader(pid.as_raw()).ok()?;
        let pcb = match self.pcbs.get(&leader) {
            Some(p) => p.clone(),
            None => {
                // A whole new process; hang it off the PCB of its parent
                // if we trace it, else it is not ours.
                let parent = process_parent(leader)?;
                let parent_pcb = self.pcbs.get(&parent)?.clone();
                let pcb = Pcb::new(
                    Pid::from_raw(leader),
                    false,
                    Some(Rc::downgrade(&parent_pcb)),
                );
                let _ = pcb.borrow_mut().refresh_identity();
                // The child copies the parent's image, bases included.
                pcb.borrow_mut().libraries = parent_pcb.borrow().libraries.clone();
                self.pcbs.insert(leader, pcb.clone());
                pcb
            }
        };
        let tcb = Tcb::new(pid, Rc::downgrade(&pcb));
        pcb.borrow_mut().tids.push(pid);
        self.tcbs.insert(pid.as_raw(), tcb.clone());
        debug!("tracer: adopted unknown thread {} under {}", pid, leader);
        Some(tcb)
    }

    fn handle_sigstop(&mut self, pid: Pid) {
        let tcb = match self.tcb_of(pid).or_else(|| self.adopt_unknown(pid)) {
            Some(t) => t,
            None => {
                // Not ours; let it go.
                let _ = ptrace::detach(pid, None);
                return;
            }
        };
        if tcb.borrow().stop_tracing {
            self.detach_thread(pid);
            return;
        }
        if !tcb.borrow().seen_first_stop {
            self.first_clean_stop(pid, &tcb);
        }
        // The stop itself is suppressed.
        self.resume_thread(pid, None);
    }

    /// First clean stop after attach or exec: set the tracer-child
    /// options, sweep for sibling threads, and patch the mapped library
    /// images.
    fn first_clean_stop(&mut self, pid: Pid, tcb: &TcbRef) {
        tcb.borrow_mut().seen_first_stop = true;
        if tcb.borrow().options_state == OptionsState::Unset {
            let state = set_trace_options(pid);
            tcb.borrow_mut().options_state = state;
        }
        if let Some(pcb) = self.pcb_of_tcb(tcb) {
            self.discover_siblings(&pcb);
            self.examine_libraries(&pcb);
        }
    }

    /// Attach every thread of the group we do not know yet, looping until
    /// a full pass finds nothing new (threads may spawn more threads while
    /// we attach).
    fn discover_siblings(&mut self, pcb: &PcbRef) {
        let leader = pcb.borrow().pid.as_raw();
        loop {
            let tids = match list_tasks(leader) {
                Ok(tids) => tids,
                Err(_) => return,
            };
            let unknown: Vec<i32> = tids
                .into_iter()
                .filter(|tid| !self.tcbs.contains_key(tid))
                .collect();
            if unknown.is_empty() {
                return;
            }
            for tid in unknown {
                match ptrace::attach(Pid::from_raw(tid)) {
                    Ok(()) => {
                        let tcb = Tcb::new(Pid::from_raw(tid), Rc::downgrade(pcb));
                        pcb.borrow_mut().tids.push(Pid::from_raw(tid));
                        self.tcbs.insert(tid, tcb);
                        debug!("tracer: attached sibling {}", tid);
                    }
                    Err(e) => debug!("tracer: sibling {} not attachable: {}", tid, e),
                }
            }
        }
    }

    /// Parse the target's maps, scan each library of interest (once per
    /// on-disk image) and patch its sites in this address space.
    fn examine_libraries(&mut self, pcb: &PcbRef) {
        let leader = pcb.borrow().pid;
        let mapped = match library_mappings(leader.as_raw()) {
            Ok(m) => m,
            Err(e) => {
                debug!("tracer: maps of {} unreadable: {}", leader, e);
                return;
            }
        };
        let mut all_patched = !mapped.is_empty();
        for (lib, base, len) in mapped {
            let already = pcb.borrow().libraries.get(&lib).map(|l| l.patched);
            if already == Some(true) {
                continue;
            }
            let set = match self.patches.get_or_scan(&lib) {
                Ok(set) => set,
                Err(e) => {
                    warn!("tracer: scan of {} failed: {}", lib.display(), e);
                    all_patched = false;
                    continue;
                }
            };
            let applied = patch::apply(&mut pcb.borrow_mut(), &set, base);
            let patched = match applied {
                Ok(()) => true,
                Err(Error::PatchVerification(_)) => {
                    warn!(
                        "tracer: {} verification failed in {}; keeping full interception",
                        lib.display(),
                        leader
                    );
                    all_patched = false;
                    false
                }
                Err(e) => {
                    if e.is_vanished() {
                        return;
                    }
                    debug!("tracer: patching {} failed: {}", lib.display(), e);
                    all_patched = false;
                    false
                }
            };
            pcb.borrow_mut()
                .libraries
                .insert(lib, pcb::LibMap { base, len, patched });
        }
        if all_patched {
            // Traps now cover the interesting calls; threads can free-run.
            for tid in pcb.borrow().tids.iter() {
                if let Some(tcb) = self.tcbs.get(&tid.as_raw()) {
                    tcb.borrow_mut().full_syscall_trace = false;
                }
            }
        }
    }

    // ---- stops -----------------------------------------------------------

    fn handle_syscall_stop(&mut self, pid: Pid, now: u64) {
        let tcb = match self.tcb_of(pid).or_else(|| self.adopt_unknown(pid)) {
            Some(t) => t,
            None => return,
        };
        if tcb.borrow().stop_tracing {
            self.detach_thread(pid);
            return;
        }
        let pcb = match self.pcb_of_tcb(&tcb) {
            Some(p) => p,
            None => {
                self.remove_thread(pid);
                return;
            }
        };
        let regs = match ptrace::getregs(pid) {
            Ok(r) => Registers::from_raw(r),
            Err(_) => {
                self.remove_thread(pid);
                return;
            }
        };
        tcb.borrow_mut().ring.hit(now);

        let in_syscall = tcb.borrow().in_syscall();
        if !in_syscall {
            syscalls::on_entry(&mut tcb.borrow_mut(), &mut pcb.borrow_mut(), &regs);
            self.resume_thread(pid, None);
            return;
        }

        // Exit: report, then fall back to free-running.
        let application = {
            let p = pcb.borrow();
            p.root()
                .map(|r| r.borrow().application())
                .unwrap_or_else(|| p.application())
        };
        let mut events = Vec::new();
        let action = syscalls::on_exit(
            &mut tcb.borrow_mut(),
            &mut pcb.borrow_mut(),
            &regs,
            &*self.allow,
            &application,
            &mut events,
        );
        for ev in events {
            let _ = self.sink.send(ev);
        }
        match action {
            ExitAction::AttachChild(child) => {
                self.install_child(Pid::from_raw(child), &pcb, false);
            }
            ExitAction::Repatch => self.examine_libraries(&pcb),
            ExitAction::None => {}
        }
        self.maybe_shed(pid, &tcb, now);
        self.resume_thread(pid, None);
    }

    fn handle_trap(&mut self, pid: Pid, now: u64) {
        let tcb = match self.tcb_of(pid) {
            Some(t) => t,
            None => {
                self.resume_thread(pid, Some(Signal::SIGTRAP));
                return;
            }
        };
        if tcb.borrow().stop_tracing {
            self.detach_thread(pid);
            return;
        }
        let pcb = match self.pcb_of_tcb(&tcb) {
            Some(p) => p,
            None => return,
        };
        let mut regs = match ptrace::getregs(pid) {
            Ok(r) => Registers::from_raw(r),
            Err(_) => {
                self.remove_thread(pid);
                return;
            }
        };
        tcb.borrow_mut().ring.hit(now);

        // Patch-site trap: emulate the displaced number-load and re-arm
        // syscall stops so the bracketing syscall reports entry and exit.
        let site = self.find_patch_site(&pcb, regs.ip());
        match site {
            Some((site_addr, nr)) => {
                regs.set_ip(site_addr + patch::NUMBER_LOAD_LEN as u64);
                regs.emulate_number_load(nr);
                if ptrace::setregs(pid, regs.raw()).is_err() {
                    self.remove_thread(pid);
                    return;
                }
                match ptrace::syscall(pid, None) {
                    Ok(()) => {}
                    Err(_) => self.remove_thread(pid),
                }
            }
            None => {
                // Not ours: deliver the trap to the target.
                self.resume_thread(pid, Some(Signal::SIGTRAP));
            }
        }
    }

    fn find_patch_site(&mut self, pcb: &PcbRef, ip: u64) -> Option<(u64, i64)> {
        let p = pcb.borrow();
        for (lib, map) in p.libraries.iter() {
            if !map.patched || ip < map.base || ip >= map.base + map.len {
                continue;
            }
            let set = self.patches.get_or_scan(lib).ok()?;
            if let Some(found) = set.find_site(map.base, ip) {
                return Some((map.base + found.offset, found.syscall_nr));
            }
        }
        None
    }

    fn handle_ptrace_event(&mut self, pid: Pid, event: i32) {
        let tcb = self.tcb_of(pid);
        if event == ptrace::Event::PTRACE_EVENT_EXEC as i32 {
            if let Some(tcb) = tcb {
                if let Some(pcb) = self.pcb_of_tcb(&tcb) {
                    let mut p = pcb.borrow_mut();
                    let _ = p.refresh_identity();
                    // The image is gone; bases are stale until remapped.
                    p.libraries.clear();
                    p.tracked_fds.clear();
                    drop(p);
                    for tid in pcb.borrow().tids.iter() {
                        if let Some(t) = self.tcbs.get(&tid.as_raw()) {
                            let mut t = t.borrow_mut();
                            t.full_syscall_trace = true;
                            t.seen_first_stop = false;
                        }
                    }
                }
                // SYSCALL resume so the loader's mappings surface.
                let _ = ptrace::syscall(pid, None);
            }
            return;
        }
        if event == ptrace::Event::PTRACE_EVENT_CLONE as i32
            || event == ptrace::Event::PTRACE_EVENT_FORK as i32
            || event == ptrace::Event::PTRACE_EVENT_VFORK as i32
        {
            let child = match ptrace::getevent(pid) {
                Ok(c) => Pid::from_raw(c as i32),
                Err(_) => {
                    self.resume_thread(pid, None);
                    return;
                }
            };
            if let Some(tcb) = tcb {
                if let Some(pcb) = self.pcb_of_tcb(&tcb) {
                    let forked = event != ptrace::Event::PTRACE_EVENT_CLONE as i32;
                    self.install_child(child, &pcb, forked);
                    // New threads inherit the parent's options state.
                    if let Some(child_tcb) = self.tcbs.get(&child.as_raw()) {
                        child_tcb.borrow_mut().options_state = tcb.borrow().options_state;
                    }
                }
            }
            self.resume_thread(pid, None);
            return;
        }
        if event == ptrace::Event::PTRACE_EVENT_EXIT as i32 {
            // The real removal happens at the exit status.
            self.resume_thread(pid, None);
            return;
        }
        self.resume_thread(pid, None);
    }

    /// Install a TCB (and for forks a child PCB) for a newly created
    /// tracee.
    fn install_child(&mut self, child: Pid, creator: &PcbRef, forked: bool) {
        if self.tcbs.contains_key(&child.as_raw()) {
            return;
        }
        let pcb = if forked {
            let pcb = Pcb::new(child, false, Some(creator.borrow().self_ptr()));
            let _ = pcb.borrow_mut().refresh_identity();
            // Fork copies the address space, library bases included.
            pcb.borrow_mut().libraries = creator.borrow().libraries.clone();
            pcb.borrow_mut().stop_tracing = creator.borrow().stop_tracing;
            self.pcbs.insert(child.as_raw(), pcb.clone());
            pcb
        } else {
            creator.clone()
        };
        let tcb = Tcb::new(child, Rc::downgrade(&pcb));
        // Forked children of a fully patched parent can free-run at once.
        if forked && pcb.borrow().libraries.values().all(|l| l.patched)
            && !pcb.borrow().libraries.is_empty()
        {
            tcb.borrow_mut().full_syscall_trace = false;
        }
        if !forked {
            tcb.borrow_mut().full_syscall_trace = self
                .tcbs
                .get(&pcb.borrow().pid.as_raw())
                .map(|t| t.borrow().full_syscall_trace)
                .unwrap_or(true);
        }
        tcb.borrow_mut().stop_tracing = pcb.borrow().stop_tracing;
        pcb.borrow_mut().tids.push(child);
        self.tcbs.insert(child.as_raw(), tcb);
        debug!(
            "tracer: child {} installed under {} ({})",
            child,
            pcb.borrow().pid,
            if forked { "fork" } else { "clone" }
        );
    }

    fn maybe_shed(&mut self, pid: Pid, tcb: &TcbRef, now: u64) {
        let interesting = tcb.borrow().interesting_events;
        let should = {
            let mut t = tcb.borrow_mut();
            shed::should_suspend(&mut self.global_ring, &mut t.ring, interesting, now)
        };
        if should {
            info!("tracer: shedding hot quiet thread {}", pid);
            tcb.borrow_mut().suspended = true;
            tcb.borrow_mut().stop_tracing = true;
            self.suspended.insert(pid.as_raw());
        }
    }

    // ---- resume / removal ------------------------------------------------

    fn resume_thread(&mut self, pid: Pid, sig: Option<Signal>) {
        let tcb = match self.tcb_of(pid) {
            Some(t) => t,
            None => {
                let _ = ptrace::cont(pid, sig);
                return;
            }
        };
        if tcb.borrow().stop_tracing {
            self.detach_thread(pid);
            return;
        }
        let syscall_mode = tcb.borrow().in_syscall() || tcb.borrow().full_syscall_trace;
        let result = if syscall_mode {
            ptrace::syscall(pid, sig)
        } else {
            ptrace::cont(pid, sig)
        };
        if result.is_err() {
            // The target vanished between the stop and the resume.
            self.remove_thread(pid);
        }
    }

    /// Detach a stopped thread, reverting patches when it is the last of
    /// its process.
    fn detach_thread(&mut self, pid: Pid) {
        if let Some(tcb) = self.tcb_of(pid) {
            if let Some(pcb) = self.pcb_of_tcb(&tcb) {
                let last = pcb.borrow().tids.len() == 1;
                if last {
                    self.revert_process_patches(&pcb);
                }
            }
        }
        let _ = ptrace::detach(pid, None);
        self.remove_thread(pid);
    }

    fn revert_process_patches(&mut self, pcb: &PcbRef) {
        let libs: Vec<(PathBuf, u64)> = pcb
            .borrow()
            .libraries
            .iter()
            .filter(|(_, m)| m.patched)
            .map(|(p, m)| (p.clone(), m.base))
            .collect();
        for (lib, base) in libs {
            if let Ok(set) = self.patches.get_or_scan(&lib) {
                patch::revert(&mut pcb.borrow_mut(), &set, base);
            }
        }
    }

    /// Drop a TCB; free or zombify its PCB when it was the last thread.
    fn remove_thread(&mut self, pid: Pid) {
        let tcb = match self.tcbs.remove(&pid.as_raw()) {
            Some(t) => t,
            None => return,
        };
        let pcb = match tcb.borrow().pcb.upgrade() {
            Some(p) => p,
            None => return,
        };
        pcb.borrow_mut().remove_tid(pid);
        if !pcb.borrow().tids.is_empty() {
            return;
        }
        if pcb.borrow().is_zombie_root() {
            debug!("tracer: {} is a zombie root, children alive", pcb.borrow().pid);
            return;
        }
        self.free_pcb(&pcb);
    }

    fn free_pcb(&mut self, pcb: &PcbRef) {
        let pid = pcb.borrow().pid;
        if pcb.borrow().top_level {
            let _ = self.sink.send(TraceEvent::ProcessExit {
                pid: pid.as_raw(),
                application: pcb.borrow().application(),
            });
        }
        let parent = pcb.borrow().parent.clone().and_then(|w| w.upgrade());
        pcb.borrow_mut().reparent_children();
        self.pcbs.remove(&pid.as_raw());
        debug!("tracer: freed pcb {}", pid);
        // The parent may have been lingering only for this child.
        if let Some(parent) = parent {
            let free_parent = {
                let p = parent.borrow();
                p.tids.is_empty() && p.live_children() == 0
            };
            if free_parent && self.pcbs.contains_key(&parent.borrow().pid.as_raw()) {
                self.free_pcb(&parent);
            }
        }
    }
}

// ---- /proc helpers -------------------------------------------------------

/// Resolve a pid to its thread-group leader.
fn thread_group_leader(pid: i32) -> Result<i32> {
    let proc = procfs::process::Process::new(pid)?;
    Ok(proc.status()?.tgid)
}

fn process_parent(pid: i32) -> Option<i32> {
    procfs::process::Process::new(pid)
        .ok()?
        .stat()
        .ok()
        .map(|s| s.ppid)
}

fn list_tasks(pid: i32) -> Result<Vec<i32>> {
    let proc = procfs::process::Process::new(pid)?;
    let mut tids = Vec::new();
    for task in proc.tasks()? {
        if let Ok(task) = task {
            tids.push(task.tid);
        }
    }
    Ok(tids)
}

/// Executable mappings of the libraries we instrument: `(path, base, span)`
/// where base is the lowest address the image is mapped at.
fn library_mappings(pid: i32) -> Result<Vec<(PathBuf, u64, u64)>> {
    let proc = procfs::process::Process::new(pid)?;
    let mut ranges: HashMap<PathBuf, (u64, u64)> = HashMap::new();
    for map in proc.maps()? {
        let path = match &map.pathname {
            procfs::process::MMapPath::Path(p) => p.clone(),
            _ => continue,
        };
        if !patch::is_library_of_interest(&path) {
            continue;
        }
        let entry = ranges.entry(path).or_insert((u64::MAX, 0));
        entry.0 = entry.0.min(map.address.0);
        entry.1 = entry.1.max(map.address.1);
    }
    Ok(ranges
        .into_iter()
        .map(|(path, (lo, hi))| (path, lo, hi.saturating_sub(lo)))
        .collect())
}

fn set_trace_options(pid: Pid) -> OptionsState {
    let full = ptrace::Options::PTRACE_O_TRACESYSGOOD
        | ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACEVFORK
        | ptrace::Options::PTRACE_O_TRACEEXEC
        | ptrace::Options::PTRACE_O_TRACEEXIT;
    if ptrace::setoptions(pid, full).is_ok() {
        return OptionsState::Set;
    }
    // Kernels without the trace-clone family: children get attached
    // explicitly at clone exits instead.
    let minimal =
        ptrace::Options::PTRACE_O_TRACESYSGOOD | ptrace::Options::PTRACE_O_TRACEEXEC;
    match ptrace::setoptions(pid, minimal) {
        Ok(()) => OptionsState::Unsupported,
        Err(_) => OptionsState::Unsupported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[test]
    fn commands_are_fifo() {
        let q = CommandQueue::default();
        let (tx, _rx) = channel();
        q.push(Command::Trace { pid: 1, ack: tx });
        q.push(Command::Untrace { pid: 2 });
        q.push(Command::Quit);
        assert!(matches!(q.pop(), Some(Command::Trace { pid: 1, .. })));
        assert!(matches!(q.pop(), Some(Command::Untrace { pid: 2 })));
        assert!(matches!(q.pop(), Some(Command::Quit)));
        assert!(q.pop().is_none());
    }

    #[test]
    fn leader_resolution_maps_self() {
        let me = std::process::id() as i32;
        assert_eq!(thread_group_leader(me).unwrap(), me);
    }

    /// End-to-end smoke: attach to a child, then quit and drain. Skipped
    /// quietly where the environment forbids ptrace.
    #[test]
    fn attach_and_quit_drains() {
        let mut child = match std::process::Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
        {
            Ok(c) => c,
            Err(_) => return,
        };
        let (sink, _events) = channel();
        let (handle, join) = match spawn(sink, Box::new(|_| true)) {
            Ok(x) => x,
            Err(_) => {
                let _ = child.kill();
                return;
            }
        };
        match handle.trace(child.id() as i32) {
            Ok(()) => {}
            Err(_) => {
                // No ptrace permission in this environment.
                handle.quit();
                let _ = join.join();
                let _ = child.kill();
                return;
            }
        }
        handle.quit();
        join.join().unwrap();
        let _ = child.kill();
        let _ = child.wait();
    }
}
