//! Library scanning and breakpoint patching.
//!
//! Interesting syscalls are intercepted by displacing the syscall-number
//! load that precedes each syscall instruction in the loader, the C
//! runtime and the thread library: the first byte of the `mov eax, imm32`
//! becomes a trap. When the trap fires the tracer emulates the displaced
//! load, re-arms syscall stops for the bracketing syscall, and the thread
//! otherwise free-runs.
//!
//! The scan walks the image's executable segment looking for the syscall
//! instruction, then requires a known number-load at one of the permitted
//! displacements before it and the conventional errno check within the
//! window after it. The heuristic may miss rewritten libc builds; every
//! scan therefore reports `{candidates, matches}` so misses are
//! detectable.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use goblin::elf::program_header::PF_X;
use goblin::elf::Elf;
use log::{debug, info, warn};
use serde::Serialize;

use super::pcb::Pcb;
use super::syscalls::INTERESTING;
use crate::errors::{Error, Result};

/// x86_64 syscall instruction.
pub const SYSCALL_INSN: [u8; 2] = [0x0f, 0x05];
/// `mov eax, imm32` opcode; the instruction the patch displaces.
pub const NUMBER_LOAD_OPCODE: u8 = 0xb8;
pub const NUMBER_LOAD_LEN: usize = 5;
/// INT3.
pub const TRAP_INSN: u8 = 0xcc;
/// Permitted gaps, in bytes, between the end of the number-load and the
/// syscall instruction.
pub const DISPLACEMENTS: [usize; 4] = [0, 1, 2, 3];
/// How far past the syscall instruction the errno check may sit.
const ERRNO_WINDOW: usize = 16;

/// Libraries whose images get scanned and patched.
pub const LIBRARIES_OF_INTEREST: &[&str] = &["libc", "ld-linux", "ld-", "libpthread"];

pub fn is_library_of_interest(path: &Path) -> bool {
    let name = match path.file_name() {
        Some(n) => n.to_string_lossy(),
        None => return false,
    };
    LIBRARIES_OF_INTEREST
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// One patchable site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// Offset of the displaced number-load, relative to the image's load
    /// base.
    pub offset: u64,
    pub syscall_nr: i64,
    /// Gap between the load and the syscall instruction.
    pub displacement: u8,
    /// The displaced instruction, for verification and reversion.
    pub original: [u8; NUMBER_LOAD_LEN],
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ScanReport {
    pub candidates: usize,
    pub matches: usize,
}

/// Per-library patch list, generated once per on-disk image.
#[derive(Debug, Clone)]
pub struct PatchSet {
    pub lib: PathBuf,
    pub image_len: u64,
    pub patches: Vec<Patch>,
    pub report: ScanReport,
}

impl PatchSet {
    /// Site lookup for trap handling: `ip` is the address after the trap
    /// byte.
    pub fn find_site(&self, base: u64, ip: u64) -> Option<&Patch> {
        let site = ip.checked_sub(1)?.checked_sub(base)?;
        self.patches.iter().find(|p| p.offset == site)
    }

    pub fn covers(&self, base: u64, ip: u64) -> bool {
        ip >= base && ip < base + self.image_len
    }
}

/// Scan an on-disk library image.
pub fn scan_library(path: &Path) -> Result<PatchSet> {
    let image = fs::read(path)?;
    let elf = Elf::parse(&image).map_err(|e| Error::BadImage(format!("{}: {}", path.display(), e)))?;
    let exec = elf
        .program_headers
        .iter()
        .find(|ph| ph.p_type == goblin::elf::program_header::PT_LOAD && ph.p_flags & PF_X != 0)
        .ok_or_else(|| Error::BadImage(format!("{}: no executable segment", path.display())))?;
    let start = exec.p_offset as usize;
    let end = (exec.p_offset + exec.p_filesz) as usize;
    if end > image.len() || start >= end {
        return Err(Error::BadImage(format!(
            "{}: executable segment out of bounds",
            path.display()
        )));
    }
    // Runtime addresses are base + p_vaddr + (file_offset - p_offset).
    let vaddr_delta = exec.p_vaddr as i64 - exec.p_offset as i64;
    let (patches, report) = scan_image(&image[start..end], start as u64, vaddr_delta);
    info!(
        "scanned {}: {}",
        path.display(),
        serde_json::to_string(&report).unwrap_or_default()
    );
    Ok(PatchSet {
        lib: path.to_path_buf(),
        image_len: image.len() as u64,
        patches,
        report,
    })
}

/// Pattern scan over one executable segment. `segment_file_offset` is the
/// segment's position in the file; `vaddr_delta` converts file offsets to
/// load-base-relative addresses.
pub fn scan_image(
    segment: &[u8],
    segment_file_offset: u64,
    vaddr_delta: i64,
) -> (Vec<Patch>, ScanReport) {
    let mut patches = Vec::new();
    let mut report = ScanReport::default();
    if segment.len() < 2 {
        return (patches, report);
    }
    for i in 0..segment.len() - 1 {
        if segment[i] != SYSCALL_INSN[0] || segment[i + 1] != SYSCALL_INSN[1] {
            continue;
        }
        report.candidates += 1;
        let load = DISPLACEMENTS.iter().find_map(|gap| {
            let load_at = i.checked_sub(NUMBER_LOAD_LEN + gap)?;
            if segment[load_at] != NUMBER_LOAD_OPCODE {
                return None;
            }
            let imm = u32::from_le_bytes([
                segment[load_at + 1],
                segment[load_at + 2],
                segment[load_at + 3],
                segment[load_at + 4],
            ]) as i64;
            if !INTERESTING.contains(&imm) {
                return None;
            }
            Some((load_at, imm, *gap as u8))
        });
        let (load_at, nr, displacement) = match load {
            Some(found) => found,
            None => continue,
        };
        if !has_errno_check(&segment[i + 2..]) {
            continue;
        }
        let mut original = [0u8; NUMBER_LOAD_LEN];
        original.copy_from_slice(&segment[load_at..load_at + NUMBER_LOAD_LEN]);
        let offset = (segment_file_offset + load_at as u64) as i64 + vaddr_delta;
        patches.push(Patch {
            offset: offset as u64,
            syscall_nr: nr,
            displacement,
            original,
        });
        report.matches += 1;
    }
    (patches, report)
}

/// The conventional `cmp rax, -4095` (or its 32-bit form) within the
/// post-syscall window.
fn has_errno_check(tail: &[u8]) -> bool {
    let window = &tail[..tail.len().min(ERRNO_WINDOW)];
    for i in 0..window.len() {
        let rest = &window[i..];
        let imm_at = if rest.len() >= 6 && rest[0] == 0x48 && rest[1] == 0x3d {
            2
        } else if rest.len() >= 5 && rest[0] == 0x3d {
            1
        } else {
            continue;
        };
        if rest.len() < imm_at + 4 {
            continue;
        }
        let imm = u32::from_le_bytes([
            rest[imm_at],
            rest[imm_at + 1],
            rest[imm_at + 2],
            rest[imm_at + 3],
        ]);
        if imm == 0xffff_f001 || imm == 0xffff_f000 {
            return true;
        }
    }
    false
}

/// Verify every site still holds the expected original instruction, then
/// overwrite each with the trap. A single mismatch aborts the whole image
/// to avoid corrupting the target.
pub fn apply(pcb: &mut Pcb, set: &PatchSet, base: u64) -> Result<()> {
    let mut probe = [0u8; NUMBER_LOAD_LEN];
    for patch in &set.patches {
        pcb.mem_read_exact(base + patch.offset, &mut probe)?;
        if probe != patch.original {
            return Err(Error::PatchVerification(set.lib.clone()));
        }
    }
    for patch in &set.patches {
        pcb.mem_write(base + patch.offset, &[TRAP_INSN])?;
    }
    debug!(
        "patched {} sites of {} in {}",
        set.patches.len(),
        set.lib.display(),
        pcb.pid
    );
    Ok(())
}

/// Restore the displaced instructions. Errors indicating the process is
/// gone end reversion silently.
pub fn revert(pcb: &mut Pcb, set: &PatchSet, base: u64) {
    for patch in &set.patches {
        match pcb.mem_write(base + patch.offset, &[patch.original[0]]) {
            Ok(()) => {}
            Err(e) if e.is_vanished() => return,
            Err(e) => {
                warn!(
                    "reverting {} in {}: {}",
                    set.lib.display(),
                    pcb.pid,
                    e
                );
                return;
            }
        }
    }
}

/// Cache of scan results keyed by on-disk image path; one scan per image
/// regardless of how many processes map it.
#[derive(Default)]
pub struct PatchCache {
    sets: HashMap<PathBuf, std::rc::Rc<PatchSet>>,
}

impl PatchCache {
    pub fn get_or_scan(&mut self, path: &Path) -> Result<std::rc::Rc<PatchSet>> {
        if let Some(set) = self.sets.get(path) {
            return Ok(set.clone());
        }
        let set = std::rc::Rc::new(scan_library(path)?);
        self.sets.insert(path.to_path_buf(), set.clone());
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble `mov eax, nr; <gap nops>; syscall; cmp rax, -4095` at an
    /// offset inside a synthetic segment.
    fn synth_site(seg: &mut Vec<u8>, nr: i64, gap: usize) -> usize {
        let load_at = seg.len();
        seg.push(NUMBER_LOAD_OPCODE);
        seg.extend_from_slice(&(nr as u32).to_le_bytes());
        seg.extend(std::iter::repeat(0x90).take(gap));
        seg.extend_from_slice(&SYSCALL_INSN);
        seg.extend_from_slice(&[0x48, 0x3d, 0x01, 0xf0, 0xff, 0xff]);
        load_at
    }

    #[test]
    fn scan_finds_interesting_sites_at_all_displacements() {
        let mut seg = vec![0x90u8; 8];
        let mut expect = Vec::new();
        for gap in DISPLACEMENTS {
            expect.push((synth_site(&mut seg, 2, gap), gap));
            seg.extend(std::iter::repeat(0x90).take(5));
        }
        let (patches, report) = scan_image(&seg, 0, 0);
        assert_eq!(report.matches, DISPLACEMENTS.len());
        assert_eq!(report.candidates, DISPLACEMENTS.len());
        for (patch, (load_at, gap)) in patches.iter().zip(expect) {
            assert_eq!(patch.offset, load_at as u64);
            assert_eq!(patch.displacement, gap as u8);
            assert_eq!(patch.syscall_nr, 2);
            assert_eq!(patch.original[0], NUMBER_LOAD_OPCODE);
        }
    }

    #[test]
    fn uninteresting_number_is_a_candidate_but_no_match() {
        let mut seg = vec![0x90u8; 8];
        synth_site(&mut seg, 39, 0); // getpid
        let (patches, report) = scan_image(&seg, 0, 0);
        assert!(patches.is_empty());
        assert_eq!(report.candidates, 1);
        assert_eq!(report.matches, 0);
    }

    #[test]
    fn missing_errno_check_rejects_site() {
        let mut seg = vec![0x90u8; 8];
        seg.push(NUMBER_LOAD_OPCODE);
        seg.extend_from_slice(&2u32.to_le_bytes());
        seg.extend_from_slice(&SYSCALL_INSN);
        seg.extend(std::iter::repeat(0x90).take(ERRNO_WINDOW + 2));
        let (patches, report) = scan_image(&seg, 0, 0);
        assert!(patches.is_empty());
        assert_eq!(report.candidates, 1);
    }

    #[test]
    fn syscall_without_preceding_load_is_skipped() {
        let mut seg = vec![0x90u8; 16];
        seg.extend_from_slice(&SYSCALL_INSN);
        seg.extend_from_slice(&[0x48, 0x3d, 0x01, 0xf0, 0xff, 0xff]);
        let (patches, report) = scan_image(&seg, 0, 0);
        assert!(patches.is_empty());
        assert_eq!(report.candidates, 1);
    }

    #[test]
    fn vaddr_delta_is_applied() {
        let mut seg = vec![0x90u8; 8];
        let load_at = synth_site(&mut seg, 87, 0);
        let (patches, _) = scan_image(&seg, 0x1000, 0x2000);
        assert_eq!(patches[0].offset, 0x1000 + 0x2000 + load_at as u64);
    }

    #[test]
    fn find_site_matches_trap_ip() {
        let mut seg = vec![0x90u8; 8];
        let load_at = synth_site(&mut seg, 87, 0) as u64;
        let (patches, report) = scan_image(&seg, 0, 0);
        let set = PatchSet {
            lib: PathBuf::from("/lib/synth.so"),
            image_len: seg.len() as u64,
            patches,
            report,
        };
        let base = 0x7f00_0000_0000u64;
        // After INT3 fires the ip is one past the site.
        let found = set.find_site(base, base + load_at + 1).unwrap();
        assert_eq!(found.syscall_nr, 87);
        assert!(set.find_site(base, base + load_at + 2).is_none());
    }

    #[test]
    fn apply_verifies_then_patches_and_revert_restores() {
        use nix::unistd::Pid;

        // A fake "image" in our own address space; the mem handle writes
        // land through /proc/self/mem.
        let mut image = vec![0x90u8; 32];
        let load_at = synth_site(&mut image, 87, 0);
        let (patches, report) = scan_image(&image, 0, 0);
        let set = PatchSet {
            lib: PathBuf::from("/lib/synth.so"),
            image_len: image.len() as u64,
            patches,
            report,
        };
        let base = image.as_ptr() as u64;

        let pcb = Pcb::new(Pid::this(), true, None);
        apply(&mut pcb.borrow_mut(), &set, base).unwrap();
        assert_eq!(image[load_at], TRAP_INSN);

        revert(&mut pcb.borrow_mut(), &set, base);
        assert_eq!(image[load_at], NUMBER_LOAD_OPCODE);
    }

    #[test]
    fn mismatched_site_aborts_patching() {
        use nix::unistd::Pid;

        let mut image = vec![0x90u8; 32];
        let load_at = synth_site(&mut image, 2, 0);
        let (patches, report) = scan_image(&image, 0, 0);
        let set = PatchSet {
            lib: PathBuf::from("/lib/synth.so"),
            image_len: image.len() as u64,
            patches,
            report,
        };
        // Something else rewrote the site between scan and patch.
        image[load_at + 1] ^= 0xff;
        let base = image.as_ptr() as u64;

        let pcb = Pcb::new(Pid::this(), true, None);
        match apply(&mut pcb.borrow_mut(), &set, base) {
            Err(crate::errors::Error::PatchVerification(_)) => {}
            other => panic!("expected verification failure, got {:?}", other.map(|_| ())),
        }
        // The image is untouched: no site was overwritten.
        assert_ne!(image[load_at], TRAP_INSN);
    }

    #[test]
    fn scan_a_real_libc_reports_sites() {
        // Best effort: present on every Linux box we build on; skip quietly
        // when the path is exotic.
        for candidate in ["/lib/x86_64-linux-gnu/libc.so.6", "/usr/lib64/libc.so.6"] {
            let path = Path::new(candidate);
            if !path.exists() {
                continue;
            }
            let set = scan_library(path).unwrap();
            assert!(set.report.candidates >= set.report.matches);
            return;
        }
    }
}
