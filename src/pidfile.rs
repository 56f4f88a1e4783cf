//! Pidfile handling. The file holds `pid\nexe\n`; a process counts as the
//! owner only when both its pid exists and its executable matches, so a
//! recycled pid does not look like a live daemon.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::warn;

use crate::errors::{Error, Result};

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Acquire the pidfile, failing with `AlreadyRunning` when a live owner
    /// holds it. A stale file (dead pid or mismatched executable) is
    /// replaced.
    pub fn acquire(path: &Path) -> Result<PidFile> {
        if let Some((pid, exe)) = read_owner(path) {
            if owner_alive(pid, &exe) {
                return Err(Error::AlreadyRunning(pid));
            }
            warn!("replacing stale pidfile for pid {}", pid);
        }
        let exe = fs::read_link("/proc/self/exe")?;
        let mut f = fs::File::create(path)?;
        write!(f, "{}\n{}\n", std::process::id(), exe.display())?;
        Ok(PidFile {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_owner(path: &Path) -> Option<(i32, PathBuf)> {
    let text = fs::read_to_string(path).ok()?;
    let mut lines = text.lines();
    let pid = lines.next()?.trim().parse::<i32>().ok()?;
    let exe = PathBuf::from(lines.next()?.trim());
    Some((pid, exe))
}

fn owner_alive(pid: i32, exe: &Path) -> bool {
    match fs::read_link(format!("/proc/{}/exe", pid)) {
        Ok(current) => current == exe,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_reacquire_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pid");
        let held = PidFile::acquire(&path).unwrap();
        // We are the live owner, so a second acquire must fail.
        match PidFile::acquire(&path) {
            Err(Error::AlreadyRunning(pid)) => assert_eq!(pid, std::process::id() as i32),
            other => panic!("expected AlreadyRunning, got {:?}", other.map(|_| ())),
        }
        drop(held);
        assert!(!path.exists());
    }

    #[test]
    fn stale_pidfile_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pid");
        // A pid that cannot exist, so the file is stale.
        fs::write(&path, "999999999\n/no/such/exe\n").unwrap();
        let _held = PidFile::acquire(&path).unwrap();
        let (pid, _) = read_owner(&path).unwrap();
        assert_eq!(pid, std::process::id() as i32);
    }
}
