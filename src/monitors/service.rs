//! Service monitor.
//!
//! Follows name-owner-changed notifications from the session bus and keeps
//! two indexes: process id to record and bus name to owning process. The
//! first name a process acquires triggers a tracer attach; the
//! service-started row is only journalled once the tracer confirms. The
//! last name released triggers detach. Well-known system services are
//! denylisted by executable basename and never traced.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};

use super::Collector;
use crate::errors::Result;
use crate::event::Stamp;
use crate::flags::Flags;
use crate::journal::sql_buf::quote;
use crate::journal::SqlBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameEvent {
    Acquired { name: String, pid: i32 },
    Released { name: String, pid: i32 },
}

/// Platform seam for the bus connection.
pub trait BusNameSource: Send {
    fn poll(&mut self, timeout: Duration) -> Result<Option<NameEvent>>;
}

/// The slice of the tracer the monitor drives. `trace` blocks until the
/// attach is confirmed or fails.
pub trait TracerControl: Send {
    fn trace(&self, pid: i32) -> Result<()>;
    fn untrace(&self, pid: i32) -> Result<()>;
}

struct ProcRecord {
    exe: PathBuf,
    /// Sorted multiset of owned bus names.
    names: BTreeMap<String, usize>,
    traced: bool,
}

pub struct ServiceMonitor<B: BusNameSource> {
    source: B,
    buf: SqlBuf,
    tracer: Box<dyn TracerControl>,
    by_pid: HashMap<i32, ProcRecord>,
    by_name: HashMap<String, i32>,
    denylist: Vec<String>,
}

impl<B: BusNameSource> ServiceMonitor<B> {
    pub fn new(source: B, buf: SqlBuf, tracer: Box<dyn TracerControl>) -> ServiceMonitor<B> {
        ServiceMonitor {
            source,
            buf,
            tracer,
            by_pid: HashMap::new(),
            by_name: HashMap::new(),
            denylist: Flags::get().denylist,
        }
    }

    fn journal_row(&mut self, name: &str, status: &str) -> Result<()> {
        let t = Stamp::now();
        self.buf.append(
            &format!(
                "INSERT INTO process_log (year, yday, hour, min, sec, name, status) \
                 VALUES ({}, {}, {}, {}, {}, {}, {})",
                t.year,
                t.yday,
                t.hour,
                t.min,
                t.sec,
                quote(name),
                quote(status)
            ),
            false,
        )
    }

    fn denied(&self, exe: &Path) -> bool {
        let base = exe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.denylist.iter().any(|d| *d == base)
    }

    fn on_acquired(&mut self, name: String, pid: i32) -> Result<()> {
        let exe = std::fs::read_link(format!("/proc/{}/exe", pid)).unwrap_or_default();
        let denied = self.denied(&exe);
        let rec = self.by_pid.entry(pid).or_insert_with(|| ProcRecord {
            exe,
            names: BTreeMap::new(),
            traced: false,
        });
        let first = rec.names.is_empty();
        *rec.names.entry(name.clone()).or_insert(0) += 1;
        self.by_name.insert(name.clone(), pid);

        if first && !denied {
            match self.tracer.trace(pid) {
                Ok(()) => {
                    if let Some(rec) = self.by_pid.get_mut(&pid) {
                        rec.traced = true;
                    }
                }
                Err(e) => {
                    warn!("service: attach to {} failed: {}", pid, e);
                }
            }
        } else if first {
            debug!("service: {} is denylisted, not tracing pid {}", name, pid);
        }
        // The started signal follows the attach attempt, never precedes it.
        self.journal_row(&name, "acquired")
    }

    fn on_released(&mut self, name: String, pid: i32) -> Result<()> {
        if self.by_name.get(&name) == Some(&pid) {
            self.by_name.remove(&name);
        }
        let empty = match self.by_pid.get_mut(&pid) {
            Some(rec) => {
                if let Some(count) = rec.names.get_mut(&name) {
                    *count -= 1;
                    if *count == 0 {
                        rec.names.remove(&name);
                    }
                }
                rec.names.is_empty()
            }
            None => return Ok(()),
        };
        self.journal_row(&name, "released")?;
        if empty {
            let rec = self.by_pid.remove(&pid);
            if rec.map(|r| r.traced).unwrap_or(false) {
                if let Err(e) = self.tracer.untrace(pid) {
                    warn!("service: detach from {} failed: {}", pid, e);
                }
            }
        }
        Ok(())
    }

    /// Owner of a bus name, if any.
    pub fn owner_of(&self, name: &str) -> Option<i32> {
        self.by_name.get(name).copied()
    }

    /// Names currently owned by a process, in sorted order.
    pub fn names_of(&self, pid: i32) -> Vec<String> {
        self.by_pid
            .get(&pid)
            .map(|r| r.names.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl<B: BusNameSource> Collector for ServiceMonitor<B> {
    fn name(&self) -> &'static str {
        "service"
    }

    fn start(&mut self) -> Result<()> {
        self.buf.set_flush_delay(Duration::from_secs(60));
        self.journal_row("", "system_start")?;
        self.buf.flush()
    }

    fn tick(&mut self, timeout: Duration) -> Result<()> {
        match self.source.poll(timeout)? {
            Some(NameEvent::Acquired { name, pid }) => self.on_acquired(name, pid)?,
            Some(NameEvent::Released { name, pid }) => self.on_released(name, pid)?,
            None => {}
        }
        self.buf.flush_if_due()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.buf.flush()
    }

    fn stop(&mut self) -> Result<()> {
        self.buf.flush()
    }
}

/// Placeholder bus feed for builds without a session-bus backend; the
/// platform integration delivers `NameEvent`s through this seam.
pub struct NullBusSource;

impl BusNameSource for NullBusSource {
    fn poll(&mut self, timeout: Duration) -> Result<Option<NameEvent>> {
        std::thread::sleep(timeout);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::store::PROCESS_SCHEMA;
    use rusqlite::Connection;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct ScriptedBus {
        events: VecDeque<NameEvent>,
    }

    impl BusNameSource for ScriptedBus {
        fn poll(&mut self, _timeout: Duration) -> Result<Option<NameEvent>> {
            Ok(self.events.pop_front())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingTracer {
        calls: Arc<Mutex<Vec<(String, i32)>>>,
    }

    impl TracerControl for RecordingTracer {
        fn trace(&self, pid: i32) -> Result<()> {
            self.calls.lock().unwrap().push(("trace".into(), pid));
            Ok(())
        }
        fn untrace(&self, pid: i32) -> Result<()> {
            self.calls.lock().unwrap().push(("untrace".into(), pid));
            Ok(())
        }
    }

    fn process_buf() -> SqlBuf {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(PROCESS_SCHEMA).unwrap();
        SqlBuf::new(conn)
    }

    fn monitor(events: Vec<NameEvent>) -> (ServiceMonitor<ScriptedBus>, RecordingTracer) {
        crate::flags::Flags::init_for_tests(std::env::temp_dir());
        let tracer = RecordingTracer::default();
        let mon = ServiceMonitor::new(
            ScriptedBus {
                events: events.into(),
            },
            process_buf(),
            Box::new(tracer.clone()),
        );
        (mon, tracer)
    }

    fn drain(mon: &mut ServiceMonitor<ScriptedBus>, n: usize) {
        for _ in 0..n {
            mon.tick(Duration::from_millis(1)).unwrap();
        }
        mon.flush().unwrap();
    }

    #[test]
    fn first_acquire_traces_last_release_untraces() {
        let pid = std::process::id() as i32;
        let (mut mon, tracer) = monitor(vec![
            NameEvent::Acquired {
                name: "org.example.A".into(),
                pid,
            },
            NameEvent::Acquired {
                name: "org.example.B".into(),
                pid,
            },
            NameEvent::Released {
                name: "org.example.A".into(),
                pid,
            },
            NameEvent::Released {
                name: "org.example.B".into(),
                pid,
            },
        ]);
        mon.start().unwrap();
        drain(&mut mon, 4);
        let calls = tracer.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("trace".to_string(), pid), ("untrace".to_string(), pid)]);
        assert!(mon.by_pid.is_empty());
        assert!(mon.by_name.is_empty());
    }

    #[test]
    fn rows_follow_event_order() {
        let pid = std::process::id() as i32;
        let (mut mon, _tracer) = monitor(vec![
            NameEvent::Acquired {
                name: "org.example.A".into(),
                pid,
            },
            NameEvent::Released {
                name: "org.example.A".into(),
                pid,
            },
        ]);
        mon.start().unwrap();
        drain(&mut mon, 2);
        let rows: Vec<(String, String)> = mon
            .buf
            .conn()
            .prepare("SELECT name, status FROM process_log ORDER BY rowid")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(rows[0].1, "system_start");
        assert_eq!(rows[1], ("org.example.A".to_string(), "acquired".to_string()));
        assert_eq!(rows[2], ("org.example.A".to_string(), "released".to_string()));
    }

    #[test]
    fn name_owner_index_tracks_current_owner() {
        let pid = std::process::id() as i32;
        let (mut mon, _tracer) = monitor(vec![NameEvent::Acquired {
            name: "org.example.A".into(),
            pid,
        }]);
        mon.start().unwrap();
        drain(&mut mon, 1);
        assert_eq!(mon.owner_of("org.example.A"), Some(pid));
        assert_eq!(mon.names_of(pid), vec!["org.example.A".to_string()]);
    }

    #[test]
    fn release_of_unknown_pid_is_ignored() {
        let (mut mon, tracer) = monitor(vec![NameEvent::Released {
            name: "org.example.A".into(),
            pid: 424242,
        }]);
        mon.start().unwrap();
        drain(&mut mon, 1);
        assert!(tracer.calls.lock().unwrap().is_empty());
    }
}
