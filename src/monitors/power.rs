//! Battery monitor.
//!
//! Enumerates devices advertising a battery capability, journals one
//! `batteries` row per device, and appends a timestamped `battery_log` row
//! for every property-change notification. Properties the platform does
//! not expose are stored as −1.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, warn};
use rusqlite::{params, OptionalExtension};

use super::Collector;
use crate::errors::Result;
use crate::event::Stamp;
use crate::journal::SqlBuf;

/// Static identity of one battery device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatteryDevice {
    pub name: String,
    pub voltage_design: i64,
    pub voltage_unit: String,
    pub reporting_design: i64,
    pub reporting_unit: String,
}

/// One property read-out. Unknown values are −1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatterySample {
    pub charging: bool,
    pub discharging: bool,
    pub voltage_mv: i64,
    pub reporting: i64,
    pub last_full: i64,
}

/// Platform seam. The sysfs implementation below polls; an IPC-backed one
/// would subscribe to property-change signals.
pub trait PowerSource: Send {
    fn enumerate(&mut self) -> Result<Vec<BatteryDevice>>;
    fn read(&mut self, device: &str) -> Result<BatterySample>;
    /// Wait up to `timeout` for a change notification; returns the device
    /// that changed, or None on timeout.
    fn wait_change(&mut self, timeout: Duration) -> Result<Option<String>>;
}

pub struct PowerMonitor<S: PowerSource> {
    source: S,
    buf: SqlBuf,
    /// Journal id per device name, filled at start.
    ids: HashMap<String, i64>,
}

impl<S: PowerSource> PowerMonitor<S> {
    pub fn new(source: S, buf: SqlBuf) -> PowerMonitor<S> {
        PowerMonitor {
            source,
            buf,
            ids: HashMap::new(),
        }
    }

    fn sample(&mut self, device: &str) -> Result<()> {
        let id = match self.ids.get(device) {
            Some(id) => *id,
            None => return Ok(()),
        };
        let s = self.source.read(device)?;
        let t = Stamp::now();
        self.buf.append(
            &format!(
                "INSERT INTO battery_log (id, year, yday, hour, min, sec, \
                 is_charging, is_discharging, voltage, reporting, last_full) \
                 VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {})",
                id,
                t.year,
                t.yday,
                t.hour,
                t.min,
                t.sec,
                s.charging as i32,
                s.discharging as i32,
                s.voltage_mv,
                s.reporting,
                s.last_full
            ),
            false,
        )?;
        Ok(())
    }
}

impl<S: PowerSource> Collector for PowerMonitor<S> {
    fn name(&self) -> &'static str {
        "power"
    }

    fn start(&mut self) -> Result<()> {
        self.buf.set_flush_delay(Duration::from_secs(60));
        let devices = self.source.enumerate()?;
        for dev in devices {
            let existing: Option<i64> = self
                .buf
                .conn()
                .query_row(
                    "SELECT id FROM batteries WHERE device = ?1",
                    params![dev.name],
                    |r| r.get(0),
                )
                .optional()?;
            let id = match existing {
                Some(id) => id,
                None => {
                    self.buf.conn().execute(
                        "INSERT INTO batteries (device, voltage_design, voltage_unit, \
                         reporting_design, reporting_unit) VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            dev.name,
                            dev.voltage_design,
                            dev.voltage_unit,
                            dev.reporting_design,
                            dev.reporting_unit
                        ],
                    )?;
                    self.buf.conn().last_insert_rowid()
                }
            };
            debug!("battery {} -> id {}", dev.name, id);
            self.ids.insert(dev.name, id);
        }
        // First sample regardless of notifications.
        let names: Vec<String> = self.ids.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.sample(&name) {
                warn!("power: initial sample of {} failed: {}", name, e);
            }
        }
        Ok(())
    }

    fn tick(&mut self, timeout: Duration) -> Result<()> {
        if let Some(device) = self.source.wait_change(timeout)? {
            self.sample(&device)?;
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

/// `/sys/class/power_supply` implementation. The kernel exposes no
/// notification stream here, so changes are detected by polling on a
/// coarse cadence.
pub struct SysfsPowerSource {
    root: PathBuf,
    poll: Duration,
    last_poll: Option<Instant>,
    devices: Vec<String>,
    next: usize,
}

impl SysfsPowerSource {
    pub fn new() -> SysfsPowerSource {
        SysfsPowerSource::at(PathBuf::from("/sys/class/power_supply"), Duration::from_secs(30))
    }

    pub fn at(root: PathBuf, poll: Duration) -> SysfsPowerSource {
        SysfsPowerSource {
            root,
            poll,
            last_poll: None,
            devices: Vec::new(),
            next: 0,
        }
    }

    fn read_attr(dir: &Path, attr: &str) -> Option<String> {
        fs::read_to_string(dir.join(attr))
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn read_num(dir: &Path, attr: &str) -> i64 {
        Self::read_attr(dir, attr)
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(-1)
    }
}

impl Default for SysfsPowerSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerSource for SysfsPowerSource {
    fn enumerate(&mut self) -> Result<Vec<BatteryDevice>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Ok(out),
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            if Self::read_attr(&dir, "type").as_deref() != Some("Battery") {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // Design voltage is reported in microvolts; the journal keeps
            // millivolts.
            let vd = Self::read_num(&dir, "voltage_min_design");
            let reporting_design = match Self::read_num(&dir, "energy_full_design") {
                -1 => Self::read_num(&dir, "charge_full_design"),
                v => v,
            };
            let reporting_unit = if dir.join("energy_full_design").exists() {
                "uWh"
            } else {
                "uAh"
            };
            out.push(BatteryDevice {
                name: name.clone(),
                voltage_design: if vd < 0 { -1 } else { vd / 1000 },
                voltage_unit: "mV".into(),
                reporting_design,
                reporting_unit: reporting_unit.into(),
            });
            self.devices.push(name);
        }
        Ok(out)
    }

    fn read(&mut self, device: &str) -> Result<BatterySample> {
        let dir = self.root.join(device);
        let status = Self::read_attr(&dir, "status").unwrap_or_default();
        let voltage = Self::read_num(&dir, "voltage_now");
        let reporting = match Self::read_num(&dir, "energy_now") {
            -1 => Self::read_num(&dir, "charge_now"),
            v => v,
        };
        let last_full = match Self::read_num(&dir, "energy_full") {
            -1 => Self::read_num(&dir, "charge_full"),
            v => v,
        };
        Ok(BatterySample {
            charging: status == "Charging",
            discharging: status == "Discharging",
            voltage_mv: if voltage < 0 { -1 } else { voltage / 1000 },
            reporting,
            last_full,
        })
    }

    fn wait_change(&mut self, timeout: Duration) -> Result<Option<String>> {
        let due = self
            .last_poll
            .map(|t| t.elapsed() >= self.poll)
            .unwrap_or(true);
        if !due || self.devices.is_empty() {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        let device = self.devices[self.next % self.devices.len()].clone();
        self.next += 1;
        if self.next % self.devices.len().max(1) == 0 {
            self.last_poll = Some(Instant::now());
        }
        Ok(Some(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::store::BATTERY_SCHEMA;
    use rusqlite::Connection;
    use std::sync::mpsc::{channel, Receiver, Sender};

    /// Scripted source: enumeration plus a queue of change notifications.
    struct ScriptedSource {
        devices: Vec<BatteryDevice>,
        samples: HashMap<String, BatterySample>,
        changes: Receiver<String>,
    }

    fn scripted() -> (ScriptedSource, Sender<String>) {
        let (tx, rx) = channel();
        let dev = BatteryDevice {
            name: "BAT0".into(),
            voltage_design: 11400,
            voltage_unit: "mV".into(),
            reporting_design: 50000,
            reporting_unit: "uWh".into(),
        };
        let mut samples = HashMap::new();
        samples.insert(
            "BAT0".to_string(),
            BatterySample {
                charging: true,
                discharging: false,
                voltage_mv: 12100,
                reporting: 42000,
                last_full: 48000,
            },
        );
        (
            ScriptedSource {
                devices: vec![dev],
                samples,
                changes: rx,
            },
            tx,
        )
    }

    impl PowerSource for ScriptedSource {
        fn enumerate(&mut self) -> Result<Vec<BatteryDevice>> {
            Ok(self.devices.clone())
        }
        fn read(&mut self, device: &str) -> Result<BatterySample> {
            Ok(self.samples[device])
        }
        fn wait_change(&mut self, timeout: Duration) -> Result<Option<String>> {
            Ok(self.changes.recv_timeout(timeout).ok())
        }
    }

    fn battery_buf() -> SqlBuf {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(BATTERY_SCHEMA).unwrap();
        SqlBuf::new(conn)
    }

    #[test]
    fn start_registers_device_and_first_sample() {
        let (source, _tx) = scripted();
        let mut mon = PowerMonitor::new(source, battery_buf());
        mon.start().unwrap();
        mon.flush().unwrap();
        let n: i64 = mon
            .buf
            .conn()
            .query_row("SELECT COUNT(*) FROM batteries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
        let logged: i64 = mon
            .buf
            .conn()
            .query_row("SELECT COUNT(*) FROM battery_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(logged, 1);
    }

    #[test]
    fn notification_appends_log_row() {
        let (source, tx) = scripted();
        let mut mon = PowerMonitor::new(source, battery_buf());
        mon.start().unwrap();
        tx.send("BAT0".into()).unwrap();
        mon.tick(Duration::from_millis(50)).unwrap();
        mon.flush().unwrap();
        let logged: i64 = mon
            .buf
            .conn()
            .query_row("SELECT COUNT(*) FROM battery_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(logged, 2);
        let (charging, voltage): (i64, i64) = mon
            .buf
            .conn()
            .query_row(
                "SELECT is_charging, voltage FROM battery_log ORDER BY rowid DESC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(charging, 1);
        assert_eq!(voltage, 12100);
    }

    #[test]
    fn restart_reuses_battery_row() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(BATTERY_SCHEMA).unwrap();
        let buf = SqlBuf::new(conn);
        let (source, _tx) = scripted();
        let mut mon = PowerMonitor::new(source, buf);
        mon.start().unwrap();
        let first = mon.ids["BAT0"];
        // Second start on the same store must resolve to the same id.
        let (source2, _tx2) = scripted();
        let mut mon2 = PowerMonitor::new(source2, SqlBuf::new(mon.buf.into_conn()));
        mon2.start().unwrap();
        assert_eq!(mon2.ids["BAT0"], first);
    }
}
