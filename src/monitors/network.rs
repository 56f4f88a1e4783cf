//! Network monitor.
//!
//! One state machine per connection, driven by platform connectivity
//! signals; every transition appends a `connection_log` row. Scheduled
//! actions run off a deadline-ordered timer queue: a statistics poll while
//! connected, a periodic active scan, and the journal-buffer flush policy.
//! A disconnecting connection gets one synchronous statistics request so
//! final byte counters are captured before teardown.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::Collector;
use crate::errors::Result;
use crate::event::Stamp;
use crate::flags::Flags;
use crate::journal::sql_buf::quote;
use crate::journal::SqlBuf;

pub const STATS_PERIOD: Duration = Duration::from_secs(5 * 60);
pub const SCAN_PERIOD: Duration = Duration::from_secs(3 * 60 * 60);
const FLUSH_CHECK: Duration = Duration::from_secs(1);
const FLUSH_BUFFERED_MAX: Duration = Duration::from_secs(60);
const FLUSH_QUIET_MAX: Duration = Duration::from_secs(2);
/// First scan soon after start; the 3 h cadence follows from there.
const FIRST_SCAN_DELAY: Duration = Duration::from_secs(60);

pub type ConnId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Limited,
    Disconnected,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Disconnecting => "disconnecting",
            ConnState::Limited => "limited",
            ConnState::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone)]
pub enum NetSignal {
    StateChange { conn: ConnId, state: ConnState },
    /// The platform connectivity service is going down.
    PlatformShutdown,
}

#[derive(Debug, Clone, Default)]
pub struct ConnInfo {
    pub service_triple: String,
    pub network_triple: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnStats {
    pub rx: i64,
    pub tx: i64,
    pub time_active: i64,
    pub signal_strength: i64,
    pub sent: i64,
    pub received: i64,
}

#[derive(Debug, Clone)]
pub struct ScanRow {
    pub status: String,
    pub last_seen: i64,
    pub service_triple: String,
    pub service_name: String,
    pub service_priority: i64,
    pub network_triple: String,
    pub network_name: String,
    pub network_priority: i64,
    pub signal_strength: i64,
    pub signal_strength_db: i64,
    pub station_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Medium {
    Wired,
    Wlan,
    Cellular,
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct DefaultLink {
    pub medium: Medium,
    pub up_since: Instant,
}

/// Default-connection state shared with the upload scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkState {
    pub link: Option<DefaultLink>,
}

pub type SharedLink = Arc<Mutex<LinkState>>;

/// Platform seam for connectivity IPC.
pub trait ConnectivitySource: Send {
    fn poll_signal(&mut self, timeout: Duration) -> Result<Option<NetSignal>>;
    fn connection_info(&mut self, conn: &str) -> Result<ConnInfo>;
    /// Synchronous statistics request, bounded by `grace`.
    fn stats(&mut self, conn: &str, grace: Duration) -> Result<ConnStats>;
    fn scan(&mut self) -> Result<Vec<ScanRow>>;
    fn default_link(&mut self) -> Result<Option<DefaultLink>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Action {
    StatsPoll,
    ScanKick,
    FlushCheck,
}

struct ConnTrack {
    state: ConnState,
    info: ConnInfo,
    stats: ConnStats,
}

pub struct NetworkMonitor<S: ConnectivitySource> {
    source: S,
    buf: SqlBuf,
    conns: HashMap<ConnId, ConnTrack>,
    timers: BinaryHeap<Reverse<(Instant, Action)>>,
    scan_outstanding: bool,
    last_append: Option<Instant>,
    link: SharedLink,
    stats_grace: Duration,
}

impl<S: ConnectivitySource> NetworkMonitor<S> {
    pub fn new(source: S, buf: SqlBuf, link: SharedLink) -> NetworkMonitor<S> {
        NetworkMonitor {
            source,
            buf,
            conns: HashMap::new(),
            timers: BinaryHeap::new(),
            scan_outstanding: false,
            last_append: None,
            link,
            stats_grace: Flags::get().stats_grace,
        }
    }

    fn schedule(&mut self, action: Action, after: Duration) {
        self.timers.push(Reverse((Instant::now() + after, action)));
    }

    fn append(&mut self, stmt: &str) -> Result<()> {
        self.buf.append(stmt, false)?;
        self.last_append = Some(Instant::now());
        Ok(())
    }

    fn flush_policy_due(&self) -> bool {
        if self.buf.buffered() == 0 {
            return false;
        }
        let buffered_long = self
            .buf
            .oldest()
            .map(|age| age >= FLUSH_BUFFERED_MAX)
            .unwrap_or(false);
        let quiet = self
            .last_append
            .map(|t| t.elapsed() >= FLUSH_QUIET_MAX)
            .unwrap_or(false);
        buffered_long || quiet
    }

    fn refresh_link(&mut self) {
        match self.source.default_link() {
            Ok(link) => self.link.lock().unwrap().link = link,
            Err(e) => warn!("network: default link query failed: {}", e),
        }
    }

    fn log_transition(&mut self, conn: &str, state: ConnState) -> Result<()> {
        let (info, stats) = match self.conns.get(conn) {
            Some(t) => (t.info.clone(), t.stats),
            None => (ConnInfo::default(), ConnStats::default()),
        };
        let t = Stamp::now();
        self.append(&format!(
            "INSERT INTO connection_log (year, yday, hour, min, sec, \
             service_triple, network_triple, status, rx, tx) \
             VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {})",
            t.year,
            t.yday,
            t.hour,
            t.min,
            t.sec,
            quote(&info.service_triple),
            quote(&info.network_triple),
            quote(state.as_str()),
            stats.rx,
            stats.tx
        ))
    }

    fn handle_state_change(&mut self, conn: ConnId, state: ConnState) -> Result<()> {
        if !self.conns.contains_key(&conn) {
            let info = self.source.connection_info(&conn).unwrap_or_default();
            self.conns.insert(
                conn.clone(),
                ConnTrack {
                    state: ConnState::Disconnected,
                    info,
                    stats: ConnStats::default(),
                },
            );
        }
        if state == ConnState::Disconnecting {
            // Final counters, before the platform tears the counters down.
            match self.source.stats(&conn, self.stats_grace) {
                Ok(s) => {
                    if let Some(t) = self.conns.get_mut(&conn) {
                        t.stats = s;
                    }
                }
                Err(e) => debug!("network: final stats for {} unavailable: {}", conn, e),
            }
        }
        self.log_transition(&conn, state)?;
        match state {
            ConnState::Disconnected => {
                self.conns.remove(&conn);
            }
            _ => {
                if let Some(t) = self.conns.get_mut(&conn) {
                    t.state = state;
                }
            }
        }
        self.refresh_link();
        Ok(())
    }

    fn poll_stats(&mut self) -> Result<()> {
        let active: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, t)| matches!(t.state, ConnState::Connected | ConnState::Limited))
            .map(|(id, _)| id.clone())
            .collect();
        for conn in active {
            let stats = match self.source.stats(&conn, self.stats_grace) {
                Ok(s) => s,
                Err(e) => {
                    warn!("network: stats for {} failed: {}", conn, e);
                    continue;
                }
            };
            if let Some(t) = self.conns.get_mut(&conn) {
                t.stats = stats;
            }
            let info = self.conns[&conn].info.clone();
            let t = Stamp::now();
            self.append(&format!(
                "INSERT INTO stats_log (year, yday, hour, min, sec, \
                 service_triple, network_triple, time_active, signal_strength, \
                 sent, received) VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {})",
                t.year,
                t.yday,
                t.hour,
                t.min,
                t.sec,
                quote(&info.service_triple),
                quote(&info.network_triple),
                stats.time_active,
                stats.signal_strength,
                stats.sent,
                stats.received
            ))?;
        }
        Ok(())
    }

    fn run_scan(&mut self) -> Result<()> {
        if self.scan_outstanding {
            return Ok(());
        }
        self.scan_outstanding = true;
        let t = Stamp::now();
        // The scans row is the scan session; its id tags every result row.
        self.buf.conn().execute(
            "INSERT INTO scans (year, yday, hour, min, sec) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![t.year, t.yday, t.hour, t.min, t.sec],
        )?;
        let session = self.buf.conn().last_insert_rowid();
        let rows = match self.source.scan() {
            Ok(rows) => rows,
            Err(e) => {
                warn!("network: scan failed: {}", e);
                self.scan_outstanding = false;
                return Ok(());
            }
        };
        info!("network: scan {} returned {} rows", session, rows.len());
        for r in rows {
            self.append(&format!(
                "INSERT INTO scan_log (id, status, last_seen, service_triple, \
                 service_name, service_priority, network_triple, network_name, \
                 network_priority, signal_strength, signal_strength_db, station_id) \
                 VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {})",
                session,
                quote(&r.status),
                r.last_seen,
                quote(&r.service_triple),
                quote(&r.service_name),
                r.service_priority,
                quote(&r.network_triple),
                quote(&r.network_name),
                r.network_priority,
                r.signal_strength,
                r.signal_strength_db,
                quote(&r.station_id)
            ))?;
        }
        self.scan_outstanding = false;
        Ok(())
    }

    fn fire_due_timers(&mut self) -> Result<()> {
        let now = Instant::now();
        while let Some(Reverse((deadline, action))) = self.timers.peek().copied() {
            if deadline > now {
                break;
            }
            self.timers.pop();
            match action {
                Action::StatsPoll => {
                    self.poll_stats()?;
                    self.schedule(Action::StatsPoll, STATS_PERIOD);
                }
                Action::ScanKick => {
                    self.run_scan()?;
                    self.schedule(Action::ScanKick, SCAN_PERIOD);
                }
                Action::FlushCheck => {
                    if self.flush_policy_due() {
                        self.buf.flush()?;
                    }
                    self.schedule(Action::FlushCheck, FLUSH_CHECK);
                }
            }
        }
        Ok(())
    }
}

impl<S: ConnectivitySource> Collector for NetworkMonitor<S> {
    fn name(&self) -> &'static str {
        "network"
    }

    fn start(&mut self) -> Result<()> {
        self.schedule(Action::StatsPoll, STATS_PERIOD);
        self.schedule(Action::ScanKick, FIRST_SCAN_DELAY);
        self.schedule(Action::FlushCheck, FLUSH_CHECK);
        self.refresh_link();
        Ok(())
    }

    fn tick(&mut self, timeout: Duration) -> Result<()> {
        self.fire_due_timers()?;
        match self.source.poll_signal(timeout)? {
            Some(NetSignal::StateChange { conn, state }) => {
                self.handle_state_change(conn, state)?;
            }
            Some(NetSignal::PlatformShutdown) => {
                info!("network: platform shutdown signal; flushing");
                self.buf.flush()?;
            }
            None => {}
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.buf.flush()
    }

    fn stop(&mut self) -> Result<()> {
        self.buf.flush()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse((t, _))| *t)
    }
}

/// Connectivity over `/sys/class/net` and `/proc/net/route`, for hosts
/// without a connectivity IPC service. Detects default-route changes by
/// polling and reads byte counters from the interface statistics; active
/// scans need a wireless IPC backend and return empty here.
pub struct SysfsNetSource {
    current_iface: Option<String>,
    up_since: Option<Instant>,
}

impl SysfsNetSource {
    pub fn new() -> SysfsNetSource {
        SysfsNetSource {
            current_iface: None,
            up_since: None,
        }
    }

    /// Interface carrying the default route.
    fn default_iface() -> Option<String> {
        let table = std::fs::read_to_string("/proc/net/route").ok()?;
        for line in table.lines().skip(1) {
            let mut cols = line.split_whitespace();
            let iface = cols.next()?;
            let dest = cols.next()?;
            if dest == "00000000" {
                return Some(iface.to_string());
            }
        }
        None
    }

    fn medium_of(iface: &str) -> Medium {
        let sys = PathBuf::from("/sys/class/net").join(iface);
        if sys.join("wireless").exists() {
            Medium::Wlan
        } else if iface.starts_with("ww") || iface.starts_with("usb") {
            Medium::Cellular
        } else if sys.join("device").exists() || iface.starts_with("en") || iface.starts_with("eth")
        {
            Medium::Wired
        } else {
            Medium::Other
        }
    }

    fn counter(iface: &str, name: &str) -> i64 {
        std::fs::read_to_string(
            PathBuf::from("/sys/class/net")
                .join(iface)
                .join("statistics")
                .join(name),
        )
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(-1)
    }
}

impl Default for SysfsNetSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivitySource for SysfsNetSource {
    fn poll_signal(&mut self, timeout: Duration) -> Result<Option<NetSignal>> {
        std::thread::sleep(timeout.min(Duration::from_millis(500)));
        let now_iface = Self::default_iface();
        if now_iface == self.current_iface {
            return Ok(None);
        }
        // The previous default going away surfaces before the new one.
        if let Some(old) = self.current_iface.take() {
            self.up_since = None;
            self.current_iface = now_iface;
            return Ok(Some(NetSignal::StateChange {
                conn: old,
                state: ConnState::Disconnected,
            }));
        }
        let iface = now_iface.clone().unwrap_or_default();
        self.current_iface = now_iface;
        self.up_since = Some(Instant::now());
        Ok(Some(NetSignal::StateChange {
            conn: iface,
            state: ConnState::Connected,
        }))
    }

    fn connection_info(&mut self, conn: &str) -> Result<ConnInfo> {
        Ok(ConnInfo {
            service_triple: format!("sysfs/{}/default", conn),
            network_triple: format!("net/{}/{:?}", conn, Self::medium_of(conn)),
        })
    }

    fn stats(&mut self, conn: &str, _grace: Duration) -> Result<ConnStats> {
        Ok(ConnStats {
            rx: Self::counter(conn, "rx_bytes"),
            tx: Self::counter(conn, "tx_bytes"),
            time_active: self
                .up_since
                .map(|t| t.elapsed().as_secs() as i64)
                .unwrap_or(-1),
            signal_strength: -1,
            sent: Self::counter(conn, "tx_packets"),
            received: Self::counter(conn, "rx_packets"),
        })
    }

    fn scan(&mut self) -> Result<Vec<ScanRow>> {
        // Needs a wireless IPC backend.
        Ok(Vec::new())
    }

    fn default_link(&mut self) -> Result<Option<DefaultLink>> {
        let iface = match &self.current_iface {
            Some(i) => i.clone(),
            None => match Self::default_iface() {
                Some(i) => {
                    self.current_iface = Some(i.clone());
                    self.up_since = Some(Instant::now());
                    i
                }
                None => return Ok(None),
            },
        };
        Ok(Some(DefaultLink {
            medium: Self::medium_of(&iface),
            up_since: self.up_since.unwrap_or_else(Instant::now),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::store::NETWORK_SCHEMA;
    use rusqlite::Connection;
    use std::collections::VecDeque;

    struct ScriptedNet {
        signals: VecDeque<NetSignal>,
        stats: ConnStats,
        stats_calls: usize,
        scan_rows: Vec<ScanRow>,
        link: Option<DefaultLink>,
    }

    impl Default for ScriptedNet {
        fn default() -> Self {
            ScriptedNet {
                signals: VecDeque::new(),
                stats: ConnStats {
                    rx: 100,
                    tx: 50,
                    time_active: 10,
                    signal_strength: 70,
                    sent: 5,
                    received: 9,
                },
                stats_calls: 0,
                scan_rows: Vec::new(),
                link: None,
            }
        }
    }

    impl ConnectivitySource for ScriptedNet {
        fn poll_signal(&mut self, _timeout: Duration) -> Result<Option<NetSignal>> {
            Ok(self.signals.pop_front())
        }
        fn connection_info(&mut self, conn: &str) -> Result<ConnInfo> {
            Ok(ConnInfo {
                service_triple: format!("svc/{}", conn),
                network_triple: format!("net/{}", conn),
            })
        }
        fn stats(&mut self, _conn: &str, _grace: Duration) -> Result<ConnStats> {
            self.stats_calls += 1;
            Ok(self.stats)
        }
        fn scan(&mut self) -> Result<Vec<ScanRow>> {
            Ok(self.scan_rows.clone())
        }
        fn default_link(&mut self) -> Result<Option<DefaultLink>> {
            Ok(self.link)
        }
    }

    fn network_buf() -> SqlBuf {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(NETWORK_SCHEMA).unwrap();
        SqlBuf::new(conn)
    }

    fn monitor(source: ScriptedNet) -> NetworkMonitor<ScriptedNet> {
        crate::flags::Flags::init_for_tests(std::env::temp_dir());
        NetworkMonitor::new(source, network_buf(), SharedLink::default())
    }

    fn statuses(mon: &NetworkMonitor<ScriptedNet>) -> Vec<String> {
        mon.buf
            .conn()
            .prepare("SELECT status FROM connection_log ORDER BY rowid")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn transitions_append_rows_in_order() {
        let mut source = ScriptedNet::default();
        source.signals.push_back(NetSignal::StateChange {
            conn: "eth0".into(),
            state: ConnState::Connecting,
        });
        source.signals.push_back(NetSignal::StateChange {
            conn: "eth0".into(),
            state: ConnState::Connected,
        });
        let mut mon = monitor(source);
        mon.start().unwrap();
        mon.tick(Duration::from_millis(1)).unwrap();
        mon.tick(Duration::from_millis(1)).unwrap();
        mon.flush().unwrap();
        assert_eq!(statuses(&mon), vec!["connecting", "connected"]);
    }

    #[test]
    fn disconnecting_requests_final_stats() {
        let mut source = ScriptedNet::default();
        source.signals.push_back(NetSignal::StateChange {
            conn: "wlan0".into(),
            state: ConnState::Connected,
        });
        source.signals.push_back(NetSignal::StateChange {
            conn: "wlan0".into(),
            state: ConnState::Disconnecting,
        });
        let mut mon = monitor(source);
        mon.start().unwrap();
        mon.tick(Duration::from_millis(1)).unwrap();
        mon.tick(Duration::from_millis(1)).unwrap();
        mon.flush().unwrap();
        assert_eq!(mon.source.stats_calls, 1);
        // The disconnecting row carries the captured byte counters.
        let (status, rx, tx): (String, i64, i64) = mon
            .buf
            .conn()
            .query_row(
                "SELECT status, rx, tx FROM connection_log ORDER BY rowid DESC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(status, "disconnecting");
        assert_eq!((rx, tx), (100, 50));
    }

    #[test]
    fn disconnected_drops_tracking() {
        let mut source = ScriptedNet::default();
        source.signals.push_back(NetSignal::StateChange {
            conn: "eth0".into(),
            state: ConnState::Connected,
        });
        source.signals.push_back(NetSignal::StateChange {
            conn: "eth0".into(),
            state: ConnState::Disconnected,
        });
        let mut mon = monitor(source);
        mon.start().unwrap();
        mon.tick(Duration::from_millis(1)).unwrap();
        mon.tick(Duration::from_millis(1)).unwrap();
        assert!(mon.conns.is_empty());
    }

    #[test]
    fn scan_rows_share_session_id() {
        let row = ScanRow {
            status: "seen".into(),
            last_seen: 1,
            service_triple: "s".into(),
            service_name: "n".into(),
            service_priority: 0,
            network_triple: "t".into(),
            network_name: "m".into(),
            network_priority: 0,
            signal_strength: 80,
            signal_strength_db: -40,
            station_id: "ap-1".into(),
        };
        let mut source = ScriptedNet::default();
        source.scan_rows = vec![row.clone(), row];
        let mut mon = monitor(source);
        mon.start().unwrap();
        mon.run_scan().unwrap();
        mon.flush().unwrap();
        let session: i64 = mon
            .buf
            .conn()
            .query_row("SELECT rowid FROM scans", [], |r| r.get(0))
            .unwrap();
        let ids: Vec<i64> = mon
            .buf
            .conn()
            .prepare("SELECT id FROM scan_log")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(ids, vec![session, session]);
    }

    #[test]
    fn stats_poll_covers_connected_only() {
        let mut source = ScriptedNet::default();
        source.signals.push_back(NetSignal::StateChange {
            conn: "a".into(),
            state: ConnState::Connected,
        });
        source.signals.push_back(NetSignal::StateChange {
            conn: "b".into(),
            state: ConnState::Connecting,
        });
        let mut mon = monitor(source);
        mon.start().unwrap();
        mon.tick(Duration::from_millis(1)).unwrap();
        mon.tick(Duration::from_millis(1)).unwrap();
        mon.poll_stats().unwrap();
        mon.flush().unwrap();
        let n: i64 = mon
            .buf
            .conn()
            .query_row("SELECT COUNT(*) FROM stats_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn platform_shutdown_forces_flush() {
        let mut source = ScriptedNet::default();
        source.signals.push_back(NetSignal::StateChange {
            conn: "eth0".into(),
            state: ConnState::Connected,
        });
        source.signals.push_back(NetSignal::PlatformShutdown);
        let mut mon = monitor(source);
        mon.start().unwrap();
        mon.tick(Duration::from_millis(1)).unwrap();
        mon.tick(Duration::from_millis(1)).unwrap();
        // No explicit flush: the shutdown signal already drained the buffer.
        let n: i64 = mon
            .buf
            .conn()
            .query_row("SELECT COUNT(*) FROM connection_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }
}
