//! Daemon entry point: resource acquisition, worker spawn, shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;

use log::{error, info, warn};
use nix::sys::signal::Signal;
use structopt::StructOpt;

use usaged::flags::Flags;
use usaged::journal::{self, SqlBuf, Store};
use usaged::monitors::network::{NetworkMonitor, SharedLink, SysfsNetSource};
use usaged::monitors::power::{PowerMonitor, SysfsPowerSource};
use usaged::monitors::service::{NullBusSource, ServiceMonitor};
use usaged::monitors::{self, Collector};
use usaged::options::Options;
use usaged::pidfile::PidFile;
use usaged::sigfan::SignalFan;
use usaged::uploader::{self, ActivityBeacon, LiveEnv, UploadDb, Uploader, UploaderConfig};
use usaged::watcher::{Coalescer, Watcher};
use usaged::{tracer, Error};

fn main() {
    let opts = Options::from_args();
    Flags::init(&opts);
    let flags = Flags::get();

    init_logging(flags.log_level);

    if !flags.no_fork {
        if let Err(e) = nix::unistd::daemon(false, false) {
            eprintln!("usaged: daemonize failed: {}", e);
            std::process::exit(1);
        }
    }

    std::process::exit(match run() {
        Ok(()) => 0,
        Err(Error::AlreadyRunning(pid)) => {
            error!("already running as pid {}", pid);
            1
        }
        Err(e) => {
            error!("start-up failed: {}", e);
            1
        }
    });
}

fn init_logging(level: log::LevelFilter) {
    let dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());
    if dispatch.apply().is_err() {
        eprintln!("usaged: logger already installed");
    }
}

fn run() -> usaged::Result<()> {
    let flags = Flags::get();

    // Only these three acquisitions are fatal: the state directory, the
    // pidfile and the kernel event stream.
    journal::init_stores()?;
    let pidfile = PidFile::acquire(&flags.state_dir.join("pid"))?;

    // Block the fan-out mask before any worker exists so every thread
    // inherits it.
    let fan = SignalFan::start(&[Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP])?;

    let beacon = ActivityBeacon::default();
    let watcher = Watcher::start(beacon.clone())?;

    // Access journal: single writer, shared by the coalescer and the
    // tracer event stream.
    let coalescer = Coalescer::new();
    let access_buf = SqlBuf::new(Store::open(&flags.state_dir.join("access.db"))?.into_conn());
    let (trace_tx, trace_rx) = channel();
    let coalesce_consumer = coalescer.clone();
    let coalesce_thread = thread::Builder::new()
        .name("fs-coalesce".into())
        .spawn(move || coalesce_consumer.run(access_buf, trace_rx))?;

    // Tracer: report file events under the base subtree, never our own
    // state directory.
    let base = flags.base_dir.clone();
    let state = flags.state_dir.clone();
    let (tracer_handle, tracer_thread) = tracer::spawn(
        trace_tx,
        Box::new(move |path| path.starts_with(&base) && !path.starts_with(&state)),
    )?;

    // Monitors.
    let stop_monitors = Arc::new(AtomicBool::new(false));
    let link: SharedLink = SharedLink::default();
    let mut monitor_threads = Vec::new();
    {
        let power = PowerMonitor::new(
            SysfsPowerSource::new(),
            SqlBuf::new(Store::open(&flags.state_dir.join("battery.db"))?.into_conn()),
        );
        let network = NetworkMonitor::new(
            SysfsNetSource::new(),
            SqlBuf::new(Store::open(&flags.state_dir.join("network.db"))?.into_conn()),
            link.clone(),
        );
        let service = ServiceMonitor::new(
            NullBusSource,
            SqlBuf::new(Store::open(&flags.state_dir.join("process.db"))?.into_conn()),
            Box::new(tracer_handle.clone()),
        );
        let collectors: Vec<Box<dyn Collector + Send>> =
            vec![Box::new(power), Box::new(network), Box::new(service)];
        for collector in collectors {
            let stop = stop_monitors.clone();
            let name = collector.name();
            monitor_threads.push(
                thread::Builder::new()
                    .name(name.into())
                    .spawn(move || monitors::drive(collector, stop))?,
            );
        }
    }

    // Uploader. A pin handed over on the command line is persisted in
    // ssl.db and re-materialised for the submitter on every run.
    let pins = journal::PinStore::open(&flags.state_dir)?;
    if let Some(ca) = &flags.collector_ca {
        match std::fs::read_to_string(ca) {
            Ok(pem) => pins.install(&pem)?,
            Err(e) => warn!("collector ca {} unreadable: {}", ca.display(), e),
        }
    }
    let mut upload_config = UploaderConfig::from_flags();
    upload_config.collector_ca = pins
        .materialise(&flags.state_dir)?
        .or(upload_config.collector_ca);

    let upload_db = UploadDb::open(&flags.state_dir.join("upload.db"))?;
    let site_uuid = usaged::journal::store::site_uuid(&flags.state_dir)?;
    let uploader = Uploader::new(
        journal::registry(),
        upload_db,
        Box::new(LiveEnv {
            link,
            beacon: beacon.clone(),
        }),
        upload_config,
        site_uuid,
    );
    let uploader_stop = uploader::stop_handle();
    let uploader_stop_worker = uploader_stop.clone();
    let uploader_thread = thread::Builder::new()
        .name("uploader".into())
        .spawn(move || uploader.run(uploader_stop_worker))?;

    // Shutdown coordinator: fatal signals drain every worker in order,
    // then end the process (the main thread stays blocked on the kernel
    // event stream by design).
    let term_rx = fan.register(Signal::SIGTERM);
    let int_rx = fan.register(Signal::SIGINT);
    let shutdown_coalescer = coalescer.clone();
    let shutdown_tracer = tracer_handle;
    thread::Builder::new().name("shutdown".into()).spawn(move || {
        loop {
            if term_rx
                .recv_timeout(std::time::Duration::from_millis(200))
                .is_ok()
            {
                break;
            }
            if int_rx.try_recv().is_ok() {
                break;
            }
        }
        info!("shutdown: draining workers");
        // Tracer first, so patches are reverted while targets still run;
        // the coalescer drains the tracer's final events afterwards.
        shutdown_tracer.quit();
        let _ = tracer_thread.join();
        stop_monitors.store(true, Ordering::SeqCst);
        uploader::request_stop(&uploader_stop);
        shutdown_coalescer.shutdown();
        let _ = coalesce_thread.join();
        let _ = uploader_thread.join();
        for t in monitor_threads {
            let _ = t.join();
        }
        drop(pidfile);
        info!("all workers drained");
        std::process::exit(0);
    })?;

    info!(
        "usaged watching {} (state in {})",
        flags.base_dir.display(),
        flags.state_dir.display()
    );

    // The main loop reads the kernel event stream; it only returns when
    // the stream itself fails, which is routed through the same orderly
    // shutdown path.
    watcher.run_reader(coalescer);
    warn!("event stream closed; shutting down");
    let _ = nix::sys::signal::kill(nix::unistd::Pid::this(), Signal::SIGTERM);
    loop {
        std::thread::park();
    }
}
