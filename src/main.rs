use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(unix)]
use nix::fcntl::{flock, FlockArg};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use dpllsync::clock_id;
use dpllsync::config::DaemonConfig;
use dpllsync::dependents::DependentStates;
use dpllsync::event::{Event, EventSink};
use dpllsync::monitor::{DpllMonitor, MonitorContext};
use dpllsync::netlink::NetlinkTransport;
use dpllsync::registry::StateRegistry;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(10);
const EVENT_WAIT: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Daemon configuration file (JSON)
    #[arg(short, long, default_value = "/etc/dpllsync/config.json")]
    config: PathBuf,

    /// Monitor only these interfaces (overrides the config file, repeatable)
    #[arg(short, long)]
    interface: Vec<String>,

    /// Print every DPLL event as a JSON line on stdout
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

fn acquire_singleton_lock() -> Result<File> {
    #[cfg(unix)]
    {
        let lock_path = "/var/run/dpllsync.lock";
        let file = File::create(lock_path)
            .map_err(|e| anyhow!("Failed to create lock file {}: {}", lock_path, e))?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(_) => Ok(file),
            Err(nix::errno::Errno::EAGAIN) => Err(anyhow!(
                "Another instance of dpllsync is already running! (Lockfile: {})",
                lock_path
            )),
            Err(e) => Err(e.into()),
        }
    }
    #[cfg(not(unix))]
    {
        let file = File::create("dpllsync.lock")?;
        Ok(file)
    }
}

#[cfg(unix)]
fn notify_systemd(state: sd_notify::NotifyState) {
    if let Err(e) = sd_notify::notify(false, &[state]) {
        warn!("systemd notification failed: {}", e);
    }
}

fn log_event(event: &Event, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to serialize event: {}", e),
        }
    } else if event.reset {
        info!("[{}] {} monitoring terminated", event.process_name, event.interface);
    } else {
        info!(
            "[{}] {} state {} values {:?}",
            event.process_name, event.interface, event.state, event.values
        );
    }
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    let _lock_file = match acquire_singleton_lock() {
        Ok(f) => f,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let mut config = DaemonConfig::load(&args.config)?;
    if !args.interface.is_empty() {
        config.interfaces = args.interface.clone();
    }
    if config.interfaces.is_empty() {
        return Err(anyhow!("No interfaces configured in {}", args.config.display()));
    }

    let sysfs_root = config.timing.sysfs_root.clone();
    let dpll_configs = config.dpll_configs(|iface| {
        let id = clock_id::pci_clock_id(&sysfs_root, iface)?;
        info!("{}: clock id {:#x} derived from PCI device serial number", iface, id);
        Ok(id)
    })?;

    let (events, event_rx) = EventSink::bounded(config.timing.event_queue_depth);
    let ctx = MonitorContext {
        registry: Arc::new(StateRegistry::new()),
        dependents: Arc::new(DependentStates::new()),
        transport: Arc::new(NetlinkTransport::new(config.timing.netlink_recv_timeout())),
        timing: config.timing.clone(),
    };

    let mut monitors = Vec::new();
    for dpll in dpll_configs {
        let iface = dpll.interface.clone();
        let monitor = DpllMonitor::new(dpll, ctx.clone())
            .with_context(|| format!("Failed to set up DPLL monitor for {}", iface))?;
        let backend = monitor.init();
        info!("{}: using {} backend", iface, backend);
        monitor.run();
        monitor.monitor_process(config.process.clone(), events.clone());
        monitors.push(monitor);
    }
    drop(events);

    // Every monitor is wired, start them together
    let started = ctx.registry.start_monitoring();
    info!("Started DPLL monitoring on {} of {} interface(s)", started, monitors.len());

    #[cfg(unix)]
    notify_systemd(sd_notify::NotifyState::Ready);

    let mut last_log = Instant::now();
    while running.load(Ordering::SeqCst) {
        match event_rx.recv_timeout(EVENT_WAIT) {
            Ok(event) => log_event(&event, args.log_json),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Event channel closed");
                break;
            }
        }

        if last_log.elapsed() >= STATUS_LOG_INTERVAL {
            for monitor in &monitors {
                let snap = monitor.snapshot();
                info!(
                    "[Status] {} clock {:#x} {} state {} phase {} freq {} offset {}ns \
                     in-spec {} source-lost {} holdover {} dependents {}",
                    snap.interface,
                    snap.clock_id,
                    snap.backend,
                    snap.state,
                    snap.phase_status,
                    snap.frequency_status,
                    snap.offset_ns,
                    snap.in_spec,
                    snap.source_lost,
                    snap.on_holdover,
                    ctx.dependents.current()
                );
            }
            last_log = Instant::now();
        }
    }

    #[cfg(unix)]
    notify_systemd(sd_notify::NotifyState::Stopping);

    for monitor in &monitors {
        monitor.stop();
    }
    ctx.registry.clear();
    for event in event_rx.try_iter() {
        log_event(&event, args.log_json);
    }

    info!("Exiting.");
    Ok(())
}
