//! Background workers feeding raw DPLL samples into a monitor.
//!
//! The sysfs worker polls on a fixed interval. The netlink worker runs an
//! explicit link state machine:
//!
//! ```text
//! Connecting --ok--> Streaming --receiver exited--> Redialing --delay--> Connecting
//!     |                  |                              |
//!     +--err--> Redialing +----------- stop ------------+--> Stopped
//! ```
//!
//! Both workers wait on the same control channel, so a stop request wakes
//! them from any blocking point except an in-flight netlink receive, which
//! returns within the socket receive timeout.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::netlink::DeviceReply;
use crate::retry::Backoff;
use crate::sysfs::{SysfsReader, SysfsSample};
use crate::traits::{DpllConnection, DpllTransport};

/// Channel the DPLL status is read from, chosen once at start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sysfs,
    Netlink,
    #[default]
    None,
}

impl Backend {
    /// Prefers sysfs when the status files exist, then a netlink handshake.
    pub fn resolve(iface: &str, reader: &SysfsReader, transport: &dyn DpllTransport) -> Backend {
        if reader.is_present(iface) {
            info!("{}: DPLL status available through sysfs ({})", iface, reader.root().display());
            Backend::Sysfs
        } else if transport.probe() {
            info!("{}: DPLL status available through netlink", iface);
            Backend::Netlink
        } else {
            error!("{}: no DPLL status backend available, monitoring disabled", iface);
            Backend::None
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Sysfs => f.write_str("sysfs"),
            Backend::Netlink => f.write_str("netlink"),
            Backend::None => f.write_str("none"),
        }
    }
}

/// Consumer of backend samples, implemented by the monitor.
pub(crate) trait SampleSink: Send + Sync {
    fn ingest_sysfs(&self, sample: SysfsSample);

    /// Returns true if any reply belonged to this DPLL.
    fn ingest_replies(&self, replies: &[DeviceReply]) -> bool;

    /// Final cleanup before the backend releases its resources.
    fn teardown(&self);
}

#[derive(Debug)]
enum Control {
    Stop,
    /// The netlink receiver of the given connection epoch has exited
    ReceiverExited(u64),
}

/// A running backend thread.
pub struct BackendWorker {
    control: Sender<Control>,
    thread: Option<JoinHandle<()>>,
}

impl BackendWorker {
    pub(crate) fn spawn_sysfs(
        iface: &str,
        reader: SysfsReader,
        interval: Duration,
        sink: Weak<dyn SampleSink>,
    ) -> Result<Self> {
        let (control, control_rx) = mpsc::channel();
        let iface = iface.to_string();
        let thread = thread::Builder::new()
            .name(format!("dpll-sysfs-{}", iface))
            .spawn(move || sysfs_loop(&iface, &reader, interval, &sink, &control_rx))
            .context("failed to spawn sysfs worker")?;
        Ok(BackendWorker { control, thread: Some(thread) })
    }

    pub(crate) fn spawn_netlink(
        iface: &str,
        transport: Arc<dyn DpllTransport>,
        backoff: Backoff,
        sink: Weak<dyn SampleSink>,
    ) -> Result<Self> {
        let (control, control_rx) = mpsc::channel();
        let link = NetlinkLink {
            iface: iface.to_string(),
            transport,
            backoff,
            sink,
            control_tx: control.clone(),
            control_rx,
            epoch: 0,
        };
        let thread = thread::Builder::new()
            .name(format!("dpll-netlink-{}", iface))
            .spawn(move || link.run())
            .context("failed to spawn netlink worker")?;
        Ok(BackendWorker { control, thread: Some(thread) })
    }

    /// Signals the worker and waits for it. The worker tears the monitor
    /// down before it releases the backend connection.
    pub fn stop(mut self) {
        let _ = self.control.send(Control::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("DPLL backend worker panicked");
            }
        }
    }
}

fn sysfs_loop(
    iface: &str,
    reader: &SysfsReader,
    interval: Duration,
    sink: &Weak<dyn SampleSink>,
    control: &Receiver<Control>,
) {
    info!("{}: sysfs DPLL monitoring started (every {:?})", iface, interval);
    loop {
        match sink.upgrade() {
            Some(s) => s.ingest_sysfs(reader.read(iface)),
            None => return,
        }

        match control.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) | Ok(Control::ReceiverExited(_)) => {}
            Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("{}: terminating sysfs DPLL monitoring", iface);
    if let Some(s) = sink.upgrade() {
        s.teardown();
    }
}

enum LinkState {
    Connecting,
    Streaming(ReceiverTask),
    Redialing,
    Stopped(Option<ReceiverTask>),
}

struct NetlinkLink {
    iface: String,
    transport: Arc<dyn DpllTransport>,
    backoff: Backoff,
    sink: Weak<dyn SampleSink>,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
    epoch: u64,
}

impl NetlinkLink {
    fn run(mut self) {
        let mut state = LinkState::Connecting;
        loop {
            state = match state {
                LinkState::Connecting => match self.connect() {
                    Ok(task) => {
                        self.backoff.reset();
                        LinkState::Streaming(task)
                    }
                    Err(e) => {
                        warn!("{}: DPLL netlink connect failed: {:#}", self.iface, e);
                        LinkState::Redialing
                    }
                },
                LinkState::Streaming(task) => match self.control_rx.recv() {
                    Ok(Control::ReceiverExited(epoch)) if epoch == task.epoch => {
                        info!("{}: DPLL netlink receiver exited, redialing", self.iface);
                        task.shutdown();
                        LinkState::Redialing
                    }
                    Ok(Control::ReceiverExited(epoch)) => {
                        debug!("{}: ignoring exit of stale receiver {}", self.iface, epoch);
                        LinkState::Streaming(task)
                    }
                    Ok(Control::Stop) | Err(_) => LinkState::Stopped(Some(task)),
                },
                LinkState::Redialing => {
                    let delay = self.backoff.next_delay();
                    debug!(
                        "{}: redial attempt {} in {:?}",
                        self.iface,
                        self.backoff.attempts(),
                        delay
                    );
                    match self.control_rx.recv_timeout(delay) {
                        Err(RecvTimeoutError::Timeout) | Ok(Control::ReceiverExited(_)) => {
                            LinkState::Connecting
                        }
                        Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => {
                            LinkState::Stopped(None)
                        }
                    }
                }
                LinkState::Stopped(task) => {
                    info!("{}: terminating netlink DPLL monitoring", self.iface);
                    if let Some(s) = self.sink.upgrade() {
                        s.teardown();
                    }
                    if let Some(task) = task {
                        task.shutdown();
                    }
                    return;
                }
            };

            if self.sink.strong_count() == 0 {
                debug!("{}: monitor dropped, stopping netlink worker", self.iface);
                state = match state {
                    LinkState::Streaming(task) => LinkState::Stopped(Some(task)),
                    LinkState::Stopped(task) => LinkState::Stopped(task),
                    _ => LinkState::Stopped(None),
                };
            }
        }
    }

    /// Dial, prime the state from a full device dump, join the monitor
    /// group and start the receiver.
    fn connect(&mut self) -> Result<ReceiverTask> {
        let mut conn = self.transport.dial().context("dial")?;
        let devices = conn.dump_devices().context("device dump")?;
        debug!("{}: device dump returned {} entries", self.iface, devices.len());
        if let Some(s) = self.sink.upgrade() {
            s.ingest_replies(&devices);
        }
        conn.join_monitor_group().context("join monitor group")?;

        self.epoch += 1;
        info!("{}: DPLL netlink connection {} established", self.iface, self.epoch);
        ReceiverTask::spawn(
            &self.iface,
            conn,
            self.epoch,
            self.sink.clone(),
            self.control_tx.clone(),
        )
    }
}

/// Thread owning one netlink connection and forwarding its notifications.
struct ReceiverTask {
    epoch: u64,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReceiverTask {
    fn spawn(
        iface: &str,
        mut conn: Box<dyn DpllConnection>,
        epoch: u64,
        sink: Weak<dyn SampleSink>,
        control: Sender<Control>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let name = iface.to_string();
        let thread = thread::Builder::new()
            .name(format!("dpll-recv-{}", iface))
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    match conn.receive() {
                        Ok(Some(replies)) => match sink.upgrade() {
                            Some(s) => {
                                s.ingest_replies(&replies);
                            }
                            None => break,
                        },
                        Ok(None) => {}
                        Err(e) => {
                            warn!("{}: DPLL netlink receive failed: {:#}", name, e);
                            break;
                        }
                    }
                }
                drop(conn);
                let _ = control.send(Control::ReceiverExited(epoch));
            })
            .context("failed to spawn netlink receiver")?;
        Ok(ReceiverTask { epoch, stop, thread: Some(thread) })
    }

    /// Stops the receiver and waits for it to drop the connection.
    fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("DPLL netlink receiver panicked");
            }
        }
    }
}
