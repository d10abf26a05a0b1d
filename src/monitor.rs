//! DPLL Monitor - fuses raw DPLL lock status with the state of upstream
//! sources into one published sync state per interface.
//!
//! Lifecycle: `new` -> `init` (resolve backend) -> `run` (subscribe to
//! dependencies) -> `monitor_process` (bind event output) -> `monitor_dpll`
//! (start the backend, normally triggered by `StateRegistry::start_monitoring`)
//! -> `stop`.
//!
//! All mutable state lives behind one mutex. When a dependency notification
//! arrives the shared `DependentStates` lock is taken first, then the monitor
//! lock; no path takes them in the other order.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::backend::{Backend, BackendWorker, SampleSink};
use crate::config::{DpllConfig, OffsetThreshold, ProcessConfig, TimingConfig};
use crate::dependents::DependentStates;
use crate::event::{Event, EventSink, EventSource, ValueType};
use crate::holdover::{self, HoldoverHandle, HoldoverOutcome, HoldoverParams, HoldoverTarget};
use crate::netlink::{DeviceReply, DpllType};
use crate::registry::{StateRegistry, Subscriber};
use crate::retry::Backoff;
use crate::status::{DpllStatus, MonitorSnapshot, PtpState};
use crate::sysfs::{SysfsReader, SysfsSample};
use crate::traits::DpllTransport;

/// Collaborators shared by every monitor of the daemon.
#[derive(Clone)]
pub struct MonitorContext {
    pub registry: Arc<StateRegistry>,
    pub dependents: Arc<DependentStates>,
    pub transport: Arc<dyn DpllTransport>,
    pub timing: TimingConfig,
}

struct ProcessBinding {
    config: ProcessConfig,
    events: EventSink,
}

struct MonitorState {
    backend: Backend,
    phase_status: DpllStatus,
    frequency_status: DpllStatus,
    phase_offset_ns: i64,
    offset_ns: i64,
    state: PtpState,
    in_spec: bool,
    source_lost: bool,
    /// Last holdover left the offset window; cleared when GNSS locks again
    range_exceeded: bool,
    /// Dependency states as this monitor last saw them
    last_seen: HashMap<EventSource, PtpState>,
    holdover: Option<HoldoverHandle>,
    next_episode: u64,
    monitoring: bool,
    process: Option<ProcessBinding>,
    decisions: u64,
}

impl MonitorState {
    fn new() -> Self {
        MonitorState {
            backend: Backend::None,
            phase_status: DpllStatus::Unknown,
            frequency_status: DpllStatus::Unknown,
            phase_offset_ns: 0,
            offset_ns: 0,
            state: PtpState::FreeRun,
            in_spec: true,
            source_lost: false,
            range_exceeded: false,
            last_seen: HashMap::new(),
            holdover: None,
            next_episode: 1,
            monitoring: false,
            process: None,
            decisions: 0,
        }
    }

    fn owns_episode(&self, episode: u64) -> bool {
        self.holdover.as_ref().map_or(false, |h| h.episode() == episode)
    }
}

pub struct DpllMonitor {
    me: Weak<DpllMonitor>,
    config: DpllConfig,
    params: HoldoverParams,
    /// Subscriber id in the registry
    id: String,
    ctx: MonitorContext,
    reader: SysfsReader,
    state: Mutex<MonitorState>,
    worker: Mutex<Option<BackendWorker>>,
    /// Set once stopping starts; suppresses regular events
    shutdown: AtomicBool,
    torn_down: AtomicBool,
}

impl DpllMonitor {
    pub fn new(config: DpllConfig, ctx: MonitorContext) -> Result<Arc<Self>> {
        config.validate()?;
        let params = HoldoverParams::new(
            config.local_max_holdover_offset_ns,
            config.local_holdover_timeout_secs,
            config.max_in_spec_offset_ns,
        )
        .with_context(|| format!("invalid holdover settings for {}", config.interface))?;

        info!(
            "DPLL monitor for {} (clock id {:#x}): max holdover offset {} ns, \
             holdover timeout {} s, max in-spec offset {} ns",
            config.interface,
            config.clock_id,
            config.local_max_holdover_offset_ns,
            config.local_holdover_timeout_secs,
            config.max_in_spec_offset_ns
        );
        info!(
            "  slope {:.4} ps/s, in-spec timer {} s, depends on {:?}",
            params.slope_ps_per_s(),
            params.timer_secs(),
            config.depends_on
        );

        let reader = SysfsReader::new(ctx.timing.sysfs_root.clone());
        let id = format!("dpll[{}]", config.interface);
        Ok(Arc::new_cyclic(|me| DpllMonitor {
            me: me.clone(),
            config,
            params,
            id,
            ctx,
            reader,
            state: Mutex::new(MonitorState::new()),
            worker: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<BackendWorker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn interface(&self) -> &str {
        &self.config.interface
    }

    pub fn clock_id(&self) -> u64 {
        self.config.clock_id
    }

    pub fn config(&self) -> &DpllConfig {
        &self.config
    }

    pub fn holdover_params(&self) -> HoldoverParams {
        self.params
    }

    pub fn state(&self) -> PtpState {
        self.lock().state
    }

    pub fn backend(&self) -> Backend {
        self.lock().backend
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let st = self.lock();
        MonitorSnapshot {
            interface: self.config.interface.clone(),
            clock_id: self.config.clock_id,
            backend: st.backend,
            phase_status: st.phase_status,
            frequency_status: st.frequency_status,
            phase_offset_ns: st.phase_offset_ns,
            offset_ns: st.offset_ns,
            state: st.state,
            in_spec: st.in_spec,
            source_lost: st.source_lost,
            on_holdover: st.holdover.is_some(),
            monitoring: st.monitoring,
            decisions: st.decisions,
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Resolves which channel the DPLL status is read from.
    pub fn init(&self) -> Backend {
        let backend =
            Backend::resolve(&self.config.interface, &self.reader, self.ctx.transport.as_ref());
        self.lock().backend = backend;
        backend
    }

    /// Subscribes to every dependency and seeds it as `Unknown`.
    pub fn run(&self) {
        for &source in &self.config.depends_on {
            self.ctx.dependents.register(source);
            self.ctx.registry.register(Arc::new(DependencySubscriber {
                topic: source,
                id: self.id.clone(),
                monitor: self.me.clone(),
            }));
        }
    }

    /// Binds the PTP process this DPLL reports for. Monitoring itself starts
    /// once the registry activates `Monitoring` subscribers.
    pub fn monitor_process(&self, process: ProcessConfig, events: EventSink) {
        info!(
            "{}: bound to process config {} ({:?}), offset window [{}, {}]",
            self.config.interface,
            process.config_name,
            process.clock_type,
            process.threshold.min,
            process.threshold.max
        );
        self.lock().process = Some(ProcessBinding { config: process, events });
        self.ctx.registry.register(Arc::new(ActivationSubscriber {
            id: self.id.clone(),
            monitor: self.me.clone(),
        }));
    }

    /// Starts the backend worker. Returns false if no backend is available.
    pub fn monitor_dpll(&self) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            warn!("{}: monitor is stopping, not starting DPLL monitoring", self.config.interface);
            return false;
        }

        let mut worker = self.lock_worker();
        if worker.is_some() {
            debug!("{}: DPLL monitoring already running", self.config.interface);
            return true;
        }

        let backend = self.lock().backend;
        let sink: Weak<dyn SampleSink> = self.me.clone();
        let timing = &self.ctx.timing;
        let spawned = match backend {
            Backend::Sysfs => BackendWorker::spawn_sysfs(
                &self.config.interface,
                self.reader.clone(),
                timing.poll_interval(),
                sink,
            ),
            Backend::Netlink => BackendWorker::spawn_netlink(
                &self.config.interface,
                self.ctx.transport.clone(),
                Backoff::new(timing.redial_delay(), timing.redial_max_delay()),
                sink,
            ),
            Backend::None => {
                error!(
                    "{}: DPLL monitoring is not possible, neither sysfs nor netlink is available",
                    self.config.interface
                );
                return false;
            }
        };

        match spawned {
            Ok(w) => {
                *worker = Some(w);
                self.lock().monitoring = true;
                info!("{}: DPLL monitoring started using {}", self.config.interface, backend);
                true
            }
            Err(e) => {
                error!("{}: failed to start DPLL monitoring: {:#}", self.config.interface, e);
                false
            }
        }
    }

    /// Stops the backend, cancels holdover, emits the reset event and
    /// unregisters every subscription. Safe to call more than once.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let worker = self.lock_worker().take();
        if let Some(worker) = worker {
            worker.stop();
        }
        // Covers monitors that never started a worker
        SampleSink::teardown(self);
    }

    // ========================================================================
    // INPUTS
    // ========================================================================

    /// State change of an upstream source. Repeated reports of the same
    /// state are ignored.
    pub fn notify(&self, source: EventSource, state: PtpState) {
        if !self.lock().monitoring {
            error!(
                "{}: {} notification ignored, DPLL monitoring not started",
                self.config.interface, source
            );
            return;
        }

        self.ctx.dependents.record(source, state, || {
            let mut st = self.lock();
            let previous = st.last_seen.insert(source, state).unwrap_or(PtpState::Unknown);
            if previous == state {
                debug!(
                    "{}: ignoring {} notification, state {} unchanged",
                    self.config.interface, source, state
                );
                return;
            }
            if source == EventSource::Gnss {
                let lost = state != PtpState::Locked;
                if st.source_lost && !lost {
                    st.offset_ns = st.phase_offset_ns;
                }
                if !lost {
                    st.range_exceeded = false;
                }
                st.source_lost = lost;
            }
            self.decide(&mut st);
        });
    }

    // ========================================================================
    // DECISION
    // ========================================================================

    fn threshold(&self, st: &MonitorState) -> OffsetThreshold {
        match &st.process {
            Some(p) => p.config.threshold,
            None => self.config.default_threshold(),
        }
    }

    fn decide(&self, st: &mut MonitorState) {
        st.decisions += 1;
        let fused = DpllStatus::worse(st.phase_status, st.frequency_status);
        let in_range = self.threshold(st).contains(st.offset_ns);
        debug!(
            "{}: decision: status {}, offset {} ns, in spec {}, source lost {}, on holdover {}",
            self.config.interface,
            fused,
            st.offset_ns,
            st.in_spec,
            st.source_lost,
            st.holdover.is_some()
        );

        match fused {
            DpllStatus::FreeRun | DpllStatus::Invalid | DpllStatus::Unknown => {
                st.in_spec = true;
                self.cancel_holdover(st);
                self.set_state(st, PtpState::FreeRun);
            }
            DpllStatus::Locked => {
                self.cancel_holdover(st);
                if !st.source_lost && in_range {
                    self.set_state(st, PtpState::Locked);
                } else {
                    self.set_state(st, PtpState::FreeRun);
                }
                st.in_spec = true;
            }
            DpllStatus::LockedHoldoverAcquired | DpllStatus::Holdover => {
                if !st.source_lost && in_range {
                    self.cancel_holdover(st);
                    st.in_spec = true;
                    self.set_state(st, PtpState::Locked);
                } else if st.source_lost && st.in_spec {
                    if st.holdover.is_none() {
                        if st.range_exceeded {
                            // No re-arm until the source comes back
                            self.set_state(st, PtpState::FreeRun);
                        } else {
                            self.start_holdover(st);
                        }
                    }
                } else if !st.in_spec {
                    self.cancel_holdover(st);
                    self.set_state(st, PtpState::FreeRun);
                }
                // Source present but offset out of range: keep the current state
            }
        }

        self.send_event(st);
    }

    fn set_state(&self, st: &mut MonitorState, state: PtpState) {
        if st.state != state {
            info!(
                "{} (clock id {:#x}): {} -> {} (phase {}, frequency {}, offset {} ns, in spec {})",
                self.config.interface,
                self.config.clock_id,
                st.state,
                state,
                st.phase_status,
                st.frequency_status,
                st.offset_ns,
                st.in_spec
            );
            st.state = state;
        }
    }

    fn start_holdover(&self, st: &mut MonitorState) {
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };
        let target: Arc<dyn HoldoverTarget> = me;
        let episode = st.next_episode;
        st.next_episode += 1;

        match holdover::start(self.params, self.ctx.timing.holdover_tick(), episode, target) {
            Ok(handle) => {
                st.holdover = Some(handle);
                self.set_state(st, PtpState::Holdover);
            }
            Err(e) => {
                error!("{}: cannot enter holdover: {:#}", self.config.interface, e);
                self.set_state(st, PtpState::FreeRun);
            }
        }
    }

    fn cancel_holdover(&self, st: &mut MonitorState) {
        if let Some(handle) = st.holdover.take() {
            info!("{}: cancelling holdover episode {}", self.config.interface, handle.episode());
            handle.cancel();
            st.in_spec = true;
        }
    }

    fn send_event(&self, st: &MonitorState) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.emit(st, st.state, false);
    }

    fn emit(&self, st: &MonitorState, state: PtpState, reset: bool) {
        let binding = match &st.process {
            Some(b) => b,
            None => {
                debug!("{}: skip event, no process bound yet", self.config.interface);
                return;
            }
        };

        let mut values = BTreeMap::new();
        if !reset {
            values.insert(ValueType::FrequencyStatus, st.frequency_status.code());
            values.insert(ValueType::Offset, st.phase_offset_ns);
            values.insert(ValueType::PhaseStatus, st.phase_status.code());
        }
        binding.events.publish(Event {
            process_name: EventSource::Dpll,
            state,
            interface: self.config.interface.clone(),
            config_name: binding.config.config_name.clone(),
            clock_type: binding.config.clock_type,
            timestamp_ms: Event::now_ms(),
            values,
            write_to_log: !reset,
            reset,
        });
    }
}

impl SampleSink for DpllMonitor {
    fn ingest_sysfs(&self, sample: SysfsSample) {
        let mut st = self.lock();
        if let Some(code) = sample.frequency_status {
            st.frequency_status = DpllStatus::from_code(code);
        }
        if let Some(code) = sample.phase_status {
            st.phase_status = DpllStatus::from_code(code);
        }
        if let Some(offset) = sample.phase_offset_ns {
            st.phase_offset_ns = offset;
            if !st.source_lost {
                st.offset_ns = offset;
            }
        }
        self.decide(&mut st);
    }

    fn ingest_replies(&self, replies: &[DeviceReply]) -> bool {
        let mut st = self.lock();
        let mut valid = false;
        for reply in replies {
            if reply.clock_id != self.config.clock_id {
                debug!(
                    "{}: discarding reply for clock id {:#x}",
                    self.config.interface, reply.clock_id
                );
                continue;
            }
            if reply.status() == DpllStatus::Invalid {
                debug!("{}: discarding on invalid status: {}", self.config.interface, reply);
                continue;
            }
            match reply.kind() {
                DpllType::Eec => {
                    st.frequency_status = reply.status();
                    valid = true;
                }
                DpllType::Pps => {
                    st.phase_status = reply.status();
                    // Netlink does not report the phase offset
                    st.phase_offset_ns = 0;
                    if !st.source_lost {
                        st.offset_ns = 0;
                    }
                    valid = true;
                }
                DpllType::Other(_) => {
                    debug!("{}: ignoring {}", self.config.interface, reply);
                    continue;
                }
            }
            info!("{}: {}", self.config.interface, reply);
        }

        if valid {
            self.decide(&mut st);
        }
        valid
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.store(true, Ordering::Release);

        let holdover = {
            let mut st = self.lock();
            let handle = st.holdover.take();
            if handle.is_some() {
                st.in_spec = true;
            }
            handle
        };
        if let Some(handle) = holdover {
            info!(
                "{}: cancelling holdover episode {} on stop",
                self.config.interface,
                handle.episode()
            );
            handle.join();
        }

        self.emit(&self.lock(), PtpState::Unknown, true);

        let topics = self.config.depends_on.iter().chain(std::iter::once(&EventSource::Monitoring));
        for &topic in topics {
            self.ctx.registry.unregister(topic, &self.id);
        }

        self.lock().monitoring = false;
        info!(
            "{} (clock id {:#x}): DPLL monitor stopped",
            self.config.interface, self.config.clock_id
        );
    }
}

impl HoldoverTarget for DpllMonitor {
    fn extrapolated(&self, episode: u64, offset_ns: i64) -> bool {
        let mut st = self.lock();
        if !st.owns_episode(episode) {
            return false;
        }
        st.offset_ns = offset_ns;
        let threshold = self.threshold(&st);
        if threshold.contains(offset_ns) {
            true
        } else {
            info!(
                "{}: holdover offset {} ns out of range [{}, {}]",
                self.config.interface, offset_ns, threshold.min, threshold.max
            );
            false
        }
    }

    fn finish(&self, episode: u64, outcome: HoldoverOutcome) {
        let mut st = self.lock();
        if !st.owns_episode(episode) {
            debug!(
                "{}: holdover episode {} already released",
                self.config.interface, episode
            );
            return;
        }
        st.holdover = None;

        match outcome {
            HoldoverOutcome::Expired => {
                info!(
                    "{}: holdover timer {} s expired",
                    self.config.interface,
                    self.params.timer_secs()
                );
                st.in_spec = false;
                self.set_state(&mut st, PtpState::FreeRun);
            }
            HoldoverOutcome::Cancelled => st.in_spec = true,
            HoldoverOutcome::RangeExceeded => st.range_exceeded = true,
        }

        if !self.shutdown.load(Ordering::Acquire) {
            self.decide(&mut st);
        }
    }
}

// ============================================================================
// SUBSCRIBERS
// ============================================================================

struct DependencySubscriber {
    topic: EventSource,
    id: String,
    monitor: Weak<DpllMonitor>,
}

impl Subscriber for DependencySubscriber {
    fn topic(&self) -> EventSource {
        self.topic
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn notify(&self, source: EventSource, state: PtpState) {
        if let Some(m) = self.monitor.upgrade() {
            m.notify(source, state);
        }
    }
}

/// Starts DPLL monitoring once the daemon has wired every monitor.
struct ActivationSubscriber {
    id: String,
    monitor: Weak<DpllMonitor>,
}

impl Subscriber for ActivationSubscriber {
    fn topic(&self) -> EventSource {
        EventSource::Monitoring
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn notify(&self, _source: EventSource, _state: PtpState) {}

    fn monitor(&self) {
        if let Some(m) = self.monitor.upgrade() {
            info!("{}: starting DPLL monitoring", m.interface());
            m.monitor_dpll();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockDpllTransport;
    use std::sync::mpsc::Receiver;
    use std::thread;
    use std::time::{Duration, Instant};

    struct Fixture {
        monitor: Arc<DpllMonitor>,
        registry: Arc<StateRegistry>,
        dependents: Arc<DependentStates>,
        events: Receiver<Event>,
    }

    fn fixture_with(config: DpllConfig, holdover_tick_ms: u64) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let registry = Arc::new(StateRegistry::new());
        let dependents = Arc::new(DependentStates::new());
        let timing = TimingConfig { holdover_tick_ms, ..TimingConfig::default() };
        let ctx = MonitorContext {
            registry: registry.clone(),
            dependents: dependents.clone(),
            transport: Arc::new(MockDpllTransport::new()),
            timing,
        };
        let monitor = DpllMonitor::new(config, ctx).unwrap();
        monitor.run();
        let (sink, events) = EventSink::bounded(100);
        let process = ProcessConfig {
            config_name: "ts2phc.0.config".to_string(),
            threshold: OffsetThreshold { min: -100, max: 100 },
            ..ProcessConfig::default()
        };
        monitor.monitor_process(process, sink);
        // Activate notifications without a backend worker
        monitor.lock().monitoring = true;
        Fixture { monitor, registry, dependents, events }
    }

    fn fixture() -> Fixture {
        fixture_with(DpllConfig::new(0x1122, "ens1f0", vec![EventSource::Gnss]), 1000)
    }

    fn sample(frequency: i64, phase: i64, offset: i64) -> SysfsSample {
        SysfsSample {
            frequency_status: Some(frequency),
            phase_status: Some(phase),
            phase_offset_ns: Some(offset),
        }
    }

    fn reply(clock_id: u64, dpll_type: u32, lock_status: u32) -> DeviceReply {
        DeviceReply { clock_id, dpll_type, lock_status, ..Default::default() }
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "timed out waiting for {}",
                what
            );
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_locked_in_range() {
        let f = fixture();
        f.monitor.ingest_sysfs(sample(2, 2, 50));

        assert_eq!(f.monitor.state(), PtpState::Locked);
        let ev = f.events.try_recv().unwrap();
        assert_eq!(ev.state, PtpState::Locked);
        assert_eq!(ev.process_name, EventSource::Dpll);
        assert_eq!(ev.config_name, "ts2phc.0.config");
        assert_eq!(ev.values[&ValueType::FrequencyStatus], 2);
        assert_eq!(ev.values[&ValueType::PhaseStatus], 2);
        assert_eq!(ev.values[&ValueType::Offset], 50);
        assert!(!ev.reset);
    }

    #[test]
    fn test_locked_out_of_range_is_freerun() {
        let f = fixture();
        f.monitor.ingest_sysfs(sample(2, 2, 50));
        f.monitor.ingest_sysfs(sample(2, 2, 150));
        assert_eq!(f.monitor.state(), PtpState::FreeRun);
        assert!(f.monitor.snapshot().in_spec);
    }

    #[test]
    fn test_worse_sub_signal_wins() {
        let f = fixture();
        f.monitor.ingest_sysfs(sample(1, 2, 0));
        assert_eq!(f.monitor.state(), PtpState::FreeRun);

        // Unreadable fields keep their previous values
        f.monitor.ingest_sysfs(SysfsSample { frequency_status: Some(2), ..Default::default() });
        let snap = f.monitor.snapshot();
        assert_eq!(snap.phase_status, DpllStatus::Locked);
        assert_eq!(snap.frequency_status, DpllStatus::Locked);
        assert_eq!(snap.state, PtpState::Locked);
    }

    #[test]
    fn test_gnss_loss_enters_and_leaves_holdover() {
        let f = fixture();
        f.monitor.ingest_sysfs(sample(3, 3, 40));
        assert_eq!(f.monitor.state(), PtpState::Locked);

        f.monitor.notify(EventSource::Gnss, PtpState::FreeRun);
        let snap = f.monitor.snapshot();
        assert!(snap.source_lost);
        assert!(snap.on_holdover);
        assert_eq!(snap.state, PtpState::Holdover);
        let last = f.events.try_iter().last().unwrap();
        assert_eq!(last.state, PtpState::Holdover);

        // Samples while the source is lost do not overwrite the evaluated offset
        f.monitor.ingest_sysfs(sample(3, 3, 900));
        let snap = f.monitor.snapshot();
        assert_eq!(snap.offset_ns, 40);
        assert_eq!(snap.state, PtpState::Holdover);

        f.monitor.ingest_sysfs(sample(3, 3, 20));
        f.monitor.notify(EventSource::Gnss, PtpState::Locked);
        let snap = f.monitor.snapshot();
        assert!(!snap.source_lost);
        assert!(!snap.on_holdover);
        assert!(snap.in_spec);
        assert_eq!(snap.offset_ns, 20);
        assert_eq!(snap.state, PtpState::Locked);
    }

    #[test]
    fn test_repeated_notification_is_ignored() {
        let f = fixture();
        f.monitor.ingest_sysfs(sample(2, 2, 0));
        let before = f.monitor.snapshot().decisions;

        f.monitor.notify(EventSource::Gnss, PtpState::Locked);
        f.monitor.notify(EventSource::Gnss, PtpState::Locked);

        assert_eq!(f.monitor.snapshot().decisions, before + 1);
        assert_eq!(f.dependents.state_of(EventSource::Gnss), Some(PtpState::Locked));
    }

    #[test]
    fn test_notification_before_monitoring_is_dropped() {
        let f = fixture();
        f.monitor.lock().monitoring = false;
        f.monitor.notify(EventSource::Gnss, PtpState::Locked);
        assert_eq!(f.monitor.snapshot().decisions, 0);
        assert_eq!(f.dependents.state_of(EventSource::Gnss), Some(PtpState::Unknown));
    }

    #[test]
    fn test_holdover_expiry() {
        // 10 ns per tick, 5 tick timer, window never left
        let mut config = DpllConfig::new(0x1122, "ens1f0", vec![EventSource::Gnss]);
        config.local_max_holdover_offset_ns = 100;
        config.local_holdover_timeout_secs = 10;
        config.max_in_spec_offset_ns = 50;
        let f = fixture_with(config, 10);

        f.monitor.ingest_sysfs(sample(3, 3, 0));
        f.monitor.notify(EventSource::Gnss, PtpState::Holdover);
        assert_eq!(f.monitor.state(), PtpState::Holdover);

        wait_until("holdover expiry", || !f.monitor.snapshot().in_spec);
        let snap = f.monitor.snapshot();
        assert_eq!(snap.state, PtpState::FreeRun);
        assert!(!snap.on_holdover);
        assert_eq!(snap.offset_ns, 40);

        // Out of spec: still free run while the source stays lost
        f.monitor.ingest_sysfs(sample(3, 3, 0));
        assert_eq!(f.monitor.state(), PtpState::FreeRun);
        assert!(!f.monitor.snapshot().in_spec);
    }

    #[test]
    fn test_holdover_range_exceeded_settles_on_freerun() {
        // 20 ns per tick, window [-100, 100] left at tick 6, timer 50 ticks
        let mut config = DpllConfig::new(0x1122, "ens1f0", vec![EventSource::Gnss]);
        config.local_max_holdover_offset_ns = 200;
        config.local_holdover_timeout_secs = 10;
        config.max_in_spec_offset_ns = 1000;
        let f = fixture_with(config, 10);

        f.monitor.ingest_sysfs(sample(3, 3, 0));
        f.monitor.notify(EventSource::Gnss, PtpState::FreeRun);
        assert_eq!(f.monitor.state(), PtpState::Holdover);

        wait_until("holdover exit", || !f.monitor.snapshot().on_holdover);
        let snap = f.monitor.snapshot();
        assert!(snap.in_spec);
        assert_eq!(snap.offset_ns, 120);
        assert_eq!(snap.state, PtpState::FreeRun);
    }

    #[test]
    fn test_gnss_loss_with_offset_out_of_range_enters_holdover() {
        let f = fixture();
        f.monitor.ingest_sysfs(sample(3, 3, 150));
        assert_eq!(f.monitor.state(), PtpState::FreeRun);

        f.monitor.notify(EventSource::Gnss, PtpState::FreeRun);
        let snap = f.monitor.snapshot();
        assert!(snap.source_lost);
        assert!(snap.in_spec);
        assert!(snap.on_holdover);
        assert_eq!(snap.state, PtpState::Holdover);
        f.monitor.stop();
    }

    #[test]
    fn test_holdover_rearms_after_source_returns() {
        // Leaves the [-100, 100] window at tick 6
        let mut config = DpllConfig::new(0x1122, "ens1f0", vec![EventSource::Gnss]);
        config.local_max_holdover_offset_ns = 200;
        config.local_holdover_timeout_secs = 10;
        config.max_in_spec_offset_ns = 1000;
        let f = fixture_with(config, 10);

        f.monitor.ingest_sysfs(sample(3, 3, 0));
        f.monitor.notify(EventSource::Gnss, PtpState::FreeRun);
        wait_until("holdover exit", || !f.monitor.snapshot().on_holdover);
        assert_eq!(f.monitor.state(), PtpState::FreeRun);

        // Still lost: no new episode
        f.monitor.ingest_sysfs(sample(3, 3, 0));
        assert!(!f.monitor.snapshot().on_holdover);
        assert_eq!(f.monitor.state(), PtpState::FreeRun);

        f.monitor.notify(EventSource::Gnss, PtpState::Locked);
        assert_eq!(f.monitor.state(), PtpState::Locked);
        f.monitor.notify(EventSource::Gnss, PtpState::FreeRun);
        assert!(f.monitor.snapshot().on_holdover);
        assert_eq!(f.monitor.state(), PtpState::Holdover);
        f.monitor.stop();
    }

    #[test]
    fn test_source_present_offset_out_of_range_keeps_state() {
        let f = fixture();
        f.monitor.ingest_sysfs(sample(3, 3, 500));
        let snap = f.monitor.snapshot();
        assert_eq!(snap.state, PtpState::FreeRun);
        assert_eq!(snap.decisions, 1);
        // An event still goes out on this tick
        assert_eq!(f.events.try_recv().unwrap().state, PtpState::FreeRun);
    }

    #[test]
    fn test_netlink_replies_filtered() {
        let f = fixture();
        let foreign = reply(0x9999, 2, 2);
        let invalid = reply(0x1122, 1, 0);
        assert!(!f.monitor.ingest_replies(&[foreign, invalid]));
        assert_eq!(f.monitor.snapshot().decisions, 0);
        assert_eq!(f.monitor.snapshot().phase_status, DpllStatus::Unknown);

        let eec = reply(0x1122, 2, 2);
        let pps = reply(0x1122, 1, 3);
        assert!(f.monitor.ingest_replies(&[eec, pps]));
        let snap = f.monitor.snapshot();
        assert_eq!(snap.decisions, 1);
        assert_eq!(snap.frequency_status, DpllStatus::Locked);
        assert_eq!(snap.phase_status, DpllStatus::LockedHoldoverAcquired);
        assert_eq!(snap.state, PtpState::Locked);
    }

    #[test]
    fn test_stop_emits_reset_and_unregisters() {
        let f = fixture();
        assert_eq!(f.registry.len(), 2);
        f.monitor.ingest_sysfs(sample(3, 3, 0));
        f.monitor.notify(EventSource::Gnss, PtpState::FreeRun);
        assert!(f.monitor.snapshot().on_holdover);

        f.monitor.stop();
        f.monitor.stop();

        let events: Vec<Event> = f.events.try_iter().collect();
        let resets: Vec<&Event> = events.iter().filter(|e| e.reset).collect();
        assert_eq!(resets.len(), 1);
        assert!(events.last().unwrap().reset);
        assert!(f.registry.is_empty());

        let snap = f.monitor.snapshot();
        assert!(!snap.on_holdover);
        assert!(!snap.monitoring);
        assert!(!f.monitor.monitor_dpll());
    }

    #[test]
    fn test_no_backend_does_not_start() {
        let _ = env_logger::builder().is_test(true).try_init();
        let root = tempfile::tempdir().unwrap();
        let mut transport = MockDpllTransport::new();
        transport.expect_probe().return_const(false);
        let ctx = MonitorContext {
            registry: Arc::new(StateRegistry::new()),
            dependents: Arc::new(DependentStates::new()),
            transport: Arc::new(transport),
            timing: TimingConfig {
                sysfs_root: root.path().to_path_buf(),
                ..TimingConfig::default()
            },
        };
        let monitor = DpllMonitor::new(DpllConfig::new(1, "ens1f0", vec![]), ctx).unwrap();
        assert_eq!(monitor.init(), Backend::None);
        assert!(!monitor.monitor_dpll());
        assert!(!monitor.snapshot().monitoring);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = DpllConfig::new(1, "ens1f0", vec![]);
        config.local_holdover_timeout_secs = 0;
        let ctx = MonitorContext {
            registry: Arc::new(StateRegistry::new()),
            dependents: Arc::new(DependentStates::new()),
            transport: Arc::new(MockDpllTransport::new()),
            timing: TimingConfig::default(),
        };
        assert!(DpllMonitor::new(config, ctx).is_err());
    }
}
