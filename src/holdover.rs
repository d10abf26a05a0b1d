//! Holdover countdown.
//!
//! While the upstream reference is lost the clock error is modelled as a
//! straight line: `offset = slope * elapsed`, with the slope derived from the
//! configured worst-case drift. The countdown runs until the in-spec timer
//! fires unless the extrapolated offset leaves the accuracy window first or
//! the owner cancels it.

use anyhow::{bail, Context, Result};
use log::{debug, info};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HoldoverParams {
    slope_ps_per_s: f64,
    timer_secs: u64,
}

impl HoldoverParams {
    pub fn new(
        max_holdover_offset_ns: u64,
        holdover_timeout_secs: u64,
        max_in_spec_offset_ns: u64,
    ) -> Result<Self> {
        if holdover_timeout_secs == 0 {
            bail!("holdover timeout must be greater than zero");
        }
        if max_holdover_offset_ns == 0 {
            bail!("max holdover offset must be greater than zero");
        }
        let slope_ps_per_s = max_holdover_offset_ns as f64 / holdover_timeout_secs as f64 * 1000.0;
        let timer_secs = (max_in_spec_offset_ns as f64 * 1000.0 / slope_ps_per_s).round() as u64;
        Ok(HoldoverParams { slope_ps_per_s, timer_secs })
    }

    /// Worst-case drift in picoseconds per second.
    pub fn slope_ps_per_s(&self) -> f64 {
        self.slope_ps_per_s
    }

    /// Seconds the clock stays in spec once holdover starts.
    pub fn timer_secs(&self) -> u64 {
        self.timer_secs
    }

    /// Extrapolated offset in nanoseconds after `elapsed_secs` of holdover.
    pub fn offset_after(&self, elapsed_secs: u64) -> i64 {
        (self.slope_ps_per_s / 1000.0 * elapsed_secs as f64).round() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldoverOutcome {
    /// The extrapolated offset left the accuracy window before the timer ran out
    RangeExceeded,
    /// The in-spec timer ran out
    Expired,
    Cancelled,
}

/// Receiver of countdown progress. `episode` identifies the countdown so
/// late calls from an already replaced episode can be ignored.
pub(crate) trait HoldoverTarget: Send + Sync {
    /// Stores the extrapolated offset. Returns false if it is out of range.
    fn extrapolated(&self, episode: u64, offset_ns: i64) -> bool;

    fn finish(&self, episode: u64, outcome: HoldoverOutcome);
}

/// Owner side of a running countdown. Dropping it without calling
/// [`HoldoverHandle::cancel`] also cancels the countdown.
pub struct HoldoverHandle {
    cancel: Sender<()>,
    episode: u64,
    thread: Option<JoinHandle<HoldoverOutcome>>,
}

impl HoldoverHandle {
    pub fn episode(&self) -> u64 {
        self.episode
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(());
    }

    /// Cancels and waits for the countdown thread. Must not be called from
    /// the countdown thread itself.
    pub fn join(mut self) -> Option<HoldoverOutcome> {
        self.cancel();
        self.thread.take().and_then(|t| t.join().ok())
    }
}

/// Spawns the countdown for one holdover episode. `tick` is the length of
/// one holdover second.
pub(crate) fn start(
    params: HoldoverParams,
    tick: Duration,
    episode: u64,
    target: Arc<dyn HoldoverTarget>,
) -> Result<HoldoverHandle> {
    let (cancel, cancel_rx) = mpsc::channel();
    info!(
        "holdover episode {} started: slope {:.4} ps/s, in-spec timer {} s",
        episode,
        params.slope_ps_per_s(),
        params.timer_secs()
    );

    let thread = thread::Builder::new()
        .name(format!("holdover-{}", episode))
        .spawn(move || {
            let outcome = countdown(&params, tick, episode, target.as_ref(), &cancel_rx);
            info!("holdover episode {} ended: {:?}", episode, outcome);
            target.finish(episode, outcome);
            outcome
        })
        .context("failed to spawn holdover thread")?;

    Ok(HoldoverHandle { cancel, episode, thread: Some(thread) })
}

fn countdown(
    params: &HoldoverParams,
    tick: Duration,
    episode: u64,
    target: &dyn HoldoverTarget,
    cancel: &Receiver<()>,
) -> HoldoverOutcome {
    let start = Instant::now();
    let timer = u32::try_from(params.timer_secs()).unwrap_or(u32::MAX);
    // An unrepresentable deadline never fires
    let deadline = start.checked_add(tick.saturating_mul(timer));
    let mut next_tick = start;
    let mut elapsed: u64 = 0;

    loop {
        next_tick += tick;
        let wake = match deadline {
            Some(d) => next_tick.min(d),
            None => next_tick,
        };

        match cancel.recv_timeout(wake.saturating_duration_since(Instant::now())) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return HoldoverOutcome::Cancelled,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if deadline.map_or(false, |d| Instant::now() >= d) {
            return HoldoverOutcome::Expired;
        }

        elapsed += 1;
        let offset = params.offset_after(elapsed);
        debug!("holdover episode {} tick {}: extrapolated offset {} ns", episode, elapsed, offset);
        if !target.extrapolated(episode, offset) {
            return HoldoverOutcome::RangeExceeded;
        }
    }
}
