use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::event::EventSource;
use crate::status::PtpState;

/// Latest reported state of every external source a DPLL decision depends on,
/// plus the cached worst state across all of them.
///
/// One instance is shared by every monitor in the process.
#[derive(Debug, Default)]
pub struct DependentStates {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<EventSource, PtpState>,
    current: PtpState,
}

impl Inner {
    fn recompute(&mut self) {
        self.current = self.states.values().copied().min().unwrap_or(PtpState::FreeRun);
    }
}

impl DependentStates {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds `source` as `Unknown` until its first report arrives. A source
    /// that already reported keeps its state.
    pub fn register(&self, source: EventSource) {
        let mut inner = self.lock();
        inner.states.entry(source).or_insert(PtpState::Unknown);
        inner.recompute();
    }

    /// Records the latest state of `source`. Returns false if it is unchanged.
    pub fn update(&self, source: EventSource, state: PtpState) -> bool {
        self.record(source, state, || {})
    }

    /// Records the latest state of `source` and runs `then` while the table is
    /// still locked. `then` runs on every report, repeated or not: each
    /// monitor filters repeats against what it has seen itself.
    pub(crate) fn record<F: FnOnce()>(
        &self,
        source: EventSource,
        state: PtpState,
        then: F,
    ) -> bool {
        let mut inner = self.lock();
        let previous = inner.states.insert(source, state).unwrap_or(PtpState::Unknown);
        let changed = previous != state;
        if changed {
            info!("{} state change: {} -> {}", source, previous, state);
        } else {
            debug!("{} reported {} again", source, state);
        }
        then();
        inner.recompute();
        changed
    }

    /// Worst (lowest quality) state across all sources.
    pub fn current(&self) -> PtpState {
        self.lock().current
    }

    pub fn state_of(&self, source: EventSource) -> Option<PtpState> {
        self.lock().states.get(&source).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_table_is_freerun() {
        let deps = DependentStates::new();
        assert_eq!(deps.current(), PtpState::FreeRun);
        assert_eq!(deps.state_of(EventSource::Gnss), None);
    }

    #[test]
    fn test_worst_of_dependents() {
        let deps = DependentStates::new();
        assert!(deps.update(EventSource::Gnss, PtpState::Locked));
        assert!(deps.update(EventSource::Ts2phc, PtpState::FreeRun));
        assert!(deps.update(EventSource::Ptp4l, PtpState::Holdover));
        assert_eq!(deps.current(), PtpState::FreeRun);

        assert!(deps.update(EventSource::Ts2phc, PtpState::Locked));
        assert_eq!(deps.current(), PtpState::Holdover);

        assert!(deps.update(EventSource::Ptp4l, PtpState::Locked));
        assert_eq!(deps.current(), PtpState::Locked);
    }

    #[test]
    fn test_registered_source_counts_as_unknown() {
        let deps = DependentStates::new();
        deps.update(EventSource::Ts2phc, PtpState::Locked);
        deps.register(EventSource::Gnss);
        assert_eq!(deps.state_of(EventSource::Gnss), Some(PtpState::Unknown));
        assert_eq!(deps.current(), PtpState::Unknown);
    }

    #[test]
    fn test_repeated_state_reports_unchanged() {
        let deps = DependentStates::new();
        let mut calls = 0;
        assert!(deps.record(EventSource::Gnss, PtpState::Locked, || calls += 1));
        assert!(!deps.record(EventSource::Gnss, PtpState::Locked, || calls += 1));
        assert_eq!(calls, 2);
        assert_eq!(deps.state_of(EventSource::Gnss), Some(PtpState::Locked));
    }

    #[test]
    fn test_register_keeps_reported_state() {
        let deps = DependentStates::new();
        deps.register(EventSource::Gnss);
        deps.update(EventSource::Gnss, PtpState::Locked);

        // A second monitor depending on the same source
        deps.register(EventSource::Gnss);
        assert_eq!(deps.state_of(EventSource::Gnss), Some(PtpState::Locked));
        assert_eq!(deps.current(), PtpState::Locked);
    }
}
