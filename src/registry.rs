//! Typed publish/subscribe fabric between monitors.
//!
//! The registry is an explicitly owned object handed to every monitor at
//! construction. Callbacks are invoked after the subscriber list lock is
//! released, so a subscriber may register or unregister from inside `notify`.

use log::{debug, info};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::event::EventSource;
use crate::status::PtpState;

pub trait Subscriber: Send + Sync {
    /// Source whose state changes this subscriber wants.
    fn topic(&self) -> EventSource;

    fn id(&self) -> &str;

    fn notify(&self, source: EventSource, state: PtpState);

    /// Called once the daemon has finished wiring, for `Monitoring` subscribers.
    fn monitor(&self) {}
}

#[derive(Default)]
pub struct StateRegistry {
    subscribers: Mutex<Vec<Arc<dyn Subscriber>>>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn Subscriber>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, subscriber: Arc<dyn Subscriber>) {
        info!("registering subscriber {} for {}", subscriber.id(), subscriber.topic());
        self.lock().push(subscriber);
    }

    /// Removes every subscriber matching `topic` and `id`. Returns how many were removed.
    pub fn unregister(&self, topic: EventSource, id: &str) -> usize {
        let mut subs = self.lock();
        let before = subs.len();
        subs.retain(|s| !(s.topic() == topic && s.id() == id));
        let removed = before - subs.len();
        if removed > 0 {
            info!("unregistered subscriber {} from {}", id, topic);
        }
        removed
    }

    /// Delivers a state change to every subscriber of `source`.
    pub fn publish(&self, source: EventSource, state: PtpState) -> usize {
        let targets = self.matching(source);
        debug!("publishing {} state {} to {} subscriber(s)", source, state, targets.len());
        for sub in &targets {
            sub.notify(source, state);
        }
        targets.len()
    }

    /// Starts every subscriber registered on the `Monitoring` topic.
    pub fn start_monitoring(&self) -> usize {
        let targets = self.matching(EventSource::Monitoring);
        for sub in &targets {
            info!("starting monitoring for {}", sub.id());
            sub.monitor();
        }
        targets.len()
    }

    /// Drops all subscriptions, used on daemon shutdown.
    pub fn clear(&self) {
        let mut subs = self.lock();
        info!("clearing {} subscriber(s)", subs.len());
        subs.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn matching(&self, topic: EventSource) -> Vec<Arc<dyn Subscriber>> {
        self.lock().iter().filter(|s| s.topic() == topic).cloned().collect()
    }
}
