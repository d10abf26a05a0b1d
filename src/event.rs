//! Event records published by monitors and the bounded channel that carries them.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

use crate::status::PtpState;

/// Producers and topics in the state fabric.
///
/// `Monitoring` is not a signal source: subscribers on that topic are started
/// by [`crate::registry::StateRegistry::start_monitoring`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Dpll,
    Gnss,
    Ts2phc,
    Ptp4l,
    Phc2sys,
    Monitoring,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventSource::Dpll => "dpll",
            EventSource::Gnss => "gnss",
            EventSource::Ts2phc => "ts2phc",
            EventSource::Ptp4l => "ptp4l",
            EventSource::Phc2sys => "phc2sys",
            EventSource::Monitoring => "monitoring",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    FrequencyStatus,
    Offset,
    PhaseStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockType {
    #[default]
    #[serde(rename = "GM")]
    Gm,
    #[serde(rename = "BC")]
    Bc,
    #[serde(rename = "OC")]
    Oc,
}

/// Immutable state record. `reset` marks the final event of a stopped monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub process_name: EventSource,
    pub state: PtpState,
    pub interface: String,
    pub config_name: String,
    pub clock_type: ClockType,
    pub timestamp_ms: i64,
    pub values: BTreeMap<ValueType, i64>,
    pub write_to_log: bool,
    pub reset: bool,
}

impl Event {
    pub fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Sending half of the shared event channel.
///
/// Delivery is best effort: a full queue drops the event instead of blocking
/// the producer. The next tick or notification reasserts the state.
#[derive(Clone)]
pub struct EventSink {
    tx: SyncSender<Event>,
}

impl EventSink {
    pub fn bounded(depth: usize) -> (EventSink, Receiver<Event>) {
        let (tx, rx) = mpsc::sync_channel(depth);
        (EventSink { tx }, rx)
    }

    /// Returns true if the event was queued.
    pub fn publish(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(ev)) => {
                warn!(
                    "event queue full, dropping {} event for {} (state {}, reset {})",
                    ev.process_name, ev.interface, ev.state, ev.reset
                );
                false
            }
            Err(TrySendError::Disconnected(ev)) => {
                debug!(
                    "event consumer gone, dropping {} event for {}",
                    ev.process_name, ev.interface
                );
                false
            }
        }
    }
}
