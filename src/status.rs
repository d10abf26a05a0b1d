use serde::{Deserialize, Serialize};
use std::fmt;

use crate::backend::Backend;

/// Raw lock status reported by a DPLL sub-signal (EEC frequency or PPS phase).
///
/// The numeric codes match the sysfs files and the kernel DPLL netlink
/// `lock-status` attribute (1..=4); `Unknown` means no sample has been seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DpllStatus {
    #[default]
    Unknown,
    Invalid,
    FreeRun,
    Locked,
    LockedHoldoverAcquired,
    Holdover,
}

impl DpllStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => DpllStatus::Invalid,
            1 => DpllStatus::FreeRun,
            2 => DpllStatus::Locked,
            3 => DpllStatus::LockedHoldoverAcquired,
            4 => DpllStatus::Holdover,
            _ => DpllStatus::Unknown,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            DpllStatus::Unknown => -1,
            DpllStatus::Invalid => 0,
            DpllStatus::FreeRun => 1,
            DpllStatus::Locked => 2,
            DpllStatus::LockedHoldoverAcquired => 3,
            DpllStatus::Holdover => 4,
        }
    }

    /// Signal quality rank, lower is worse (ITU-T G.781 6.3.1 auto selection).
    pub fn quality(self) -> i8 {
        match self {
            DpllStatus::Unknown => -1,
            DpllStatus::Invalid => 0,
            DpllStatus::FreeRun => 1,
            DpllStatus::Holdover => 2,
            DpllStatus::Locked => 3,
            DpllStatus::LockedHoldoverAcquired => 4,
        }
    }

    /// Returns the status with the worse signal quality. On equal quality the
    /// first argument is kept, so callers pass the phase status first.
    pub fn worse(phase: DpllStatus, frequency: DpllStatus) -> DpllStatus {
        if frequency.quality() < phase.quality() {
            frequency
        } else {
            phase
        }
    }
}

impl fmt::Display for DpllStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DpllStatus::Unknown => "unknown",
            DpllStatus::Invalid => "invalid",
            DpllStatus::FreeRun => "unlocked",
            DpllStatus::Locked => "locked",
            DpllStatus::LockedHoldoverAcquired => "locked-ho-acquired",
            DpllStatus::Holdover => "holdover",
        };
        write!(f, "{}({})", name, self.code())
    }
}

/// Synchronization state published for a clock or an external signal source.
///
/// Variant order is the quality order: `Unknown < FreeRun < Holdover < Locked`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PtpState {
    #[serde(rename = "-1")]
    Unknown,
    #[default]
    #[serde(rename = "s0")]
    FreeRun,
    #[serde(rename = "s1")]
    Holdover,
    #[serde(rename = "s2")]
    Locked,
}

impl fmt::Display for PtpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            PtpState::Unknown => "-1",
            PtpState::FreeRun => "s0",
            PtpState::Holdover => "s1",
            PtpState::Locked => "s2",
        };
        f.write_str(code)
    }
}

/// Point-in-time view of one DPLL monitor, used for status logging.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MonitorSnapshot {
    pub interface: String,
    pub clock_id: u64,
    pub backend: Backend,

    /// Last raw samples per sub-signal
    pub phase_status: DpllStatus,
    pub frequency_status: DpllStatus,

    /// Last sampled phase offset (nanoseconds)
    pub phase_offset_ns: i64,

    /// Offset evaluated against the threshold window. Extrapolated while in holdover.
    pub offset_ns: i64,

    pub state: PtpState,
    pub in_spec: bool,
    pub source_lost: bool,
    pub on_holdover: bool,
    pub monitoring: bool,

    /// Number of decision passes run so far
    pub decisions: u64,
}
