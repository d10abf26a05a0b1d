use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::event::{ClockType, EventSource};

pub const DEFAULT_LOCAL_MAX_HOLDOVER_OFFSET_NS: u64 = 1500;
pub const DEFAULT_LOCAL_HOLDOVER_TIMEOUT_SECS: u64 = 14400;
pub const DEFAULT_MAX_IN_SPEC_OFFSET_NS: u64 = 100;

// PtpSettings keys, as written by the NIC plugins into the node profile
pub const LOCAL_MAX_HOLDOVER_OFFSET_KEY: &str = "LocalMaxHoldoverOffSet";
pub const LOCAL_HOLDOVER_TIMEOUT_KEY: &str = "LocalHoldoverTimeout";
pub const MAX_IN_SPEC_OFFSET_KEY: &str = "MaxInSpecOffset";
pub const CLOCK_ID_KEY: &str = "clockId";

/// Per-interface DPLL settings. Immutable once a monitor is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpllConfig {
    pub clock_id: u64,
    pub interface: String,
    pub local_max_holdover_offset_ns: u64,
    pub local_holdover_timeout_secs: u64,
    pub max_in_spec_offset_ns: u64,
    pub depends_on: Vec<EventSource>,
}

impl DpllConfig {
    pub fn new(clock_id: u64, interface: &str, depends_on: Vec<EventSource>) -> Self {
        DpllConfig {
            clock_id,
            interface: interface.to_string(),
            local_max_holdover_offset_ns: DEFAULT_LOCAL_MAX_HOLDOVER_OFFSET_NS,
            local_holdover_timeout_secs: DEFAULT_LOCAL_HOLDOVER_TIMEOUT_SECS,
            max_in_spec_offset_ns: DEFAULT_MAX_IN_SPEC_OFFSET_NS,
            depends_on,
        }
    }

    /// Builds the config from a profile's PtpSettings map.
    ///
    /// `clockId[IFACE]` is required; the holdover keys fall back to defaults.
    pub fn from_ptp_settings(
        interface: &str,
        settings: &HashMap<String, String>,
        depends_on: Vec<EventSource>,
    ) -> Result<Self> {
        let clock_key = clock_id_key(interface);
        let clock_id = match settings.get(&clock_key) {
            Some(raw) => parse_u64(&clock_key, raw)?,
            None => return Err(anyhow!("missing {} in ptp settings", clock_key)),
        };

        let mut cfg = DpllConfig::new(clock_id, interface, depends_on);
        if let Some(raw) = settings.get(LOCAL_MAX_HOLDOVER_OFFSET_KEY) {
            cfg.local_max_holdover_offset_ns = parse_u64(LOCAL_MAX_HOLDOVER_OFFSET_KEY, raw)?;
        }
        if let Some(raw) = settings.get(LOCAL_HOLDOVER_TIMEOUT_KEY) {
            cfg.local_holdover_timeout_secs = parse_u64(LOCAL_HOLDOVER_TIMEOUT_KEY, raw)?;
        }
        if let Some(raw) = settings.get(MAX_IN_SPEC_OFFSET_KEY) {
            cfg.max_in_spec_offset_ns = parse_u64(MAX_IN_SPEC_OFFSET_KEY, raw)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(anyhow!("dpll interface name is empty"));
        }
        if self.local_holdover_timeout_secs == 0 {
            return Err(anyhow!("{} must be positive", LOCAL_HOLDOVER_TIMEOUT_KEY));
        }
        if self.local_max_holdover_offset_ns == 0 {
            return Err(anyhow!("{} must be positive", LOCAL_MAX_HOLDOVER_OFFSET_KEY));
        }
        Ok(())
    }

    /// Window used when no process config has been bound yet.
    pub fn default_threshold(&self) -> OffsetThreshold {
        let max = self.max_in_spec_offset_ns as i64;
        OffsetThreshold { min: -max, max }
    }
}

pub fn clock_id_key(interface: &str) -> String {
    format!("{}[{}]", CLOCK_ID_KEY, interface)
}

fn parse_u64(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("invalid value {:?} for {}", raw, key))
}

/// Accepted offset window, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetThreshold {
    pub min: i64,
    pub max: i64,
}

impl OffsetThreshold {
    pub fn contains(&self, offset_ns: i64) -> bool {
        offset_ns >= self.min && offset_ns <= self.max
    }
}

impl Default for OffsetThreshold {
    fn default() -> Self {
        let max = DEFAULT_MAX_IN_SPEC_OFFSET_NS as i64;
        OffsetThreshold { min: -max, max }
    }
}

/// Settings of the PTP process a DPLL is attached to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub config_name: String,
    pub clock_type: ClockType,
    pub threshold: OffsetThreshold,
}

/// Loop periods and queue sizes. Tests shrink these to milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    /// Length of one holdover "second"
    pub holdover_tick_ms: u64,
    pub redial_delay_ms: u64,
    pub redial_max_delay_ms: u64,
    pub netlink_recv_timeout_ms: u64,
    pub event_queue_depth: usize,
    pub sysfs_root: PathBuf,
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn holdover_tick(&self) -> Duration {
        Duration::from_millis(self.holdover_tick_ms.max(1))
    }

    pub fn redial_delay(&self) -> Duration {
        Duration::from_millis(self.redial_delay_ms)
    }

    pub fn redial_max_delay(&self) -> Duration {
        Duration::from_millis(self.redial_max_delay_ms.max(self.redial_delay_ms))
    }

    pub fn netlink_recv_timeout(&self) -> Duration {
        Duration::from_millis(self.netlink_recv_timeout_ms.max(1))
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            poll_interval_ms: 1000,
            holdover_tick_ms: 1000,
            redial_delay_ms: 250,
            redial_max_delay_ms: 250,
            netlink_recv_timeout_ms: 500,
            event_queue_depth: 100,
            sysfs_root: PathBuf::from(crate::sysfs::DEFAULT_SYSFS_ROOT),
        }
    }
}

/// Daemon configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub interfaces: Vec<String>,
    pub depends_on: Vec<EventSource>,
    pub ptp_settings: HashMap<String, String>,
    pub process: ProcessConfig,
    pub timing: TimingConfig,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg: DaemonConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(cfg)
    }

    /// Builds one DPLL config per interface. A missing `clockId[IFACE]` is
    /// filled from `lookup_clock_id` (the PCI serial number on real hosts).
    pub fn dpll_configs<F>(&self, mut lookup_clock_id: F) -> Result<Vec<DpllConfig>>
    where
        F: FnMut(&str) -> Result<u64>,
    {
        let mut settings = self.ptp_settings.clone();
        let mut out = Vec::with_capacity(self.interfaces.len());
        for iface in &self.interfaces {
            let key = clock_id_key(iface);
            if !settings.contains_key(&key) {
                let id = lookup_clock_id(iface).with_context(|| {
                    format!("no clock id configured or discoverable for {}", iface)
                })?;
                settings.insert(key, id.to_string());
            }
            out.push(DpllConfig::from_ptp_settings(iface, &settings, self.depends_on.clone())?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_from_ptp_settings_defaults() {
        let s = settings(&[("clockId[ens1f0]", "5799633565432596414")]);
        let cfg = DpllConfig::from_ptp_settings("ens1f0", &s, vec![EventSource::Gnss]).unwrap();
        assert_eq!(cfg.clock_id, 5799633565432596414);
        assert_eq!(cfg.local_max_holdover_offset_ns, 1500);
        assert_eq!(cfg.local_holdover_timeout_secs, 14400);
        assert_eq!(cfg.max_in_spec_offset_ns, 100);
        assert_eq!(cfg.depends_on, vec![EventSource::Gnss]);
    }

    #[test]
    fn test_from_ptp_settings_overrides() {
        let s = settings(&[
            ("clockId[ens2f0]", "17"),
            ("LocalMaxHoldoverOffSet", "6000"),
            ("LocalHoldoverTimeout", " 3600 "),
            ("MaxInSpecOffset", "250"),
        ]);
        let cfg = DpllConfig::from_ptp_settings("ens2f0", &s, vec![]).unwrap();
        assert_eq!(cfg.local_max_holdover_offset_ns, 6000);
        assert_eq!(cfg.local_holdover_timeout_secs, 3600);
        assert_eq!(cfg.max_in_spec_offset_ns, 250);
        assert_eq!(cfg.default_threshold(), OffsetThreshold { min: -250, max: 250 });
    }

    #[test]
    fn test_from_ptp_settings_errors() {
        assert!(DpllConfig::from_ptp_settings("ens1f0", &settings(&[]), vec![]).is_err());

        let bad = settings(&[("clockId[ens1f0]", "0x12")]);
        assert!(DpllConfig::from_ptp_settings("ens1f0", &bad, vec![]).is_err());

        let zero = settings(&[("clockId[ens1f0]", "1"), ("LocalHoldoverTimeout", "0")]);
        assert!(DpllConfig::from_ptp_settings("ens1f0", &zero, vec![]).is_err());
    }

    #[test]
    fn test_threshold_inclusive() {
        let t = OffsetThreshold { min: -100, max: 100 };
        assert!(t.contains(-100));
        assert!(t.contains(100));
        assert!(t.contains(0));
        assert!(!t.contains(101));
        assert!(!t.contains(-101));
    }

    #[test]
    fn test_daemon_config_load_and_lookup() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "interfaces": ["ens1f0", "ens2f0"],
                "depends_on": ["gnss"],
                "ptp_settings": {{ "clockId[ens1f0]": "11", "MaxInSpecOffset": "150" }},
                "process": {{ "config_name": "ts2phc.0.config", "clock_type": "GM",
                             "threshold": {{ "min": -150, "max": 150 }} }},
                "timing": {{ "poll_interval_ms": 500 }}
            }}"#
        )
        .unwrap();

        let cfg = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(cfg.timing.poll_interval(), Duration::from_millis(500));
        assert_eq!(cfg.timing.holdover_tick(), Duration::from_secs(1));
        assert_eq!(cfg.process.threshold.max, 150);

        let dplls = cfg
            .dpll_configs(|iface| {
                assert_eq!(iface, "ens2f0");
                Ok(22)
            })
            .unwrap();
        assert_eq!(dplls.len(), 2);
        assert_eq!(dplls[0].clock_id, 11);
        assert_eq!(dplls[1].clock_id, 22);
        assert_eq!(dplls[1].max_in_spec_offset_ns, 150);
        assert_eq!(dplls[1].depends_on, vec![EventSource::Gnss]);
    }

    #[test]
    fn test_daemon_config_lookup_failure() {
        let cfg = DaemonConfig {
            interfaces: vec!["ens9f0".to_string()],
            ..Default::default()
        };
        assert!(cfg.dpll_configs(|_| Err(anyhow!("no dsn"))).is_err());
    }
}
