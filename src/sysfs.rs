//! Polled DPLL status from the per-interface sysfs files.
//!
//! Index of the DPLL being read: 0 is the EEC (frequency) DPLL, 1 the PPS
//! (phase) DPLL. The raw `dpll_1_offset` value is divided by 100 to give
//! nanoseconds.

use anyhow::{Context, Result};
use log::{error, warn};
use std::path::{Path, PathBuf};

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/net";

const FREQUENCY_STATE_FILE: &str = "dpll_0_state";
const PHASE_STATE_FILE: &str = "dpll_1_state";
const PHASE_OFFSET_FILE: &str = "dpll_1_offset";

/// One polling cycle. `None` means the field could not be read and the
/// previous value should be kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SysfsSample {
    pub frequency_status: Option<i64>,
    pub phase_status: Option<i64>,
    pub phase_offset_ns: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SysfsReader {
    root: PathBuf,
}

impl SysfsReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SysfsReader { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn device_file(&self, iface: &str, file: &str) -> PathBuf {
        self.root.join(iface).join("device").join(file)
    }

    pub fn frequency_state_path(&self, iface: &str) -> PathBuf {
        self.device_file(iface, FREQUENCY_STATE_FILE)
    }

    pub fn phase_state_path(&self, iface: &str) -> PathBuf {
        self.device_file(iface, PHASE_STATE_FILE)
    }

    pub fn phase_offset_path(&self, iface: &str) -> PathBuf {
        self.device_file(iface, PHASE_OFFSET_FILE)
    }

    /// True if the DPLL status files exist for `iface`.
    pub fn is_present(&self, iface: &str) -> bool {
        !iface.is_empty() && self.frequency_state_path(iface).exists()
    }

    /// Reads all three files. A failing file is logged and left as `None`;
    /// the other fields are still returned.
    pub fn read(&self, iface: &str) -> SysfsSample {
        if iface.is_empty() {
            warn!("sysfs read requested without an interface name");
            return SysfsSample::default();
        }

        let read_field = |path: PathBuf, what: &str| match read_i64(&path) {
            Ok(v) => Some(v),
            Err(e) => {
                error!("Error reading {} from {}: {:#}", what, path.display(), e);
                None
            }
        };

        SysfsSample {
            frequency_status: read_field(self.frequency_state_path(iface), "frequency state"),
            phase_status: read_field(self.phase_state_path(iface), "phase state"),
            phase_offset_ns: read_field(self.phase_offset_path(iface), "phase offset")
                .map(|raw| raw / 100),
        }
    }
}

fn read_i64(path: &Path) -> Result<i64> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("open {}", path.display()))?;
    content
        .trim()
        .parse::<i64>()
        .with_context(|| format!("parse {:?}", content.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn device_dir(root: &Path, iface: &str) -> PathBuf {
        let dir = root.join(iface).join("device");
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_paths() {
        let reader = SysfsReader::new(DEFAULT_SYSFS_ROOT);
        assert_eq!(
            reader.frequency_state_path("ens7f0"),
            PathBuf::from("/sys/class/net/ens7f0/device/dpll_0_state")
        );
        assert_eq!(
            reader.phase_state_path("ens7f0"),
            PathBuf::from("/sys/class/net/ens7f0/device/dpll_1_state")
        );
        assert_eq!(
            reader.phase_offset_path("ens7f0"),
            PathBuf::from("/sys/class/net/ens7f0/device/dpll_1_offset")
        );
    }

    #[test]
    fn test_read_full_sample() {
        let _ = env_logger::builder().is_test(true).try_init();
        let root = tempfile::tempdir().unwrap();
        let dir = device_dir(root.path(), "ens1f0");
        fs::write(dir.join("dpll_0_state"), "2\n").unwrap();
        fs::write(dir.join("dpll_1_state"), "3\n").unwrap();
        fs::write(dir.join("dpll_1_offset"), "-12345\n").unwrap();

        let reader = SysfsReader::new(root.path());
        assert!(reader.is_present("ens1f0"));
        let sample = reader.read("ens1f0");
        assert_eq!(sample.frequency_status, Some(2));
        assert_eq!(sample.phase_status, Some(3));
        // Truncates toward zero
        assert_eq!(sample.phase_offset_ns, Some(-123));
    }

    #[test]
    fn test_read_partial_sample() {
        let _ = env_logger::builder().is_test(true).try_init();
        let root = tempfile::tempdir().unwrap();
        let dir = device_dir(root.path(), "ens1f0");
        fs::write(dir.join("dpll_0_state"), "2").unwrap();
        fs::write(dir.join("dpll_1_state"), "garbage").unwrap();

        let sample = SysfsReader::new(root.path()).read("ens1f0");
        assert_eq!(sample.frequency_status, Some(2));
        assert_eq!(sample.phase_status, None);
        assert_eq!(sample.phase_offset_ns, None);
    }

    #[test]
    fn test_missing_interface() {
        let root = tempfile::tempdir().unwrap();
        let reader = SysfsReader::new(root.path());
        assert!(!reader.is_present("ens9f9"));
        assert!(!reader.is_present(""));
        assert_eq!(reader.read(""), SysfsSample::default());
    }
}
