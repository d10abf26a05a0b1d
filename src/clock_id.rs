//! DPLL clock id discovery from the PCI Express Device Serial Number.
//!
//! The DSN extended capability (id 3) carries the 64-bit serial the ice
//! driver also reports as the DPLL clock id.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;

const PCI_CONFIG_SPACE_SIZE: usize = 256;
const PCI_EXT_CAP_ID_DSN: u16 = 3;
const PCI_EXT_CAP_NEXT_OFFSET: usize = 2;
const PCI_EXT_CAP_OFFSET_SHIFT: u16 = 4;
const PCI_EXT_CAP_DATA_OFFSET: usize = 4;

/// Reads `<root>/<iface>/device/config` and extracts the DSN.
pub fn pci_clock_id(sysfs_root: &Path, iface: &str) -> Result<u64> {
    let path = sysfs_root.join(iface).join("device").join("config");
    let config = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    parse_dsn(&config).with_context(|| format!("no device serial number for {}", iface))
}

/// Walks the extended capability list, which starts right after the
/// standard 256-byte configuration space.
pub fn parse_dsn(config: &[u8]) -> Result<u64> {
    let mut offset = PCI_CONFIG_SPACE_SIZE;
    // Each hop must move forward, so the walk is bounded by the buffer size
    loop {
        if config.len() < offset + PCI_EXT_CAP_DATA_OFFSET {
            return Err(anyhow!(
                "config space out of bounds (offset {} of {})",
                offset,
                config.len()
            ));
        }
        let id = LittleEndian::read_u16(&config[offset..]);
        if id == PCI_EXT_CAP_ID_DSN {
            break;
        }
        if id == 0 {
            return Err(anyhow!("DSN capability not present"));
        }
        let next = LittleEndian::read_u16(&config[offset + PCI_EXT_CAP_NEXT_OFFSET..]);
        let next = (next >> PCI_EXT_CAP_OFFSET_SHIFT) as usize;
        if next <= offset {
            return Err(anyhow!("capability list loops at offset {}", offset));
        }
        offset = next;
    }

    let data = offset + PCI_EXT_CAP_DATA_OFFSET;
    if config.len() < data + 8 {
        return Err(anyhow!("DSN capability truncated"));
    }
    Ok(LittleEndian::read_u64(&config[data..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn config_with_dsn(id: u64, extra_sections: usize) -> Vec<u8> {
        let mut buf = vec![0u8; PCI_CONFIG_SPACE_SIZE];
        let mut next_section = PCI_CONFIG_SPACE_SIZE;
        for i in 0..extra_sections {
            let cap_id = PCI_EXT_CAP_ID_DSN + 1 + i as u16;
            let section_size = (1usize << PCI_EXT_CAP_OFFSET_SHIFT) * (i + 1);
            next_section += section_size;
            buf.write_u16::<LittleEndian>(cap_id).unwrap();
            let next = (next_section << PCI_EXT_CAP_OFFSET_SHIFT) as u16;
            buf.write_u16::<LittleEndian>(next).unwrap();
            buf.extend(std::iter::repeat(0u8).take(section_size - PCI_EXT_CAP_DATA_OFFSET));
        }
        buf.write_u16::<LittleEndian>(PCI_EXT_CAP_ID_DSN).unwrap();
        buf.write_u16::<LittleEndian>(1).unwrap();
        buf.write_u64::<LittleEndian>(id).unwrap();
        buf
    }

    #[test]
    fn test_dsn_at_start() {
        assert_eq!(parse_dsn(&config_with_dsn(1111222233334, 0)).unwrap(), 1111222233334);
    }

    #[test]
    fn test_dsn_after_other_capabilities() {
        let id = 0x5077_fc1f_ffaa_bb00;
        assert_eq!(parse_dsn(&config_with_dsn(id, 3)).unwrap(), id);
    }

    #[test]
    fn test_dsn_missing() {
        assert!(parse_dsn(&[]).is_err());
        assert!(parse_dsn(&vec![0u8; PCI_CONFIG_SPACE_SIZE + 64]).is_err());
    }

    #[test]
    fn test_pci_clock_id_from_file() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("ens1f0").join("device");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config"), config_with_dsn(42, 1)).unwrap();

        assert_eq!(pci_clock_id(root.path(), "ens1f0").unwrap(), 42);
        assert!(pci_clock_id(root.path(), "missing").is_err());
    }
}
