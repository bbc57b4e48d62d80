//! Device descriptions borrowed from the external device cache.
//!
//! The cache core never opens or frees a device; it holds shared handles and
//! compares them by device number. Everything the duplicate resolver needs
//! to know about a device (size, use by an LV, mounted filesystem, major
//! classification) is supplied here by the device cache.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::flags::DevFlags;

// ---------------------------------------------------------------------------
// DevNum
// ---------------------------------------------------------------------------

/// Kernel device number, the identity of a device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct DevNum {
    pub major: u32,
    pub minor: u32,
}

impl DevNum {
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for DevNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// One block device known to the external device cache.
///
/// The mounted-filesystem bit and the size are snapshots taken by the device
/// cache; the core treats them as authoritative for the duration of a
/// command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    name: String,
    devno: DevNum,
    size_sectors: u64,
    flags: DevFlags,
    has_mounted_fs: bool,
}

impl Device {
    #[must_use]
    pub fn new(name: impl Into<String>, devno: DevNum, size_sectors: u64) -> Self {
        Self {
            name: name.into(),
            devno,
            size_sectors,
            flags: DevFlags::empty(),
            has_mounted_fs: false,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: DevFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_mounted_fs(mut self, mounted: bool) -> Self {
        self.has_mounted_fs = mounted;
        self
    }

    /// Path-style name, e.g. `/dev/sda1`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn devno(&self) -> DevNum {
        self.devno
    }

    /// Current device size in sectors.
    #[must_use]
    pub fn size_sectors(&self) -> u64 {
        self.size_sectors
    }

    #[must_use]
    pub fn flags(&self) -> DevFlags {
        self.flags
    }

    /// True when a filesystem on this device is currently mounted.
    #[must_use]
    pub fn has_mounted_fs(&self) -> bool {
        self.has_mounted_fs
    }

    /// Devices are the same iff their device numbers match.
    #[must_use]
    pub fn same_device(&self, other: &Device) -> bool {
        self.devno == other.devno
    }
}

/// Shared device handle as handed out by the device cache.
pub type DeviceHandle = Arc<Device>;

// ---------------------------------------------------------------------------
// DevTypes
// ---------------------------------------------------------------------------

/// Major-number classification supplied by the command layer.
///
/// Used by the duplicate resolver: the device-mapper major and membership in
/// a recognized subsystem (MD, DRBD and friends) are preference signals, and
/// MD components are filtered out of the unused-duplicates list entirely.
#[derive(Debug, Clone, Default)]
pub struct DevTypes {
    dm_major: u32,
    md_major: u32,
    subsystem_majors: BTreeSet<u32>,
}

impl DevTypes {
    #[must_use]
    pub fn new(dm_major: u32, md_major: u32) -> Self {
        Self {
            dm_major,
            md_major,
            subsystem_majors: BTreeSet::new(),
        }
    }

    /// Register an additional subsystem major (DRBD, EMC power paths, ...).
    #[must_use]
    pub fn with_subsystem_major(mut self, major: u32) -> Self {
        self.subsystem_majors.insert(major);
        self
    }

    #[must_use]
    pub fn is_dm_major(&self, major: u32) -> bool {
        major == self.dm_major
    }

    #[must_use]
    pub fn is_md_major(&self, major: u32) -> bool {
        major == self.md_major
    }

    /// True when the major belongs to a recognized layered subsystem. The MD
    /// major counts; the device-mapper major is classified separately.
    #[must_use]
    pub fn is_subsystem_major(&self, major: u32) -> bool {
        major == self.md_major || self.subsystem_majors.contains(&major)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devno_display() {
        assert_eq!(DevNum::new(253, 7).to_string(), "253:7");
    }

    #[test]
    fn same_device_ignores_name() {
        let a = Device::new("/dev/sda", DevNum::new(8, 0), 1000);
        let b = Device::new("/dev/disk/by-id/wwn-x", DevNum::new(8, 0), 1000);
        let c = Device::new("/dev/sdb", DevNum::new(8, 16), 1000);
        assert!(a.same_device(&b));
        assert!(!a.same_device(&c));
    }

    #[test]
    fn subsystem_classification() {
        let dt = DevTypes::new(253, 9).with_subsystem_major(147);
        assert!(dt.is_dm_major(253));
        assert!(!dt.is_subsystem_major(253));
        assert!(dt.is_subsystem_major(9));
        assert!(dt.is_subsystem_major(147));
        assert!(!dt.is_subsystem_major(8));
    }
}
