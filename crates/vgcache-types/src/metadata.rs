//! Parsed VG metadata and on-PV area descriptions.
//!
//! [`VolumeGroup`] is the fully parsed metadata object the saved-VG buffer
//! snapshots and `update_vg` consumes. It is deliberately a plain value
//! with serde derives: the deep-copy contract is
//! `import_vg(export_vg(vg))`, so whatever text format the external layer
//! provides must round-trip it losslessly.

use crate::device::DevNum;
use crate::flags::VgStatus;
use crate::{PvId, VgId, SECTOR_SHIFT};

// ---------------------------------------------------------------------------
// Areas
// ---------------------------------------------------------------------------

/// One on-disk metadata area. The cache only looks at `size` and `ignored`;
/// offsets are opaque bookkeeping for the format layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mda {
    pub start: u64,
    pub size: u64,
    pub ignored: bool,
}

impl Mda {
    #[must_use]
    pub const fn new(start: u64, size: u64, ignored: bool) -> Self {
        Self {
            start,
            size,
            ignored,
        }
    }
}

/// A reserved extent on a PV: data area or bootloader area. Offsets and
/// sizes are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskArea {
    pub offset: u64,
    pub size: u64,
}

impl DiskArea {
    #[must_use]
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }
}

// ---------------------------------------------------------------------------
// VolumeGroup
// ---------------------------------------------------------------------------

/// PV membership record inside parsed VG metadata.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VgPv {
    pub id: PvId,
    /// Device backing this PV when the parser resolved one.
    pub devno: Option<DevNum>,
}

/// Fully parsed VG metadata.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VolumeGroup {
    pub id: VgId,
    pub name: String,
    pub seqno: u32,
    pub status: VgStatus,
    pub system_id: Option<String>,
    pub lock_type: Option<String>,
    pub pvs: Vec<VgPv>,
}

impl VolumeGroup {
    #[must_use]
    pub fn new(id: VgId, name: impl Into<String>, seqno: u32) -> Self {
        Self {
            id,
            name: name.into(),
            seqno,
            status: VgStatus::empty(),
            system_id: None,
            lock_type: None,
            pvs: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// PhysicalVolume
// ---------------------------------------------------------------------------

/// The slice of a physical-volume record the cache can project from its
/// label information (orphan PV bring-up).
#[derive(Debug, Clone, Default)]
pub struct PhysicalVolume {
    pub id: PvId,
    pub devno: Option<DevNum>,
    pub vg_name: String,
    pub label_sector: u64,
    /// Size in sectors.
    pub size: u64,
    /// First physical extent, in sectors.
    pub pe_start: u64,
    /// Bootloader area start and size, in sectors.
    pub ba_start: u64,
    pub ba_size: u64,
}

impl PhysicalVolume {
    /// Size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size << SECTOR_SHIFT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_group_serde_round_trip() {
        let mut vg = VolumeGroup::new(VgId::from_name("g1"), "vg0", 7);
        vg.status = VgStatus::EXPORTED;
        vg.system_id = Some("host-a".into());
        vg.pvs.push(VgPv {
            id: PvId::from_name("p1"),
            devno: Some(DevNum::new(8, 0)),
        });

        let text = serde_json::to_string(&vg).unwrap();
        let back: VolumeGroup = serde_json::from_str(&text).unwrap();
        assert_eq!(vg, back);
    }

    #[test]
    fn pv_size_conversion() {
        let pv = PhysicalVolume {
            size: 2048,
            ..PhysicalVolume::default()
        };
        assert_eq!(pv.size_bytes(), 2048 * 512);
    }
}
