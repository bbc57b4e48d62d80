//! Collaborator seams: metadata format, labeller, label scanner, metadata
//! daemon.
//!
//! The cache performs no I/O and parses no on-disk format. Everything it
//! needs from the outside world arrives through the traits here: the format
//! layer exports/imports parsed VG metadata (the saved-VG deep-copy
//! contract), the labeller mints label objects, and the scanner supplies one
//! [`DeviceScan`] per device.

use std::fmt;
use std::sync::Arc;

use vgcache_error::Result;
use vgcache_types::{DeviceHandle, DiskArea, Mda, PvId, VgSummary, VolumeGroup};

// ---------------------------------------------------------------------------
// MetadataFormat
// ---------------------------------------------------------------------------

/// A metadata format as seen by the cache: a name, the format-specific
/// orphan VG name, and a lossless text round-trip for parsed VG metadata.
///
/// `import_vg(export_vg(vg))` must reproduce `vg` exactly; the saved-VG
/// buffer relies on this to take independent deep copies without a bespoke
/// cloner.
pub trait MetadataFormat: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Name of this format's orphan VG, e.g. `#orphans_text`.
    fn orphan_vg_name(&self) -> &str;

    fn export_vg(&self, vg: &VolumeGroup) -> Result<String>;

    fn import_vg(&self, text: &str) -> Result<VolumeGroup>;
}

/// Shared format descriptor handle.
pub type FormatHandle = Arc<dyn MetadataFormat>;

// ---------------------------------------------------------------------------
// Labeller / Label
// ---------------------------------------------------------------------------

/// The label-writing side of a format. The cache only uses it to mint
/// [`Label`] objects and to notice when a device changes format.
#[derive(Debug)]
pub struct Labeller {
    fmt: FormatHandle,
}

impl Labeller {
    #[must_use]
    pub fn new(fmt: FormatHandle) -> Self {
        Self { fmt }
    }

    #[must_use]
    pub fn fmt(&self) -> &FormatHandle {
        &self.fmt
    }
}

/// Shared labeller handle; identity comparisons are by pointer, the same
/// way the label reader hands the cache one labeller per format.
pub type LabellerHandle = Arc<Labeller>;

/// A parsed on-disk label. Owned by the info that carries it; the cache
/// records the sector and keeps the labeller for identity checks.
#[derive(Debug, Clone)]
pub struct Label {
    sector: u64,
    labeller: LabellerHandle,
}

impl Label {
    #[must_use]
    pub fn new(labeller: LabellerHandle, sector: u64) -> Self {
        Self { sector, labeller }
    }

    /// Sector the label was read from.
    #[must_use]
    pub fn sector(&self) -> u64 {
        self.sector
    }

    pub(crate) fn set_sector(&mut self, sector: u64) {
        self.sector = sector;
    }

    #[must_use]
    pub fn labeller(&self) -> &LabellerHandle {
        &self.labeller
    }
}

// ---------------------------------------------------------------------------
// DeviceScan / LabelScanner
// ---------------------------------------------------------------------------

/// Everything the label reader learned about one device: the device itself,
/// the labeller that recognized it, the PV id from the label, and the VG
/// summary assembled from the device's metadata areas (absent for orphan
/// PVs).
#[derive(Debug, Clone)]
pub struct DeviceScan {
    pub device: DeviceHandle,
    pub labeller: LabellerHandle,
    pub pvid: PvId,
    pub label_sector: u64,
    /// Device size in bytes as recorded in the PV header.
    pub device_size: u64,
    pub ext_version: u32,
    pub ext_flags: u32,
    pub summary: Option<VgSummary>,
    pub mdas: Vec<Mda>,
    pub das: Vec<DiskArea>,
    pub bas: Vec<DiskArea>,
}

/// The external label reader. `scan_all` is the full device sweep;
/// `read_device` is the targeted re-read used after duplicate resolution
/// and for per-VG rescans.
pub trait LabelScanner {
    fn scan_all(&mut self) -> Vec<DeviceScan>;

    fn read_device(&mut self, dev: &DeviceHandle) -> Option<DeviceScan>;
}

/// The external metadata daemon: a PV list that can seed the cache without
/// touching disks.
pub trait MetadataDaemon {
    fn pv_list(&self) -> Vec<DeviceScan>;
}
