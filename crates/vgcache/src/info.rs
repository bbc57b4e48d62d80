//! Cache entities: one [`PvInfo`] per labeled device, one [`VgInfo`] per
//! (VG name, VG id) pair.
//!
//! The two sides reference each other through stable handles owned by the
//! registry: `VgInfo::infos` holds the member handles, `PvInfo::vginfo` the
//! back-reference. Neither type touches the indexes itself; all linking goes
//! through the registry so the indexes cannot drift.

use tracing::error;

use vgcache_types::{
    is_orphan_vg, DiskArea, InfoStatus, Mda, PhysicalVolume, PvId, VgId, VgStatus, DeviceHandle,
    SECTOR_SHIFT,
};

use crate::format::{FormatHandle, Label, LabellerHandle};
use crate::registry::{InfoHandle, VgHandle};

// ---------------------------------------------------------------------------
// PvInfo
// ---------------------------------------------------------------------------

/// Cached state for one device carrying a PV label.
#[derive(Debug)]
pub struct PvInfo {
    pub(crate) vginfo: Option<VgHandle>,
    pvid: PvId,
    device: DeviceHandle,
    label: Label,
    fmt: FormatHandle,
    /// Bytes, as recorded in the PV header.
    device_size: u64,
    ext_version: u32,
    ext_flags: u32,
    pub(crate) status: InfoStatus,
    mdas: Vec<Mda>,
    das: Vec<DiskArea>,
    bas: Vec<DiskArea>,
}

impl PvInfo {
    pub(crate) fn new(labeller: LabellerHandle, device: DeviceHandle, pvid: PvId) -> Self {
        let fmt = labeller.fmt().clone();
        Self {
            vginfo: None,
            pvid,
            device,
            label: Label::new(labeller, 0),
            fmt,
            device_size: 0,
            ext_version: 0,
            ext_flags: 0,
            status: InfoStatus::empty(),
            mdas: Vec::new(),
            das: Vec::new(),
            bas: Vec::new(),
        }
    }

    #[must_use]
    pub fn pvid(&self) -> PvId {
        self.pvid
    }

    pub(crate) fn set_pvid(&mut self, pvid: PvId) {
        self.pvid = pvid;
    }

    #[must_use]
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    #[must_use]
    pub fn label(&self) -> &Label {
        &self.label
    }

    pub(crate) fn replace_label(&mut self, labeller: LabellerHandle) {
        self.fmt = labeller.fmt().clone();
        self.label = Label::new(labeller, self.label.sector());
    }

    pub(crate) fn set_label_sector(&mut self, sector: u64) {
        self.label.set_sector(sector);
    }

    #[must_use]
    pub fn fmt(&self) -> &FormatHandle {
        &self.fmt
    }

    /// True when this info's format descriptor is the given one; a mismatch
    /// is reported as an error, matching the behavior commands rely on.
    #[must_use]
    pub fn check_format(&self, fmt: &FormatHandle) -> bool {
        if !std::sync::Arc::ptr_eq(&self.fmt, fmt) {
            error!(
                dev = self.device.name(),
                fmt = self.fmt.name(),
                "PV is a different format"
            );
            return false;
        }
        true
    }

    /// Handle of the owning VG, if attached.
    #[must_use]
    pub fn vginfo(&self) -> Option<VgHandle> {
        self.vginfo
    }

    #[must_use]
    pub fn device_size(&self) -> u64 {
        self.device_size
    }

    pub fn set_device_size(&mut self, size: u64) {
        self.device_size = size;
    }

    #[must_use]
    pub fn ext_version(&self) -> u32 {
        self.ext_version
    }

    pub fn set_ext_version(&mut self, version: u32) {
        self.ext_version = version;
    }

    #[must_use]
    pub fn ext_flags(&self) -> u32 {
        self.ext_flags
    }

    pub fn set_ext_flags(&mut self, flags: u32) {
        self.ext_flags = flags;
    }

    #[must_use]
    pub fn status(&self) -> InfoStatus {
        self.status
    }

    // --- Areas ---

    #[must_use]
    pub fn mdas(&self) -> &[Mda] {
        &self.mdas
    }

    #[must_use]
    pub fn das(&self) -> &[DiskArea] {
        &self.das
    }

    #[must_use]
    pub fn bas(&self) -> &[DiskArea] {
        &self.bas
    }

    #[must_use]
    pub fn mda_count(&self) -> usize {
        self.mdas.len()
    }

    pub fn add_mda(&mut self, mda: Mda) {
        self.mdas.push(mda);
    }

    pub fn add_da(&mut self, da: DiskArea) {
        self.das.push(da);
    }

    pub fn add_ba(&mut self, ba: DiskArea) {
        self.bas.push(ba);
    }

    pub fn del_mdas(&mut self) {
        self.mdas.clear();
    }

    pub fn del_das(&mut self) {
        self.das.clear();
    }

    pub fn del_bas(&mut self) {
        self.bas.clear();
    }

    pub(crate) fn set_mdas(&mut self, mdas: Vec<Mda>) {
        self.mdas = mdas;
    }

    pub(crate) fn set_das(&mut self, das: Vec<DiskArea>) {
        self.das = das;
    }

    pub(crate) fn set_bas(&mut self, bas: Vec<DiskArea>) {
        self.bas = bas;
    }

    /// True when this info alone cannot settle whether the PV is an orphan:
    /// it has no usable metadata areas.
    #[must_use]
    pub fn mdas_empty_or_ignored(&self) -> bool {
        self.mdas.is_empty() || self.mdas.iter().all(|m| m.ignored)
    }

    /// Ownership of an MDA-less PV can only be decided from VG metadata.
    #[must_use]
    pub fn uncertain_ownership(&self) -> bool {
        self.mdas_empty_or_ignored()
    }

    /// Smallest MDA size on this PV, 0 when it has none.
    #[must_use]
    pub fn smallest_mda_size(&self) -> u64 {
        self.mdas.iter().map(|m| m.size).min().unwrap_or(0)
    }

    /// Refresh the cached size and format from a PV record.
    pub fn update_pv_geometry(&mut self, pv: &PhysicalVolume, fmt: FormatHandle) {
        self.device_size = pv.size << SECTOR_SHIFT;
        self.fmt = fmt;
    }

    /// Re-seed the data-area list from a PV record, first back-filling
    /// `pe_start` from the cached list when the record lacks it.
    pub fn update_data_areas(&mut self, pv: &mut PhysicalVolume) {
        if !self.das.is_empty() && pv.pe_start == 0 {
            if let Some(da) = self.das.first() {
                pv.pe_start = da.offset >> SECTOR_SHIFT;
            }
        }
        self.das.clear();
        self.das.push(DiskArea::new(pv.pe_start << SECTOR_SHIFT, 0));
    }

    /// Re-seed the bootloader-area list from a PV record, back-filling the
    /// record from the cached list when it is empty.
    pub fn update_bootloader_areas(&mut self, pv: &mut PhysicalVolume) {
        if !self.bas.is_empty() && pv.ba_start == 0 && pv.ba_size == 0 {
            if let Some(ba) = self.bas.first() {
                pv.ba_start = ba.offset >> SECTOR_SHIFT;
                pv.ba_size = ba.size >> SECTOR_SHIFT;
            }
        }
        self.bas.clear();
        self.bas.push(DiskArea::new(
            pv.ba_start << SECTOR_SHIFT,
            pv.ba_size << SECTOR_SHIFT,
        ));
    }

    /// Project cached label information into an orphan PV record. Requires
    /// a nonzero size, exactly one data area, and at most one bootloader
    /// area.
    pub fn populate_pv_fields(&self, orphan_vg_name: &str, pv: &mut PhysicalVolume) -> bool {
        pv.label_sector = self.label.sector();
        pv.devno = Some(self.device.devno());
        pv.size = self.device_size >> SECTOR_SHIFT;
        pv.vg_name = orphan_vg_name.to_string();
        pv.id = self.pvid;

        if pv.size == 0 {
            error!(dev = self.device.name(), "PV size is zero");
            return false;
        }
        if self.das.len() != 1 {
            error!(
                dev = self.device.name(),
                found = self.das.len(),
                "must be exactly one data area on PV"
            );
            return false;
        }
        if self.bas.len() > 1 {
            error!(
                dev = self.device.name(),
                found = self.bas.len(),
                "must be at most one bootloader area on PV"
            );
            return false;
        }

        if let Some(da) = self.das.first() {
            pv.pe_start = da.offset >> SECTOR_SHIFT;
        }
        if let Some(ba) = self.bas.first() {
            pv.ba_start = ba.offset >> SECTOR_SHIFT;
            pv.ba_size = ba.size >> SECTOR_SHIFT;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// VgInfo
// ---------------------------------------------------------------------------

/// Cached state for one VG, assembled from the summaries of its member
/// devices.
#[derive(Debug)]
pub struct VgInfo {
    name: String,
    vgid: VgId,
    fmt: FormatHandle,
    pub(crate) status: VgStatus,
    pub(crate) creation_host: Option<String>,
    pub(crate) system_id: Option<String>,
    pub(crate) lock_type: Option<String>,
    /// Metadata witness, recorded from the first device that supplied one.
    pub(crate) seqno: u32,
    pub(crate) mda_size: u64,
    pub(crate) mda_checksum: u32,
    pub(crate) scan_summary_mismatch: bool,
    independent_metadata_location: bool,
    pub(crate) infos: Vec<InfoHandle>,
}

impl VgInfo {
    pub(crate) fn new(name: impl Into<String>, fmt: FormatHandle) -> Self {
        Self {
            name: name.into(),
            vgid: VgId::new([0; vgcache_types::ID_LEN]),
            fmt,
            status: VgStatus::empty(),
            creation_host: None,
            system_id: None,
            lock_type: None,
            seqno: 0,
            mda_size: 0,
            mda_checksum: 0,
            scan_summary_mismatch: false,
            independent_metadata_location: false,
            infos: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn vgid(&self) -> VgId {
        self.vgid
    }

    pub(crate) fn set_vgid(&mut self, vgid: VgId) {
        self.vgid = vgid;
    }

    #[must_use]
    pub fn fmt(&self) -> &FormatHandle {
        &self.fmt
    }

    pub(crate) fn set_fmt(&mut self, fmt: FormatHandle) {
        self.fmt = fmt;
    }

    #[must_use]
    pub fn is_orphan(&self) -> bool {
        is_orphan_vg(&self.name)
    }

    #[must_use]
    pub fn status(&self) -> VgStatus {
        self.status
    }

    #[must_use]
    pub fn creation_host(&self) -> Option<&str> {
        self.creation_host.as_deref()
    }

    #[must_use]
    pub fn system_id(&self) -> Option<&str> {
        self.system_id.as_deref()
    }

    #[must_use]
    pub fn lock_type(&self) -> Option<&str> {
        self.lock_type.as_deref()
    }

    #[must_use]
    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    #[must_use]
    pub fn mda_size(&self) -> u64 {
        self.mda_size
    }

    #[must_use]
    pub fn mda_checksum(&self) -> u32 {
        self.mda_checksum
    }

    /// Set when a device's summary disagreed with the recorded witness.
    #[must_use]
    pub fn scan_summary_mismatch(&self) -> bool {
        self.scan_summary_mismatch
    }

    /// Set when this VG's metadata came from a file rather than device
    /// MDAs; disables the per-VG rescan path.
    #[must_use]
    pub fn independent_metadata_location(&self) -> bool {
        self.independent_metadata_location
    }

    pub(crate) fn set_independent_metadata_location(&mut self) {
        self.independent_metadata_location = true;
    }

    /// Member info handles, in attach order.
    #[must_use]
    pub fn infos(&self) -> &[InfoHandle] {
        &self.infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{dev, json_format, labeller};
    use vgcache_types::DevNum;

    fn info() -> PvInfo {
        PvInfo::new(
            labeller(),
            dev("/dev/sda", DevNum::new(8, 0), 2048),
            PvId::from_name("p1"),
        )
    }

    #[test]
    fn mdas_empty_or_ignored() {
        let mut i = info();
        assert!(i.mdas_empty_or_ignored());
        i.add_mda(Mda::new(4096, 1024 * 1024, true));
        assert!(i.mdas_empty_or_ignored());
        i.add_mda(Mda::new(8192, 2 * 1024 * 1024, false));
        assert!(!i.mdas_empty_or_ignored());
        assert_eq!(i.mda_count(), 2);
        assert_eq!(i.smallest_mda_size(), 1024 * 1024);
    }

    #[test]
    fn populate_pv_fields_requires_one_data_area() {
        let mut i = info();
        i.set_device_size(2048 << SECTOR_SHIFT);
        let mut pv = PhysicalVolume::default();
        assert!(!i.populate_pv_fields("#orphans_text", &mut pv));

        i.add_da(DiskArea::new(1_048_576, 0));
        assert!(i.populate_pv_fields("#orphans_text", &mut pv));
        assert_eq!(pv.size, 2048);
        assert_eq!(pv.pe_start, 1_048_576 >> SECTOR_SHIFT);
        assert_eq!(pv.vg_name, "#orphans_text");
    }

    #[test]
    fn populate_pv_fields_rejects_zero_size() {
        let mut i = info();
        i.add_da(DiskArea::new(1_048_576, 0));
        let mut pv = PhysicalVolume::default();
        assert!(!i.populate_pv_fields("#orphans_text", &mut pv));
    }

    #[test]
    fn orphan_vginfo_detection() {
        let fmt = json_format();
        assert!(VgInfo::new("#orphans_text", fmt.clone()).is_orphan());
        assert!(VgInfo::new("", fmt.clone()).is_orphan());
        assert!(!VgInfo::new("vg0", fmt).is_orphan());
    }
}
