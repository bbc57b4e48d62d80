//! In-memory metadata cache for a block-level volume manager.
//!
//! The cache indexes every physical volume (PV) discovered by the external
//! label scan and aggregates PVs into the volume groups (VGs) they belong
//! to, so commands can resolve names, find devices and enforce consistency
//! without re-reading disk labels. It performs no I/O itself: the label
//! reader, the metadata format and the device cache are collaborators
//! behind the traits in [`format`].
//!
//! One [`Cache`] lives per command, owned alongside a [`CommandContext`].
//! All state is internal to the value; tests construct independent
//! instances freely.

pub mod context;
pub mod duplicates;
pub mod format;
pub mod info;
pub mod locks;
pub mod registry;
pub mod saved_vg;
pub mod update;

#[cfg(test)]
pub(crate) mod testutil;

pub use context::{CacheConfig, CommandContext};
pub use format::{
    DeviceScan, FormatHandle, Label, LabelScanner, Labeller, LabellerHandle, MetadataDaemon,
    MetadataFormat,
};
pub use info::{PvInfo, VgInfo};
pub use locks::precedes;
pub use registry::{InfoHandle, VgHandle};

use tracing::{debug, warn};

use vgcache_error::{CacheError, Result};
use vgcache_types::{Device, DeviceHandle, PvId, VgId, VgStatus, VgSummary};

use crate::duplicates::DupEntry;
use crate::locks::LockRegistry;
use crate::registry::Registry;
use crate::saved_vg::SavedVgs;

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// The metadata cache. Lifetime equals the command; a command that aborts
/// mid-scan calls [`Cache::destroy`] and starts over.
#[derive(Debug)]
pub struct Cache {
    pub(crate) registry: Registry,
    pub(crate) locks: LockRegistry,
    pub(crate) saved: Option<SavedVgs>,
    pub(crate) found_duplicates: Vec<DupEntry>,
    pub(crate) unused_duplicates: Vec<DupEntry>,
    pub(crate) found_duplicate_pvs: bool,
    scanning_in_progress: bool,
    has_scanned: bool,
}

impl Cache {
    /// Build and initialise a cache for the command.
    #[must_use]
    pub fn new(cmd: &mut CommandContext) -> Self {
        let mut cache = Self {
            registry: Registry::new(),
            locks: LockRegistry::default(),
            saved: None,
            found_duplicates: Vec::new(),
            unused_duplicates: Vec::new(),
            found_duplicate_pvs: false,
            scanning_in_progress: false,
            has_scanned: false,
        };
        cache.init(cmd);
        cache
    }

    /// (Re)initialise. Restores the global lock when the previous cache of
    /// this command was destroyed with it held.
    pub fn init(&mut self, cmd: &mut CommandContext) {
        self.locks.reset_count();
        self.locks
            .set_suppress_ordering(cmd.config().suppress_lock_ordering);
        self.saved = cmd.is_cluster_daemon().then(SavedVgs::new);

        if cmd.global_lock_held {
            cmd.global_lock_held = false;
            if let Err(e) = self.lock_vgname(vgcache_types::VG_GLOBAL) {
                warn!(error = %e, "failed to restore global lock after cache re-init");
            }
        }
    }

    /// Tear the cache down. Leaked VG locks are reported (the global lock
    /// is remembered on the command for the next `init`), the saved-VG
    /// index is drained, and the unchosen-duplicate list moves onto the
    /// command so the next cache makes the same duplicate choices.
    pub fn destroy(&mut self, cmd: &mut CommandContext, retain_orphans: bool, reset: bool) {
        debug!("dropping VG info");
        self.has_scanned = false;

        self.registry.clear_for_destroy();

        self.report_leaked_locks_at_destroy(cmd, reset);
        self.locks.clear();

        if let Some(mut saved) = self.saved.take() {
            saved.clear();
        }

        self.destroy_duplicate_lists(cmd);

        if retain_orphans {
            self.init(cmd);
            let formats: Vec<FormatHandle> = cmd.formats().to_vec();
            for fmt in formats {
                let orphan = fmt.orphan_vg_name().to_string();
                self.add_orphan_vginfo(cmd, &orphan, fmt);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Scan orchestration
    // -----------------------------------------------------------------------

    /// Full label scan: feed every device the scanner reports through the
    /// update pipeline, then resolve duplicates and rescan the preferred
    /// devices. Returns the number of real (non-orphan) VGs seen.
    ///
    /// Scanning looks up PVs, so a nested scan request fails fast instead
    /// of recursing.
    pub fn label_scan(
        &mut self,
        cmd: &mut CommandContext,
        scanner: &mut dyn LabelScanner,
    ) -> Result<usize> {
        if self.scanning_in_progress {
            return Err(CacheError::ScanInProgress);
        }
        self.scanning_in_progress = true;
        let result = self.label_scan_inner(cmd, scanner);
        self.scanning_in_progress = false;

        let count = self.registry.vginfo_count(false);
        debug!(vgs = count, "found VG info");
        result.map(|()| count)
    }

    fn label_scan_inner(
        &mut self,
        cmd: &mut CommandContext,
        scanner: &mut dyn LabelScanner,
    ) -> Result<()> {
        debug!("finding VG info");

        self.found_duplicates.clear();

        for scan in scanner.scan_all() {
            let dev_name = scan.device.name().to_string();
            if let Err(e) = self.apply_device_scan(cmd, scan) {
                warn!(dev = dev_name.as_str(), error = %e, "failed to cache scanned device");
            }
        }

        if !self.found_duplicates.is_empty() {
            debug!("resolving duplicate devices");
            let (del, add) = self.resolve_duplicates(cmd);

            for entry in &del {
                debug!(dev = entry.dev.name(), "dropping duplicate device from cache");
                if let Some(ih) = self.registry.info_by_pvid(&entry.pvid, None) {
                    self.registry.del_info(ih);
                }
            }

            for entry in &add {
                debug!(dev = entry.dev.name(), "rescanning preferred device");
                match scanner.read_device(&entry.dev) {
                    Some(scan) => {
                        if let Err(e) = self.apply_device_scan(cmd, scan) {
                            warn!(dev = entry.dev.name(), error = %e,
                                "failed to cache preferred duplicate");
                        }
                    }
                    None => warn!(dev = entry.dev.name(), "preferred device vanished on rescan"),
                }
            }

            // Dropped registry devices are unused duplicates too.
            self.unused_duplicates.extend(del);
            self.filter_md_component_duplicates(cmd);
        }

        Ok(())
    }

    /// Revalidate one VG's device-to-VG associations under its lock by
    /// re-reading the labels of its devices.
    ///
    /// VGs whose metadata came from an independent location are skipped
    /// (there are no associations on the devices to revalidate) unless the
    /// policy knob [`CacheConfig::rescan_independent_metadata`] is set.
    pub fn label_rescan_vg(
        &mut self,
        cmd: &mut CommandContext,
        scanner: &mut dyn LabelScanner,
        vgname: &str,
        vgid: Option<&VgId>,
    ) -> Result<()> {
        let Some(vgh) = self.registry.vginfo_by_name(vgname, vgid) else {
            return Err(CacheError::RescanUnknownVg {
                vg: vgname.to_string(),
            });
        };

        let vginfo = self.registry.vginfo(vgh).expect("looked-up VG is live");
        if vginfo.independent_metadata_location() && !cmd.config().rescan_independent_metadata {
            return Ok(());
        }

        let devs = self.registry.vg_devs(vgh);

        // Deleting the last info deletes the vginfo.
        let members = vginfo.infos().to_vec();
        for ih in members {
            self.registry.del_info(ih);
        }
        if self.registry.vginfo_by_name(vgname, vgid).is_some() {
            warn!(vg = vgname, "VG info not dropped before rescan");
        }

        for dev in devs {
            match scanner.read_device(&dev) {
                Some(scan) => {
                    if let Err(e) = self.apply_device_scan(cmd, scan) {
                        warn!(dev = dev.name(), error = %e, "failed to rescan device");
                    }
                }
                None => warn!(dev = dev.name(), "device vanished on VG rescan"),
            }
        }

        if self.registry.vginfo_by_name(vgname, vgid).is_none() {
            warn!(vg = vgname, "VG info not found after rescan");
            return Err(CacheError::RescanLost {
                vg: vgname.to_string(),
            });
        }
        Ok(())
    }

    /// Seed the cache from the external metadata daemon's PV list instead
    /// of scanning devices. A no-op once the cache has been populated.
    pub fn seed_from_metadata_daemon(
        &mut self,
        cmd: &mut CommandContext,
        daemon: &dyn MetadataDaemon,
    ) -> Result<()> {
        if self.has_scanned {
            return Ok(());
        }
        for scan in daemon.pv_list() {
            let dev_name = scan.device.name().to_string();
            if let Err(e) = self.apply_device_scan(cmd, scan) {
                warn!(dev = dev_name.as_str(), error = %e, "failed to seed device from daemon");
            }
        }
        self.has_scanned = true;
        Ok(())
    }

    /// Install one device's scan product: find-or-create the info, record
    /// label geometry and areas, then run the witness side of the summary
    /// through the pipeline.
    pub fn apply_device_scan(
        &mut self,
        cmd: &CommandContext,
        scan: DeviceScan,
    ) -> Result<Option<InfoHandle>> {
        let DeviceScan {
            device,
            labeller,
            pvid,
            label_sector,
            device_size,
            ext_version,
            ext_flags,
            summary,
            mdas,
            das,
            bas,
        } = scan;

        let (vgname, vgid, vgstatus) = match &summary {
            Some(s) => (s.vgname.clone(), s.vgid, s.vgstatus),
            None => {
                // A labeled device without a VG summary is an orphan PV.
                let orphan = labeller.fmt().orphan_vg_name().to_string();
                let id = VgId::from_name(&orphan);
                (orphan, Some(id), VgStatus::empty())
            }
        };

        let Some(ih) = self.add(cmd, &labeller, pvid, &device, &vgname, vgid, vgstatus)? else {
            return Ok(None);
        };

        {
            let info = self.registry.info_mut(ih).expect("just added info is live");
            info.set_label_sector(label_sector);
            info.set_device_size(device_size);
            info.set_ext_version(ext_version);
            info.set_ext_flags(ext_flags);
            info.set_mdas(mdas);
            info.set_das(das);
            info.set_bas(bas);
        }

        if let Some(s) = &summary {
            if s.has_witness() {
                self.update_vgname_and_id(cmd, ih, s)?;
            }
        }
        Ok(Some(ih))
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn info(&self, ih: InfoHandle) -> Option<&PvInfo> {
        self.registry.info(ih)
    }

    pub fn info_mut(&mut self, ih: InfoHandle) -> Option<&mut PvInfo> {
        self.registry.info_mut(ih)
    }

    #[must_use]
    pub fn vginfo(&self, vgh: VgHandle) -> Option<&VgInfo> {
        self.registry.vginfo(vgh)
    }

    /// Info lookup by PV id; with a device, a mismatch counts as not-found
    /// so duplicate handling stays safe.
    #[must_use]
    pub fn get_info_by_pvid(&self, pvid: &PvId, dev: Option<&Device>) -> Option<InfoHandle> {
        self.registry.info_by_pvid(pvid, dev.map(Device::devno))
    }

    #[must_use]
    pub fn get_vginfo_by_name(&self, vgname: &str, vgid: Option<&VgId>) -> Option<VgHandle> {
        self.registry.vginfo_by_name(vgname, vgid)
    }

    #[must_use]
    pub fn get_vginfo_by_vgid(&self, vgid: &VgId) -> Option<VgHandle> {
        self.registry.vginfo_by_vgid(vgid)
    }

    #[must_use]
    pub fn vgname_from_vgid(&self, vgid: &VgId) -> Option<&str> {
        self.registry
            .vginfo_by_vgid(vgid)
            .and_then(|h| self.registry.vginfo(h))
            .map(VgInfo::name)
    }

    /// The id for a name, refused when the name is ambiguous.
    #[must_use]
    pub fn vgid_from_vgname(&self, vgname: &str) -> Option<VgId> {
        self.registry.vgid_from_vgname(vgname)
    }

    #[must_use]
    pub fn vgname_from_info(&self, ih: InfoHandle) -> Option<&str> {
        self.registry
            .info(ih)
            .and_then(PvInfo::vginfo)
            .and_then(|h| self.registry.vginfo(h))
            .map(VgInfo::name)
    }

    #[must_use]
    pub fn vgname_from_pvid(&self, pvid: &PvId) -> Option<&str> {
        let ih = self.registry.info_by_pvid(pvid, None)?;
        self.vgname_from_info(ih)
    }

    /// Device and label sector for a PV id.
    #[must_use]
    pub fn device_from_pvid(&self, pvid: &PvId) -> Option<(DeviceHandle, u64)> {
        let ih = self.registry.info_by_pvid(pvid, None)?;
        let info = self.registry.info(ih)?;
        Some((info.device().clone(), info.label().sector()))
    }

    #[must_use]
    pub fn has_dev_info(&self, dev: &Device) -> bool {
        self.registry.info_by_device(dev).is_some()
    }

    /// The label for a device; a duplicate's device gets nothing.
    #[must_use]
    pub fn get_dev_label(&self, dev: &Device) -> Option<&Label> {
        let ih = self.registry.info_by_device(dev)?;
        self.registry.info(ih).map(PvInfo::label)
    }

    #[must_use]
    pub fn fmt_from_info(&self, ih: InfoHandle) -> Option<FormatHandle> {
        self.registry.info(ih).map(|i| i.fmt().clone())
    }

    #[must_use]
    pub fn fmt_from_vgname(&self, vgname: &str, vgid: Option<&VgId>) -> Option<FormatHandle> {
        self.registry
            .vginfo_by_name(vgname, vgid)
            .and_then(|h| self.registry.vginfo(h))
            .map(|v| v.fmt().clone())
    }

    // -----------------------------------------------------------------------
    // Enumeration
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn vgnames(&self, include_internal: bool) -> Vec<String> {
        self.registry.vgnames(include_internal)
    }

    #[must_use]
    pub fn vgids(&self, include_internal: bool) -> Vec<VgId> {
        self.registry.vgids(include_internal)
    }

    #[must_use]
    pub fn vgnameids(&self, include_internal: bool) -> Vec<(String, VgId)> {
        self.registry.vgnameids(include_internal)
    }

    #[must_use]
    pub fn pvids_in_vg(&self, vgname: &str, vgid: Option<&VgId>) -> Vec<PvId> {
        self.registry.pvids_in_vg(vgname, vgid)
    }

    #[must_use]
    pub fn vg_devs(&self, vgh: VgHandle) -> Vec<DeviceHandle> {
        self.registry.vg_devs(vgh)
    }

    /// Longest device name and VG name, for table formatting.
    #[must_use]
    pub fn max_name_lengths(&self) -> (usize, usize) {
        self.registry.max_name_lengths()
    }

    /// True when the info belongs to no VG or to an orphan VG.
    #[must_use]
    pub fn info_is_orphan(&self, ih: InfoHandle) -> bool {
        self.registry
            .info(ih)
            .and_then(PvInfo::vginfo)
            .and_then(|h| self.registry.vginfo(h))
            .map_or(true, VgInfo::is_orphan)
    }

    /// Every metadata area across a VG's members, the set a format
    /// instance attaches when it opens the VG.
    #[must_use]
    pub fn vg_mdas(&self, vgh: VgHandle) -> Vec<vgcache_types::Mda> {
        let Some(vginfo) = self.registry.vginfo(vgh) else {
            return Vec::new();
        };
        vginfo
            .infos()
            .iter()
            .filter_map(|&ih| self.registry.info(ih))
            .flat_map(|i| i.mdas().iter().copied())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Misc queries
    // -----------------------------------------------------------------------

    /// True when the id belongs to a cached, real (non-orphan) VG.
    #[must_use]
    pub fn vgid_is_cached(&self, vgid: &VgId) -> bool {
        self.registry
            .vginfo_by_vgid(vgid)
            .and_then(|h| self.registry.vginfo(h))
            .is_some_and(|v| !v.is_orphan() && !v.name().is_empty())
    }

    /// True when the VG's system-id puts it under another host's control.
    #[must_use]
    pub fn vg_is_foreign(&self, cmd: &CommandContext, vgid: &VgId) -> bool {
        self.registry
            .vginfo_by_vgid(vgid)
            .and_then(|h| self.registry.vginfo(h))
            .is_some_and(|v| !cmd.is_system_id_allowed(v.system_id()))
    }

    /// Any cached VG using the sanlock lock manager.
    #[must_use]
    pub fn contains_lock_type_sanlock(&self) -> bool {
        self.registry
            .vg_handles()
            .filter_map(|h| self.registry.vginfo(h))
            .any(|v| v.lock_type() == Some("sanlock"))
    }

    /// Mark a VG's metadata as coming from an independent location.
    pub fn set_independent_location(&mut self, vgname: &str) {
        if let Some(vgh) = self.registry.vginfo_by_name(vgname, None) {
            if let Some(vginfo) = self.registry.vginfo_mut(vgh) {
                vginfo.set_independent_metadata_location();
            }
        }
    }

    /// Witness-mismatch flag for a VG; unknown VGs count as mismatched so
    /// callers fall back to full metadata reads.
    #[must_use]
    pub fn scan_mismatch(&self, vgname: &str, vgid: &VgId) -> bool {
        if vgname.is_empty() {
            return true;
        }
        self.registry
            .vginfo_by_vgid(vgid)
            .and_then(|h| self.registry.vginfo(h))
            .map_or(true, VgInfo::scan_summary_mismatch)
    }

    /// Fill a summary from a cached VGInfo whose checksum and size match,
    /// letting the caller skip parsing identical metadata again.
    #[must_use]
    pub fn lookup_mda(&self, summary: &mut VgSummary) -> bool {
        if summary.mda_size == 0 {
            return false;
        }
        for vgh in self.registry.vg_handles() {
            let Some(vginfo) = self.registry.vginfo(vgh) else {
                continue;
            };
            if vginfo.is_orphan() {
                continue;
            }
            if vginfo.mda_checksum() == summary.mda_checksum
                && vginfo.mda_size() == summary.mda_size
            {
                summary.vgname = vginfo.name().to_string();
                summary.vgid = Some(vginfo.vgid());
                summary.vgstatus = vginfo.status();
                summary.creation_host = vginfo.creation_host().map(str::to_string);
                summary.seqno = vginfo.seqno();
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{dev, new_cmd, scan_for, FixtureScanner};
    use vgcache_types::DevNum;

    #[test]
    fn scan_guard_rejects_nested_scan() {
        let mut cmd = new_cmd();
        let mut cache = Cache::new(&mut cmd);
        // Simulate a scan in flight.
        cache.scanning_in_progress = true;
        let mut scanner = FixtureScanner::default();
        assert_eq!(
            cache.label_scan(&mut cmd, &mut scanner),
            Err(CacheError::ScanInProgress)
        );
        cache.scanning_in_progress = false;
        assert!(cache.label_scan(&mut cmd, &mut scanner).is_ok());
    }

    #[test]
    fn label_scan_counts_real_vgs_only() {
        let mut cmd = new_cmd();
        let mut cache = Cache::new(&mut cmd);
        let mut scanner = FixtureScanner::default();
        scanner.push(scan_for(
            dev("/dev/sda", DevNum::new(8, 0), 2048),
            "p1",
            Some(("vg0", "g1", 5, 0xAAAA)),
        ));
        scanner.push(scan_for(
            dev("/dev/sdb", DevNum::new(8, 16), 2048),
            "p2",
            None,
        ));
        let count = cache.label_scan(&mut cmd, &mut scanner).unwrap();
        assert_eq!(count, 1);
        assert_eq!(cache.vgnames(false), vec!["vg0"]);
    }

    #[test]
    fn seed_from_daemon_is_latched() {
        struct Daemon;
        impl MetadataDaemon for Daemon {
            fn pv_list(&self) -> Vec<DeviceScan> {
                vec![scan_for(
                    dev("/dev/sda", DevNum::new(8, 0), 2048),
                    "p1",
                    Some(("vg0", "g1", 5, 0xAAAA)),
                )]
            }
        }

        let mut cmd = new_cmd();
        let mut cache = Cache::new(&mut cmd);
        cache.seed_from_metadata_daemon(&mut cmd, &Daemon).unwrap();
        assert_eq!(cache.vgnames(false), vec!["vg0"]);

        // Second seeding does not re-apply (and must not disturb anything).
        cache.seed_from_metadata_daemon(&mut cmd, &Daemon).unwrap();
        assert_eq!(cache.vgnames(false), vec!["vg0"]);
    }

    #[test]
    fn destroy_carries_global_lock_to_next_init() {
        let mut cmd = new_cmd();
        let mut cache = Cache::new(&mut cmd);
        cache.lock_vgname(vgcache_types::VG_GLOBAL).unwrap();
        cache.destroy(&mut cmd, false, false);
        assert!(cmd.global_lock_held);

        let cache = Cache::new(&mut cmd);
        assert!(cache.vgname_is_locked(vgcache_types::VG_GLOBAL));
        assert!(!cmd.global_lock_held);
    }

    #[test]
    fn destroy_with_reset_forgets_global_lock() {
        let mut cmd = new_cmd();
        let mut cache = Cache::new(&mut cmd);
        cache.lock_vgname(vgcache_types::VG_GLOBAL).unwrap();
        cache.destroy(&mut cmd, false, true);
        assert!(!cmd.global_lock_held);

        let cache = Cache::new(&mut cmd);
        assert!(!cache.vgname_is_locked(vgcache_types::VG_GLOBAL));
    }

    #[test]
    fn destroy_retain_orphans_recreates_per_format_orphans() {
        let mut cmd = new_cmd();
        let mut cache = Cache::new(&mut cmd);
        cache.destroy(&mut cmd, true, false);
        assert_eq!(cache.vgnames(true), vec!["#orphans_json"]);
        assert_eq!(cache.vgnames(false), Vec::<String>::new());
    }

    #[test]
    fn lookup_mda_fills_summary_from_matching_vginfo() {
        let mut cmd = new_cmd();
        let mut cache = Cache::new(&mut cmd);
        let mut scanner = FixtureScanner::default();
        scanner.push(scan_for(
            dev("/dev/sda", DevNum::new(8, 0), 2048),
            "p1",
            Some(("vg0", "g1", 5, 0xAAAA)),
        ));
        cache.label_scan(&mut cmd, &mut scanner).unwrap();

        let mut probe = VgSummary {
            mda_size: 1024,
            mda_checksum: 0xAAAA,
            ..VgSummary::default()
        };
        assert!(cache.lookup_mda(&mut probe));
        assert_eq!(probe.vgname, "vg0");
        assert_eq!(probe.seqno, 5);
        assert_eq!(probe.vgid, Some(VgId::from_name("g1")));

        let mut miss = VgSummary {
            mda_size: 1024,
            mda_checksum: 0xBBBB,
            ..VgSummary::default()
        };
        assert!(!cache.lookup_mda(&mut miss));
        let mut no_size = VgSummary::default();
        assert!(!cache.lookup_mda(&mut no_size));
    }
}
