//! Update pipeline: placing and re-placing PVs under VGs from per-device
//! summaries, with first-witness-wins metadata reconciliation.

use std::sync::Arc;

use tracing::{debug, error, warn};

use vgcache_error::Result;
use vgcache_types::{
    is_orphan_vg, DeviceHandle, PvId, VgId, VgStatus, VgSummary, VolumeGroup,
};

use crate::context::CommandContext;
use crate::duplicates::DupEntry;
use crate::format::{FormatHandle, LabellerHandle};
use crate::info::{PvInfo, VgInfo};
use crate::registry::InfoHandle;
use crate::Cache;

impl Cache {
    /// Find or create the info for a labeled device and run the update
    /// pipeline on it.
    ///
    /// Returns `Ok(None)` when the PV id is already cached for a different
    /// device: the registry keeps the old device and the new sighting is
    /// parked for the duplicate resolver.
    pub fn add(
        &mut self,
        cmd: &CommandContext,
        labeller: &LabellerHandle,
        pvid: PvId,
        dev: &DeviceHandle,
        vgname: &str,
        vgid: Option<VgId>,
        vgstatus: VgStatus,
    ) -> Result<Option<InfoHandle>> {
        let mut created = false;
        // Look up by PV id first, then by device: the latter finds an info
        // whose PV id was just rewritten (pvcreate over an existing PV).
        let existing = self
            .registry
            .info_by_pvid(&pvid, None)
            .or_else(|| self.registry.info_by_device(dev));
        let ih = match existing {
            Some(h) => h,
            None => {
                created = true;
                self.registry
                    .create_info(PvInfo::new(labeller.clone(), dev.clone(), pvid))
            }
        };

        if !created {
            let info = self.registry.info(ih).expect("indexed info is live");

            if !info.device().same_device(dev) {
                warn!(
                    pv = %pvid,
                    dev = dev.name(),
                    existing = info.device().name(),
                    "PV was already found on another device"
                );
                self.found_duplicate_pvs = true;
                // One parked sighting per device; a re-read supersedes the
                // previous one.
                self.found_duplicates.retain(|e| !e.dev.same_device(dev));
                self.found_duplicates.push(DupEntry {
                    pvid,
                    dev: dev.clone(),
                });
                return Ok(None);
            }

            if info.pvid() != pvid {
                // Happens when pvcreate runs on an existing PV.
                debug!(
                    dev = info.device().name(),
                    from = %info.pvid(),
                    to = %pvid,
                    "changing pvid on dev"
                );
            }

            if !Arc::ptr_eq(info.label().labeller(), labeller) {
                debug!(
                    dev = info.device().name(),
                    from = info.fmt().name(),
                    to = labeller.fmt().name(),
                    "changing labeller on dev"
                );
                if let Some(info) = self.registry.info_mut(ih) {
                    info.replace_label(labeller.clone());
                }
            }
        }

        if !self.registry.pvid_indexed(ih, &pvid) {
            self.registry.reindex_pvid(ih, pvid);
        }

        // The registry device for this PV id cannot sit in the parked
        // sightings under a stale id; re-key it so resolution groups it
        // with the id the device now carries.
        for entry in &mut self.found_duplicates {
            if entry.dev.same_device(dev) {
                entry.pvid = pvid;
            }
        }

        let summary = VgSummary::placement(vgname, vgid, vgstatus);
        if let Err(e) = self.update_vgname_and_id(cmd, ih, &summary) {
            error!(vg = vgname, "failed to update VG info in cache");
            if created {
                self.registry.unindex_and_remove_info(ih);
            }
            return Err(e);
        }

        Ok(Some(ih))
    }

    /// The update pipeline proper: re-place the info under the summary's
    /// VG, then reconcile the metadata witness.
    pub fn update_vgname_and_id(
        &mut self,
        cmd: &CommandContext,
        ih: InfoHandle,
        summary: &VgSummary,
    ) -> Result<()> {
        let info = self.registry.info(ih).expect("caller passes a live info");

        let (vgname, vgid) = if summary.vgname.is_empty() && info.vginfo().is_none() {
            error!("internal: empty vgname handed to cache");
            let orphan = info.fmt().orphan_vg_name().to_string();
            let id = VgId::from_name(&orphan);
            (orphan, Some(id))
        } else {
            (summary.vgname.clone(), summary.vgid)
        };

        // An MDA-less PV in a real VG is not demoted to orphan on the
        // strength of a summary while a critical section is open; the
        // metadata that placed it there outranks the label scan.
        if is_orphan_vg(&vgname)
            && info.mdas_empty_or_ignored()
            && cmd.in_critical_section()
            && info
                .vginfo()
                .and_then(|h| self.registry.vginfo(h))
                .is_some_and(|v| !v.is_orphan())
        {
            return Ok(());
        }

        self.place_info(cmd, ih, &vgname, vgid.as_ref(), summary);

        let vgh = self
            .registry
            .info(ih)
            .and_then(PvInfo::vginfo)
            .expect("info was just attached to a VG");

        if let Some(id) = vgid {
            self.registry.update_vgid(vgh, id);
        }

        if !summary.has_witness() {
            return Ok(());
        }

        let dev_name = self
            .registry
            .info(ih)
            .map(|i| i.device().name().to_string())
            .unwrap_or_default();
        let vginfo = self
            .registry
            .vginfo_mut(vgh)
            .expect("attached VG is live");

        if vginfo.seqno == 0 {
            vginfo.seqno = summary.seqno;
            debug!(dev = dev_name.as_str(), vg = vginfo.name(), seqno = vginfo.seqno, "set seqno");
        } else if vginfo.seqno != summary.seqno {
            warn!(
                vg = vginfo.name(),
                dev = dev_name.as_str(),
                found = summary.seqno,
                previous = vginfo.seqno,
                "scan of VG found metadata seqno mismatch"
            );
            vginfo.scan_summary_mismatch = true;
            // Returning success keeps the info cached so the VG can still
            // be rescanned or repaired.
            return Ok(());
        }

        if vginfo.mda_size == 0 {
            vginfo.mda_checksum = summary.mda_checksum;
            vginfo.mda_size = summary.mda_size;
            debug!(
                dev = dev_name.as_str(),
                vg = vginfo.name(),
                mda_checksum = vginfo.mda_checksum,
                mda_size = vginfo.mda_size,
                "set mda checksum and size"
            );
        } else if vginfo.mda_size != summary.mda_size
            || vginfo.mda_checksum != summary.mda_checksum
        {
            warn!(
                vg = vginfo.name(),
                dev = dev_name.as_str(),
                found_checksum = summary.mda_checksum,
                found_size = summary.mda_size,
                previous_checksum = vginfo.mda_checksum,
                previous_size = vginfo.mda_size,
                "scan of VG found mda mismatch"
            );
            vginfo.scan_summary_mismatch = true;
            return Ok(());
        }

        // A dev whose checksum matched contributes the remaining summary
        // fields.
        self.update_vgstatus(ih, summary);
        Ok(())
    }

    /// Re-run the pipeline for every PV of a parsed VG; the vg_read path.
    /// The summary built here carries no witness, so only placement and
    /// status fields are refreshed.
    pub fn update_vg(
        &mut self,
        cmd: &CommandContext,
        vg: &VolumeGroup,
        precommitted: bool,
    ) -> Result<()> {
        debug!(vg = vg.name.as_str(), precommitted, "updating cache from VG metadata");
        let summary = VgSummary {
            vgname: vg.name.clone(),
            vgid: Some(vg.id),
            vgstatus: vg.status,
            system_id: vg.system_id.clone(),
            lock_type: vg.lock_type.clone(),
            ..VgSummary::default()
        };

        for pv in &vg.pvs {
            if let Some(ih) = self.registry.info_by_pvid(&pv.id, pv.devno) {
                self.update_vgname_and_id(cmd, ih, &summary)?;
            }
        }
        Ok(())
    }

    /// Ensure an orphan VGInfo exists for a format.
    pub fn add_orphan_vginfo(&mut self, cmd: &CommandContext, vgname: &str, fmt: FormatHandle) {
        let vgh = match self.registry.vginfo_by_name(vgname, None) {
            Some(h) => h,
            None => {
                let vginfo = VgInfo::new(vgname, fmt);
                self.registry
                    .insert_vginfo(vginfo, VgStatus::empty(), None, cmd.hostname())
            }
        };
        self.registry.update_vgid(vgh, VgId::from_name(vgname));
        debug!(vg = vgname, "initialised VG");
    }

    /// Remove an info from the cache (and its VGInfo when that empties a
    /// real VG).
    pub fn del(&mut self, ih: InfoHandle) {
        self.registry.del_info(ih);
    }

    /// Remove the info bound to a device, if any.
    pub fn del_dev(&mut self, dev: &vgcache_types::Device) {
        if let Some(ih) = self.registry.info_by_device(dev) {
            self.registry.del_info(ih);
        }
    }

    /// Detach the info from its current VG (if it moved) and attach it
    /// under the summary's VG, creating the VGInfo on first sight.
    fn place_info(
        &mut self,
        cmd: &CommandContext,
        ih: InfoHandle,
        vgname: &str,
        vgid: Option<&VgId>,
        summary: &VgSummary,
    ) {
        let info = self.registry.info(ih).expect("caller passes a live info");

        // Already under the target VG: same name, and the id either matches
        // or was never supplied. A same-name different-id summary re-places
        // the info under the alias with that id instead of relabeling the
        // current VGInfo.
        let already_placed = info
            .vginfo()
            .and_then(|h| self.registry.vginfo(h))
            .is_some_and(|v| {
                v.name() == vgname && vgid.map_or(true, |id| *id == v.vgid())
            });
        if vgname.is_empty() || already_placed {
            return;
        }

        let fmt = info.fmt().clone();
        let mda_count = info.mda_count();
        let dev_name = info.device().name().to_string();

        self.registry.drop_vginfo_for(ih);

        let vgh = match self.registry.vginfo_by_name(vgname, vgid) {
            Some(h) => h,
            None => {
                // A different VG with the same name keeps its own VGInfo;
                // the chain-insertion policy picks the primary.
                let vginfo = VgInfo::new(vgname, fmt.clone());
                self.registry.insert_vginfo(
                    vginfo,
                    summary.vgstatus,
                    summary.creation_host.as_deref(),
                    cmd.hostname(),
                )
            }
        };

        self.registry.attach_info(vgh, ih);
        self.set_vg_lock_state(vgh, self.locks.is_locked(vgname));
        if let Some(vginfo) = self.registry.vginfo_mut(vgh) {
            vginfo.set_fmt(fmt);
        }

        debug!(dev = dev_name.as_str(), vg = vgname, mdas = mda_count, "now in VG");
    }

    /// Refresh status, creation host, lock type and system id on the VG of
    /// an info, rewriting strings only when they change.
    fn update_vgstatus(&mut self, ih: InfoHandle, summary: &VgSummary) {
        let Some(vgh) = self.registry.info(ih).and_then(PvInfo::vginfo) else {
            return;
        };
        let dev_name = self
            .registry
            .info(ih)
            .map(|i| i.device().name().to_string())
            .unwrap_or_default();
        let Some(vginfo) = self.registry.vginfo_mut(vgh) else {
            return;
        };

        let was_exported = vginfo.status.contains(VgStatus::EXPORTED);
        let now_exported = summary.vgstatus.contains(VgStatus::EXPORTED);
        if was_exported != now_exported {
            debug!(
                dev = dev_name.as_str(),
                vg = vginfo.name(),
                exported = now_exported,
                "VG exported state changed"
            );
        }
        vginfo.status = summary.vgstatus;

        if let Some(host) = summary.creation_host.as_deref() {
            if vginfo.creation_host.as_deref() != Some(host) {
                vginfo.creation_host = Some(host.to_string());
                debug!(dev = dev_name.as_str(), vg = vginfo.name(), host, "set creation host");
            }
        }

        if let Some(lock_type) = summary.lock_type.as_deref() {
            if vginfo.lock_type.as_deref() != Some(lock_type) {
                vginfo.lock_type = Some(lock_type.to_string());
                debug!(dev = dev_name.as_str(), vg = vginfo.name(), lock_type, "set lock_type");
            }
        }

        if let Some(system_id) = summary.system_id.as_deref() {
            if vginfo.system_id.as_deref() != Some(system_id) {
                vginfo.system_id = Some(system_id.to_string());
                debug!(dev = dev_name.as_str(), vg = vginfo.name(), system_id, "set system_id");
            }
        }
    }
}
