//! The four keyed indexes and the ordered VG list.
//!
//! The registry is the exclusive owner of every [`PvInfo`] and [`VgInfo`];
//! both are stored in handle-keyed maps and referenced everywhere else by
//! copyable handles, which is what breaks the PV↔VG reference cycle. Index
//! maintenance lives here and nowhere else:
//!
//! - `pvid_index`: PV id → info handle (one device per PV id, always)
//! - `vgid_index`: VG id → VG handle
//! - `name_index`: VG name → alias chain (primary at position 0)
//! - `vg_order`:   enumeration order, real VGs first, orphans last

use std::collections::{HashMap, VecDeque};
use std::fmt;

use tracing::{debug, error};

use vgcache_types::{Device, DevNum, DeviceHandle, PvId, VgId, VgStatus};

use crate::info::{PvInfo, VgInfo};

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Stable handle to a [`PvInfo`] owned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHandle(u64);

/// Stable handle to a [`VgInfo`] owned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VgHandle(u64);

impl fmt::Display for InfoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "info#{}", self.0)
    }
}

impl fmt::Display for VgHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vg#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Registry {
    infos: HashMap<InfoHandle, PvInfo>,
    vginfos: HashMap<VgHandle, VgInfo>,
    pvid_index: HashMap<PvId, InfoHandle>,
    vgid_index: HashMap<VgId, VgHandle>,
    name_index: HashMap<String, Vec<VgHandle>>,
    vg_order: VecDeque<VgHandle>,
    next_info: u64,
    next_vg: u64,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // --- Access by handle ---

    #[must_use]
    pub fn info(&self, h: InfoHandle) -> Option<&PvInfo> {
        self.infos.get(&h)
    }

    pub fn info_mut(&mut self, h: InfoHandle) -> Option<&mut PvInfo> {
        self.infos.get_mut(&h)
    }

    #[must_use]
    pub fn vginfo(&self, h: VgHandle) -> Option<&VgInfo> {
        self.vginfos.get(&h)
    }

    pub fn vginfo_mut(&mut self, h: VgHandle) -> Option<&mut VgInfo> {
        self.vginfos.get_mut(&h)
    }

    // --- Lookups ---

    /// Look up an info by PV id. When the caller knows which device it is
    /// working with, a device-number mismatch is treated as not-found so a
    /// duplicate's info is never handed out for the wrong device.
    #[must_use]
    pub fn info_by_pvid(&self, pvid: &PvId, devno: Option<DevNum>) -> Option<InfoHandle> {
        let h = *self.pvid_index.get(pvid)?;
        if let Some(devno) = devno {
            let info = self.infos.get(&h)?;
            if info.device().devno() != devno {
                debug!(
                    cached = info.device().name(),
                    requested = %devno,
                    pvid = %pvid,
                    "ignoring cache info because another device was requested for PV"
                );
                return None;
            }
        }
        Some(h)
    }

    #[must_use]
    pub fn vginfo_by_vgid(&self, vgid: &VgId) -> Option<VgHandle> {
        let h = self.vgid_index.get(vgid).copied();
        if h.is_none() {
            debug!(vgid = %vgid, "cache has no info for vgid");
        }
        h
    }

    /// Look up by name, walking the alias chain when a VG id is supplied.
    /// Without an id, the primary is returned.
    #[must_use]
    pub fn vginfo_by_name(&self, vgname: &str, vgid: Option<&VgId>) -> Option<VgHandle> {
        let chain = self.name_index.get(vgname)?;
        match vgid {
            Some(id) => chain
                .iter()
                .copied()
                .find(|h| self.vginfos[h].vgid() == *id),
            None => chain.first().copied(),
        }
    }

    /// The id for a name, but only when the name is unambiguous.
    #[must_use]
    pub fn vgid_from_vgname(&self, vgname: &str) -> Option<VgId> {
        let chain = self.name_index.get(vgname)?;
        if chain.len() != 1 {
            return None;
        }
        Some(self.vginfos[&chain[0]].vgid())
    }

    #[must_use]
    pub fn info_by_device(&self, dev: &Device) -> Option<InfoHandle> {
        self.infos
            .iter()
            .find(|(_, i)| i.device().same_device(dev))
            .map(|(h, _)| *h)
    }

    // --- Info creation / PV-id index ---

    pub(crate) fn create_info(&mut self, info: PvInfo) -> InfoHandle {
        let h = InfoHandle(self.next_info);
        self.next_info += 1;
        self.infos.insert(h, info);
        h
    }

    /// True when the index entry for `pvid` already points at `h` and the
    /// info agrees about its own id.
    #[must_use]
    pub(crate) fn pvid_indexed(&self, h: InfoHandle, pvid: &PvId) -> bool {
        self.pvid_index.get(pvid) == Some(&h) && self.infos[&h].pvid() == *pvid
    }

    /// Point the PV-id index entry for `pvid` at `h`, clearing any stale
    /// entry under the info's previous id.
    pub(crate) fn reindex_pvid(&mut self, h: InfoHandle, pvid: PvId) {
        let old = self.infos[&h].pvid();
        if self.pvid_index.get(&old) == Some(&h) {
            self.pvid_index.remove(&old);
        }
        if let Some(info) = self.infos.get_mut(&h) {
            info.set_pvid(pvid);
        }
        self.pvid_index.insert(pvid, h);
    }

    pub(crate) fn unindex_and_remove_info(&mut self, h: InfoHandle) {
        if let Some(info) = self.infos.get(&h) {
            let pvid = info.pvid();
            if self.pvid_index.get(&pvid) == Some(&h) {
                self.pvid_index.remove(&pvid);
            }
        }
        self.infos.remove(&h);
    }

    // --- Attach / detach ---

    pub(crate) fn attach_info(&mut self, vgh: VgHandle, ih: InfoHandle) {
        if let Some(info) = self.infos.get_mut(&ih) {
            info.vginfo = Some(vgh);
        }
        if let Some(vginfo) = self.vginfos.get_mut(&vgh) {
            vginfo.infos.push(ih);
        }
    }

    /// Unlink an info from its VG. Returns the VG it was attached to. The
    /// VGInfo is left in place; use [`Registry::drop_vginfo_for`] when the
    /// empty-VG free rule should apply.
    pub(crate) fn detach_info(&mut self, ih: InfoHandle) -> Option<VgHandle> {
        let vgh = self.infos.get_mut(&ih)?.vginfo.take()?;
        if let Some(vginfo) = self.vginfos.get_mut(&vgh) {
            vginfo.infos.retain(|&h| h != ih);
        }
        Some(vgh)
    }

    /// Detach an info and free its VGInfo if that left it empty. Orphan
    /// VGInfos persist regardless.
    pub(crate) fn drop_vginfo_for(&mut self, ih: InfoHandle) {
        if let Some(vgh) = self.detach_info(ih) {
            self.drop_vginfo_if_unused(vgh);
        }
    }

    pub(crate) fn drop_vginfo_if_unused(&mut self, vgh: VgHandle) {
        let Some(vginfo) = self.vginfos.get(&vgh) else {
            return;
        };
        if vginfo.is_orphan() || !vginfo.infos.is_empty() {
            return;
        }
        self.free_vginfo(vgh);
    }

    /// Remove a VGInfo from every index. The name chain self-repairs: when
    /// the primary goes, the next alias is promoted by position.
    pub(crate) fn free_vginfo(&mut self, vgh: VgHandle) {
        let Some(vginfo) = self.vginfos.remove(&vgh) else {
            return;
        };

        if let Some(chain) = self.name_index.get_mut(vginfo.name()) {
            chain.retain(|&h| h != vgh);
            if chain.is_empty() {
                self.name_index.remove(vginfo.name());
            }
        }

        if self.vgid_index.get(&vginfo.vgid()) == Some(&vgh) {
            self.vgid_index.remove(&vginfo.vgid());
        }

        self.vg_order.retain(|&h| h != vgh);
    }

    /// Full info removal: PV-id index entry, VG membership (freeing an
    /// emptied VGInfo), and the info itself.
    pub(crate) fn del_info(&mut self, ih: InfoHandle) {
        if let Some(info) = self.infos.get(&ih) {
            let pvid = info.pvid();
            if self.pvid_index.get(&pvid) == Some(&ih) {
                self.pvid_index.remove(&pvid);
            }
        }
        self.drop_vginfo_for(ih);
        self.infos.remove(&ih);
    }

    // --- VGInfo insertion and the alias-chain policy ---

    /// Insert a new VGInfo, deciding its position in the name chain against
    /// any existing primary, and its position in the enumeration order
    /// (orphans last).
    pub(crate) fn insert_vginfo(
        &mut self,
        vginfo: VgInfo,
        new_status: VgStatus,
        new_creation_host: Option<&str>,
        hostname: &str,
    ) -> VgHandle {
        let h = VgHandle(self.next_vg);
        self.next_vg += 1;

        let name = vginfo.name().to_string();
        let orphan = vginfo.is_orphan();

        let promote = match self.name_index.get(&name).and_then(|c| c.first()) {
            Some(primary_h) => {
                let primary = &self.vginfos[primary_h];
                prefer_new_primary(primary, new_status, new_creation_host, hostname)
            }
            None => true,
        };

        self.vginfos.insert(h, vginfo);
        let chain = self.name_index.entry(name).or_default();
        if promote {
            chain.insert(0, h);
        } else {
            chain.push(h);
        }

        if orphan {
            self.vg_order.push_back(h);
        } else {
            self.vg_order.push_front(h);
        }
        h
    }

    /// Re-key the VG-id index entry for a VGInfo whose id changed.
    pub(crate) fn update_vgid(&mut self, vgh: VgHandle, vgid: VgId) {
        let Some(vginfo) = self.vginfos.get(&vgh) else {
            return;
        };
        if vginfo.vgid() == vgid {
            return;
        }
        let old = vginfo.vgid();
        if self.vgid_index.get(&old) == Some(&vgh) {
            self.vgid_index.remove(&old);
        }
        if let Some(vginfo) = self.vginfos.get_mut(&vgh) {
            vginfo.set_vgid(vgid);
        }
        self.vgid_index.insert(vgid, vgh);

        if let Some(vginfo) = self.vginfos.get(&vgh) {
            if !vginfo.is_orphan() {
                debug!(vg = vginfo.name(), vgid = %vgid, "set VGID");
            }
        }
    }

    // --- Enumeration ---

    /// VG handles in enumeration order: real VGs first, orphans last.
    pub fn vg_handles(&self) -> impl Iterator<Item = VgHandle> + '_ {
        self.vg_order.iter().copied()
    }

    #[must_use]
    pub fn vgnames(&self, include_internal: bool) -> Vec<String> {
        self.vg_order
            .iter()
            .map(|h| &self.vginfos[h])
            .filter(|v| include_internal || !v.is_orphan())
            .map(|v| v.name().to_string())
            .collect()
    }

    #[must_use]
    pub fn vgids(&self, include_internal: bool) -> Vec<VgId> {
        self.vg_order
            .iter()
            .map(|h| &self.vginfos[h])
            .filter(|v| include_internal || !v.is_orphan())
            .map(VgInfo::vgid)
            .collect()
    }

    /// (name, id) pairs in enumeration order.
    #[must_use]
    pub fn vgnameids(&self, include_internal: bool) -> Vec<(String, VgId)> {
        self.vg_order
            .iter()
            .map(|h| &self.vginfos[h])
            .filter(|v| include_internal || !v.is_orphan())
            .map(|v| (v.name().to_string(), v.vgid()))
            .collect()
    }

    #[must_use]
    pub fn pvids_in_vg(&self, vgname: &str, vgid: Option<&VgId>) -> Vec<PvId> {
        let Some(vgh) = self.vginfo_by_name(vgname, vgid) else {
            return Vec::new();
        };
        self.vginfos[&vgh]
            .infos
            .iter()
            .map(|ih| self.infos[ih].pvid())
            .collect()
    }

    #[must_use]
    pub fn vg_devs(&self, vgh: VgHandle) -> Vec<DeviceHandle> {
        let Some(vginfo) = self.vginfos.get(&vgh) else {
            return Vec::new();
        };
        vginfo
            .infos
            .iter()
            .map(|ih| self.infos[ih].device().clone())
            .collect()
    }

    /// Longest device name and VG name in the cache, for table formatting.
    #[must_use]
    pub fn max_name_lengths(&self) -> (usize, usize) {
        let mut pv_max = 0;
        let mut vg_max = 0;
        for h in &self.vg_order {
            let vginfo = &self.vginfos[h];
            vg_max = vg_max.max(vginfo.name().len());
            for ih in &vginfo.infos {
                pv_max = pv_max.max(self.infos[ih].device().name().len());
            }
        }
        (pv_max, vg_max)
    }

    #[must_use]
    pub fn vginfo_count(&self, include_internal: bool) -> usize {
        self.vg_order
            .iter()
            .filter(|h| include_internal || !self.vginfos[h].is_orphan())
            .count()
    }

    pub(crate) fn info_handles(&self) -> impl Iterator<Item = InfoHandle> + '_ {
        self.infos.keys().copied()
    }

    pub(crate) fn pvid_entries(&self) -> impl Iterator<Item = (&PvId, &InfoHandle)> {
        self.pvid_index.iter()
    }

    pub(crate) fn vginfo_entries(&self) -> impl Iterator<Item = (VgHandle, &VgInfo)> {
        self.vginfos.iter().map(|(h, v)| (*h, v))
    }

    pub(crate) fn name_chain(&self, vgname: &str) -> Option<&[VgHandle]> {
        self.name_index.get(vgname).map(Vec::as_slice)
    }

    // --- Teardown ---

    /// Drop every info, then every alias chain. A VG still on the order
    /// list afterwards means an index went incoherent; that is reported and
    /// repaired.
    pub(crate) fn clear_for_destroy(&mut self) {
        let handles: Vec<InfoHandle> = self.pvid_index.values().copied().collect();
        for ih in handles {
            self.detach_info(ih);
        }
        self.infos.clear();
        self.pvid_index.clear();

        let names: Vec<String> = self.name_index.keys().cloned().collect();
        for name in names {
            if let Some(chain) = self.name_index.remove(&name) {
                for vgh in chain {
                    if let Some(vginfo) = self.vginfos.remove(&vgh) {
                        if self.vgid_index.get(&vginfo.vgid()) == Some(&vgh) {
                            self.vgid_index.remove(&vginfo.vgid());
                        }
                        self.vg_order.retain(|&h| h != vgh);
                    }
                }
            }
        }

        if !self.vg_order.is_empty() {
            error!("internal: vginfos list should be empty");
        }
        self.vg_order.clear();
        self.vgid_index.clear();
        self.vginfos.clear();
    }
}

/// Ranking between an existing primary and a newcomer under the same name.
/// Not-exported beats exported, then created-here, then has-creation-host;
/// ties keep the pre-existing primary.
fn prefer_new_primary(
    primary: &VgInfo,
    new_status: VgStatus,
    new_creation_host: Option<&str>,
    hostname: &str,
) -> bool {
    let primary_exported = primary.status().contains(VgStatus::EXPORTED);
    let new_exported = new_status.contains(VgStatus::EXPORTED);

    if !primary_exported && new_exported {
        debug!(
            vg = primary.name(),
            "duplicate VG name: existing takes precedence over exported newcomer"
        );
        false
    } else if primary_exported && !new_exported {
        debug!(
            vg = primary.name(),
            "duplicate VG name: newcomer takes precedence over exported existing"
        );
        true
    } else if primary.creation_host() == Some(hostname) {
        debug!(
            vg = primary.name(),
            "duplicate VG name: existing (created here) takes precedence"
        );
        false
    } else if primary.creation_host().is_none() && new_creation_host.is_some() {
        debug!(
            vg = primary.name(),
            "duplicate VG name: newcomer (with creation host) takes precedence"
        );
        true
    } else if new_creation_host == Some(hostname) {
        debug!(
            vg = primary.name(),
            "duplicate VG name: newcomer (created here) takes precedence"
        );
        true
    } else {
        debug!(
            vg = primary.name(),
            "duplicate VG name: preferring existing"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{dev, json_format, labeller};
    use vgcache_types::{DevNum, PvId};

    fn seeded() -> (Registry, InfoHandle, VgHandle) {
        let mut reg = Registry::new();
        let ih = reg.create_info(PvInfo::new(
            labeller(),
            dev("/dev/sda", DevNum::new(8, 0), 2048),
            PvId::from_name("p1"),
        ));
        reg.reindex_pvid(ih, PvId::from_name("p1"));
        let vgh = reg.insert_vginfo(
            VgInfo::new("vg0", json_format()),
            VgStatus::empty(),
            None,
            "host-a",
        );
        reg.update_vgid(vgh, VgId::from_name("g1"));
        reg.attach_info(vgh, ih);
        (reg, ih, vgh)
    }

    #[test]
    fn lookup_by_pvid_honors_requested_device() {
        let (reg, ih, _) = seeded();
        let p1 = PvId::from_name("p1");
        assert_eq!(reg.info_by_pvid(&p1, None), Some(ih));
        assert_eq!(reg.info_by_pvid(&p1, Some(DevNum::new(8, 0))), Some(ih));
        assert_eq!(reg.info_by_pvid(&p1, Some(DevNum::new(8, 16))), None);
    }

    #[test]
    fn free_rewires_name_chain_and_promotes_successor() {
        let (mut reg, _, primary) = seeded();
        let second = reg.insert_vginfo(
            VgInfo::new("vg0", json_format()),
            VgStatus::empty(),
            None,
            "host-a",
        );
        reg.update_vgid(second, VgId::from_name("g2"));

        // Ties keep the pre-existing primary.
        assert_eq!(reg.vginfo_by_name("vg0", None), Some(primary));
        assert_eq!(
            reg.vginfo_by_name("vg0", Some(&VgId::from_name("g2"))),
            Some(second)
        );
        // Ambiguous name refuses to pick an id.
        assert_eq!(reg.vgid_from_vgname("vg0"), None);

        reg.free_vginfo(primary);
        assert_eq!(reg.vginfo_by_name("vg0", None), Some(second));
        assert_eq!(reg.vgid_from_vgname("vg0"), Some(VgId::from_name("g2")));
        assert_eq!(reg.vginfo_by_vgid(&VgId::from_name("g1")), None);
    }

    #[test]
    fn exported_newcomer_never_becomes_primary() {
        let (mut reg, _, primary) = seeded();
        let second = reg.insert_vginfo(
            VgInfo::new("vg0", json_format()),
            VgStatus::EXPORTED,
            Some("host-a"),
            "host-a",
        );
        assert_eq!(reg.vginfo_by_name("vg0", None), Some(primary));
        assert_ne!(primary, second);
    }

    #[test]
    fn created_here_newcomer_takes_primary_from_foreign() {
        let mut reg = Registry::new();
        let foreign = reg.insert_vginfo(
            VgInfo::new("vg0", json_format()),
            VgStatus::empty(),
            None,
            "host-a",
        );
        // Existing primary has a foreign creation host.
        reg.vginfo_mut(foreign).unwrap().creation_host = Some("host-b".into());

        let local = reg.insert_vginfo(
            VgInfo::new("vg0", json_format()),
            VgStatus::empty(),
            Some("host-a"),
            "host-a",
        );
        assert_eq!(reg.vginfo_by_name("vg0", None), Some(local));
    }

    #[test]
    fn orphans_enumerate_last_and_are_internal() {
        let mut reg = Registry::new();
        let orphan = reg.insert_vginfo(
            VgInfo::new("#orphans_text", json_format()),
            VgStatus::empty(),
            None,
            "h",
        );
        reg.update_vgid(orphan, VgId::from_name("#orphans_text"));
        let real = reg.insert_vginfo(
            VgInfo::new("vg0", json_format()),
            VgStatus::empty(),
            None,
            "h",
        );
        reg.update_vgid(real, VgId::from_name("g1"));

        assert_eq!(reg.vgnames(true), vec!["vg0", "#orphans_text"]);
        assert_eq!(reg.vgnames(false), vec!["vg0"]);
        assert_eq!(reg.vginfo_count(false), 1);
        assert_eq!(reg.vginfo_count(true), 2);
    }

    #[test]
    fn del_info_frees_emptied_vginfo_but_not_orphans() {
        let (mut reg, ih, vgh) = seeded();
        reg.del_info(ih);
        assert!(reg.vginfo(vgh).is_none());
        assert_eq!(reg.vginfo_by_name("vg0", None), None);

        let orphan = reg.insert_vginfo(
            VgInfo::new("#orphans_text", json_format()),
            VgStatus::empty(),
            None,
            "h",
        );
        let ih2 = reg.create_info(PvInfo::new(
            labeller(),
            dev("/dev/sdb", DevNum::new(8, 16), 2048),
            PvId::from_name("p2"),
        ));
        reg.reindex_pvid(ih2, PvId::from_name("p2"));
        reg.attach_info(orphan, ih2);
        reg.del_info(ih2);
        assert!(reg.vginfo(orphan).is_some());
    }

    #[test]
    fn max_name_lengths_cover_all_members() {
        let (mut reg, _, vgh) = seeded();
        let ih2 = reg.create_info(PvInfo::new(
            labeller(),
            dev("/dev/very/long/device/path", DevNum::new(8, 32), 2048),
            PvId::from_name("p3"),
        ));
        reg.reindex_pvid(ih2, PvId::from_name("p3"));
        reg.attach_info(vgh, ih2);
        let (pv_max, vg_max) = reg.max_name_lengths();
        assert_eq!(pv_max, "/dev/very/long/device/path".len());
        assert_eq!(vg_max, 3);
    }
}
