//! Saved-VG buffer for the clustered resume path.
//!
//! Between suspend and resume the devices are unreadable, so the cluster
//! daemon keeps both the pre-commit (`new`) and committed (`old`) parsed
//! metadata per VG. Snapshots are independent deep copies taken through the
//! format layer's export/import round-trip. A displaced snapshot is not
//! dropped immediately: it is retired to a deferred-free queue so callers
//! still holding it stay safe until the next free cycle.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use vgcache_error::Result;
use vgcache_types::{is_orphan_vg, VgId, VolumeGroup, VG_GLOBAL};

use crate::context::CommandContext;
use crate::format::FormatHandle;
use crate::Cache;

/// Per-VG snapshot slots.
#[derive(Debug, Default)]
pub(crate) struct SavedVg {
    committed: bool,
    old: Option<Arc<VolumeGroup>>,
    new: Option<Arc<VolumeGroup>>,
    to_free: Vec<Arc<VolumeGroup>>,
}

impl SavedVg {
    /// Retire the selected slots to the deferred-free queue.
    fn inval(&mut self, inval_old: bool, inval_new: bool) {
        if inval_old {
            if let Some(vg) = self.old.take() {
                debug!(vg = vg.name.as_str(), seqno = vg.seqno, "inval saved_vg old");
                self.to_free.push(vg);
            }
        }
        if inval_new {
            if let Some(vg) = self.new.take() {
                debug!(vg = vg.name.as_str(), seqno = vg.seqno, "inval saved_vg new");
                self.to_free.push(vg);
            }
        }
    }

    /// Actually release slots; releasing `old` also drains the deferred
    /// queue (the free cycle).
    fn free(&mut self, free_old: bool, free_new: bool) {
        if free_old {
            if let Some(vg) = self.old.take() {
                debug!(vg = vg.name.as_str(), seqno = vg.seqno, "free saved_vg old");
            }
            for vg in self.to_free.drain(..) {
                debug!(vg = vg.name.as_str(), seqno = vg.seqno, "free saved_vg deferred");
            }
        }
        if free_new {
            if let Some(vg) = self.new.take() {
                debug!(vg = vg.name.as_str(), seqno = vg.seqno, "free saved_vg new");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn deferred(&self) -> &[Arc<VolumeGroup>] {
        &self.to_free
    }
}

#[derive(Debug, Default)]
pub(crate) struct SavedVgs {
    map: HashMap<VgId, SavedVg>,
}

impl SavedVgs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, vgid: &VgId) -> Option<&mut SavedVg> {
        let svg = self.map.get_mut(vgid);
        if svg.is_none() {
            debug!(vgid = %vgid, "no saved_vg for vgid");
        }
        svg
    }

    pub(crate) fn clear(&mut self) {
        for svg in self.map.values_mut() {
            svg.free(true, true);
        }
        self.map.clear();
    }

    #[cfg(test)]
    pub(crate) fn get_raw(&self, vgid: &VgId) -> Option<&SavedVg> {
        self.map.get(vgid)
    }
}

impl Cache {
    /// Snapshot `vg` into the old (committed) or new (pre-commit) slot.
    ///
    /// A slot already holding the same seqno is left untouched; otherwise
    /// the displaced snapshot is retired and an independent copy of `vg` is
    /// stored via the format round-trip. Does nothing outside the cluster
    /// daemon.
    pub fn save_vg(&mut self, cmd: &CommandContext, vg: &VolumeGroup, precommitted: bool) -> Result<()> {
        let fmt = self.format_for_vg(cmd, vg);
        let Some(saved) = self.saved.as_mut() else {
            return Ok(());
        };

        let new = precommitted;
        let old = !precommitted;

        let svg = saved.map.entry(vg.id).or_default();

        if old {
            if let Some(cur) = &svg.old {
                if cur.seqno == vg.seqno {
                    return Ok(());
                }
            }
        }
        if new {
            if let Some(cur) = &svg.new {
                if cur.seqno == vg.seqno {
                    return Ok(());
                }
            }
        }

        svg.inval(old, new);

        let copy = match deep_copy(fmt.as_deref(), vg) {
            Ok(copy) => copy,
            Err(e) => {
                debug!(vg = vg.name.as_str(), precommitted, "failed to save vg");
                return Err(e);
            }
        };

        let copy = Arc::new(copy);
        if old {
            debug!(vg = copy.name.as_str(), seqno = copy.seqno, "saved old vg");
            svg.old = Some(copy);
        } else {
            debug!(vg = copy.name.as_str(), seqno = copy.seqno, "saved pre vg");
            svg.new = Some(copy);
        }
        Ok(())
    }

    /// Fetch the requested side. Returning `new` retires a stale `old`
    /// (strictly smaller seqno) eagerly, and from then on `new` satisfies
    /// requests for `old` too: once used, the pre-commit snapshot is both
    /// old and new.
    pub fn get_saved_vg(&mut self, vgid: &VgId, precommitted: bool) -> Option<Arc<VolumeGroup>> {
        let saved = self.saved.as_mut()?;
        let svg = saved.slot(vgid)?;

        if precommitted {
            let vg = svg.new.clone();
            match &vg {
                Some(vg) => {
                    let stale = svg.old.as_ref().is_some_and(|old| old.seqno < vg.seqno);
                    if stale {
                        svg.inval(true, false);
                    }
                }
                None => {
                    if let Some(old) = &svg.old {
                        warn!(
                            seqno = old.seqno,
                            vg = old.name.as_str(),
                            "wanted new saved vg but only have old"
                        );
                    }
                    debug!(vgid = %vgid, precommitted, "no saved vg");
                }
            }
            vg
        } else {
            if let Some(old) = svg.old.clone() {
                return Some(old);
            }
            if let Some(new) = svg.new.clone() {
                warn!(
                    seqno = new.seqno,
                    vg = new.name.as_str(),
                    "wanted old saved vg but only have new"
                );
                return Some(new);
            }
            debug!(vgid = %vgid, precommitted, "no saved vg");
            None
        }
    }

    /// The committed side when the commit flag is set, the old side
    /// otherwise, with the same eager retirement of a stale `old`.
    pub fn get_saved_vg_latest(&mut self, vgid: &VgId) -> Option<Arc<VolumeGroup>> {
        let saved = self.saved.as_mut()?;
        let svg = saved.slot(vgid)?;

        if svg.committed {
            let vg = svg.new.clone();
            if let Some(vg) = &vg {
                let stale = svg
                    .old
                    .as_ref()
                    .is_some_and(|old| old.seqno < vg.seqno);
                if stale {
                    svg.inval(true, false);
                }
            } else {
                debug!(vgid = %vgid, "no saved vg latest");
            }
            vg
        } else {
            let vg = svg.old.clone();
            if vg.is_none() {
                debug!(vgid = %vgid, "no saved vg latest");
            }
            vg
        }
    }

    /// Promote the pre-commit snapshot: after this, `get_latest` serves the
    /// new side. No snapshot moves.
    pub fn commit_metadata(&mut self, vgname: &str) {
        let Some(vgh) = self.registry.vginfo_by_name(vgname, None) else {
            return;
        };
        let vgid = match self.registry.vginfo(vgh) {
            Some(v) => v.vgid(),
            None => return,
        };
        if let Some(saved) = self.saved.as_mut() {
            if let Some(svg) = saved.map.get_mut(&vgid) {
                svg.committed = true;
            }
        }
    }

    /// Free saved metadata by VG name. With `drop_precommitted` only the
    /// pre-commit side goes; the orphan name is a wildcard meaning both.
    /// A held global lock means a suspend window is open and nothing is
    /// dropped.
    pub fn drop_metadata(&mut self, vgname: &str, drop_precommitted: bool) {
        if self.saved.is_none() {
            return;
        }
        if self.locks.is_locked(VG_GLOBAL) {
            return;
        }

        let drop_precommitted = !is_orphan_vg(vgname) && drop_precommitted;
        let Some(vgh) = self.registry.vginfo_by_name(vgname, None) else {
            return;
        };
        let vgid = match self.registry.vginfo(vgh) {
            Some(v) => v.vgid(),
            None => return,
        };
        if let Some(saved) = self.saved.as_mut() {
            if let Some(svg) = saved.map.get_mut(&vgid) {
                if drop_precommitted {
                    svg.free(false, true);
                } else {
                    svg.free(true, true);
                }
            }
        }
    }

    /// Retire both slots for a VG id.
    pub fn drop_saved_vgid(&mut self, vgid: &VgId) {
        if let Some(saved) = self.saved.as_mut() {
            if let Some(svg) = saved.map.get_mut(vgid) {
                svg.inval(true, true);
            }
        }
    }

    /// The format used for the deep copy: the cached VGInfo's when the VG
    /// is known, the first registered format otherwise.
    fn format_for_vg(&self, cmd: &CommandContext, vg: &VolumeGroup) -> Option<FormatHandle> {
        self.registry
            .vginfo_by_vgid(&vg.id)
            .and_then(|h| self.registry.vginfo(h))
            .map(|v| v.fmt().clone())
            .or_else(|| cmd.formats().first().cloned())
    }

    #[cfg(test)]
    pub(crate) fn saved_deferred_count(&self, vgid: &VgId) -> usize {
        self.saved
            .as_ref()
            .and_then(|s| s.get_raw(vgid))
            .map_or(0, |svg| svg.deferred().len())
    }
}

/// Independent deep copy through the format layer's text round-trip.
fn deep_copy(fmt: Option<&dyn crate::format::MetadataFormat>, vg: &VolumeGroup) -> Result<VolumeGroup> {
    let Some(fmt) = fmt else {
        return Err(vgcache_error::CacheError::Export {
            vg: vg.name.clone(),
            detail: "no metadata format registered".to_string(),
        });
    };
    let text = fmt.export_vg(vg)?;
    fmt.import_vg(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CommandContext;
    use crate::testutil::{json_format, new_cluster_cmd};
    use vgcache_types::{DevTypes, VgId};

    fn vg(seqno: u32) -> VolumeGroup {
        VolumeGroup::new(VgId::from_name("g1"), "vg0", seqno)
    }

    fn cluster_cache() -> (CommandContext, Cache) {
        let mut cmd = new_cluster_cmd();
        let cache = Cache::new(&mut cmd);
        (cmd, cache)
    }

    #[test]
    fn save_outside_cluster_daemon_is_a_no_op() {
        let mut cmd = CommandContext::new("h", DevTypes::default());
        cmd.register_format(json_format());
        let mut cache = Cache::new(&mut cmd);
        cache.save_vg(&cmd, &vg(1), false).unwrap();
        assert!(cache.get_saved_vg(&VgId::from_name("g1"), false).is_none());
    }

    #[test]
    fn save_and_get_round_trip() {
        let (cmd, mut cache) = cluster_cache();
        let v = vg(4);
        cache.save_vg(&cmd, &v, false).unwrap();
        let got = cache.get_saved_vg(&VgId::from_name("g1"), false).unwrap();
        assert_eq!(got.seqno, 4);
        assert_eq!(*got, v);
    }

    #[test]
    fn same_seqno_save_is_idempotent() {
        let (cmd, mut cache) = cluster_cache();
        cache.save_vg(&cmd, &vg(4), false).unwrap();
        let first = cache.get_saved_vg(&VgId::from_name("g1"), false).unwrap();
        cache.save_vg(&cmd, &vg(4), false).unwrap();
        let second = cache.get_saved_vg(&VgId::from_name("g1"), false).unwrap();
        // Same snapshot object: nothing was invalidated or reallocated.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.saved_deferred_count(&VgId::from_name("g1")), 0);
    }

    #[test]
    fn displaced_snapshot_is_deferred_not_dropped() {
        let (cmd, mut cache) = cluster_cache();
        cache.save_vg(&cmd, &vg(4), false).unwrap();
        cache.save_vg(&cmd, &vg(5), false).unwrap();
        assert_eq!(cache.saved_deferred_count(&VgId::from_name("g1")), 1);
        let got = cache.get_saved_vg(&VgId::from_name("g1"), false).unwrap();
        assert_eq!(got.seqno, 5);
    }

    #[test]
    fn missing_new_returns_none_but_missing_old_promotes() {
        let (cmd, mut cache) = cluster_cache();
        cache.save_vg(&cmd, &vg(4), false).unwrap();
        // Only old present: a request for new stays unanswered.
        assert!(cache.get_saved_vg(&VgId::from_name("g1"), true).is_none());

        cache.drop_saved_vgid(&VgId::from_name("g1"));
        cache.save_vg(&cmd, &vg(5), true).unwrap();
        // Only new present: a request for old is served by new.
        let got = cache.get_saved_vg(&VgId::from_name("g1"), false).unwrap();
        assert_eq!(got.seqno, 5);
    }

    #[test]
    fn returning_new_retires_stale_old() {
        let (cmd, mut cache) = cluster_cache();
        cache.save_vg(&cmd, &vg(4), false).unwrap();
        cache.save_vg(&cmd, &vg(5), true).unwrap();
        let got = cache.get_saved_vg(&VgId::from_name("g1"), true).unwrap();
        assert_eq!(got.seqno, 5);
        // The stale old snapshot moved to the deferred queue; from now on
        // the pre-commit snapshot serves the old side too.
        assert_eq!(cache.saved_deferred_count(&VgId::from_name("g1")), 1);
        let old_side = cache.get_saved_vg(&VgId::from_name("g1"), false).unwrap();
        assert_eq!(old_side.seqno, 5);
    }

    #[test]
    fn drop_by_vgid_retires_both_sides() {
        let (cmd, mut cache) = cluster_cache();
        cache.save_vg(&cmd, &vg(4), false).unwrap();
        cache.save_vg(&cmd, &vg(5), true).unwrap();
        cache.drop_saved_vgid(&VgId::from_name("g1"));
        assert!(cache.get_saved_vg(&VgId::from_name("g1"), false).is_none());
        assert!(cache.get_saved_vg(&VgId::from_name("g1"), true).is_none());
        assert_eq!(cache.saved_deferred_count(&VgId::from_name("g1")), 2);
    }
}
