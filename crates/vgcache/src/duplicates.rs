//! Duplicate-PV resolution.
//!
//! Multipath, clones, and stacked device-mapper targets all present the
//! same PV id on more than one device. During a scan the extra sightings
//! are parked on `found_duplicates`; after the scan [`Cache::resolve_duplicates`]
//! picks one preferred device per PV id with a fixed priority ladder and
//! parks everything else on `unused_duplicates`, which also makes the same
//! choice sticky across cache rebuilds within one command.

use tracing::{debug, warn};

use vgcache_types::{Device, DeviceHandle, DevFlags, PvId, VolumeGroup, SECTOR_SHIFT};

use crate::context::CommandContext;
use crate::Cache;

/// One parked duplicate sighting.
#[derive(Debug, Clone)]
pub(crate) struct DupEntry {
    pub pvid: PvId,
    pub dev: DeviceHandle,
}

// ---------------------------------------------------------------------------
// Priority ladder
// ---------------------------------------------------------------------------

/// Verdict of one ladder rung comparing the current winner against a
/// candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Keep,
    Switch,
    Neither,
}

/// Facts about one device that the ladder consults.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DevFacts {
    pub(crate) prev_unchosen: bool,
    pub(crate) used_for_lv: bool,
    pub(crate) size_correct: bool,
    pub(crate) has_fs: bool,
    pub(crate) is_dm: bool,
    pub(crate) in_subsystem: bool,
}

/// The device that has the property wins.
fn prefer_having(a: bool, b: bool) -> Verdict {
    match (a, b) {
        (true, false) => Verdict::Keep,
        (false, true) => Verdict::Switch,
        _ => Verdict::Neither,
    }
}

/// The device that lacks the property wins (being previously unchosen is an
/// un-preference).
fn prefer_lacking(a: bool, b: bool) -> Verdict {
    prefer_having(b, a)
}

/// Ordered rungs; the first non-neutral verdict decides. Extending the
/// policy means adding a rung.
const LADDER: &[(&str, fn(&DevFacts, &DevFacts) -> Verdict)] = &[
    ("of previous preference", |a, b| {
        prefer_lacking(a.prev_unchosen, b.prev_unchosen)
    }),
    ("device is used by LV", |a, b| {
        prefer_having(a.used_for_lv, b.used_for_lv)
    }),
    ("device size is correct", |a, b| {
        prefer_having(a.size_correct, b.size_correct)
    }),
    ("device has fs mounted", |a, b| {
        prefer_having(a.has_fs, b.has_fs)
    }),
    ("device is in dm subsystem", |a, b| {
        prefer_having(a.is_dm, b.is_dm)
    }),
    ("device is in subsystem", |a, b| {
        prefer_having(a.in_subsystem, b.in_subsystem)
    }),
];

/// Run the ladder. Returns whether to switch to the candidate, and the
/// reason that decided it.
pub(crate) fn choose(winner: &DevFacts, candidate: &DevFacts) -> (bool, &'static str) {
    for (reason, rung) in LADDER.iter().copied() {
        match rung(winner, candidate) {
            Verdict::Keep => return (false, reason),
            Verdict::Switch => return (true, reason),
            Verdict::Neither => {}
        }
    }
    (false, "device was seen first")
}

// ---------------------------------------------------------------------------
// Cache operations
// ---------------------------------------------------------------------------

impl Cache {
    /// True once any duplicate PV has been seen by this cache; lets
    /// commands skip duplicate searches entirely on clean hosts.
    #[must_use]
    pub fn found_duplicate_pvs(&self) -> bool {
        self.found_duplicate_pvs
    }

    /// Devices that lost duplicate resolution and are not referenced by the
    /// registry.
    #[must_use]
    pub fn unused_duplicate_devs(&self) -> Vec<DeviceHandle> {
        self.unused_duplicates.iter().map(|e| e.dev.clone()).collect()
    }

    #[must_use]
    pub fn dev_is_unchosen_duplicate(&self, dev: &Device) -> bool {
        dev_in_list(&self.unused_duplicates, dev)
    }

    #[must_use]
    pub fn pvid_in_unchosen_duplicates(&self, pvid: &PvId) -> bool {
        self.unused_duplicates.iter().any(|e| e.pvid == *pvid)
    }

    /// Forget one unchosen duplicate, lifting the restrictions tied to it.
    pub fn remove_unchosen_duplicate(&mut self, dev: &Device) {
        if let Some(at) = self
            .unused_duplicates
            .iter()
            .position(|e| e.dev.same_device(dev))
        {
            self.unused_duplicates.remove(at);
        }
    }

    /// True iff any PV of `vg` shares its PV id with an unchosen duplicate.
    #[must_use]
    pub fn vg_has_duplicate_pvs(&self, vg: &VolumeGroup) -> bool {
        vg.pvs
            .iter()
            .any(|pv| self.unused_duplicates.iter().any(|e| e.pvid == pv.id))
    }

    /// Apply the priority ladder to every duplicate group found by the
    /// scan. Returns the registry devices to drop and the preferred devices
    /// to rescan; `unused_duplicates` is replaced with the losers.
    pub(crate) fn resolve_duplicates(
        &mut self,
        cmd: &CommandContext,
    ) -> (Vec<DupEntry>, Vec<DupEntry>) {
        let mut remaining = std::mem::take(&mut self.found_duplicates);
        let mut new_unused: Vec<DupEntry> = Vec::new();
        let mut del: Vec<DupEntry> = Vec::new();
        let mut add: Vec<DupEntry> = Vec::new();

        loop {
            let Some(pvid) = remaining.first().map(|e| e.pvid) else {
                break;
            };
            let (group, rest): (Vec<DupEntry>, Vec<DupEntry>) =
                remaining.into_iter().partition(|e| e.pvid == pvid);
            remaining = rest;

            let Some(cur_h) = self.registry.info_by_pvid(&pvid, None) else {
                warn!(pvid = %pvid, dev = group[0].dev.name(),
                    "PV on duplicate device not found in cache");
                continue;
            };
            let info = self.registry.info(cur_h).expect("indexed info is live");
            let current = info.device().clone();
            let cached_sectors = info.device_size() >> SECTOR_SHIFT;

            let mut winner = current.clone();
            let mut winner_entry: Option<DupEntry> = None;
            let mut losers: Vec<DupEntry> = Vec::new();

            for cand in group {
                if cand.dev.same_device(&current) {
                    warn!(dev = current.name(), "same duplicate device repeated");
                    continue;
                }

                // Sticky unpreference: consult the live unused list first,
                // then the carryover saved on the command across rebuilds.
                let mut prev1 = dev_in_list(&self.unused_duplicates, &winner);
                let mut prev2 = dev_in_list(&self.unused_duplicates, &cand.dev);
                if !prev1 && !prev2 {
                    prev1 = cmd.carried_contains(&winner);
                    prev2 = cmd.carried_contains(&cand.dev);
                }

                let facts1 = dev_facts(cmd, &winner, cached_sectors, prev1);
                let facts2 = dev_facts(cmd, &cand.dev, cached_sectors, prev2);
                let (switch, reason) = choose(&facts1, &facts2);
                if switch {
                    winner = cand.dev.clone();
                    if let Some(prev) = winner_entry.take() {
                        losers.push(prev);
                    }
                    winner_entry = Some(cand);
                } else {
                    losers.push(cand);
                }
                warn!(
                    pvid = %pvid,
                    dev = winner.name(),
                    reason,
                    "PV prefers device"
                );
            }

            if let Some(entry) = winner_entry {
                debug!(
                    pvid = %pvid,
                    to = entry.dev.name(),
                    from = current.name(),
                    "switching to preferred duplicate device"
                );
                del.push(DupEntry {
                    pvid,
                    dev: current,
                });
                add.push(entry);
            } else {
                debug!(pvid = %pvid, dev = current.name(), "keeping current device");
            }

            new_unused.extend(losers);
        }

        self.unused_duplicates = new_unused;
        (del, add)
    }

    /// Drop MD components from the unused list: such a device is a leg of a
    /// software RAID and must not be exposed as a duplicate PV.
    pub(crate) fn filter_md_component_duplicates(&mut self, cmd: &CommandContext) {
        let dt = cmd.dev_types();
        self.unused_duplicates.retain(|e| {
            if dt.is_md_major(e.dev.devno().major) {
                debug!(dev = e.dev.name(), "ignoring md component duplicate");
                false
            } else {
                true
            }
        });
    }

    pub(crate) fn destroy_duplicate_lists(&mut self, cmd: &mut CommandContext) {
        cmd.unused_duplicate_devs = std::mem::take(&mut self.unused_duplicates);
        self.found_duplicates.clear();
        self.found_duplicate_pvs = false;
    }
}

fn dev_in_list(list: &[DupEntry], dev: &Device) -> bool {
    list.iter().any(|e| e.dev.same_device(dev))
}

fn dev_facts(
    cmd: &CommandContext,
    dev: &DeviceHandle,
    cached_sectors: u64,
    prev_unchosen: bool,
) -> DevFacts {
    let dt = cmd.dev_types();
    let major = dev.devno().major;
    DevFacts {
        prev_unchosen,
        used_for_lv: dev.flags().contains(DevFlags::USED_FOR_LV),
        size_correct: dev.size_sectors() == cached_sectors,
        has_fs: dev.has_mounted_fs(),
        is_dm: dt.is_dm_major(major),
        in_subsystem: dt.is_subsystem_major(major),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> DevFacts {
        DevFacts {
            prev_unchosen: false,
            used_for_lv: false,
            size_correct: false,
            has_fs: false,
            is_dm: false,
            in_subsystem: false,
        }
    }

    #[test]
    fn first_rung_dominates_later_rungs() {
        // Candidate is used by an LV, but the winner was never unchosen and
        // the candidate was: stickiness wins.
        let winner = facts();
        let candidate = DevFacts {
            prev_unchosen: true,
            used_for_lv: true,
            ..facts()
        };
        let (switch, reason) = choose(&winner, &candidate);
        assert!(!switch);
        assert_eq!(reason, "of previous preference");
    }

    #[test]
    fn unchosen_winner_loses_to_fresh_candidate() {
        let winner = DevFacts {
            prev_unchosen: true,
            ..facts()
        };
        let (switch, reason) = choose(&winner, &facts());
        assert!(switch);
        assert_eq!(reason, "of previous preference");
    }

    #[test]
    fn ladder_order_lv_size_fs_dm_subsystem() {
        let mut w = facts();
        let mut c = facts();

        c.used_for_lv = true;
        assert_eq!(choose(&w, &c), (true, "device is used by LV"));

        c.used_for_lv = false;
        w.size_correct = true;
        assert_eq!(choose(&w, &c), (false, "device size is correct"));

        w.size_correct = false;
        c.has_fs = true;
        assert_eq!(choose(&w, &c), (true, "device has fs mounted"));

        c.has_fs = false;
        w.is_dm = true;
        assert_eq!(choose(&w, &c), (false, "device is in dm subsystem"));

        w.is_dm = false;
        c.in_subsystem = true;
        assert_eq!(choose(&w, &c), (true, "device is in subsystem"));
    }

    #[test]
    fn all_neutral_keeps_first_seen() {
        assert_eq!(choose(&facts(), &facts()), (false, "device was seen first"));
    }

    #[test]
    fn ladder_is_antisymmetric() {
        // For every single-fact difference, swapping the operands flips the
        // verdict but never the reason.
        let deltas: &[fn(&mut DevFacts)] = &[
            |f| f.prev_unchosen = true,
            |f| f.used_for_lv = true,
            |f| f.size_correct = true,
            |f| f.has_fs = true,
            |f| f.is_dm = true,
            |f| f.in_subsystem = true,
        ];
        for delta in deltas {
            let a = facts();
            let mut b = facts();
            delta(&mut b);
            let (s1, r1) = choose(&a, &b);
            let (s2, r2) = choose(&b, &a);
            assert_ne!(s1, s2);
            assert_eq!(r1, r2);
        }
    }
}
