//! Lock registry with alphabetical ordering discipline.
//!
//! Keys are VG names. `VG_GLOBAL` orders before everything, orphan names
//! alias to `VG_ORPHANS` and order after everything; two VG locks taken by
//! one command must otherwise be acquired in lexicographic order or the
//! second acquisition fails with a deadlock-class error.

use std::collections::BTreeSet;

use tracing::error;

use vgcache_error::{CacheError, Result};
use vgcache_types::{is_global_vg, is_orphan_vg, InfoStatus, VG_GLOBAL, VG_ORPHANS};

use crate::context::CommandContext;
use crate::Cache;

/// True when `a` may be locked before `b`.
#[must_use]
pub fn precedes(a: &str, b: &str) -> bool {
    if is_global_vg(a) {
        return true;
    }
    if is_global_vg(b) {
        return false;
    }
    if is_orphan_vg(a) {
        return false;
    }
    if is_orphan_vg(b) {
        return true;
    }
    a < b
}

#[derive(Debug, Default)]
pub(crate) struct LockRegistry {
    held: BTreeSet<String>,
    vgs_locked: u32,
    suppress_ordering: bool,
}

impl LockRegistry {
    pub(crate) fn reset_count(&mut self) {
        self.vgs_locked = 0;
    }

    pub(crate) fn set_suppress_ordering(&mut self, suppress: bool) {
        self.suppress_ordering = suppress;
    }

    pub(crate) fn is_locked(&self, vgname: &str) -> bool {
        let key = if is_orphan_vg(vgname) {
            VG_ORPHANS
        } else {
            vgname
        };
        self.held.contains(key)
    }

    pub(crate) fn holds_exact(&self, vgname: &str) -> bool {
        self.held.contains(vgname)
    }

    pub(crate) fn verify_order(&self, vgname: &str) -> Result<()> {
        if self.suppress_ordering {
            return Ok(());
        }
        for held in &self.held {
            if !precedes(held, vgname) {
                error!(
                    requested = vgname,
                    held = held.as_str(),
                    "internal: VG lock requested out of order"
                );
                return Err(CacheError::LockOrderViolation {
                    requested: vgname.to_string(),
                    held: held.clone(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn insert(&mut self, vgname: &str) {
        self.held.insert(vgname.to_string());
    }

    pub(crate) fn remove(&mut self, vgname: &str) {
        self.held.remove(vgname);
    }

    pub(crate) fn held_names(&self) -> impl Iterator<Item = &str> {
        self.held.iter().map(String::as_str)
    }

    pub(crate) fn clear(&mut self) {
        self.held.clear();
        self.vgs_locked = 0;
    }

    pub(crate) fn vgs_locked(&self) -> u32 {
        self.vgs_locked
    }

    pub(crate) fn inc_locked(&mut self) {
        self.vgs_locked += 1;
    }

    /// Decrement the per-command VG lock count; true when it reached zero.
    pub(crate) fn dec_locked(&mut self) -> bool {
        self.vgs_locked = self.vgs_locked.saturating_sub(1);
        self.vgs_locked == 0
    }
}

impl Cache {
    /// Record a VG lock acquisition. The requested name must order after
    /// every lock already held; nested locking is a programming error.
    /// Non-global locks propagate `CACHE_LOCKED` to the VG's member infos.
    pub fn lock_vgname(&mut self, vgname: &str) -> Result<()> {
        if self.locks.holds_exact(vgname) {
            error!(vg = vgname, "internal: nested locking attempted on VG");
            return Err(CacheError::NestedLock {
                vg: vgname.to_string(),
            });
        }

        self.locks.verify_order(vgname)?;

        self.locks.insert(vgname);

        if !is_global_vg(vgname) {
            self.update_vg_lock_state(vgname, true);
            self.locks.inc_locked();
        }
        Ok(())
    }

    /// Record a VG lock release. Releasing the last VG lock of the command
    /// bumps the device-size seqno, invalidating externally cached sizes.
    pub fn unlock_vgname(&mut self, cmd: &mut CommandContext, vgname: &str) -> Result<()> {
        if !self.locks.holds_exact(vgname) {
            error!(vg = vgname, "internal: attempt to unlock unlocked VG");
            return Err(CacheError::UnlockNotLocked {
                vg: vgname.to_string(),
            });
        }

        if !is_global_vg(vgname) {
            self.update_vg_lock_state(vgname, false);
        }

        self.locks.remove(vgname);

        if !is_global_vg(vgname) && self.locks.dec_locked() {
            cmd.bump_dev_size_seqno();
        }
        Ok(())
    }

    /// Orphan-aliased lock query.
    #[must_use]
    pub fn vgname_is_locked(&self, vgname: &str) -> bool {
        self.locks.is_locked(vgname)
    }

    /// Number of VG locks (the global lock not counted) currently held.
    #[must_use]
    pub fn vgs_locked(&self) -> u32 {
        self.locks.vgs_locked()
    }

    /// Check a prospective lock against the ordering discipline without
    /// taking it.
    pub fn verify_lock_order(&self, vgname: &str) -> Result<()> {
        self.locks.verify_order(vgname)
    }

    /// Enable or disable lock-order verification.
    pub fn set_lock_ordering(&mut self, enable: bool) {
        self.locks.set_suppress_ordering(!enable);
    }

    pub(crate) fn update_vg_lock_state(&mut self, vgname: &str, locked: bool) {
        let Some(vgh) = self.registry.vginfo_by_name(vgname, None) else {
            return;
        };
        self.set_vg_lock_state(vgh, locked);
    }

    pub(crate) fn set_vg_lock_state(&mut self, vgh: crate::registry::VgHandle, locked: bool) {
        let members = match self.registry.vginfo(vgh) {
            Some(v) => v.infos().to_vec(),
            None => return,
        };
        for ih in members {
            if let Some(info) = self.registry.info_mut(ih) {
                if locked {
                    info.status |= InfoStatus::CACHE_LOCKED;
                } else {
                    info.status &= !InfoStatus::CACHE_LOCKED;
                }
            }
        }
    }

    pub(crate) fn report_leaked_locks_at_destroy(
        &self,
        cmd: &mut CommandContext,
        reset: bool,
    ) {
        if reset {
            cmd.global_lock_held = false;
            return;
        }
        for name in self.locks.held_names() {
            if name == VG_GLOBAL {
                cmd.global_lock_held = true;
            } else {
                error!(vg = name, "internal: volume group was not unlocked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_precedes_everything() {
        assert!(precedes(VG_GLOBAL, "a"));
        assert!(precedes(VG_GLOBAL, VG_ORPHANS));
        assert!(!precedes("a", VG_GLOBAL));
        assert!(!precedes(VG_ORPHANS, VG_GLOBAL));
    }

    #[test]
    fn orphans_follow_everything() {
        assert!(precedes("zz", VG_ORPHANS));
        assert!(precedes("zz", "#orphans_text"));
        assert!(!precedes(VG_ORPHANS, "a"));
        assert!(!precedes("#orphans_text", "#orphans_other"));
    }

    #[test]
    fn names_order_lexicographically() {
        assert!(precedes("a", "b"));
        assert!(!precedes("b", "a"));
        assert!(!precedes("a", "a"));
    }

    #[test]
    fn verify_order_checks_all_held() {
        let mut locks = LockRegistry::default();
        locks.insert("m");
        assert!(locks.verify_order("n").is_ok());
        assert_eq!(
            locks.verify_order("a"),
            Err(CacheError::LockOrderViolation {
                requested: "a".into(),
                held: "m".into(),
            })
        );

        locks.set_suppress_ordering(true);
        assert!(locks.verify_order("a").is_ok());
    }

    #[test]
    fn orphan_alias_lookup() {
        let mut locks = LockRegistry::default();
        locks.insert(VG_ORPHANS);
        assert!(locks.is_locked(VG_ORPHANS));
        assert!(locks.is_locked("#orphans_vg_xyz"));
        assert!(!locks.is_locked("vg0"));
    }
}
