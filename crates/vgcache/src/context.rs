//! Per-command context consulted by the cache.
//!
//! One [`CommandContext`] lives for the duration of a command and outlives
//! any number of cache build/destroy cycles inside it. That is exactly the
//! state that must survive a rebuild: the unchosen-duplicate carryover, the
//! global-lock-held flag, and the device-size seqno.

use std::sync::Arc;

use vgcache_types::{DevTypes, Device, DeviceHandle};

use crate::duplicates::DupEntry;
use crate::format::FormatHandle;

// ---------------------------------------------------------------------------
// CacheConfig
// ---------------------------------------------------------------------------

/// Cache policy knobs. Plain data; whatever configuration file the command
/// layer reads is parsed out there.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Rescan VGs whose metadata came from an independent location (a file
    /// rather than device MDAs). Off by default: such a rescan cannot find
    /// the metadata on the devices and would tear down the device-to-VG
    /// associations built when the independent locations were read.
    pub rescan_independent_metadata: bool,

    /// Start with lock-order verification suppressed.
    pub suppress_lock_ordering: bool,
}

// ---------------------------------------------------------------------------
// CommandContext
// ---------------------------------------------------------------------------

/// State owned by the running command.
#[derive(Debug)]
pub struct CommandContext {
    hostname: String,
    system_id: Option<String>,
    dev_types: DevTypes,
    formats: Vec<FormatHandle>,
    is_cluster_daemon: bool,
    critical_section: bool,
    config: CacheConfig,
    /// Unchosen duplicates saved at cache destroy so the next cache built by
    /// this command makes the same preference choices.
    pub(crate) unused_duplicate_devs: Vec<DupEntry>,
    /// Set when the cache was destroyed with the global lock still held.
    pub(crate) global_lock_held: bool,
    dev_size_seqno: u64,
}

impl CommandContext {
    #[must_use]
    pub fn new(hostname: impl Into<String>, dev_types: DevTypes) -> Self {
        Self {
            hostname: hostname.into(),
            system_id: None,
            dev_types,
            formats: Vec::new(),
            is_cluster_daemon: false,
            critical_section: false,
            config: CacheConfig::default(),
            unused_duplicate_devs: Vec::new(),
            global_lock_held: false,
            dev_size_seqno: 0,
        }
    }

    #[must_use]
    pub fn with_system_id(mut self, system_id: impl Into<String>) -> Self {
        self.system_id = Some(system_id.into());
        self
    }

    #[must_use]
    pub fn with_cluster_daemon(mut self, is_cluster_daemon: bool) -> Self {
        self.is_cluster_daemon = is_cluster_daemon;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a metadata format; orphan VGInfos are re-created per format
    /// when the cache is rebuilt with retained orphans.
    pub fn register_format(&mut self, fmt: FormatHandle) {
        self.formats.push(fmt);
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub fn dev_types(&self) -> &DevTypes {
        &self.dev_types
    }

    #[must_use]
    pub fn formats(&self) -> &[FormatHandle] {
        &self.formats
    }

    #[must_use]
    pub fn is_cluster_daemon(&self) -> bool {
        self.is_cluster_daemon
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut CacheConfig {
        &mut self.config
    }

    /// A critical section covers suspend/resume windows during which PVs
    /// must not be demoted to orphans on the strength of a summary alone.
    #[must_use]
    pub fn in_critical_section(&self) -> bool {
        self.critical_section
    }

    pub fn set_critical_section(&mut self, active: bool) {
        self.critical_section = active;
    }

    /// A VG system-id is allowed here when it is absent or matches ours.
    #[must_use]
    pub fn is_system_id_allowed(&self, system_id: Option<&str>) -> bool {
        match system_id {
            None | Some("") => true,
            Some(id) => self.system_id.as_deref() == Some(id),
        }
    }

    /// Monotonic counter invalidating externally cached device sizes.
    /// Bumped when the last VG lock of a command is released.
    #[must_use]
    pub fn dev_size_seqno(&self) -> u64 {
        self.dev_size_seqno
    }

    pub(crate) fn bump_dev_size_seqno(&mut self) {
        self.dev_size_seqno += 1;
    }

    /// Unchosen duplicates carried over from a destroyed cache.
    pub fn carried_unused_duplicates(&self) -> impl Iterator<Item = &DeviceHandle> {
        self.unused_duplicate_devs.iter().map(|e| &e.dev)
    }

    pub(crate) fn carried_contains(&self, dev: &Device) -> bool {
        self.unused_duplicate_devs
            .iter()
            .any(|e| e.dev.same_device(dev))
    }
}

/// Convenience for building device handles in the command layer and tests.
#[must_use]
pub fn device_handle(dev: Device) -> DeviceHandle {
    Arc::new(dev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vgcache_types::DevNum;

    #[test]
    fn system_id_policy() {
        let cmd = CommandContext::new("host-a", DevTypes::default()).with_system_id("host-a");
        assert!(cmd.is_system_id_allowed(None));
        assert!(cmd.is_system_id_allowed(Some("")));
        assert!(cmd.is_system_id_allowed(Some("host-a")));
        assert!(!cmd.is_system_id_allowed(Some("host-b")));

        let no_id = CommandContext::new("host-a", DevTypes::default());
        assert!(!no_id.is_system_id_allowed(Some("host-a")));
    }

    #[test]
    fn dev_size_seqno_is_monotonic() {
        let mut cmd = CommandContext::new("h", DevTypes::default());
        let before = cmd.dev_size_seqno();
        cmd.bump_dev_size_seqno();
        cmd.bump_dev_size_seqno();
        assert_eq!(cmd.dev_size_seqno(), before + 2);
    }

    #[test]
    fn carried_duplicates_match_by_devno() {
        let mut cmd = CommandContext::new("h", DevTypes::default());
        let dev = device_handle(Device::new("/dev/sda", DevNum::new(8, 0), 100));
        cmd.unused_duplicate_devs.push(DupEntry {
            pvid: vgcache_types::PvId::from_name("p1"),
            dev: dev.clone(),
        });
        let alias = Device::new("/dev/other", DevNum::new(8, 0), 100);
        assert!(cmd.carried_contains(&alias));
        assert!(!cmd.carried_contains(&Device::new("/dev/sdb", DevNum::new(8, 16), 100)));
    }
}
