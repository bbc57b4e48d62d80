//! Primary error type for vgcache operations.
//!
//! Lookups that miss are not errors; they return `None`. The variants here
//! cover the conditions that abort an operation: lock-discipline misuse,
//! re-entrant scanning, structural index failures, and collaborator
//! (format-layer) failures. Scan inconsistencies are deliberately absent —
//! they are recorded on the VGInfo and never abort an update.

use thiserror::Error;

/// Error produced by the metadata cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    // === Lock discipline ===
    /// A lock was requested after a lock that must follow it.
    #[error("VG lock {requested} must be requested before {held}, not after")]
    LockOrderViolation { requested: String, held: String },

    /// Nested locking attempted on an already-held name.
    #[error("nested locking attempted on VG {vg}")]
    NestedLock { vg: String },

    /// Unlock of a name that is not locked.
    #[error("attempt to unlock unlocked VG {vg}")]
    UnlockNotLocked { vg: String },

    // === Scanning ===
    /// A scan was requested while another scan is in progress.
    #[error("label scan already in progress")]
    ScanInProgress,

    /// A VG vanished from the cache during a rescan of its devices.
    #[error("VG info not found after rescan of {vg}")]
    RescanLost { vg: String },

    /// A VG named for rescan was not in the cache to begin with.
    #[error("VG {vg} not found in cache for rescan")]
    RescanUnknownVg { vg: String },

    // === Structure ===
    /// An index entry could not be installed; partial state was unwound.
    #[error("cache {index} index insertion failed for {key}")]
    IndexInsert { index: &'static str, key: String },

    // === Collaborators ===
    /// The external metadata format failed to export a VG.
    #[error("metadata export failed for VG {vg}: {detail}")]
    Export { vg: String, detail: String },

    /// The external metadata format failed to re-import exported text.
    #[error("metadata import failed for VG {vg}: {detail}")]
    Import { vg: String, detail: String },
}

/// Result alias used throughout the cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = CacheError::LockOrderViolation {
            requested: "a".into(),
            held: "b".into(),
        };
        assert_eq!(
            err.to_string(),
            "VG lock a must be requested before b, not after"
        );

        let err = CacheError::NestedLock { vg: "vg0".into() };
        assert!(err.to_string().contains("vg0"));
    }
}
