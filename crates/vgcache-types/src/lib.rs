//! Shared vocabulary for the vgcache metadata cache.
//!
//! Everything here is plain data: identifiers, device descriptions, status
//! flag words, the per-device scan summary, and the parsed volume-group
//! metadata object. The cache core and its collaborators (label reader,
//! device cache, format layer) all speak these types; none of them carry
//! behavior beyond construction, display, and trivial queries.

pub mod device;
pub mod flags;
pub mod metadata;
pub mod summary;

pub use device::{DevNum, DevTypes, Device, DeviceHandle};
pub use flags::{DevFlags, InfoStatus, VgStatus};
pub use metadata::{DiskArea, Mda, PhysicalVolume, VgPv, VolumeGroup};
pub use summary::VgSummary;

use std::fmt;

/// Length in bytes of a PV or VG identifier.
pub const ID_LEN: usize = 16;

/// Shift converting sectors to bytes.
pub const SECTOR_SHIFT: u64 = 9;

/// Reserved lock name that orders before every VG name.
pub const VG_GLOBAL: &str = "#global";

/// Reserved lock name that orders after every VG name. Every orphan VG name
/// aliases to this in lock queries.
pub const VG_ORPHANS: &str = "#orphans";

/// True for the orphan sentinel and any format-specific orphan VG name
/// (`#orphans_<fmt>`). The empty string also denotes the orphan VG.
#[must_use]
pub fn is_orphan_vg(vgname: &str) -> bool {
    vgname.is_empty() || vgname.starts_with(VG_ORPHANS)
}

/// True only for the reserved global lock name.
#[must_use]
pub fn is_global_vg(vgname: &str) -> bool {
    vgname == VG_GLOBAL
}

// ---------------------------------------------------------------------------
// PvId / VgId
// ---------------------------------------------------------------------------

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[repr(transparent)]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            /// Construct from raw identifier bytes.
            #[must_use]
            pub const fn new(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            /// Identifier derived from a name: the first [`ID_LEN`] bytes of
            /// the name, zero padded. Orphan VGs use their VG name as their
            /// identifier.
            #[must_use]
            pub fn from_name(name: &str) -> Self {
                let mut bytes = [0_u8; ID_LEN];
                let src = name.as_bytes();
                let n = src.len().min(ID_LEN);
                bytes[..n].copy_from_slice(&src[..n]);
                Self(bytes)
            }

            /// The raw identifier bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            /// Hyphenated UUID-style grouping (6-4-4-4-4-4-6) over the hex
            /// encoding, the form used in user-facing messages.
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut hex = String::with_capacity(ID_LEN * 2);
                for b in &self.0 {
                    hex.push_str(&format!("{b:02x}"));
                }
                let groups = [6_usize, 4, 4, 4, 4, 4, 6];
                let mut at = 0;
                for (i, len) in groups.iter().enumerate() {
                    if i > 0 {
                        f.write_str("-")?;
                    }
                    f.write_str(&hex[at..at + len])?;
                    at += len;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

id_type! {
    /// 16-byte physical-volume identifier.
    PvId
}

id_type! {
    /// 16-byte volume-group identifier.
    VgId
}
