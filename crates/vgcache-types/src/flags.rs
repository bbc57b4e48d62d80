//! Status flag words.

bitflags::bitflags! {
    /// VG status bits carried in scan summaries and metadata.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
    #[serde(transparent)]
    pub struct VgStatus: u32 {
        /// The VG has been exported and must be imported before use.
        const EXPORTED = 0x0000_0002;
    }
}

bitflags::bitflags! {
    /// Per-info status bits maintained by the cache itself.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InfoStatus: u32 {
        /// Mirrors the lock-held state of the owning VG.
        const CACHE_LOCKED = 0x0000_0002;
    }
}

bitflags::bitflags! {
    /// Device flags maintained by the external device cache.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DevFlags: u32 {
        /// An active logical volume is backed by this device.
        const USED_FOR_LV = 0x0000_0001;
    }
}
