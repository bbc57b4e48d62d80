//! Per-device VG summary, the product of a label scan.

use crate::flags::VgStatus;
use crate::VgId;

/// What one device claims about the VG it belongs to.
///
/// A summary without a metadata witness (`seqno`, `mda_size` and
/// `mda_checksum` all zero) comes from the vg_read path and only re-places
/// the PV; a summary with a witness additionally participates in
/// first-witness-wins reconciliation on the VGInfo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VgSummary {
    pub vgname: String,
    pub vgid: Option<VgId>,
    pub vgstatus: VgStatus,
    pub creation_host: Option<String>,
    pub lock_type: Option<String>,
    pub system_id: Option<String>,
    pub seqno: u32,
    pub mda_size: u64,
    pub mda_checksum: u32,
}

impl VgSummary {
    /// Minimal summary used by the population path: name, id and status
    /// only.
    #[must_use]
    pub fn placement(vgname: impl Into<String>, vgid: Option<VgId>, vgstatus: VgStatus) -> Self {
        Self {
            vgname: vgname.into(),
            vgid,
            vgstatus,
            ..Self::default()
        }
    }

    /// True when this summary carries a metadata witness to reconcile.
    #[must_use]
    pub fn has_witness(&self) -> bool {
        self.seqno != 0 || self.mda_size != 0 || self.mda_checksum != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_summary_has_no_witness() {
        let s = VgSummary::placement("vg0", Some(VgId::from_name("g1")), VgStatus::empty());
        assert!(!s.has_witness());
    }

    #[test]
    fn any_witness_field_counts() {
        let s = VgSummary {
            seqno: 3,
            ..VgSummary::default()
        };
        assert!(s.has_witness());
        let s = VgSummary {
            mda_checksum: 0xAAAA,
            ..VgSummary::default()
        };
        assert!(s.has_witness());
    }
}
