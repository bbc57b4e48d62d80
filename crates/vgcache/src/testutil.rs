//! Shared test fixtures: a serde_json-backed metadata format, a scripted
//! label scanner, and device/summary builders.

use std::sync::Arc;

use vgcache_error::{CacheError, Result};
use vgcache_types::{
    DevNum, DevTypes, Device, DeviceHandle, DiskArea, Mda, PvId, VgId, VgStatus, VgSummary,
    VolumeGroup, SECTOR_SHIFT,
};

use crate::context::CommandContext;
use crate::format::{
    DeviceScan, FormatHandle, LabelScanner, Labeller, LabellerHandle, MetadataFormat,
};

/// Test metadata format: JSON text round-trip.
#[derive(Debug)]
pub(crate) struct JsonFormat;

impl MetadataFormat for JsonFormat {
    fn name(&self) -> &str {
        "json"
    }

    fn orphan_vg_name(&self) -> &str {
        "#orphans_json"
    }

    fn export_vg(&self, vg: &VolumeGroup) -> Result<String> {
        serde_json::to_string(vg).map_err(|e| CacheError::Export {
            vg: vg.name.clone(),
            detail: e.to_string(),
        })
    }

    fn import_vg(&self, text: &str) -> Result<VolumeGroup> {
        serde_json::from_str(text).map_err(|e| CacheError::Import {
            vg: String::new(),
            detail: e.to_string(),
        })
    }
}

pub(crate) fn json_format() -> FormatHandle {
    Arc::new(JsonFormat)
}

pub(crate) fn labeller() -> LabellerHandle {
    Arc::new(Labeller::new(json_format()))
}

pub(crate) fn dev(name: &str, devno: DevNum, size_sectors: u64) -> DeviceHandle {
    Arc::new(Device::new(name, devno, size_sectors))
}

/// Command context with DM major 253, MD major 9, and the JSON format
/// registered.
pub(crate) fn new_cmd() -> CommandContext {
    let mut cmd = CommandContext::new("host-a", DevTypes::new(253, 9));
    cmd.register_format(json_format());
    cmd
}

pub(crate) fn new_cluster_cmd() -> CommandContext {
    let mut cmd = CommandContext::new("host-a", DevTypes::new(253, 9)).with_cluster_daemon(true);
    cmd.register_format(json_format());
    cmd
}

/// A device's scan product. `summary` is `(vgname, vgid-name, seqno,
/// mda_checksum)`; `None` makes the device an orphan PV.
pub(crate) fn scan_for(
    device: DeviceHandle,
    pvid_name: &str,
    summary: Option<(&str, &str, u32, u32)>,
) -> DeviceScan {
    let lab = labeller();
    let (summary, mdas) = match summary {
        Some((vgname, vgid, seqno, checksum)) => (
            Some(VgSummary {
                vgname: vgname.to_string(),
                vgid: Some(VgId::from_name(vgid)),
                vgstatus: VgStatus::empty(),
                creation_host: Some("host-a".to_string()),
                lock_type: None,
                system_id: None,
                seqno,
                mda_size: 1024,
                mda_checksum: checksum,
            }),
            vec![Mda::new(4096, 1024 * 1024, false)],
        ),
        None => (None, Vec::new()),
    };
    let device_size = device.size_sectors() << SECTOR_SHIFT;
    DeviceScan {
        device,
        labeller: lab,
        pvid: PvId::from_name(pvid_name),
        label_sector: 1,
        device_size,
        ext_version: 2,
        ext_flags: 0,
        summary,
        mdas,
        das: vec![DiskArea::new(1_048_576, 0)],
        bas: Vec::new(),
    }
}

/// Scripted scanner: `scan_all` replays every pushed scan, `read_device`
/// replays the scan for that device.
#[derive(Default)]
pub(crate) struct FixtureScanner {
    scans: Vec<DeviceScan>,
}

impl FixtureScanner {
    pub(crate) fn push(&mut self, scan: DeviceScan) {
        self.scans.push(scan);
    }
}

impl LabelScanner for FixtureScanner {
    fn scan_all(&mut self) -> Vec<DeviceScan> {
        self.scans.clone()
    }

    fn read_device(&mut self, dev: &DeviceHandle) -> Option<DeviceScan> {
        self.scans
            .iter()
            .find(|s| s.device.same_device(dev))
            .cloned()
    }
}
