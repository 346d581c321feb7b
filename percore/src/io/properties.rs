use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::config::SmpConfig;
use crate::error::{Error, FatalError, ParseError, ParseErrorKind, Result};
use crate::io::queue::IoQueueConfig;
use crate::utils::parse_size;

/// Shaping budget for one mount point, straight from the properties
/// document. All four throughput fields are mandatory and non-zero.
#[derive(Debug, Clone)]
pub struct MountpointParams {
    pub mountpoint: PathBuf,
    pub read_bytes_rate: u64,
    pub write_bytes_rate: u64,
    pub read_req_rate: u64,
    pub write_req_rate: u64,
}

impl MountpointParams {
    pub fn to_queue_config(&self) -> IoQueueConfig {
        IoQueueConfig {
            read_bytes_rate: self.read_bytes_rate,
            write_bytes_rate: self.write_bytes_rate,
            read_req_rate: self.read_req_rate,
            write_req_rate: self.write_req_rate,
            ..IoQueueConfig::default()
        }
    }
}

/// Parsed I/O shaping configuration, keyed by device id so two entries
/// can never silently share a disk.
#[derive(Debug, Default)]
pub struct DiskConfig {
    pub mountpoints: HashMap<u64, MountpointParams>,
}

/// Loads the document named by the configuration; an absent document
/// yields an empty (unshaped) config.
pub fn load_io_properties(cfg: &SmpConfig) -> Result<DiskConfig> {
    let doc = match (&cfg.io_properties, &cfg.io_properties_file) {
        (Some(inline), None) => inline.clone(),
        (None, Some(path)) => std::fs::read_to_string(path).map_err(Error::System)?,
        (None, None) => return Ok(DiskConfig::default()),
        (Some(_), Some(_)) => unreachable!("rejected during config validation"),
    };
    parse_io_properties(&doc)
}

/// Parses the `disks` document. Fails fatally on an unknown top-level
/// section, zero rates, or two entries resolving to one device.
pub fn parse_io_properties(doc: &str) -> Result<DiskConfig> {
    let value: Value = serde_json::from_str(doc)
        .map_err(|e| ParseError::new(ParseErrorKind::Malformed, e.column(), doc.trim()))?;

    let Value::Object(sections) = value else {
        return Err(ParseError::new(ParseErrorKind::Malformed, 0, doc.trim()).into());
    };

    let mut config = DiskConfig::default();
    for (section, body) in &sections {
        if section != "disks" {
            return Err(ParseError::new(ParseErrorKind::UnknownSection, 0, section.clone()).into());
        }
        let Value::Array(disks) = body else {
            return Err(ParseError::new(ParseErrorKind::Malformed, 0, section.clone()).into());
        };
        for disk in disks {
            let params = parse_disk_entry(disk)?;
            let dev = device_of(&params.mountpoint)?;
            if config.mountpoints.contains_key(&dev) {
                return Err(ParseError::new(
                    ParseErrorKind::DuplicateMountpoint,
                    0,
                    params.mountpoint.display().to_string(),
                )
                .into());
            }
            config.mountpoints.insert(dev, params);
        }
    }
    Ok(config)
}

fn parse_disk_entry(disk: &Value) -> Result<MountpointParams> {
    let mountpoint = disk
        .get("mountpoint")
        .and_then(Value::as_str)
        .ok_or_else(|| ParseError::new(ParseErrorKind::Malformed, 0, disk.to_string()))?;

    let params = MountpointParams {
        mountpoint: PathBuf::from(mountpoint),
        read_bytes_rate: rate_field(disk, "read_bandwidth")?,
        write_bytes_rate: rate_field(disk, "write_bandwidth")?,
        read_req_rate: rate_field(disk, "read_iops")?,
        write_req_rate: rate_field(disk, "write_iops")?,
    };
    Ok(params)
}

fn rate_field(disk: &Value, name: &str) -> Result<u64> {
    let value = disk
        .get(name)
        .ok_or_else(|| ParseError::new(ParseErrorKind::Malformed, 0, name))?;
    let rate = match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| ParseError::new(ParseErrorKind::InvalidNumber, 0, value.to_string()))?,
        Value::String(s) => parse_size(s)?,
        _ => return Err(ParseError::new(ParseErrorKind::InvalidNumber, 0, value.to_string()).into()),
    };
    if rate == 0 {
        return Err(ParseError::new(ParseErrorKind::ZeroRate, 0, name).into());
    }
    Ok(rate)
}

fn device_of(mountpoint: &Path) -> Result<u64> {
    let st = nix::sys::stat::stat(mountpoint)
        .map_err(|e| FatalError::Boot(format!("couldn't stat {}: {e}", mountpoint.display())))?;
    Ok(st.st_dev)
}
