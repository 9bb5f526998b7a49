//! Host configuration – reads `<HDF_CONFIG_DIR or /etc/hdf>/<host_name>.toml`.
//!
//! ```toml
//! log_format = "json"
//!
//! [[devices]]
//! device_id = 1
//! module_name = "hdf_sample"
//! service_name = "sample_service"
//! policy = "public"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use hdf_types::{DevId, DeviceClass, DeviceInfo, ServicePolicy};

const DEFAULT_CONFIG_DIR: &str = "/etc/hdf";

/// Console log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// One `[[devices]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub device_id: u16,
    /// `0` lets the device allocate the node id.
    #[serde(default)]
    pub node_id: u8,
    pub module_name: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub policy: ServicePolicy,
    #[serde(default)]
    pub permission: u16,
    #[serde(default)]
    pub device_class: DeviceClass,
    #[serde(default)]
    pub match_attr: String,
    #[serde(default)]
    pub service_info: String,
}

impl DeviceEntry {
    /// Load description for this entry on host `host_id`.
    pub fn to_device_info(&self, host_id: u8) -> DeviceInfo {
        DeviceInfo::new(DevId::new(host_id, self.device_id, self.node_id), &self.module_name)
            .with_service(&self.service_name, self.policy)
            .with_permission(self.permission)
            .with_class(self.device_class)
            .with_match_attr(&self.match_attr)
            .with_service_info(&self.service_info)
    }
}

/// Persisted configuration of one device host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

/// Directory holding host configuration files.
pub fn config_dir() -> PathBuf {
    std::env::var("HDF_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR))
}

/// Path of the configuration file for `host_name`.
pub fn config_path(host_name: &str) -> PathBuf {
    config_path_in(&config_dir(), host_name)
}

pub(crate) fn config_path_in(dir: &Path, host_name: &str) -> PathBuf {
    dir.join(format!("{host_name}.toml"))
}

/// Load the configuration for `host_name`.  A missing file yields the
/// defaults.
pub fn load(host_name: &str) -> Result<HostConfig, String> {
    load_from(&config_path(host_name))
}

/// Load the configuration from a specific path.
pub(crate) fn load_from(path: &Path) -> Result<HostConfig, String> {
    let mut cfg = if path.exists() {
        let raw = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?
    } else {
        HostConfig::default()
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Apply `HDF_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `HDF_LOG_FORMAT` | `log_format` (`json` or `compact`) |
pub fn apply_env_overrides(cfg: &mut HostConfig) {
    match std::env::var("HDF_LOG_FORMAT").as_deref() {
        Ok("json") => cfg.log_format = LogFormat::Json,
        Ok("compact") => cfg.log_format = LogFormat::Compact,
        _ => {}
    }
}
