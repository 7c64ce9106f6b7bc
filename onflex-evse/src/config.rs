//! Station configuration
//!
//! Two JSON files feed the station:
//! - the station config (OCPP endpoint and identity, firmware handling)
//! - the privileged id tag table (calibration / manufacturer mode tags)
//!
//! Timing constants are not read from disk; they live in [`Timings`] so
//! tests can shrink or stretch them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::ocpp::{BootPolicy, OcppClientConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Complete station configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationConfig {
    pub ocpp: OcppSettings,

    #[serde(default)]
    pub firmware: FirmwareSettings,

    #[serde(default)]
    pub boot_policy: BootPolicy,

    #[serde(skip)]
    pub timings: Timings,
}

/// Central system connection and charge point identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcppSettings {
    /// Full WebSocket URL, including the charge point identity
    pub endpoint: String,
    pub vendor_id: String,
    pub model_id: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    /// Extra WebSocket handshake headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for OcppSettings {
    fn default() -> Self {
        let client = OcppClientConfig::default();
        Self {
            endpoint: client.endpoint,
            vendor_id: client.vendor_id,
            model_id: client.model_id,
            serial_number: client.serial_number,
            firmware_version: client.firmware_version,
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareSettings {
    /// Where downloaded images are stored while installing
    #[serde(default = "default_firmware_dir")]
    pub directory: PathBuf,
    /// Where the image archive is extracted to
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,
    #[serde(default)]
    pub archive_password: Option<String>,
}

fn default_firmware_dir() -> PathBuf {
    PathBuf::from("firmwares")
}

fn default_install_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for FirmwareSettings {
    fn default() -> Self {
        Self {
            directory: default_firmware_dir(),
            install_dir: default_install_dir(),
            archive_password: None,
        }
    }
}

/// Timing constants of the engine and the charging controller
#[derive(Debug, Clone, PartialEq)]
pub struct Timings {
    /// Budget for every request/reply exchange
    pub call_timeout: Duration,
    pub reconnect_interval: Duration,
    /// Heartbeat interval until the central system supplies one
    pub default_heartbeat: Duration,
    /// Authorized session must see CP=C within this window
    pub readiness_window: Duration,
    pub meter_values_interval: Duration,
    /// Stop tags are ignored for this long after charging starts
    pub stop_tag_grace: Duration,
    /// Relay is closed again this long after a stop
    pub relay_failsafe: Duration,
    pub reboot_delay: Duration,
    /// Controller loop period
    pub tick: Duration,
    pub cp_poll: Duration,
    pub meter_poll: Duration,
    pub meter_log_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(8),
            reconnect_interval: Duration::from_secs(8),
            default_heartbeat: Duration::from_secs(60),
            readiness_window: Duration::from_secs(30),
            meter_values_interval: Duration::from_secs(60),
            stop_tag_grace: Duration::from_secs(8),
            relay_failsafe: Duration::from_secs(600),
            reboot_delay: Duration::from_secs(4),
            tick: Duration::from_millis(100),
            cp_poll: Duration::from_millis(500),
            meter_poll: Duration::from_secs(1),
            meter_log_interval: Duration::from_secs(300),
        }
    }
}

impl StationConfig {
    /// Load and validate a JSON station config
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;

        info!("Loaded station config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = &self.ocpp.endpoint;
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "endpoint must be a ws:// or wss:// URL, got {}",
                endpoint
            )));
        }
        if self.ocpp.vendor_id.is_empty() {
            return Err(ConfigError::Invalid("vendor_id is empty".into()));
        }
        Ok(())
    }

    /// Override the central system URL
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.ocpp.endpoint = endpoint.into();
        self
    }

    pub fn with_boot_policy(mut self, policy: BootPolicy) -> Self {
        self.boot_policy = policy;
        self
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Engine configuration derived from this station config
    pub fn client_config(&self) -> OcppClientConfig {
        OcppClientConfig {
            endpoint: self.ocpp.endpoint.clone(),
            vendor_id: self.ocpp.vendor_id.clone(),
            model_id: self.ocpp.model_id.clone(),
            serial_number: self.ocpp.serial_number.clone(),
            firmware_version: self.ocpp.firmware_version.clone(),
            headers: self
                .ocpp
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            call_timeout: self.timings.call_timeout,
            reconnect_interval: self.timings.reconnect_interval,
            default_heartbeat_interval: self.timings.default_heartbeat,
            boot_policy: self.boot_policy,
        }
    }
}

/// What a presented id tag means to the station
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Manufacturer,
    Calibration,
    /// Ordinary customer tag, authorized by the central system
    User,
}

/// Privileged id tags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdTagLists {
    #[serde(default)]
    pub calibration_mode: Vec<String>,
    #[serde(default)]
    pub manufacturer_mode: Vec<String>,
}

impl IdTagLists {
    /// Load the tag table; a missing or broken file means no privileged tags
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!("No id tag table at {} ({}), privileged modes disabled", path.display(), e);
                return Self::default();
            }
        };

        match serde_json::from_str(&text) {
            Ok(lists) => lists,
            Err(e) => {
                warn!("Ignoring invalid id tag table {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Manufacturer tags take precedence over calibration tags
    pub fn classify(&self, tag: &str) -> TagClass {
        if self.manufacturer_mode.iter().any(|t| t == tag) {
            TagClass::Manufacturer
        } else if self.calibration_mode.iter().any(|t| t == tag) {
            TagClass::Calibration
        } else {
            TagClass::User
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_station_config() {
        let file = write_temp(
            r#"{
                "ocpp": {
                    "endpoint": "wss://csms.example.com/ocpp/ONFLEX-042",
                    "vendor_id": "OnFlex",
                    "model_id": "OnFlex-AC7",
                    "serial_number": "SN-042",
                    "headers": {"Authorization": "Basic abc"}
                },
                "firmware": {"archive_password": "pw"},
                "boot_policy": "once_per_process"
            }"#,
        );

        let config = StationConfig::load(file.path()).unwrap();
        assert_eq!(config.ocpp.model_id, "OnFlex-AC7");
        assert_eq!(config.firmware.directory, PathBuf::from("firmwares"));
        assert_eq!(config.firmware.archive_password.as_deref(), Some("pw"));

        let client = config.client_config();
        assert_eq!(client.boot_policy, BootPolicy::OncePerProcess);
        assert_eq!(client.serial_number.as_deref(), Some("SN-042"));
        assert_eq!(client.headers, vec![("Authorization".to_string(), "Basic abc".to_string())]);
        assert_eq!(client.call_timeout, Duration::from_secs(8));
    }

    #[test]
    fn test_invalid_endpoint_is_rejected() {
        let file = write_temp(r#"{"ocpp": {"endpoint": "http://x", "vendor_id": "V", "model_id": "M"}}"#);
        assert!(matches!(StationConfig::load(file.path()), Err(ConfigError::Invalid(_))));

        let broken = write_temp("{");
        assert!(matches!(StationConfig::load(broken.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_builder_overrides() {
        let config = StationConfig::default()
            .with_endpoint("ws://127.0.0.1:9000/CP-1")
            .with_boot_policy(BootPolicy::OncePerProcess);

        assert_eq!(config.client_config().endpoint, "ws://127.0.0.1:9000/CP-1");
        assert_eq!(config.boot_policy, BootPolicy::OncePerProcess);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_id_tag_classification() {
        let file = write_temp(
            r#"{"calibration_mode": ["CAL1", "BOTH"], "manufacturer_mode": ["MFG1", "BOTH"]}"#,
        );
        let lists = IdTagLists::load_or_default(file.path());

        assert_eq!(lists.classify("CAL1"), TagClass::Calibration);
        assert_eq!(lists.classify("MFG1"), TagClass::Manufacturer);
        assert_eq!(lists.classify("BOTH"), TagClass::Manufacturer);
        assert_eq!(lists.classify("04A1B2"), TagClass::User);
    }

    #[test]
    fn test_missing_id_tag_table_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let lists = IdTagLists::load_or_default(dir.path().join("id_tags.cfg"));
        assert_eq!(lists, IdTagLists::default());
        assert_eq!(lists.classify("CAL1"), TagClass::User);
    }
}
