//! Controller configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/tc/controller.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `controller_id`
//!
//! # Phase map
//! `[phases]` maps logical phase numbers to output pins; two phases may
//! share a pin.  When the section is absent the deployed default map is
//! used.  The set of phases is fixed for the server's lifetime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tc_protocol::MAX_ID_BYTES;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub schema_version: u32,
    pub controller_id: String,
    pub broker: BrokerConfig,
    pub outputs: OutputsConfig,
    pub watchdog: WatchdogConfig,
    /// Logical phase number → physical output pin.
    pub phase_to_output: HashMap<u32, u8>,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keepalive_secs: u64,
    /// Defaults to the controller id (plaintext auth until TLS lands).
    pub username: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OutputsConfig {
    /// Root of the GPIO sysfs tree; overridable for tests.
    pub sysfs_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub heartbeat_secs: u64,
}

/// The phase→pin map shipped on deployed controllers.
pub fn default_phase_map() -> HashMap<u32, u8> {
    HashMap::from([(1, 3), (2, 4), (3, 4), (4, 5)])
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    controller_id: Option<String>,
    broker: Option<RawBrokerConfig>,
    outputs: Option<RawOutputsConfig>,
    watchdog: Option<RawWatchdogConfig>,
    phases: Option<HashMap<String, u8>>,
}

#[derive(Debug, Deserialize)]
struct RawBrokerConfig {
    host: Option<String>,
    port: Option<u16>,
    keepalive_secs: Option<u64>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawOutputsConfig {
    sysfs_root: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawWatchdogConfig {
    heartbeat_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load controller config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ControllerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load controller config from the default path `/etc/tc/controller.toml`.
pub fn load_config() -> Result<ControllerConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/tc/controller.toml"))
}

/// Load controller config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ControllerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let controller_id = raw
        .controller_id
        .ok_or_else(|| ConfigError::MissingField("controller_id".to_owned()))?;
    if controller_id.is_empty() {
        return Err(ConfigError::InvalidValue(
            "controller_id must not be empty".to_owned(),
        ));
    }
    if controller_id.len() > MAX_ID_BYTES {
        return Err(ConfigError::InvalidValue(format!(
            "controller_id exceeds {MAX_ID_BYTES} UTF-8 bytes"
        )));
    }

    let broker = match raw.broker {
        Some(b) => BrokerConfig {
            host: b.host.unwrap_or_else(|| "localhost".to_owned()),
            port: b.port.unwrap_or(1883),
            keepalive_secs: b.keepalive_secs.unwrap_or(60),
            username: b.username.unwrap_or_else(|| controller_id.clone()),
            password: b.password,
        },
        None => BrokerConfig {
            host: "localhost".to_owned(),
            port: 1883,
            keepalive_secs: 60,
            username: controller_id.clone(),
            password: None,
        },
    };

    let outputs = OutputsConfig {
        sysfs_root: raw
            .outputs
            .and_then(|o| o.sysfs_root)
            .map_or_else(|| PathBuf::from("/sys/class/gpio"), PathBuf::from),
    };

    let watchdog = WatchdogConfig {
        heartbeat_secs: raw
            .watchdog
            .and_then(|w| w.heartbeat_secs)
            .unwrap_or(15),
    };

    let phase_to_output = match raw.phases {
        None => default_phase_map(),
        Some(phases) => {
            if phases.is_empty() {
                return Err(ConfigError::InvalidValue(
                    "[phases] must map at least one phase".to_owned(),
                ));
            }
            let mut map = HashMap::with_capacity(phases.len());
            for (key, pin) in phases {
                let phase: u32 = key.parse().map_err(|_| {
                    ConfigError::InvalidValue(format!("phase `{key}` is not a number"))
                })?;
                map.insert(phase, pin);
            }
            map
        }
    };

    Ok(ControllerConfig {
        schema_version,
        controller_id,
        broker,
        outputs,
        watchdog,
        phase_to_output,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "Parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}
