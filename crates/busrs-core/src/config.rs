use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding the machine id reported to peers.
pub const MACHINE_ID_ENV: &str = "BUSRS_MACHINE_ID";

const MACHINE_ID_FILES: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConnectionConfig {
    /// Timeout for blocking calls that do not pass one; `None` waits forever.
    pub default_timeout_ms: Option<u64>,
    /// Whether proxies introspect their target before the first call.
    pub introspect_proxies: bool,
    /// Reported by `org.freedesktop.DBus.Peer.GetMachineId`.
    pub machine_id: Option<String>,
    /// Prefix of the unique names a loopback bus hands out.
    pub unique_name_prefix: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            introspect_proxies: true,
            machine_id: None,
            unique_name_prefix: ":1.".to_owned(),
        }
    }
}

impl ConnectionConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(id) = &self.machine_id {
            if !is_machine_id(id) {
                return Err(ConfigError::Invalid(format!(
                    "machine_id '{id}' must be 32 lowercase hex digits"
                )));
            }
        }
        if !self.unique_name_prefix.starts_with(':') {
            return Err(ConfigError::Invalid(format!(
                "unique_name_prefix '{}' must start with ':'",
                self.unique_name_prefix
            )));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    /// Resolve the machine id: configuration, then `BUSRS_MACHINE_ID`, then
    /// the system machine-id files, then a stable id derived from the host
    /// name.
    pub fn resolve_machine_id(&self) -> String {
        if let Some(id) = &self.machine_id {
            return id.clone();
        }
        if let Ok(id) = std::env::var(MACHINE_ID_ENV) {
            let id = id.trim().to_owned();
            if is_machine_id(&id) {
                return id;
            }
            tracing::warn!("ignoring malformed {MACHINE_ID_ENV} '{id}'");
        }
        for file in MACHINE_ID_FILES {
            if let Ok(content) = std::fs::read_to_string(file) {
                let id = content.trim();
                if is_machine_id(id) {
                    return id.to_owned();
                }
            }
        }
        let host = std::fs::read_to_string("/etc/hostname").unwrap_or_default();
        derived_machine_id(host.trim())
    }
}

fn derived_machine_id(seed: &str) -> String {
    let hash = blake3::hash(format!("busrs-machine-id:{seed}").as_bytes());
    hash.to_hex()[..32].to_owned()
}

fn is_machine_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
