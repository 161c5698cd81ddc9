//! Controller settings
//!
//! Settings live in a YAML file (default `~/.netlab/controller.yaml`). A
//! missing file means defaults. Compute credentials may reference
//! environment variables as `${VAR}`; they are resolved when the computes
//! are registered, never written back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compute::{
    ComputeDescriptor, ProbeConfig, DEFAULT_COMPUTE_PORT, DEFAULT_PROBE_BACKOFF_MS,
    DEFAULT_PROBE_RETRIES, DEFAULT_PROTOCOL_VERSION,
};
use crate::controller::ControllerConfig;
use crate::notification::DEFAULT_CAPACITY;

/// Default settings file location: ~/.netlab/controller.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".netlab")
        .join("controller.yaml")
}

/// Errors loading, saving or validating settings
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(String),

    #[error("Failed to write settings: {0}")]
    WriteError(String),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Everything `netlab serve` needs to run a controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Major.minor every compute must report
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,

    #[serde(default = "default_probe_backoff_ms")]
    pub probe_backoff_ms: u64,

    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,

    /// Computes registered at start-up
    #[serde(default)]
    pub computes: Vec<ComputeDescriptor>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            protocol_version: default_protocol_version(),
            request_timeout_secs: default_request_timeout_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            probe_retries: default_probe_retries(),
            probe_backoff_ms: default_probe_backoff_ms(),
            notification_capacity: default_notification_capacity(),
            computes: Vec::new(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_COMPUTE_PORT
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_health_check_interval_secs() -> u64 {
    10
}

fn default_probe_retries() -> u32 {
    DEFAULT_PROBE_RETRIES
}

fn default_probe_backoff_ms() -> u64 {
    DEFAULT_PROBE_BACKOFF_MS
}

fn default_notification_capacity() -> usize {
    DEFAULT_CAPACITY
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse settings from a YAML string
pub fn parse_settings(content: &str) -> Result<ControllerSettings, ConfigError> {
    if content.trim().is_empty() {
        return Ok(ControllerSettings::default());
    }
    serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Serialize settings to a YAML string
pub fn serialize_settings(settings: &ControllerSettings) -> Result<String, ConfigError> {
    serde_yaml::to_string(settings).map_err(|e| ConfigError::WriteError(e.to_string()))
}

/// Expand `${VAR}` references in one credential field
fn expand_field(value: &Option<String>) -> Result<Option<String>, ConfigError> {
    value
        .as_deref()
        .map(|raw| {
            shellexpand::env(raw)
                .map(|expanded| expanded.into_owned())
                .map_err(|e| ConfigError::Invalid(format!("credential references {}", e)))
        })
        .transpose()
}

/// Resolve environment references in a descriptor's credentials
pub fn resolve_credentials(descriptor: &ComputeDescriptor) -> Result<ComputeDescriptor, ConfigError> {
    let mut resolved = descriptor.clone();
    resolved.user = expand_field(&descriptor.user)?;
    resolved.password = expand_field(&descriptor.password)?;
    Ok(resolved)
}

/// Check the settings are usable, without contacting anything
pub fn validate_settings(settings: &ControllerSettings) -> Result<(), ConfigError> {
    if settings.port == 0 {
        return Err(ConfigError::Invalid("port must not be 0".to_string()));
    }

    let mut parts = settings.protocol_version.split('.');
    let well_formed = matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(major), Some(minor), None)
            if major.parse::<u32>().is_ok() && minor.parse::<u32>().is_ok()
    );
    if !well_formed {
        return Err(ConfigError::Invalid(format!(
            "protocol_version '{}' is not major.minor",
            settings.protocol_version
        )));
    }

    if settings.request_timeout_secs == 0 || settings.health_check_interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "timeouts and intervals must be at least 1 second".to_string(),
        ));
    }
    if settings.notification_capacity == 0 {
        return Err(ConfigError::Invalid(
            "notification_capacity must not be 0".to_string(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for compute in &settings.computes {
        if compute.host.trim().is_empty() {
            return Err(ConfigError::Invalid("compute with empty host".to_string()));
        }
        let id = compute
            .compute_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", compute.host, compute.port));
        if !seen.insert(id.clone()) {
            return Err(ConfigError::Invalid(format!("compute '{}' listed twice", id)));
        }
        resolve_credentials(compute)?;
    }

    Ok(())
}

impl ControllerSettings {
    /// Runtime configuration of the controller
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            probe: ProbeConfig {
                retries: self.probe_retries,
                backoff: Duration::from_millis(self.probe_backoff_ms),
                ..ProbeConfig::default()
            },
            notification_capacity: self.notification_capacity,
        }
    }

    /// Address the API listens on
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load settings from the default location
pub fn load_settings() -> Result<ControllerSettings, ConfigError> {
    load_settings_from(&default_config_path())
}

/// Load settings from a specific path; a missing file yields defaults
pub fn load_settings_from(path: &Path) -> Result<ControllerSettings, ConfigError> {
    if !path.exists() {
        return Ok(ControllerSettings::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_settings(&content)
}

/// Save settings to a specific path
pub fn save_settings_to(settings: &ControllerSettings, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serialize_settings(settings)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let settings = parse_settings("port: 4000\n").unwrap();
        assert_eq!(settings.port, 4000);
        assert_eq!(settings.protocol_version, "2.2");
        assert_eq!(settings.request_timeout_secs, 30);
        assert_eq!(settings.health_check_interval_secs, 10);
        assert!(settings.computes.is_empty());
    }

    #[test]
    fn test_load_with_computes() {
        let file = create_temp_file(
            r#"
bind_addr: 127.0.0.1
computes:
  - computeId: h1
    host: 10.0.0.1
    port: 3080
  - host: 10.0.0.2
    port: 3080
    protocol: https
"#,
        );
        let settings = load_settings_from(file.path()).unwrap();
        assert_eq!(settings.listen_addr(), "127.0.0.1:3080");
        assert_eq!(settings.computes.len(), 2);
        assert_eq!(settings.computes[0].compute_id.as_deref(), Some("h1"));
        assert!(validate_settings(&settings).is_ok());
    }

    #[test]
    fn test_missing_file_is_default() {
        let settings = load_settings_from(Path::new("/nonexistent/controller.yaml")).unwrap();
        assert_eq!(settings, ControllerSettings::default());
    }

    #[test]
    fn test_malformed_file() {
        let file = create_temp_file("port: [not a port\n");
        assert!(matches!(
            load_settings_from(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("controller.yaml");

        let mut settings = ControllerSettings::default();
        settings
            .computes
            .push(ComputeDescriptor::new("10.0.0.9", 3080).with_id("lab"));
        save_settings_to(&settings, &path).unwrap();

        assert_eq!(load_settings_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_credentials_expand_from_env() {
        std::env::set_var("NETLAB_TEST_PASSWORD", "s3cret");
        let descriptor = ComputeDescriptor::new("10.0.0.1", 3080)
            .with_credentials("admin", "${NETLAB_TEST_PASSWORD}");

        let resolved = resolve_credentials(&descriptor).unwrap();
        assert_eq!(resolved.user.as_deref(), Some("admin"));
        assert_eq!(resolved.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_unset_credential_variable() {
        let descriptor = ComputeDescriptor::new("10.0.0.1", 3080)
            .with_credentials("admin", "${NETLAB_TEST_UNSET_VARIABLE}");
        assert!(matches!(
            resolve_credentials(&descriptor),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = ControllerSettings {
            protocol_version: "2".to_string(),
            ..Default::default()
        };
        assert!(validate_settings(&settings).is_err());

        settings.protocol_version = "2.2".to_string();
        settings.computes = vec![
            ComputeDescriptor::new("10.0.0.1", 3080),
            ComputeDescriptor::new("10.0.0.1", 3080),
        ];
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_controller_config() {
        let settings = ControllerSettings {
            request_timeout_secs: 5,
            probe_retries: 1,
            ..Default::default()
        };
        let config = settings.controller_config();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.probe.retries, 1);
    }
}
