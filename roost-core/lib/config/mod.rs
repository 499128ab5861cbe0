//! Node configuration types and helpers.
//!
//! The daemon loads a single YAML document from a well-known path at boot.
//! The loaded configuration is exposed process-wide as an immutable
//! [`Arc<Config>`] snapshot behind a [`ConfigHandle`]; a reload builds a new
//! snapshot and swaps the pointer so readers never observe a partial update.

mod defaults;
mod docker;
mod system;

use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use getset::Getters;
use serde::{Deserialize, Serialize};

use crate::{RoostError, RoostResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use docker::*;
pub use system::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Top-level node configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Config {
    /// Enables verbose daemon logging.
    #[serde(default)]
    debug: bool,

    /// Unique identifier assigned to this node by the panel.
    #[serde(default)]
    uuid: String,

    /// Identifier half of the node API credential.
    #[serde(default)]
    token_id: String,

    /// Secret half of the node API credential.
    #[serde(default)]
    token: String,

    /// Local HTTP API settings.
    #[serde(default)]
    api: ApiConfig,

    /// Host-level paths, intervals and feature toggles.
    #[serde(default)]
    system: SystemConfig,

    /// Container runtime settings.
    #[serde(default)]
    docker: DockerConfig,

    /// Host paths that servers are allowed to bind-mount.
    #[serde(default)]
    allowed_mounts: Vec<String>,

    /// Base URL of the panel that owns this node.
    #[serde(default)]
    remote: String,

    /// Origins allowed by the HTTP layer's CORS policy.
    #[serde(default)]
    allowed_origins: Vec<String>,
}

/// Local HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ApiConfig {
    /// Interface the API listens on.
    #[serde(default = "defaults::api_host")]
    host: String,

    /// Port the API listens on.
    #[serde(default = "defaults::api_port")]
    port: u16,

    /// TLS settings for the API listener.
    #[serde(default)]
    ssl: SslConfig,

    /// Maximum accepted request body size in mebibytes.
    #[serde(default = "defaults::upload_limit")]
    upload_limit: u64,
}

/// TLS listener settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SslConfig {
    /// Whether TLS is enabled on the API listener.
    #[serde(default)]
    enabled: bool,

    /// Path to the PEM certificate chain.
    #[serde(default, rename = "cert")]
    certificate: String,

    /// Path to the PEM private key.
    #[serde(default)]
    key: String,
}

/// Cloneable handle to the current configuration snapshot.
///
/// Readers call [`ConfigHandle::snapshot`] and keep the returned `Arc` for
/// the duration of one logical operation; a concurrent reload never mutates
/// a snapshot in place.
#[derive(Clone)]
pub struct ConfigHandle(Arc<RwLock<Arc<Config>>>);

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Config {
    /// Reads and parses the configuration document at the given path.
    pub fn from_path(path: impl AsRef<Path>) -> RoostResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            RoostError::Configuration(format!(
                "could not read configuration file {}: {}",
                path.display(),
                err
            ))
        })?;

        serde_yaml::from_str(&raw).map_err(|err| {
            RoostError::Configuration(format!(
                "could not parse configuration file {}: {}",
                path.display(),
                err
            ))
        })
    }

    /// Serializes the configuration document and writes it to disk.
    pub fn write_to_disk(&self, path: impl AsRef<Path>) -> RoostResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let raw = serde_yaml::to_string(self)?;
        std::fs::write(path, raw)?;

        tracing::info!("wrote node configuration to {}", path.display());
        Ok(())
    }

    /// Directory holding the per-server configuration documents.
    pub fn server_configuration_dir(&self) -> PathBuf {
        PathBuf::from(self.system.get_root_directory()).join(SERVERS_SUBDIR)
    }

    /// Data directory for a single server's filesystem root.
    pub fn server_data_dir(&self, uuid: &uuid::Uuid) -> PathBuf {
        PathBuf::from(self.system.get_data()).join(uuid.to_string())
    }

    /// The `Authorization` value expected on API requests.
    pub fn api_token(&self) -> String {
        format!("{}.{}", self.token_id, self.token)
    }

    /// Returns a copy with both token halves replaced, for diagnostics output.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.token_id = "{redacted}".to_string();
        copy.token = "{redacted}".to_string();
        copy
    }
}

impl ConfigHandle {
    /// Wraps a freshly loaded configuration.
    pub fn new(config: Config) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(config))))
    }

    /// Returns the current immutable snapshot.
    pub fn snapshot(&self) -> Arc<Config> {
        self.0.read().expect("config lock poisoned").clone()
    }

    /// Atomically replaces the snapshot with a newly loaded configuration.
    pub fn replace(&self, config: Config) {
        *self.0.write().expect("config lock poisoned") = Arc::new(config);
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config must deserialize")
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty api config must deserialize")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config: Config = serde_yaml::from_str("remote: https://panel.example.com").unwrap();

        assert_eq!(config.get_api().get_host(), "0.0.0.0");
        assert_eq!(*config.get_api().get_port(), 8080);
        assert_eq!(config.get_system().get_root_directory(), "/var/lib/roost");
        assert_eq!(*config.get_system().get_sftp().get_bind_port(), 2022);
        assert!(config.get_system().get_crash_detection().get_enabled());
        assert_eq!(config.get_remote(), "https://panel.example.com");
    }

    #[test]
    fn test_api_token_joins_both_halves() {
        let config: Config =
            serde_yaml::from_str("token_id: abc\ntoken: s3cret").unwrap();
        assert_eq!(config.api_token(), "abc.s3cret");
    }

    #[test]
    fn test_redacted_strips_tokens() {
        let config: Config =
            serde_yaml::from_str("token_id: abc\ntoken: s3cret").unwrap();
        let redacted = config.redacted();
        assert_eq!(redacted.get_token(), "{redacted}");
        assert_eq!(redacted.get_token_id(), "{redacted}");
    }

    #[test]
    fn test_snapshot_swap() {
        let handle = ConfigHandle::new(Config::default());
        let before = handle.snapshot();

        let mut next = Config::default();
        next.debug = true;
        handle.replace(next);

        assert!(!before.get_debug());
        assert!(handle.snapshot().get_debug());
    }
}
