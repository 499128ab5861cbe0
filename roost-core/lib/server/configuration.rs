//! Per-server configuration document.
//!
//! The panel is the authority for every field here. The daemon persists the
//! document to `<root>/servers/<uuid>.yml` when it is synced and mutates it
//! only under the owning server's write lock.

use std::{collections::HashMap, path::Path};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::RoostResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything the daemon needs to know about one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfiguration {
    /// 36-character identifier assigned by the panel.
    pub uuid: Uuid,

    /// Whether the panel has suspended this server.
    #[serde(default)]
    pub suspended: bool,

    /// Command line executed inside the container.
    #[serde(default)]
    pub invocation: String,

    /// Container image reference.
    #[serde(default)]
    pub image: String,

    /// Environment variables passed into the container.
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Labels applied to the container.
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Resource limits for the container and the data directory.
    #[serde(default)]
    pub build: ServerLimits,

    /// Network allocation declared by the panel.
    #[serde(default)]
    pub allocation: Allocation,

    /// Additional host mounts for this server.
    #[serde(default)]
    pub mounts: Vec<Mount>,

    /// How the server process is asked to stop.
    #[serde(default)]
    pub stop: StopConfiguration,

    /// Gitignore-style patterns whose matches may never be written.
    #[serde(default)]
    pub file_denylist: Vec<String>,

    /// Per-server override for crash detection.
    #[serde(default = "default_true")]
    pub crash_detection_enabled: bool,
}

/// Resource limits for one server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerLimits {
    /// Relative CPU weight. Zero leaves the runtime default.
    #[serde(default)]
    pub cpu_limit: i64,

    /// Memory limit in bytes. Zero is unlimited.
    #[serde(default)]
    pub memory_bytes: i64,

    /// Swap limit in bytes. Negative is unlimited swap.
    #[serde(default)]
    pub swap_bytes: i64,

    /// Relative block-IO weight, 10 to 1000.
    #[serde(default)]
    pub io_weight: u16,

    /// Per-device throughput caps.
    #[serde(default)]
    pub blkio_device_limits: Vec<DeviceLimit>,

    /// Disk quota in bytes. Zero is unlimited.
    #[serde(default)]
    pub disk_bytes: i64,

    /// Process cap. Zero falls back to the node-wide default.
    #[serde(default)]
    pub pid_limit: i64,
}

/// Read/write throughput caps for one block device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceLimit {
    /// Device path on the host.
    pub device: String,

    /// Read cap in bytes per second. Zero is uncapped.
    #[serde(default)]
    pub read_bps: u64,

    /// Write cap in bytes per second. Zero is uncapped.
    #[serde(default)]
    pub write_bps: u64,
}

/// Network allocation for one server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Allocation {
    /// Primary bind address.
    #[serde(default)]
    pub ip: String,

    /// Primary port.
    #[serde(default)]
    pub port: u16,

    /// Additional ports exposed for the server.
    #[serde(default)]
    pub additional_ports: Vec<u16>,
}

/// A host directory mounted into the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    /// Host path. Must be covered by the node's allowed mounts.
    pub source: String,

    /// Path inside the container.
    pub target: String,

    /// Mounts read-only when set.
    #[serde(default)]
    pub read_only: bool,
}

/// How a server process is asked to stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopConfiguration {
    /// Either `signal` or `command`.
    #[serde(default, rename = "type")]
    pub kind: StopKind,

    /// Signal name or console command, depending on the kind.
    #[serde(default = "default_stop_value")]
    pub value: String,

    /// Seconds to wait for a clean exit before escalating to a kill.
    #[serde(default = "default_stop_timeout")]
    pub timeout_seconds: u64,
}

/// Stop directive kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    /// Deliver a signal to the container init process.
    #[default]
    Signal,

    /// Write a command to the process stdin.
    Command,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServerConfiguration {
    /// Reads a configuration document from disk.
    pub fn from_disk(path: impl AsRef<Path>) -> RoostResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Persists the configuration document, creating parent directories as
    /// needed.
    pub fn to_disk(&self, path: impl AsRef<Path>) -> RoostResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Environment map rendered as `KEY=VALUE` pairs for the runtime.
    pub fn environment_pairs(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect()
    }
}

impl Default for StopConfiguration {
    fn default() -> Self {
        Self {
            kind: StopKind::Signal,
            value: default_stop_value(),
            timeout_seconds: default_stop_timeout(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_stop_value() -> String {
    "SIGTERM".to_string()
}

fn default_stop_timeout() -> u64 {
    30
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        "uuid: 6f0c2a2e-8dbb-4ce3-9e23-7b3c1d9f5a11\nimage: ghcr.io/parkervcp/yolks:java_17\ninvocation: java -jar server.jar"
    }

    #[test]
    fn test_minimal_document_parses_with_defaults() {
        let config: ServerConfiguration = serde_yaml::from_str(minimal_yaml()).unwrap();

        assert!(!config.suspended);
        assert!(config.crash_detection_enabled);
        assert_eq!(config.stop.kind, StopKind::Signal);
        assert_eq!(config.stop.value, "SIGTERM");
        assert_eq!(config.stop.timeout_seconds, 30);
        assert_eq!(config.build.disk_bytes, 0);
    }

    #[test]
    fn test_round_trip_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yml");

        let config: ServerConfiguration = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.to_disk(&path).unwrap();

        let restored = ServerConfiguration::from_disk(&path).unwrap();
        assert_eq!(restored.uuid, config.uuid);
        assert_eq!(restored.image, config.image);
    }

    #[test]
    fn test_environment_pairs() {
        let mut config: ServerConfiguration = serde_yaml::from_str(minimal_yaml()).unwrap();
        config
            .environment
            .insert("SERVER_MEMORY".to_string(), "1024".to_string());

        assert!(config
            .environment_pairs()
            .contains(&"SERVER_MEMORY=1024".to_string()));
    }
}
