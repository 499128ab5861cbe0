//! Container runtime configuration.

use std::collections::HashMap;

use getset::Getters;
use serde::{Deserialize, Serialize};

use super::defaults;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Settings applied to every container the daemon manages.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct DockerConfig {
    /// Network the server containers attach to.
    #[serde(default)]
    network: DockerNetwork,

    /// Domain name assigned to containers.
    #[serde(default)]
    domainname: String,

    /// Registry credentials keyed by registry host.
    #[serde(default)]
    registries: HashMap<String, RegistryCredentials>,

    /// Size of the `/tmp` tmpfs mount in mebibytes.
    #[serde(default = "defaults::tmpfs_size")]
    tmpfs_size: u64,

    /// Process cap applied to every server container.
    #[serde(default = "defaults::container_pid_limit")]
    container_pid_limit: i64,

    /// Resource limits for install containers.
    #[serde(default)]
    installer_limits: InstallerLimits,

    /// Memory overhead policy compensating for runtime bookkeeping.
    #[serde(default)]
    overhead: Overhead,

    /// Uses the cheaper container-list endpoint instead of a full inspect
    /// where possible.
    #[serde(default)]
    use_performant_inspect: bool,

    /// Log driver configuration for server containers.
    #[serde(default)]
    log_config: DockerLogConfig,
}

/// Network a server container attaches to.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct DockerNetwork {
    /// Network name.
    #[serde(default = "defaults::docker_network_name")]
    name: String,

    /// Network driver.
    #[serde(default = "defaults::docker_network_driver")]
    driver: String,
}

/// Credentials for a private registry.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct RegistryCredentials {
    /// Registry account name.
    username: String,

    /// Registry account password or access token.
    password: String,
}

/// Resource limits applied to install containers.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct InstallerLimits {
    /// Memory in mebibytes.
    #[serde(default = "defaults::installer_memory")]
    memory: i64,

    /// CPU percentage, 100 per core.
    #[serde(default = "defaults::installer_cpu")]
    cpu: i64,
}

/// Memory overhead policy.
///
/// Container runtimes account some bookkeeping against the container memory
/// limit; a multiplier slightly above 1.0 keeps servers from being OOM killed
/// at their nominal limit.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Overhead {
    /// Disables the multiplier when set.
    #[serde(default, rename = "override")]
    r#override: bool,

    /// Multiplier applied to the configured memory limit.
    #[serde(default = "defaults::overhead_multiplier")]
    default_multiplier: f64,
}

/// Log driver configuration for server containers.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct DockerLogConfig {
    /// Driver name.
    #[serde(default = "defaults::log_driver", rename = "type")]
    driver: String,

    /// Driver-specific options.
    #[serde(default)]
    config: HashMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Overhead {
    /// Applies the overhead policy to a memory limit in bytes.
    pub fn apply(&self, memory_bytes: i64) -> i64 {
        if self.r#override || memory_bytes <= 0 {
            return memory_bytes;
        }

        (memory_bytes as f64 * self.default_multiplier) as i64
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for DockerConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty docker config must deserialize")
    }
}

impl Default for DockerNetwork {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty network config must deserialize")
    }
}

impl Default for InstallerLimits {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty installer limits must deserialize")
    }
}

impl Default for Overhead {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty overhead config must deserialize")
    }
}

impl Default for DockerLogConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty log config must deserialize")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overhead_multiplier_applies() {
        let overhead = Overhead {
            r#override: false,
            default_multiplier: 1.05,
        };
        assert_eq!(overhead.apply(1000), 1050);
        assert_eq!(overhead.apply(0), 0);
    }

    #[test]
    fn test_overhead_override_disables_multiplier() {
        let overhead = Overhead {
            r#override: true,
            default_multiplier: 1.05,
        };
        assert_eq!(overhead.apply(1000), 1000);
    }
}
