//! Host-level system configuration.

use getset::Getters;
use serde::{Deserialize, Serialize};

use super::defaults;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Paths, intervals and feature toggles for the host this daemon runs on.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SystemConfig {
    /// Directory holding daemon state, including server configuration documents.
    #[serde(default = "defaults::root_directory")]
    root_directory: String,

    /// Directory the daemon writes its log files to.
    #[serde(default = "defaults::log_directory")]
    log_directory: String,

    /// Directory holding every server's data directory.
    #[serde(default = "defaults::data_directory")]
    data: String,

    /// Directory used for transfer archives in flight.
    #[serde(default = "defaults::archive_directory")]
    archive_directory: String,

    /// Directory server backups are written to.
    #[serde(default = "defaults::backup_directory")]
    backup_directory: String,

    /// System user that owns server files.
    #[serde(default = "defaults::username")]
    username: String,

    /// Timezone passed into containers.
    #[serde(default = "defaults::timezone")]
    timezone: String,

    /// Uid/gid that own server files.
    #[serde(default)]
    user: SystemUser,

    /// Seconds a cached disk-usage value stays fresh before a rescan.
    #[serde(default = "defaults::disk_check_interval")]
    disk_check_interval: u64,

    /// Seconds between pushes of buffered activity to the panel.
    #[serde(default = "defaults::activity_send_interval")]
    activity_send_interval: u64,

    /// Maximum activity records per push.
    #[serde(default = "defaults::activity_send_count")]
    activity_send_count: usize,

    /// Re-chowns server data directories during boot when enabled.
    #[serde(default)]
    check_permissions_on_boot: bool,

    /// Enables rotation of the daemon log file.
    #[serde(default = "defaults::enabled")]
    enable_log_rotate: bool,

    /// Number of backlog console lines replayed to a new websocket.
    #[serde(default = "defaults::websocket_log_count")]
    websocket_log_count: usize,

    /// When enabled, archive entry names that are not valid UTF-8 are decoded
    /// best-effort instead of failing the entry.
    #[serde(default)]
    legacy_filename_fallback: bool,

    /// SFTP subsystem settings.
    #[serde(default)]
    sftp: SftpConfig,

    /// Crash detection policy applied to unexpected container exits.
    #[serde(default)]
    crash_detection: CrashDetection,

    /// Backup write behavior.
    #[serde(default)]
    backups: Backups,
}

/// Uid/gid pair owning server data.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SystemUser {
    /// Owning user id.
    #[serde(default)]
    uid: u32,

    /// Owning group id.
    #[serde(default)]
    gid: u32,
}

/// SFTP subsystem settings. The daemon carries these even though the SFTP
/// listener itself lives outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SftpConfig {
    /// Interface the SFTP listener binds to.
    #[serde(default = "defaults::sftp_bind_address")]
    bind_address: String,

    /// Port the SFTP listener binds to.
    #[serde(default = "defaults::sftp_bind_port")]
    bind_port: u16,

    /// Rejects every mutating SFTP operation when enabled.
    #[serde(default)]
    read_only: bool,

    /// Skips quota accounting for SFTP writes when enabled.
    #[serde(default)]
    disable_diskchecking: bool,
}

/// Crash detection policy.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct CrashDetection {
    /// Master switch for crash detection.
    #[serde(default = "defaults::enabled")]
    enabled: bool,

    /// Treats a clean exit (code 0, no OOM) as a crash when enabled.
    #[serde(default)]
    detect_clean_exit_as_crash: bool,

    /// Cooldown window in seconds. Zero always restarts.
    #[serde(default = "defaults::crash_timeout")]
    timeout: u64,
}

/// Backup write behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Backups {
    /// Throughput cap for backup writes in mebibytes per second. Zero disables
    /// the cap.
    #[serde(default)]
    write_limit: u64,

    /// Gzip level applied to backup archives.
    #[serde(default)]
    compression_level: CompressionLevel,
}

/// Gzip compression level names accepted in the configuration document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// No compression, archive is a plain tarball in a gzip frame.
    None,

    /// Fastest compression.
    #[default]
    BestSpeed,

    /// Smallest output.
    BestCompression,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CompressionLevel {
    /// Converts the configured name into a flate2 level.
    pub fn to_flate2(self) -> flate2::Compression {
        match self {
            CompressionLevel::None => flate2::Compression::none(),
            CompressionLevel::BestSpeed => flate2::Compression::fast(),
            CompressionLevel::BestCompression => flate2::Compression::best(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for SystemConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty system config must deserialize")
    }
}

impl Default for SftpConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty sftp config must deserialize")
    }
}

impl Default for CrashDetection {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty crash detection config must deserialize")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_level_names() {
        let parsed: CompressionLevel = serde_yaml::from_str("best_compression").unwrap();
        assert_eq!(parsed, CompressionLevel::BestCompression);

        let parsed: CompressionLevel = serde_yaml::from_str("none").unwrap();
        assert_eq!(parsed, CompressionLevel::None);
    }

    #[test]
    fn test_crash_detection_defaults() {
        let detection = CrashDetection::default();
        assert!(detection.get_enabled());
        assert!(!detection.get_detect_clean_exit_as_crash());
        assert_eq!(*detection.get_timeout(), 60);
    }
}
