//! Default values and well-known paths for the node configuration.

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Well-known location of the node configuration document.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/roost/config.yml";

/// Subdirectory of the root directory holding per-server configuration documents.
pub const SERVERS_SUBDIR: &str = "servers";

/// Environment variable overriding the configuration path.
pub const ROOST_CONFIG_ENV_VAR: &str = "ROOST_CONFIG";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

pub(super) fn api_host() -> String {
    "0.0.0.0".to_string()
}

pub(super) fn api_port() -> u16 {
    8080
}

pub(super) fn upload_limit() -> u64 {
    100
}

pub(super) fn root_directory() -> String {
    "/var/lib/roost".to_string()
}

pub(super) fn log_directory() -> String {
    "/var/log/roost".to_string()
}

pub(super) fn data_directory() -> String {
    "/var/lib/roost/volumes".to_string()
}

pub(super) fn archive_directory() -> String {
    "/var/lib/roost/archives".to_string()
}

pub(super) fn backup_directory() -> String {
    "/var/lib/roost/backups".to_string()
}

pub(super) fn username() -> String {
    "roost".to_string()
}

pub(super) fn timezone() -> String {
    "UTC".to_string()
}

pub(super) fn disk_check_interval() -> u64 {
    150
}

pub(super) fn activity_send_interval() -> u64 {
    60
}

pub(super) fn activity_send_count() -> usize {
    100
}

pub(super) fn websocket_log_count() -> usize {
    150
}

pub(super) fn enabled() -> bool {
    true
}

pub(super) fn sftp_bind_address() -> String {
    "0.0.0.0".to_string()
}

pub(super) fn sftp_bind_port() -> u16 {
    2022
}

pub(super) fn crash_timeout() -> u64 {
    60
}

pub(super) fn docker_network_name() -> String {
    "roost0".to_string()
}

pub(super) fn docker_network_driver() -> String {
    "bridge".to_string()
}

pub(super) fn tmpfs_size() -> u64 {
    100
}

pub(super) fn container_pid_limit() -> i64 {
    512
}

pub(super) fn installer_memory() -> i64 {
    1024
}

pub(super) fn installer_cpu() -> i64 {
    100
}

pub(super) fn overhead_multiplier() -> f64 {
    1.05
}

pub(super) fn log_driver() -> String {
    "local".to_string()
}
