//! Error types used throughout the roost core.
//!
//! Every error carries a stable machine-readable [`ErrorKind`] that survives
//! wrapping across layers. The HTTP layer maps kinds onto status codes, so a
//! kind must never be hidden by re-wrapping.

use std::path::PathBuf;

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Result type alias for roost core operations.
pub type RoostResult<T> = std::result::Result<T, RoostError>;

/// Stable, machine-readable error categories surfaced to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A path resolved to a location outside the server root.
    PathResolution,

    /// A write targeted a path matched by the server denylist.
    Denylist,

    /// The operation would exceed the server disk quota.
    DiskSpace,

    /// A file was expected but a directory was found.
    IsDirectory,

    /// No supported archive format matched the input.
    UnknownArchive,

    /// The operating system rejected a path component as too long.
    NameTooLong,

    /// The requested entity does not exist.
    NotFound,

    /// A power action is already in progress for the server.
    Busy,

    /// A crash-triggered restart was suppressed by the cooldown window.
    CrashTooFrequent,

    /// Authentication is missing or invalid.
    Unauthorized,

    /// The authenticated caller is not allowed to perform the operation.
    Forbidden,

    /// Any other failure. Reported with a correlation uuid.
    Internal,
}

impl ErrorKind {
    /// The stable wire tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PathResolution => "path_resolution",
            ErrorKind::Denylist => "denylist",
            ErrorKind::DiskSpace => "disk_space",
            ErrorKind::IsDirectory => "is_directory",
            ErrorKind::UnknownArchive => "unknown_archive",
            ErrorKind::NameTooLong => "name_too_long",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Busy => "busy",
            ErrorKind::CrashTooFrequent => "crash_too_frequent",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Errors produced by the roost core.
#[derive(Debug, Error)]
pub enum RoostError {
    /// The path escapes the server root after symlink expansion.
    #[error("filesystem: path '{0}' resolves to a location outside the server root")]
    PathResolution(PathBuf),

    /// The path is matched by the server's file denylist.
    #[error("filesystem: file access prohibited: '{0}' is on the denylist")]
    DenylistFile(PathBuf),

    /// The operation would put the server over its disk quota.
    #[error("filesystem: not enough disk space")]
    DiskSpace,

    /// A file operation hit a directory.
    #[error("filesystem: is a directory: '{0}'")]
    IsDirectory(PathBuf),

    /// None of the supported archive formats matched the file header.
    #[error("archive: unknown or unsupported archive format")]
    UnknownArchive,

    /// An entity lookup failed.
    #[error("{0} not found")]
    NotFound(String),

    /// Another power action currently holds the server's action lock.
    #[error("another power action is currently being processed for this server")]
    PowerLocked,

    /// The requested power action is not valid in the server's current state.
    #[error("cannot {action} server while it is {state}")]
    InvalidPowerState {
        /// The refused action.
        action: &'static str,
        /// The state the server was observed in.
        state: &'static str,
    },

    /// The server is suspended and may not be started.
    #[error("server is suspended and cannot be started")]
    Suspended,

    /// A crash-triggered restart happened within the cooldown window.
    #[error("aborting automatic restart, last crash occurred within the cooldown window")]
    CrashTooFrequent,

    /// Authentication failure against the node token.
    #[error("the credentials provided were not valid")]
    Unauthorized,

    /// The caller is authenticated but not permitted.
    #[error("this operation is not permitted")]
    Forbidden,

    /// The operation was cancelled before it completed.
    #[error("operation was cancelled")]
    Cancelled,

    /// The node configuration file is missing or malformed.
    #[error("config: {0}")]
    Configuration(String),

    /// The panel rejected or failed a remote API request.
    #[error("remote: panel request failed with status {status}: {message}")]
    Remote {
        /// HTTP status returned by the panel.
        status: u16,
        /// Response body or a short description.
        message: String,
    },

    /// An invalid argument was passed to a core operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error from the Docker daemon.
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// A YAML (de)serialization failure.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An HTTP client failure talking to the panel or a peer node.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A zip archive failure.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A background task panicked or was aborted.
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RoostError {
    /// Returns the stable kind for this error.
    ///
    /// I/O errors are inspected so that OS-level conditions keep their
    /// specific tags (`not_found`, `name_too_long`) instead of collapsing
    /// into `internal`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoostError::PathResolution(_) => ErrorKind::PathResolution,
            RoostError::DenylistFile(_) => ErrorKind::Denylist,
            RoostError::DiskSpace => ErrorKind::DiskSpace,
            RoostError::IsDirectory(_) => ErrorKind::IsDirectory,
            RoostError::UnknownArchive => ErrorKind::UnknownArchive,
            RoostError::NotFound(_) => ErrorKind::NotFound,
            RoostError::PowerLocked => ErrorKind::Busy,
            RoostError::InvalidPowerState { .. } => ErrorKind::Busy,
            RoostError::Suspended => ErrorKind::Forbidden,
            RoostError::CrashTooFrequent => ErrorKind::CrashTooFrequent,
            RoostError::Unauthorized => ErrorKind::Unauthorized,
            RoostError::Forbidden => ErrorKind::Forbidden,
            RoostError::Io(err) => match err.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                _ => match err.raw_os_error() {
                    // ENAMETOOLONG is not represented by std::io::ErrorKind.
                    Some(36) => ErrorKind::NameTooLong,
                    _ => ErrorKind::Internal,
                },
            },
            _ => ErrorKind::Internal,
        }
    }

    /// Returns true when the error carries the given stable kind.
    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(ErrorKind::PathResolution.as_str(), "path_resolution");
        assert_eq!(ErrorKind::Denylist.as_str(), "denylist");
        assert_eq!(ErrorKind::DiskSpace.as_str(), "disk_space");
        assert_eq!(ErrorKind::CrashTooFrequent.as_str(), "crash_too_frequent");
        assert_eq!(ErrorKind::Busy.as_str(), "busy");
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err = RoostError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_name_too_long_maps_from_errno() {
        let err = RoostError::from(std::io::Error::from_raw_os_error(36));
        assert_eq!(err.kind(), ErrorKind::NameTooLong);
    }

    #[test]
    fn test_power_errors_map_to_busy() {
        assert_eq!(RoostError::PowerLocked.kind(), ErrorKind::Busy);
        assert_eq!(
            RoostError::InvalidPowerState {
                action: "start",
                state: "running"
            }
            .kind(),
            ErrorKind::Busy
        );
    }
}
