//! Request and response payload definitions for the node API.

use roost_core::{
    filesystem::FileEntry,
    server::{configuration::ServerConfiguration, PowerAction, ServerState},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

//--------------------------------------------------------------------------------------------------
// Types: Requests
//--------------------------------------------------------------------------------------------------

/// Request payload for creating a server on this node.
#[derive(Debug, Deserialize)]
pub struct CreateServerRequest {
    /// The panel-authored configuration document.
    #[serde(flatten)]
    pub configuration: ServerConfiguration,

    /// Starts the server once installation completes.
    #[serde(default)]
    pub start_on_completion: bool,
}

/// Request payload for a power action.
#[derive(Debug, Deserialize)]
pub struct PowerRequest {
    /// The action to perform.
    pub action: PowerAction,
}

/// Request payload for sending console commands.
#[derive(Debug, Deserialize)]
pub struct SendCommandsRequest {
    /// Commands written to the process stdin, in order.
    pub commands: Vec<String>,
}

/// Query parameters for the file listing endpoint.
#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    /// Directory to list, relative to the server root.
    #[serde(default = "default_directory")]
    pub directory: String,
}

/// Query parameters for the file write endpoint.
#[derive(Debug, Deserialize)]
pub struct WriteFileQuery {
    /// Target path, relative to the server root.
    pub file: String,
}

/// Request payload for creating an archive.
#[derive(Debug, Deserialize)]
pub struct CompressFilesRequest {
    /// Directory the paths are relative to.
    #[serde(default = "default_directory")]
    pub root: String,

    /// Files and directories to include.
    pub files: Vec<String>,
}

/// Request payload for extracting an archive.
#[derive(Debug, Deserialize)]
pub struct DecompressFileRequest {
    /// Directory the archive sits in and extracts into.
    #[serde(default = "default_directory")]
    pub root: String,

    /// Archive file name within the root.
    pub file: String,
}

/// Request payload for creating a backup.
#[derive(Debug, Deserialize)]
pub struct CreateBackupRequest {
    /// Backup identifier assigned by the panel.
    pub uuid: Uuid,

    /// Gitignore-style globs excluded from the archive.
    #[serde(default)]
    pub ignore: Vec<String>,
}

/// Request payload for pushing a server to another node.
#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    /// Base URL of the target daemon.
    pub url: String,

    /// Credential the target daemon expects.
    pub token: String,
}

//--------------------------------------------------------------------------------------------------
// Types: Responses
//--------------------------------------------------------------------------------------------------

/// Generic message response.
#[derive(Debug, Serialize)]
pub struct RegularMessageResponse {
    /// Human-readable outcome.
    pub message: String,
}

/// Error response body. Internal errors carry a correlation uuid that is
/// mirrored in the daemon log.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error.
    pub error: String,

    /// Correlation uuid, present on internal errors only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_id: Option<String>,
}

/// Details for one server.
#[derive(Debug, Serialize)]
pub struct ServerDetailsResponse {
    /// The server identifier.
    pub uuid: Uuid,

    /// Current lifecycle state.
    pub state: ServerState,

    /// Whether the panel has suspended the server.
    pub is_suspended: bool,

    /// Approximate bytes used on disk.
    pub disk_used: i64,

    /// Disk quota in bytes, zero when unlimited.
    pub disk_limit: i64,
}

/// Directory listing response.
#[derive(Debug, Serialize)]
pub struct ListFilesResponse {
    /// Entries, directories first.
    pub files: Vec<FileEntry>,
}

/// Node information for the panel.
#[derive(Debug, Serialize)]
pub struct SystemInformationResponse {
    /// Daemon version.
    pub version: String,

    /// Kernel architecture the daemon was built for.
    pub architecture: String,

    /// Operating system the daemon was built for.
    pub os: String,

    /// Number of servers managed by this node.
    pub server_count: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ErrorResponse {
    /// A plain error body.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_id: None,
        }
    }

    /// An error body carrying a correlation uuid.
    pub fn with_id(error: impl Into<String>, error_id: Uuid) -> Self {
        Self {
            error: error.into(),
            error_id: Some(error_id.to_string()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn default_directory() -> String {
    "/".to_string()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_power_request_parses_actions() {
        let request: PowerRequest = serde_json::from_value(json!({"action": "start"})).unwrap();
        assert_eq!(request.action, PowerAction::Start);

        let request: PowerRequest = serde_json::from_value(json!({"action": "kill"})).unwrap();
        assert_eq!(request.action, PowerAction::Kill);

        assert!(serde_json::from_value::<PowerRequest>(json!({"action": "reboot"})).is_err());
    }

    #[test]
    fn test_create_server_request_flattens_configuration() {
        let request: CreateServerRequest = serde_json::from_value(json!({
            "uuid": "6f0c2a2e-8dbb-4ce3-9e23-7b3c1d9f5a11",
            "image": "ghcr.io/example/game:latest",
            "invocation": "./run.sh",
            "start_on_completion": true
        }))
        .unwrap();

        assert!(request.start_on_completion);
        assert_eq!(request.configuration.image, "ghcr.io/example/game:latest");
    }

    #[test]
    fn test_compress_request_defaults_root() {
        let request: CompressFilesRequest =
            serde_json::from_value(json!({"files": ["world"]})).unwrap();
        assert_eq!(request.root, "/");
    }

    #[test]
    fn test_error_response_hides_missing_id() {
        let body = serde_json::to_value(ErrorResponse::new("nope")).unwrap();
        assert!(body.get("error_id").is_none());
    }
}
