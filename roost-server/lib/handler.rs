//! Request handlers for the node API.
//!
//! Handlers stay thin: they resolve the server, validate the payload and
//! delegate to the core engine. Error kinds map onto status codes in the
//! error module, so nothing here constructs a status by hand except the
//! success codes.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, Request, StatusCode},
    response::IntoResponse,
    Json,
};
use futures::TryStreamExt;
use roost_core::{
    backup::Backup,
    remote::BackupStatus,
    server::Server,
    transfer::{self, TRANSFER_CONFIGURATION_HEADER},
};
use tokio_util::{io::StreamReader, sync::CancellationToken};
use uuid::Uuid;

use crate::{
    error::{ApiError, ServerResult},
    payload::{
        CompressFilesRequest, CreateBackupRequest, CreateServerRequest, DecompressFileRequest,
        ListFilesQuery, ListFilesResponse, PowerRequest, RegularMessageResponse,
        SendCommandsRequest, ServerDetailsResponse, SystemInformationResponse, TransferRequest,
        WriteFileQuery,
    },
    state::AppState,
};

//--------------------------------------------------------------------------------------------------
// Functions: System Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for node information.
pub async fn system_information(
    State(state): State<AppState>,
) -> ServerResult<impl IntoResponse> {
    Ok(Json(SystemInformationResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        architecture: std::env::consts::ARCH.to_string(),
        os: std::env::consts::OS.to_string(),
        server_count: state.get_manager().len().await,
    }))
}

//--------------------------------------------------------------------------------------------------
// Functions: Server Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for creating a server from a panel sync.
pub async fn create_server(
    State(state): State<AppState>,
    Json(request): Json<CreateServerRequest>,
) -> ServerResult<impl IntoResponse> {
    let manager = state.get_manager();
    let server = manager
        .create_server(request.configuration, request.start_on_completion)
        .await?;

    tracing::info!(server = %server.uuid(), "accepted server from the panel");

    Ok((
        StatusCode::ACCEPTED,
        Json(RegularMessageResponse {
            message: format!("Server {} is being installed.", server.uuid()),
        }),
    ))
}

/// Handler for viewing a server's state and disk usage.
pub async fn view_server(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> ServerResult<impl IntoResponse> {
    let server = fetch_server(&state, &uuid).await?;
    let configuration = server.configuration().await;

    Ok(Json(ServerDetailsResponse {
        uuid: server.uuid(),
        state: server.state(),
        is_suspended: configuration.suspended,
        disk_used: server.filesystem().cached_usage(),
        disk_limit: server.filesystem().disk_limit(),
    }))
}

/// Handler for removing a server from this node.
pub async fn delete_server(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> ServerResult<impl IntoResponse> {
    state.get_manager().delete_server(&uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for power actions.
pub async fn power(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Json(request): Json<PowerRequest>,
) -> ServerResult<impl IntoResponse> {
    let server = fetch_server(&state, &uuid).await?;
    server.handle_power_action(request.action).await?;

    Ok(StatusCode::ACCEPTED)
}

/// Handler for writing console commands to the process stdin.
pub async fn send_commands(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Json(request): Json<SendCommandsRequest>,
) -> ServerResult<impl IntoResponse> {
    let server = fetch_server(&state, &uuid).await?;

    for command in &request.commands {
        server.send_command(command).await?;
    }

    Ok(StatusCode::NO_CONTENT)
}

//--------------------------------------------------------------------------------------------------
// Functions: File Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for directory listings.
pub async fn list_files(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Query(query): Query<ListFilesQuery>,
) -> ServerResult<impl IntoResponse> {
    let server = fetch_server(&state, &uuid).await?;
    let files = server.filesystem().list_directory(&query.directory).await?;

    Ok(Json(ListFilesResponse { files }))
}

/// Handler for streamed file uploads. The body streams straight through the
/// quota-checked writer, so an over-quota upload fails mid-stream with a
/// `disk_space` error and leaves nothing behind.
pub async fn write_file(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Query(query): Query<WriteFileQuery>,
    request: Request<Body>,
) -> ServerResult<impl IntoResponse> {
    let server = fetch_server(&state, &uuid).await?;

    let stream = request
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);
    let reader = StreamReader::new(stream);

    server.filesystem().write_file(&query.file, reader).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Handler for creating a `tar.gz` of selected paths.
pub async fn compress_files(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Json(request): Json<CompressFilesRequest>,
) -> ServerResult<impl IntoResponse> {
    if request.files.is_empty() {
        return Err(ApiError::Validation(
            "at least one file must be provided".to_string(),
        ));
    }

    let server = fetch_server(&state, &uuid).await?;
    let archive = server
        .filesystem()
        .compress_files(&request.root, request.files, CancellationToken::new())
        .await?;

    Ok(Json(archive))
}

/// Handler for extracting an archive in place. The declared sizes are checked
/// against the quota before a single byte is written.
pub async fn decompress_file(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Json(request): Json<DecompressFileRequest>,
) -> ServerResult<impl IntoResponse> {
    let server = fetch_server(&state, &uuid).await?;
    let filesystem = server.filesystem();

    filesystem
        .space_available_for_decompression(&request.root, &request.file, CancellationToken::new())
        .await?;
    filesystem
        .decompress(&request.root, &request.file, CancellationToken::new())
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

//--------------------------------------------------------------------------------------------------
// Functions: Backup Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for creating a backup and reporting it to the panel.
pub async fn create_backup(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Json(request): Json<CreateBackupRequest>,
) -> ServerResult<impl IntoResponse> {
    let server = fetch_server(&state, &uuid).await?;
    let config = state.get_config().snapshot();

    let backup = Backup::new(request.uuid, request.ignore);
    let result = backup.create(&server, config).await;

    if let Some(panel) = state.get_panel() {
        let status = match &result {
            Ok(details) => BackupStatus {
                successful: true,
                checksum: details.checksum.clone(),
                size: details.size,
            },
            Err(_) => BackupStatus {
                successful: false,
                checksum: String::new(),
                size: 0,
            },
        };

        if let Err(err) = panel.report_backup_status(&request.uuid, &status).await {
            tracing::warn!(backup = %request.uuid, "failed to report backup status: {}", err);
        }
    }

    Ok(Json(result?))
}

/// Handler for restoring a backup into the server root.
pub async fn restore_backup(
    State(state): State<AppState>,
    Path((uuid, backup)): Path<(Uuid, Uuid)>,
) -> ServerResult<impl IntoResponse> {
    let server = fetch_server(&state, &uuid).await?;
    let config = state.get_config().snapshot();

    server.publish_daemon_message("Restoring this server from a backup...");
    Backup::new(backup, Vec::new())
        .restore(&server, config, CancellationToken::new())
        .await?;
    server.publish_daemon_message("Backup restore completed.");

    Ok(StatusCode::NO_CONTENT)
}

/// Handler for deleting a backup archive.
pub async fn delete_backup(
    State(state): State<AppState>,
    Path((uuid, backup)): Path<(Uuid, Uuid)>,
) -> ServerResult<impl IntoResponse> {
    // The server must exist even though the archive lives outside its root.
    let _server = fetch_server(&state, &uuid).await?;

    Backup::new(backup, Vec::new())
        .delete(state.get_config().snapshot())
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

//--------------------------------------------------------------------------------------------------
// Functions: Transfer Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for pushing a server to another node.
pub async fn transfer_server(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Json(request): Json<TransferRequest>,
) -> ServerResult<impl IntoResponse> {
    let server = fetch_server(&state, &uuid).await?;
    let config = state.get_config().snapshot();

    transfer::push(&server, config, &request.url, &request.token).await?;

    Ok(StatusCode::ACCEPTED)
}

/// Handler for accepting a transferred server on this node.
pub async fn receive_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request<Body>,
) -> ServerResult<impl IntoResponse> {
    let encoded = headers
        .get(TRANSFER_CONFIGURATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            ApiError::Validation("missing the server configuration header".to_string())
        })?;
    let configuration = transfer::decode_configuration(encoded)?;

    let stream = request
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);
    let reader = StreamReader::new(stream);

    transfer::receive(state.get_manager(), configuration, reader).await?;

    Ok(StatusCode::NO_CONTENT)
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn fetch_server(state: &AppState, uuid: &Uuid) -> ServerResult<Arc<Server>> {
    state
        .get_manager()
        .get(uuid)
        .await
        .ok_or_else(|| ApiError::server_not_found(uuid))
}
