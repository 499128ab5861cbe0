//! Server-to-server data transfers.
//!
//! The source daemon archives the server's data directory and streams it,
//! authenticated, to the target daemon's transfer endpoint. The target
//! creates the server under its own manager and restores the stream; any
//! failure aborts the target-side creation while the source stays untouched.

use std::{fs::File, path::PathBuf, sync::Arc};

use base64::{prelude::BASE64_STANDARD, Engine};
use flate2::{write::GzEncoder, Compression};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    server::{configuration::ServerConfiguration, Manager, Server, ServerState},
    RoostError, RoostResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Header carrying the base64-encoded server configuration document on an
/// incoming transfer.
pub const TRANSFER_CONFIGURATION_HEADER: &str = "X-Roost-Server-Configuration";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Streams this server's data directory to another daemon.
///
/// The archive is staged in the node's archive directory, posted to the
/// target with the provided transfer token, then removed. The local server is
/// left exactly as it was regardless of the outcome.
pub async fn push(
    server: &Arc<Server>,
    config: Arc<Config>,
    target_url: &str,
    token: &str,
) -> RoostResult<()> {
    if server.state() != ServerState::Offline {
        return Err(RoostError::InvalidPowerState {
            action: "transfer",
            state: server.state().as_str(),
        });
    }

    let archive_dir = PathBuf::from(config.get_system().get_archive_directory());
    tokio::fs::create_dir_all(&archive_dir).await?;
    let archive_path = archive_dir.join(format!("{}.tar.gz", server.uuid()));

    let root = server.filesystem().root().to_path_buf();
    let staging = archive_path.clone();
    tokio::task::spawn_blocking(move || -> RoostResult<()> {
        let encoder = GzEncoder::new(File::create(&staging)?, Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder.append_dir_all("", &root)?;
        builder.into_inner()?.finish()?;
        Ok(())
    })
    .await??;

    let result = stream_archive(server, &archive_path, target_url, token).await;

    if let Err(err) = tokio::fs::remove_file(&archive_path).await {
        tracing::warn!(
            "failed to remove staged transfer archive {}: {}",
            archive_path.display(),
            err
        );
    }

    result
}

/// Accepts an incoming transfer on the target daemon.
///
/// The server is created under the manager first, then the archive stream is
/// extracted into its root with the quota enforced. Any failure tears the
/// fresh server down again, leaving the node as if the transfer never
/// happened.
pub async fn receive<R>(
    manager: &Arc<Manager>,
    configuration: ServerConfiguration,
    stream: R,
) -> RoostResult<()>
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    let uuid = configuration.uuid;
    let server = manager.create_server(configuration, false).await?;

    let filesystem = Arc::clone(server.filesystem());
    let extraction = tokio::task::spawn_blocking(move || {
        let bridge = tokio_util::io::SyncIoBridge::new(stream);
        filesystem.extract_tar_gz_reader(bridge, &CancellationToken::new())
    })
    .await;

    let result = match extraction {
        Ok(result) => result,
        Err(err) => Err(err.into()),
    };

    if let Err(err) = result {
        tracing::error!(server = %uuid, "incoming transfer failed, rolling back: {}", err);
        if let Err(cleanup) = manager.delete_server(&uuid).await {
            tracing::error!(server = %uuid, "transfer rollback failed: {}", cleanup);
        }
        return Err(err);
    }

    server.publish_daemon_message("Transfer completed, server data restored on this node.");
    Ok(())
}

/// Encodes a configuration document for the transfer header.
pub fn encode_configuration(configuration: &ServerConfiguration) -> RoostResult<String> {
    Ok(BASE64_STANDARD.encode(serde_json::to_vec(configuration)?))
}

/// Decodes a configuration document from the transfer header.
pub fn decode_configuration(raw: &str) -> RoostResult<ServerConfiguration> {
    let bytes = BASE64_STANDARD
        .decode(raw)
        .map_err(|err| RoostError::InvalidArgument(format!("bad transfer header: {}", err)))?;

    Ok(serde_json::from_slice(&bytes)?)
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn stream_archive(
    server: &Arc<Server>,
    archive_path: &std::path::Path,
    target_url: &str,
    token: &str,
) -> RoostResult<()> {
    let configuration = server.configuration().await;

    let file = tokio::fs::File::open(archive_path).await?;
    let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));

    let response = reqwest::Client::new()
        .post(format!("{}/api/transfers", target_url.trim_end_matches('/')))
        .bearer_auth(token)
        .header(
            TRANSFER_CONFIGURATION_HEADER,
            encode_configuration(&configuration)?,
        )
        .body(body)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(RoostError::Remote {
            status: response.status().as_u16(),
            message: response.text().await.unwrap_or_default(),
        });
    }

    tracing::info!(server = %server.uuid(), "transferred server data to {}", target_url);
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::server::test_support::test_server_configuration;

    #[test]
    fn test_configuration_header_round_trip() {
        let configuration = test_server_configuration(Uuid::new_v4());

        let encoded = encode_configuration(&configuration).unwrap();
        let decoded = decode_configuration(&encoded).unwrap();

        assert_eq!(decoded.uuid, configuration.uuid);
        assert_eq!(decoded.image, configuration.image);
    }

    #[test]
    fn test_bad_header_is_rejected() {
        assert!(decode_configuration("%%%not-base64%%%").is_err());
    }
}
