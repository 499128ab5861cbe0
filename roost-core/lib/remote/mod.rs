//! Client for the panel's remote API.
//!
//! The panel is authoritative for every server definition; the daemon pulls
//! configuration from it at boot and reports install and backup outcomes back
//! to it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::{Config, ConfigHandle},
    server::configuration::ServerConfiguration,
    RoostError, RoostResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Timeout applied to every panel request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Page size used when listing servers.
const SERVERS_PER_PAGE: usize = 50;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Authenticated HTTP client for the panel.
pub struct PanelClient {
    http: reqwest::Client,
    config: ConfigHandle,
}

/// One page of the server listing.
#[derive(Debug, Deserialize)]
struct ServerListPage {
    data: Vec<ServerConfiguration>,
    meta: PageMeta,
}

#[derive(Debug, Deserialize)]
struct PageMeta {
    current_page: usize,
    last_page: usize,
}

/// Install outcome reported to the panel.
#[derive(Debug, Serialize)]
struct InstallStatus {
    successful: bool,
    reinstall: bool,
}

/// Backup outcome reported to the panel.
#[derive(Debug, Serialize)]
pub struct BackupStatus {
    /// Whether the backup completed.
    pub successful: bool,

    /// Checksum of the archive, prefixed with the algorithm.
    pub checksum: String,

    /// Size of the archive in bytes.
    pub size: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PanelClient {
    /// Builds a client from the node configuration.
    pub fn new(config: ConfigHandle) -> RoostResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { http, config })
    }

    /// Fetches every server definition assigned to this node, walking the
    /// paginated listing until the last page.
    pub async fn servers(&self) -> RoostResult<Vec<ServerConfiguration>> {
        let mut collected = Vec::new();
        let mut page = 1;

        loop {
            let listing: ServerListPage = self
                .get(&format!(
                    "/api/remote/servers?page={}&per_page={}",
                    page, SERVERS_PER_PAGE
                ))
                .await?;

            collected.extend(listing.data);

            if listing.meta.current_page >= listing.meta.last_page {
                break;
            }
            page = listing.meta.current_page + 1;
        }

        tracing::info!("fetched {} server configurations from the panel", collected.len());
        Ok(collected)
    }

    /// Reports the outcome of a server installation.
    pub async fn report_install_status(
        &self,
        uuid: &Uuid,
        successful: bool,
        reinstall: bool,
    ) -> RoostResult<()> {
        self.post(
            &format!("/api/remote/servers/{}/install", uuid),
            &InstallStatus {
                successful,
                reinstall,
            },
        )
        .await
    }

    /// Reports the outcome of a backup.
    pub async fn report_backup_status(
        &self,
        backup: &Uuid,
        status: &BackupStatus,
    ) -> RoostResult<()> {
        self.post(&format!("/api/remote/backups/{}", backup), status)
            .await
    }

    //----------------------------------------------------------------------------------------------
    // Helpers
    //----------------------------------------------------------------------------------------------

    fn url(&self, path: &str) -> String {
        let snapshot = self.config.snapshot();
        format!("{}{}", snapshot.get_remote().trim_end_matches('/'), path)
    }

    fn token(&self) -> String {
        self.config.snapshot().api_token()
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> RoostResult<T> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(self.token())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        Self::parse(response).await
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> RoostResult<()> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(self.token())
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }

        Ok(())
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> RoostResult<T> {
        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }

        Ok(response.json().await?)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Fetches this node's configuration document from the panel and writes it to
/// `config_path`. Used by the `configure` subcommand with an application API
/// token rather than the node token.
pub async fn configure_from_panel(
    panel_url: &str,
    token: &str,
    node: &str,
    config_path: &std::path::Path,
    allow_insecure: bool,
) -> RoostResult<()> {
    let http = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .danger_accept_invalid_certs(allow_insecure)
        .build()?;

    let url = format!(
        "{}/api/application/nodes/{}/configuration",
        panel_url.trim_end_matches('/'),
        node
    );

    let response = http
        .get(&url)
        .bearer_auth(token)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await?;

    match response.status().as_u16() {
        401 | 403 => return Err(RoostError::Unauthorized),
        status if !response.status().is_success() => {
            return Err(RoostError::Remote {
                status,
                message: response.text().await.unwrap_or_default(),
            })
        }
        _ => {}
    }

    let config: Config = response.json().await?;
    config.write_to_disk(config_path)?;

    Ok(())
}

async fn remote_error(response: reqwest::Response) -> RoostError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();

    match status {
        401 => RoostError::Unauthorized,
        403 => RoostError::Forbidden,
        _ => RoostError::Remote { status, message },
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_list_page_parses() {
        let raw = serde_json::json!({
            "data": [{
                "uuid": "6f0c2a2e-8dbb-4ce3-9e23-7b3c1d9f5a11",
                "image": "ghcr.io/example/game:latest",
                "invocation": "./run.sh"
            }],
            "meta": { "current_page": 1, "last_page": 3 }
        });

        let page: ServerListPage = serde_json::from_value(raw).unwrap();
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.meta.last_page, 3);
    }

    #[test]
    fn test_backup_status_wire_shape() {
        let status = BackupStatus {
            successful: true,
            checksum: "sha256:abc".to_string(),
            size: 1024,
        };

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["checksum"], "sha256:abc");
        assert_eq!(value["size"], 1024);
    }
}
