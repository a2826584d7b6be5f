//! Remote data provider boundary.
//!
//! Defines the trait the scheduler talks to and a concrete HTTP client for a
//! Copernicus-style OData hub. Every download result is classified into a
//! [`DownloadOutcome`] variant; the scheduler never sees the provider's own
//! error taxonomy.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use md5::{Digest, Md5};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::models::{Credentials, DownloadOutcome, ProductMetadata};
use super::prober::{ARCHIVE_SUFFIX, INCOMPLETE_SUFFIX};

/// Marker the hub emits in 5xx bodies when a product is permanently broken
/// server-side. Other 5xx responses usually mean maintenance downtime.
const PERMANENT_FAULT_MARKER: &str = "NullPointerException";

/// Errors of the metadata lookup path.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("product does not exist at the remote provider")]
    NotFound,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Remote provider operations the scheduler depends on.
///
/// Credentials are supplied per call; how callers obtain them is out of
/// scope here.
#[async_trait]
pub trait ProductProvider: Send + Sync {
    /// Resolve product metadata. Fails with [`ProviderError::NotFound`] if
    /// the id is unknown remotely.
    async fn lookup_metadata(
        &self,
        id: &str,
        credentials: &Credentials,
    ) -> Result<ProductMetadata, ProviderError>;

    /// Download the product archive into `destination_dir`, classifying the
    /// result. Network faults mid-transfer classify as
    /// [`DownloadOutcome::TransientError`], never as a hard error.
    async fn download(
        &self,
        id: &str,
        destination_dir: &Path,
        credentials: &Credentials,
    ) -> Result<DownloadOutcome>;
}

#[derive(Debug, Deserialize)]
struct ODataEnvelope {
    d: ODataProduct,
}

#[derive(Debug, Deserialize)]
struct ODataProduct {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Checksum")]
    checksum: Option<ODataChecksum>,
}

#[derive(Debug, Deserialize)]
struct ODataChecksum {
    #[serde(rename = "Value")]
    value: String,
}

/// HTTP client for the Copernicus OData hub.
#[derive(Clone)]
pub struct CopernicusClient {
    client: Client,
    base_url: String,
}

impl CopernicusClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `base_url` - Hub base URL (e.g. "https://apihub.copernicus.eu/apihub")
    /// * `timeout_secs` - Request timeout; bounds each download attempt
    pub fn new(base_url: String, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn product_url(&self, id: &str) -> String {
        format!("{}/odata/v1/Products('{}')", self.base_url, id)
    }

    /// Stream the response body into `{title}.zip.incomplete`, hashing as it
    /// goes, then promote the file to `{title}.zip`. Returns the MD5 hex
    /// digest of the written bytes.
    async fn stream_to_archive(
        &self,
        response: reqwest::Response,
        destination_dir: &Path,
        title: &str,
    ) -> Result<String, DownloadOutcome> {
        let incomplete_path =
            destination_dir.join(format!("{title}{ARCHIVE_SUFFIX}{INCOMPLETE_SUFFIX}"));
        let archive_path = destination_dir.join(format!("{title}{ARCHIVE_SUFFIX}"));

        let mut file = tokio::fs::File::create(&incomplete_path)
            .await
            .map_err(|e| DownloadOutcome::TransientError(e.to_string()))?;

        let mut hasher = Md5::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            // The partial file stays behind on failure; the prober reports
            // it as INCOMPLETE until the next attempt replaces it.
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return Err(DownloadOutcome::TransientError(e.to_string())),
            };
            hasher.update(&chunk);
            if let Err(e) = file.write_all(&chunk).await {
                return Err(DownloadOutcome::TransientError(e.to_string()));
            }
        }
        if let Err(e) = file.flush().await {
            return Err(DownloadOutcome::TransientError(e.to_string()));
        }
        drop(file);

        if let Err(e) = tokio::fs::rename(&incomplete_path, &archive_path).await {
            return Err(DownloadOutcome::TransientError(e.to_string()));
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

#[async_trait]
impl ProductProvider for CopernicusClient {
    async fn lookup_metadata(
        &self,
        id: &str,
        credentials: &Credentials,
    ) -> Result<ProductMetadata, ProviderError> {
        let url = format!("{}?$format=json", self.product_url(id));
        let response = self
            .client
            .get(&url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await
            .with_context(|| format!("Metadata request failed for product {id}"))?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => {
                // The hub answers 400 for syntactically invalid ids and 404
                // for well-formed unknown ones.
                return Err(ProviderError::NotFound);
            }
            status if !status.is_success() => {
                return Err(ProviderError::Other(anyhow!(
                    "Metadata request for product {id} failed with status {status}"
                )));
            }
            _ => {}
        }

        let envelope: ODataEnvelope = response
            .json()
            .await
            .with_context(|| format!("Failed to parse metadata for product {id}"))?;
        debug!("Resolved metadata for {}: {}", id, envelope.d.name);

        Ok(ProductMetadata {
            id: envelope.d.id,
            title: envelope.d.name,
            checksum_md5: envelope
                .d
                .checksum
                .map(|c| c.value.to_ascii_lowercase()),
        })
    }

    async fn download(
        &self,
        id: &str,
        destination_dir: &Path,
        credentials: &Credentials,
    ) -> Result<DownloadOutcome> {
        // The archive is named after the resolved title, so metadata comes
        // first; a lookup failure here is transient by definition (the id
        // was validated when the request was created).
        let metadata = match self.lookup_metadata(id, credentials).await {
            Ok(metadata) => metadata,
            Err(ProviderError::NotFound) => {
                return Ok(DownloadOutcome::PermanentServerError(format!(
                    "product {id} disappeared from the remote catalogue"
                )));
            }
            Err(ProviderError::Other(e)) => {
                return Ok(DownloadOutcome::TransientError(e.to_string()));
            }
        };

        let url = format!("{}/$value", self.product_url(id));
        info!("Initiating download for product {}", id);
        let response = match self
            .client
            .get(&url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Ok(DownloadOutcome::TransientError(e.to_string())),
        };

        match response.status() {
            StatusCode::ACCEPTED => {
                // Offline product; the hub has begun retrieval from the
                // long-term archive.
                return Ok(DownloadOutcome::StagingTriggered);
            }
            StatusCode::FORBIDDEN => {
                // Retrieval quota exhausted or staging rejected outright.
                return Ok(DownloadOutcome::StagingRefused);
            }
            status if status.is_server_error() => {
                let body = response.text().await.unwrap_or_default();
                warn!("Hub server error for product {}: {}", id, body);
                if body.contains(PERMANENT_FAULT_MARKER) {
                    return Ok(DownloadOutcome::PermanentServerError(body));
                }
                return Ok(DownloadOutcome::TransientError(body));
            }
            status if !status.is_success() => {
                return Ok(DownloadOutcome::TransientError(format!(
                    "download request for product {id} failed with status {status}"
                )));
            }
            _ => {}
        }

        let digest = match self
            .stream_to_archive(response, destination_dir, &metadata.title)
            .await
        {
            Ok(digest) => digest,
            Err(outcome) => return Ok(outcome),
        };

        if let Some(expected) = &metadata.checksum_md5 {
            if &digest != expected {
                // The completed archive is left in place; the scheduler owns
                // cleanup of corrupted artifacts.
                warn!(
                    "Checksum mismatch for product {}: expected {}, got {}",
                    id, expected, digest
                );
                return Ok(DownloadOutcome::ChecksumMismatch);
            }
        }

        info!("Download complete for product {}", id);
        Ok(DownloadOutcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_client_trims_trailing_slash() {
        let client = CopernicusClient::new("https://hub.example/apihub/".to_string(), 30).unwrap();
        assert_eq!(client.base_url(), "https://hub.example/apihub");
    }

    #[test]
    fn test_product_url_shape() {
        let client = CopernicusClient::new("https://hub.example/apihub".to_string(), 30).unwrap();
        assert_eq!(
            client.product_url("P1"),
            "https://hub.example/apihub/odata/v1/Products('P1')"
        );
    }
}
