//! # Bulk Transport
//!
//! Fetches asset payloads. The sync engine only needs
//! `download(path) -> bytes`; the HTTP implementation resolves the path
//! against the configured media base URL.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::{validate_url, SyncConfig};
use crate::error::{SyncError, SyncResult};

/// Retrieves binary payloads by relative path.
#[async_trait]
pub trait BulkTransport: Send + Sync {
    async fn download(&self, path: &str) -> SyncResult<Bytes>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpBulkTransport {
    client: reqwest::Client,
    base: Url,
}

impl HttpBulkTransport {
    pub fn new(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        let mut base = validate_url(base_url, &["http", "https"], "Media URL")?;
        // Without a trailing slash `join` would replace the last segment.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(HttpBulkTransport { client, base })
    }

    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        Self::new(&config.server.media_url, config.download_timeout())
    }

    /// Full URL for a relative asset path.
    pub fn url_for(&self, path: &str) -> SyncResult<Url> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }
}

#[async_trait]
impl BulkTransport for HttpBulkTransport {
    async fn download(&self, path: &str) -> SyncResult<Bytes> {
        let url = self.url_for(path)?;
        debug!(%url, "Downloading");

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::DownloadFailed {
                filename: path.to_string(),
                reason: format!("HTTP {status}"),
            });
        }

        let body = response.bytes().await?;
        debug!(%url, bytes = body.len(), "Download complete");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_url_join_keeps_base_path() {
        let transport =
            HttpBulkTransport::new("http://10.0.0.2:8080/files", Duration::from_secs(5)).unwrap();
        assert_eq!(
            transport.url_for("media/a.gif").unwrap().as_str(),
            "http://10.0.0.2:8080/files/media/a.gif"
        );
    }

    #[test]
    fn test_rejects_non_http_base() {
        assert!(HttpBulkTransport::new("ftp://host/media", Duration::from_secs(5)).is_err());
    }

    #[tokio::test]
    async fn test_download_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/a.gif"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"GIF89a-payload".to_vec()))
            .mount(&server)
            .await;

        let transport = HttpBulkTransport::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let body = transport.download("media/a.gif").await.unwrap();
        assert_eq!(&body[..], b"GIF89a-payload");
    }

    #[tokio::test]
    async fn test_download_maps_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let transport = HttpBulkTransport::new(&server.uri(), Duration::from_secs(5)).unwrap();
        match transport.download("media/missing.png").await {
            Err(SyncError::DownloadFailed { filename, reason }) => {
                assert_eq!(filename, "media/missing.png");
                assert!(reason.contains("404"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_configured_download_timeout_applies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/slow.gif"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"late".to_vec())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let mut config = SyncConfig::default();
        config.server.media_url = server.uri();
        config.server.download_timeout_secs = 1;

        let transport = HttpBulkTransport::from_config(&config).unwrap();
        match transport.download("media/slow.gif").await {
            Err(SyncError::Http(reason)) => assert!(reason.starts_with("timed out")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
