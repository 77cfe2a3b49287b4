//! Network transport seam: fetch the body behind a URL as opaque bytes.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::config::FetchConfig;
use crate::error::{AstroError, FetchError};

/// Source of image bytes.
///
/// Implementations should return promptly once `cancel` fires; the pipeline
/// also drops the returned future on cancellation, so an implementation that
/// ignores the token is still aborted at its next await point.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn fetch(
        &self,
        url: &Url,
        cancel: CancellationToken,
    ) -> Result<Bytes, FetchError>;
}

/// `reqwest`-backed transport. No retries: a failed fetch is reported as is.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &FetchConfig) -> Result<Self, AstroError> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn fetch_body(&self, url: &Url) -> Result<Bytes, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(FetchError::transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.bytes().await.map_err(FetchError::transport)?;
        if body.is_empty() {
            return Err(FetchError::EmptyBody {
                url: url.to_string(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        url: &Url,
        cancel: CancellationToken,
    ) -> Result<Bytes, FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(%url, "fetch aborted");
                Err(FetchError::Transport("request aborted".to_string()))
            }
            result = self.fetch_body(url) => result,
        }
    }
}
