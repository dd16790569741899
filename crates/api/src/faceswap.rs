//! Face swap upstream client
//!
//! Thin wrapper over the external face swap service. Calls are bounded by
//! a request timeout and retried on transient failures; a definitive
//! rejection (4xx) is never retried.

use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum FaceSwapError {
    #[error("Face swap request timed out")]
    Timeout,
    #[error("Face swap service error: {0}")]
    Upstream(String),
    #[error("Face swap rejected: {0}")]
    Rejected(String),
}

impl FaceSwapError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Upstream(_))
    }
}

#[derive(Debug, Serialize)]
struct SwapRequest<'a> {
    source_url: &'a str,
    target_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct SwapResponse {
    result_url: String,
}

/// Client for the external face swap service
#[derive(Clone)]
pub struct FaceSwapClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl FaceSwapClient {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.face_swap_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: config.face_swap_api_url.trim_end_matches('/').to_string(),
            api_key: config.face_swap_api_key.clone(),
        })
    }

    /// Run a face swap and return the result URL.
    ///
    /// Transient failures (timeouts, 5xx) are retried twice with jittered
    /// exponential backoff before giving up.
    pub async fn swap(&self, source_url: &str, target_url: &str) -> Result<String, FaceSwapError> {
        let strategy = ExponentialBackoff::from_millis(500).map(jitter).take(2);

        RetryIf::spawn(
            strategy,
            || self.swap_once(source_url, target_url),
            FaceSwapError::is_transient,
        )
        .await
    }

    async fn swap_once(&self, source_url: &str, target_url: &str) -> Result<String, FaceSwapError> {
        let response = self
            .http
            .post(format!("{}/swap", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&SwapRequest {
                source_url,
                target_url,
            })
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    FaceSwapError::Timeout
                } else {
                    FaceSwapError::Upstream(err.to_string())
                }
            })?;

        let status = response.status();
        if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(FaceSwapError::Rejected(format!("{status}: {detail}")));
        }
        if !status.is_success() {
            return Err(FaceSwapError::Upstream(format!("status {status}")));
        }

        let body: SwapResponse = response
            .json()
            .await
            .map_err(|err| FaceSwapError::Upstream(format!("malformed response: {err}")))?;
        Ok(body.result_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FaceSwapError::Timeout.is_transient());
        assert!(FaceSwapError::Upstream("status 503".into()).is_transient());
        assert!(!FaceSwapError::Rejected("400: bad image".into()).is_transient());
    }
}
