//! Provider API call layer
//!
//! Every provider API request goes through [`ApiClient::call`], which:
//! 1. Waits for the shared [`Pacer`]
//! 2. Sends the request built by the caller
//! 3. Classifies the outcome (HTTP status, embedded envelope code)
//! 4. Feeds the result back to the pacer
//! 5. Retries rate-limited and transient failures through the [`RetryPolicy`]
//!
//! Authentication failures are surfaced, not retried; the token manager owns
//! that recovery.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pandrive_api::client::ApiClient;
//! use pandrive_core::config::Config;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), pandrive_api::ApiError> {
//! let client = ApiClient::from_config(&Config::default())?;
//! let cancel = CancellationToken::new();
//! let url = client.api_url("/open/user/info");
//! let info: serde_json::Value = client
//!     .call("user info", &cancel, |http| http.get(&url).bearer_auth("token"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::{sync::Arc, time::Duration};

use pandrive_core::config::{ApiConfig, Config};
use reqwest::{header::RETRY_AFTER, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    pacer::{parse_retry_after, Pacer, PacerSettings},
    retry::RetryPolicy,
    wire::{ApiResponse, Envelope},
    ApiError, ErrorKind,
};

/// Longest error body kept in an [`ApiError::Http`]
const MAX_ERROR_BODY: usize = 512;

/// Provider hosts
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub base_url: String,
    pub passport_url: String,
    pub qrcode_url: String,
}

impl From<&ApiConfig> for Endpoints {
    fn from(config: &ApiConfig) -> Self {
        Self {
            base_url: trim_slash(&config.base_url),
            passport_url: trim_slash(&config.passport_url),
            qrcode_url: trim_slash(&config.qrcode_url),
        }
    }
}

fn trim_slash(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

// ============================================================================
// ApiClient
// ============================================================================

/// Paced, retrying client for the provider API
///
/// Cheap to clone; clones share the HTTP connection pool and the pacer.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    pacer: Arc<Pacer>,
    retry: RetryPolicy,
    endpoints: Arc<Endpoints>,
}

impl ApiClient {
    /// Creates a client sharing `pacer` with every other client in the process.
    pub fn new(config: &ApiConfig, pacer: Arc<Pacer>, retry: RetryPolicy) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.call_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            pacer,
            retry,
            endpoints: Arc::new(Endpoints::from(config)),
        })
    }

    /// Creates a client with a fresh pacer and retry policy from `config`.
    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        let pacer = Arc::new(Pacer::new(PacerSettings::from(&config.pacer)));
        Self::new(&config.api, pacer, RetryPolicy::from(&config.retry))
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn pacer(&self) -> &Arc<Pacer> {
        &self.pacer
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.endpoints.base_url, path)
    }

    pub fn passport_url(&self, path: &str) -> String {
        format!("{}{}", self.endpoints.passport_url, path)
    }

    pub fn qrcode_url(&self, path: &str) -> String {
        format!("{}{}", self.endpoints.qrcode_url, path)
    }

    /// Issues a paced API call and returns the envelope's `data`.
    ///
    /// `build` is invoked once per attempt, so it must be repeatable.
    pub async fn call<T, F>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        build: F,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        self.call_envelope(operation, cancel, build)
            .await?
            .into_data()
            .map_err(|e| e.context(operation.to_string()))
    }

    /// Like [`ApiClient::call`] but hands back the whole envelope.
    pub async fn call_envelope<F>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        build: F,
    ) -> Result<Envelope, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let result = self
            .retry
            .run_classified(
                cancel,
                |attempt| self.attempt(operation, cancel, &build, attempt),
                ApiError::retry_class,
            )
            .await;
        result.map_err(|e| match e {
            ApiError::Cancelled => ApiError::Cancelled,
            other => other.context(operation.to_string()),
        })
    }

    async fn attempt<F>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        build: &F,
        attempt: u32,
    ) -> Result<Envelope, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        self.pacer.acquire(cancel).await?;
        debug!(operation, attempt, "API call");

        let response = match build(&self.http).send().await {
            Ok(response) => response,
            Err(e) => {
                self.pacer.on_retry();
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            let err = self.http_failure(response).await;
            return Err(err);
        }

        let body = response.bytes().await?;
        let envelope: Envelope = serde_json::from_slice(&body)
            .map_err(|e| ApiError::InvalidResponse(format!("malformed envelope: {}", e)))?;

        match envelope.error() {
            None => {
                self.pacer.on_success();
                if attempt > 1 {
                    info!(operation, attempt, "API call succeeded after retry");
                }
                Ok(envelope)
            }
            Some(err) => {
                if err.kind() == ErrorKind::RateLimited {
                    self.pacer.on_throttle();
                } else {
                    self.pacer.on_success();
                }
                Err(err)
            }
        }
    }

    /// Feeds a non-success status back to the pacer and builds the error.
    async fn http_failure(&self, response: Response) -> ApiError {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let cooldown = self.pacer.settings().throttle_cooldown;
            let wait = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(|v| parse_retry_after(v, cooldown))
                .unwrap_or(cooldown);
            self.pacer.defer(wait);
        } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            self.pacer.on_retry();
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        ApiError::Http {
            status: status.as_u16(),
            body,
        }
    }
}
