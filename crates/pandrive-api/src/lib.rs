//! pandrive API - provider adapter for a consumer cloud drive
//!
//! Provides async components for:
//! - Device-code PKCE login and single-flight token refresh
//! - A shared, globally serialized request pacer with throttle cooldown
//! - Content-addressed instant upload with range-hash challenges
//! - Sequential multipart upload into the S3-compatible storage tier
//! - Cached, expiry-aware download URLs
//!
//! ## Modules
//!
//! - [`pacer`] - exponential-decay pacing shared by every API call
//! - [`retry`] - reusable bounded retry policy with jittered backoff
//! - [`client`] - call layer: pacing, retries and failure classification
//! - [`auth`] - device-code PKCE flow and the [`auth::TokenManager`]
//! - [`credentials`] - keyring, file and in-memory credential stores
//! - [`hash`] - SHA1 hashing, reopenable sources and spooling
//! - [`negotiate`] - instant-upload negotiation
//! - [`storage`] - signed object-storage client
//! - [`upload`] - chunk engine, single-shot and streamed puts
//! - [`orchestrator`] - upload strategy selection and fallback
//! - [`download`] - download URL cache
//! - [`provider`] - `IRemoteStorage` implementation

pub mod auth;
pub mod client;
pub mod credentials;
pub mod download;
pub mod hash;
pub mod negotiate;
pub mod orchestrator;
pub mod pacer;
pub mod provider;
pub mod retry;
pub mod storage;
pub mod upload;
pub mod wire;

use pandrive_core::domain::DomainError;
use retry::RetryClass;
use thiserror::Error;

/// Error codes the provider embeds in otherwise successful responses
pub mod codes {
    /// Account-level request quota exhausted
    pub const RATE_LIMITED: i64 = 770004;

    /// Access token malformed, expired or revoked
    pub const ACCESS_TOKEN_INVALID: &[i64] = &[40140123, 40140124, 40140125, 40140126];

    /// Refresh token expired or revoked; only a new login helps
    pub const REFRESH_TOKEN_INVALID: &[i64] = &[40140116, 40140117, 40140119, 40140120];
}

/// Coarse classification driving retry and recovery decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry after the pacer cooldown; never fatal on its own
    RateLimited,
    /// Retry with backoff, bounded attempts
    Transient,
    /// Refresh (or log in again), then retry the call once
    TokenInvalid,
    /// Full login required
    RefreshTokenExpired,
    /// Provider rejected the uploaded bytes; re-hash and retry the upload
    ContentValidation,
    /// Storage session must be abandoned
    StorageCredentialExpired,
    /// Caller cancelled
    Cancelled,
    /// Not retried
    Permanent,
}

/// Errors that can occur when talking to the provider
#[derive(Debug, Error)]
pub enum ApiError {
    /// The provider's account-level throttle code
    #[error("Rate limited by provider (code {code}): {message}")]
    RateLimited { code: i64, message: String },

    /// A retryable failure with no better classification
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Access token rejected by the API
    #[error("Access token rejected (code {code}): {message}")]
    TokenInvalid { code: i64, message: String },

    /// Refresh token expired or revoked
    #[error("Refresh token expired or revoked (code {code}): {message}")]
    RefreshTokenExpired { code: i64, message: String },

    /// Provider rejected the completed content
    #[error("Content validation failed (code {code}): {message}")]
    ContentValidation { code: i64, message: String },

    /// Object-storage credential expired or was refused mid-session
    #[error("Storage credential expired: {0}")]
    StorageCredentialExpired(String),

    /// Provider error code with no special handling
    #[error("Provider error {code}: {message}")]
    Provider { code: i64, message: String },

    /// Object-storage error document
    #[error("Storage error {status} {code}: {message}")]
    Storage {
        status: u16,
        code: String,
        message: String,
    },

    /// Network-level error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Local I/O error while reading a source
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The response could not be parsed or was malformed
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Device login did not complete
    #[error("Login failed: {0}")]
    LoginFailed(String),

    /// The credential store failed to load, save or clear
    #[error("Credential store error: {0}")]
    CredentialStore(String),

    /// A bounded wait ran out
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Request signing could not be computed
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Hash-only mode and the provider does not already have the content
    #[error("Content is not on the provider and uploads are hash-only: {0}")]
    DedupRequired(String),

    /// The caller's cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Any of the above, annotated with the operation and identifiers involved
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ApiError>,
    },
}

impl ApiError {
    /// Maps a provider error code to its error kind.
    pub fn from_provider_code(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        if code == codes::RATE_LIMITED {
            ApiError::RateLimited { code, message }
        } else if codes::ACCESS_TOKEN_INVALID.contains(&code) {
            ApiError::TokenInvalid { code, message }
        } else if codes::REFRESH_TOKEN_INVALID.contains(&code) {
            ApiError::RefreshTokenExpired { code, message }
        } else {
            ApiError::Provider { code, message }
        }
    }

    /// Wraps a credential-store failure, keeping its context chain.
    pub fn credential_store(err: anyhow::Error) -> Self {
        ApiError::CredentialStore(format!("{:#}", err))
    }

    /// Wraps the error with the attempted operation.
    pub fn context(self, context: impl Into<String>) -> Self {
        ApiError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through context wrappers.
    pub fn root(&self) -> &ApiError {
        match self {
            ApiError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Context { source, .. } => source.kind(),
            ApiError::RateLimited { .. } => ErrorKind::RateLimited,
            ApiError::Transient(_) | ApiError::Timeout(_) => ErrorKind::Transient,
            ApiError::Http { status, .. } => match *status {
                401 => ErrorKind::TokenInvalid,
                408 | 429 | 500..=599 => ErrorKind::Transient,
                _ => ErrorKind::Permanent,
            },
            ApiError::Storage { status, .. } => match *status {
                408 | 429 | 500..=599 => ErrorKind::Transient,
                _ => ErrorKind::Permanent,
            },
            ApiError::Network(e) if e.is_decode() => ErrorKind::Permanent,
            ApiError::Network(_) => ErrorKind::Transient,
            ApiError::TokenInvalid { .. } => ErrorKind::TokenInvalid,
            ApiError::RefreshTokenExpired { .. } => ErrorKind::RefreshTokenExpired,
            ApiError::ContentValidation { .. } => ErrorKind::ContentValidation,
            ApiError::StorageCredentialExpired(_) => ErrorKind::StorageCredentialExpired,
            ApiError::Cancelled => ErrorKind::Cancelled,
            ApiError::Provider { .. }
            | ApiError::Io(_)
            | ApiError::InvalidResponse(_)
            | ApiError::LoginFailed(_)
            | ApiError::CredentialStore(_)
            | ApiError::Signing(_)
            | ApiError::DedupRequired(_)
            | ApiError::Domain(_) => ErrorKind::Permanent,
        }
    }

    /// Rate-limited and transient failures are retried by the call layer.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::RateLimited | ErrorKind::Transient)
    }

    /// Rate-limited failures wait on the pacer; transient ones back off.
    pub fn retry_class(&self) -> RetryClass {
        match self.kind() {
            ErrorKind::RateLimited => RetryClass::Paced,
            ErrorKind::Transient => RetryClass::Backoff,
            _ => RetryClass::Fatal,
        }
    }

    /// Provider code carried by the error, if any.
    pub fn provider_code(&self) -> Option<i64> {
        match self.root() {
            ApiError::RateLimited { code, .. }
            | ApiError::TokenInvalid { code, .. }
            | ApiError::RefreshTokenExpired { code, .. }
            | ApiError::ContentValidation { code, .. }
            | ApiError::Provider { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T, E = ApiError> = std::result::Result<T, E>;
