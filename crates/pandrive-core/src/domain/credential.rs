//! Credential lifecycle records
//!
//! [`Credential`] is the only piece of adapter state that survives a process
//! restart. [`PendingLogin`] lives for the duration of one device-code login.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Credential
// ============================================================================

/// Bearer credential issued by the provider's passport service
///
/// Mutated only by the token manager; every outgoing API call reads it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Bearer token for authenticating API requests
    pub access_token: String,
    /// Token used to obtain a new access token without user interaction
    pub refresh_token: String,
    /// When the access token expires
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Builds a credential that expires `expires_in` seconds from now.
    pub fn issued_now(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in: i64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: Utc::now() + Duration::seconds(expires_in),
        }
    }

    /// Returns true if the access token has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Returns true if the access token will expire within the given duration
    pub fn expires_within(&self, window: Duration) -> bool {
        Utc::now() + window >= self.expires_at
    }

    /// An access token inside the refresh window must not be used for new calls.
    pub fn is_stale(&self, refresh_window: Duration) -> bool {
        self.expires_within(refresh_window)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ============================================================================
// PendingLogin
// ============================================================================

/// Transient record of one device-code login attempt
///
/// Created when the device code is issued and discarded once tokens are
/// obtained or the attempt is abandoned.
#[derive(Clone)]
pub struct PendingLogin {
    /// Device identifier returned by the device-code endpoint
    pub device_uid: String,
    /// PKCE verifier, sent only with the final code exchange
    pub pkce_verifier: String,
    /// PKCE challenge sent with the device-code request
    pub pkce_challenge: String,
    /// When the device code was requested
    pub issued_at: DateTime<Utc>,
}

impl PendingLogin {
    /// How long this attempt has been waiting for approval
    pub fn age(&self) -> Duration {
        Utc::now() - self.issued_at
    }
}

impl fmt::Debug for PendingLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLogin")
            .field("device_uid", &self.device_uid)
            .field("pkce_verifier", &"<redacted>")
            .field("pkce_challenge", &self.pkce_challenge)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}
