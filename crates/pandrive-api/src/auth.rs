//! Device-code PKCE login and bearer token lifecycle
//!
//! ## Components
//!
//! - [`PkcePair`] - PKCE verifier/challenge generation
//! - [`DeviceCodeFlow`] - the stateless passport calls (device code, status
//!   polling, code exchange, refresh)
//! - [`TokenManager`] - owns the single live [`Credential`], refreshes it
//!   single-flight and falls back to a new login when the refresh token dies
//!
//! ## State machine
//!
//! ```text
//! NoCredential -> LoggingIn -> Active -> RefreshPending -> Active
//!                                              |
//!                                              +-> ReLoggingIn -> Active
//! ```

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use base64::Engine;
use chrono::Utc;
use pandrive_core::{
    config::AuthConfig,
    domain::{Credential, PendingLogin},
    ports::{ICredentialStore, ILoginPresenter, LoginProgress, LoginPrompt},
};
use rand::Rng;
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::ApiClient,
    wire::{i64_lenient, string_lenient},
    ApiError, ErrorKind,
};

/// Characters allowed in a PKCE verifier (RFC 7636 unreserved set)
const PKCE_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Length of generated PKCE verifiers
const PKCE_VERIFIER_LEN: usize = 64;

// ============================================================================
// PKCE
// ============================================================================

/// PKCE verifier and its SHA-256 challenge
#[derive(Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkcePair")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .finish()
    }
}

impl PkcePair {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let verifier: String = (0..PKCE_VERIFIER_LEN)
            .map(|_| PKCE_CHARSET[rng.gen_range(0..PKCE_CHARSET.len())] as char)
            .collect();
        let challenge = Self::challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    /// Standard base64 of SHA-256(verifier), the provider's `sha256` method.
    pub fn challenge_for(verifier: &str) -> String {
        let digest = Sha256::digest(verifier.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(digest)
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct DeviceCodeData {
    #[serde(deserialize_with = "string_lenient")]
    uid: String,
    #[serde(deserialize_with = "string_lenient")]
    time: String,
    #[serde(deserialize_with = "string_lenient")]
    qrcode: String,
    #[serde(deserialize_with = "string_lenient")]
    sign: String,
}

#[derive(Debug, Deserialize)]
struct QrStatusData {
    #[serde(default, deserialize_with = "i64_lenient")]
    status: i64,
    #[serde(default, deserialize_with = "string_lenient")]
    msg: String,
}

#[derive(Deserialize)]
struct TokenData {
    #[serde(deserialize_with = "string_lenient")]
    access_token: String,
    #[serde(default, deserialize_with = "string_lenient")]
    refresh_token: String,
    #[serde(deserialize_with = "i64_lenient")]
    expires_in: i64,
}

/// An issued device code, alive until approved, expired or abandoned
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub pending: PendingLogin,
    /// Opaque timestamp echoed back to the status endpoint
    pub time: String,
    /// Opaque signature echoed back to the status endpoint
    pub sign: String,
    /// QR code content to show the user
    pub qr_payload: String,
}

// ============================================================================
// DeviceCodeFlow
// ============================================================================

/// Stateless passport calls; every one goes through the shared pacer
#[derive(Debug, Clone)]
pub struct DeviceCodeFlow {
    api: ApiClient,
    client_id: Option<String>,
    poll_interval: Duration,
    login_timeout: Duration,
}

impl DeviceCodeFlow {
    pub fn new(api: ApiClient, config: &AuthConfig) -> Self {
        Self {
            api,
            client_id: config.client_id.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            login_timeout: Duration::from_secs(config.login_timeout_secs),
        }
    }

    /// Overrides the polling cadence (tests use milliseconds).
    pub fn with_timing(mut self, poll_interval: Duration, login_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.login_timeout = login_timeout;
        self
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        operation: &str,
        url: &str,
        form: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<T, ApiError> {
        self.api
            .call(operation, cancel, |http| http.post(url).form(form))
            .await
    }

    /// Requests a device code for a fresh PKCE pair.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<DeviceSession, ApiError> {
        let client_id = self
            .client_id
            .as_deref()
            .ok_or_else(|| ApiError::LoginFailed("auth.client_id is not configured".into()))?;
        let pkce = PkcePair::generate();
        let url = self.api.passport_url("/open/authDeviceCode");
        let data: DeviceCodeData = self
            .post_form(
                "request device code",
                &url,
                &[
                    ("client_id", client_id),
                    ("code_challenge", pkce.challenge.as_str()),
                    ("code_challenge_method", "sha256"),
                ],
                cancel,
            )
            .await?;

        info!(device_uid = %data.uid, "Device code issued");
        Ok(DeviceSession {
            pending: PendingLogin {
                device_uid: data.uid,
                pkce_verifier: pkce.verifier,
                pkce_challenge: pkce.challenge,
                issued_at: Utc::now(),
            },
            time: data.time,
            sign: data.sign,
            qr_payload: data.qrcode,
        })
    }

    /// Polls the status endpoint once. `None` means the code expired or was refused.
    pub async fn poll(
        &self,
        session: &DeviceSession,
        cancel: &CancellationToken,
    ) -> Result<Option<LoginProgress>, ApiError> {
        let url = self.api.qrcode_url("/get/status/");
        let query = [
            ("uid", session.pending.device_uid.as_str()),
            ("time", session.time.as_str()),
            ("sign", session.sign.as_str()),
        ];
        let data: QrStatusData = self
            .api
            .call("poll login status", cancel, |http| http.get(&url).query(&query))
            .await?;
        Ok(match data.status {
            0 => Some(LoginProgress::Waiting),
            1 => Some(LoginProgress::Scanned),
            2 => Some(LoginProgress::Approved),
            status => {
                debug!(status, msg = %data.msg, "Device code no longer valid");
                None
            }
        })
    }

    /// Polls until the user approves, the code expires or the login times out.
    pub async fn wait_for_approval(
        &self,
        session: &DeviceSession,
        presenter: &dyn ILoginPresenter,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        let deadline = tokio::time::Instant::now() + self.login_timeout;
        let mut last = None;
        loop {
            match self.poll(session, cancel).await? {
                Some(LoginProgress::Approved) => {
                    presenter.progress(LoginProgress::Approved);
                    return Ok(());
                }
                Some(progress) => {
                    if last != Some(progress) {
                        presenter.progress(progress);
                        last = Some(progress);
                    }
                }
                None => {
                    return Err(ApiError::LoginFailed(
                        "device code expired or was cancelled".into(),
                    ))
                }
            }

            if tokio::time::Instant::now() + self.poll_interval > deadline {
                return Err(ApiError::Timeout(format!(
                    "login not approved within {}s",
                    self.login_timeout.as_secs()
                )));
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Exchanges an approved device code for a credential.
    pub async fn exchange(
        &self,
        pending: &PendingLogin,
        cancel: &CancellationToken,
    ) -> Result<Credential, ApiError> {
        let url = self.api.passport_url("/open/deviceCodeToToken");
        let data: TokenData = self
            .post_form(
                "exchange device code",
                &url,
                &[
                    ("uid", pending.device_uid.as_str()),
                    ("code_verifier", pending.pkce_verifier.as_str()),
                ],
                cancel,
            )
            .await?;
        if data.refresh_token.is_empty() {
            return Err(ApiError::InvalidResponse(
                "token exchange returned no refresh token".into(),
            ));
        }
        Ok(Credential::issued_now(
            data.access_token,
            data.refresh_token,
            data.expires_in,
        ))
    }

    /// Trades a refresh token for a new credential.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        cancel: &CancellationToken,
    ) -> Result<Credential, ApiError> {
        let url = self.api.passport_url("/open/refreshToken");
        let data: TokenData = self
            .post_form(
                "refresh token",
                &url,
                &[("refresh_token", refresh_token)],
                cancel,
            )
            .await?;
        let refresh_token = if data.refresh_token.is_empty() {
            refresh_token.to_string()
        } else {
            data.refresh_token
        };
        Ok(Credential::issued_now(
            data.access_token,
            refresh_token,
            data.expires_in,
        ))
    }

    /// Runs a complete device login: code, prompt, approval, exchange.
    pub async fn login(
        &self,
        presenter: &dyn ILoginPresenter,
        cancel: &CancellationToken,
    ) -> Result<Credential, ApiError> {
        let session = self.start(cancel).await?;
        presenter.present(&LoginPrompt {
            device_uid: session.pending.device_uid.clone(),
            qr_payload: session.qr_payload.clone(),
        });
        self.wait_for_approval(&session, presenter, cancel).await?;
        let credential = self.exchange(&session.pending, cancel).await?;
        info!(
            device_uid = %session.pending.device_uid,
            waited_secs = session.pending.age().num_seconds(),
            "Device login approved"
        );
        Ok(credential)
    }
}

// ============================================================================
// TokenManager
// ============================================================================

/// Observable lifecycle state of the [`TokenManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    NoCredential,
    LoggingIn,
    Active,
    RefreshPending,
    ReLoggingIn,
}

/// Clears the in-progress flag and wakes waiters even if the refresh future is dropped
struct RefreshFlight<'a> {
    flag: &'a AtomicBool,
    done: &'a Notify,
}

impl Drop for RefreshFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.done.notify_waiters();
    }
}

/// Owns the adapter's single live credential
///
/// Shared as `Arc<TokenManager>` by every component that calls the API.
pub struct TokenManager {
    flow: DeviceCodeFlow,
    store: Arc<dyn ICredentialStore>,
    presenter: Arc<dyn ILoginPresenter>,
    credential: Mutex<Option<Credential>>,
    loaded: AtomicBool,
    refreshing: AtomicBool,
    refresh_done: Notify,
    login_lock: Mutex<()>,
    state: StdMutex<TokenState>,
    refresh_window: chrono::Duration,
    refresh_wait: Duration,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("state", &self.state())
            .field("refresh_window", &self.refresh_window)
            .finish()
    }
}

impl TokenManager {
    pub fn new(
        flow: DeviceCodeFlow,
        config: &AuthConfig,
        store: Arc<dyn ICredentialStore>,
        presenter: Arc<dyn ILoginPresenter>,
    ) -> Self {
        Self {
            flow,
            store,
            presenter,
            credential: Mutex::new(None),
            loaded: AtomicBool::new(false),
            refreshing: AtomicBool::new(false),
            refresh_done: Notify::new(),
            login_lock: Mutex::new(()),
            state: StdMutex::new(TokenState::NoCredential),
            refresh_window: chrono::Duration::seconds(config.refresh_window_secs as i64),
            refresh_wait: Duration::from_secs(config.refresh_wait_secs),
        }
    }

    pub fn api(&self) -> &ApiClient {
        self.flow.api()
    }

    pub fn state(&self) -> TokenState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: TokenState) {
        *self.state.lock().unwrap() = state;
    }

    /// Snapshot of the current credential, loading it from the store on first use.
    pub async fn credential(&self) -> Result<Option<Credential>, ApiError> {
        let mut guard = self.credential.lock().await;
        if !self.loaded.load(Ordering::Acquire) {
            *guard = self.store.load().await.map_err(ApiError::credential_store)?;
            self.loaded.store(true, Ordering::Release);
            if guard.is_some() {
                self.set_state(TokenState::Active);
            }
        }
        Ok(guard.clone())
    }

    /// Returns a fresh access token, refreshing or logging in first if needed.
    pub async fn access_token(&self, cancel: &CancellationToken) -> Result<String, ApiError> {
        match self.credential().await? {
            Some(credential) if !credential.is_stale(self.refresh_window) => {
                Ok(credential.access_token)
            }
            Some(credential) => {
                debug!(expires_at = %credential.expires_at, "Access token inside refresh window");
                Ok(self.refresh(&credential.access_token, cancel).await?.access_token)
            }
            None => Ok(self.login_inner(false, None, cancel).await?.access_token),
        }
    }

    /// Forces a new device login, replacing any stored credential.
    pub async fn login(&self, cancel: &CancellationToken) -> Result<Credential, ApiError> {
        self.login_inner(true, None, cancel).await
    }

    /// Drops the credential from memory and from the store.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let mut guard = self.credential.lock().await;
        *guard = None;
        self.loaded.store(true, Ordering::Release);
        self.store.clear().await.map_err(ApiError::credential_store)?;
        self.set_state(TokenState::NoCredential);
        info!("Logged out");
        Ok(())
    }

    /// Refreshes the credential unless `stale_token` was already replaced.
    ///
    /// Only one refresh is in flight at a time; concurrent callers wait (up to
    /// the configured refresh wait) and reread the result.
    pub async fn refresh(
        &self,
        stale_token: &str,
        cancel: &CancellationToken,
    ) -> Result<Credential, ApiError> {
        loop {
            let done = self.refresh_done.notified();
            tokio::pin!(done);
            done.as_mut().enable();

            if self
                .refreshing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let _flight = RefreshFlight {
                    flag: &self.refreshing,
                    done: &self.refresh_done,
                };
                return self.refresh_in_flight(stale_token, cancel).await;
            }

            debug!("Refresh already in flight, waiting for it");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                waited = tokio::time::timeout(self.refresh_wait, done.as_mut()) => {
                    if waited.is_err() {
                        return Err(ApiError::Timeout("waiting for in-flight token refresh".into()));
                    }
                }
            }

            if let Some(credential) = self.credential().await? {
                if credential.access_token != stale_token
                    && !credential.is_stale(self.refresh_window)
                {
                    return Ok(credential);
                }
            }
        }
    }

    async fn refresh_in_flight(
        &self,
        stale_token: &str,
        cancel: &CancellationToken,
    ) -> Result<Credential, ApiError> {
        let current = match self.credential().await? {
            Some(credential) => credential,
            None => return self.login_inner(false, None, cancel).await,
        };
        if current.access_token != stale_token && !current.is_stale(self.refresh_window) {
            debug!("Credential already refreshed by another caller");
            return Ok(current);
        }

        self.set_state(TokenState::RefreshPending);
        match self.flow.refresh(&current.refresh_token, cancel).await {
            Ok(fresh) => {
                self.install(fresh.clone()).await?;
                info!(expires_at = %fresh.expires_at, "Access token refreshed");
                Ok(fresh)
            }
            Err(e) if e.kind() == ErrorKind::RefreshTokenExpired => {
                warn!(error = %e, "Refresh token rejected, starting a new login");
                self.login_inner(true, Some(&current.access_token), cancel).await
            }
            Err(e) => {
                self.set_state(TokenState::Active);
                Err(e)
            }
        }
    }

    async fn login_inner(
        &self,
        force: bool,
        rejected: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Credential, ApiError> {
        let _login = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            guard = self.login_lock.lock() => guard,
        };

        // Another caller may have finished a login while this one queued.
        // A credential still carrying the rejected token does not count.
        if let Some(credential) = self.credential().await? {
            let replaced = rejected.map_or(!force, |token| credential.access_token != token);
            if replaced && !credential.is_stale(self.refresh_window) {
                return Ok(credential);
            }
        }

        self.set_state(if rejected.is_some() {
            TokenState::ReLoggingIn
        } else {
            TokenState::LoggingIn
        });
        match self.flow.login(self.presenter.as_ref(), cancel).await {
            Ok(credential) => {
                self.install(credential.clone()).await?;
                Ok(credential)
            }
            Err(e) => {
                let has_credential = self.credential.lock().await.is_some();
                self.set_state(if has_credential {
                    TokenState::Active
                } else {
                    TokenState::NoCredential
                });
                Err(e)
            }
        }
    }

    /// Persists, then publishes, a newly issued credential.
    async fn install(&self, credential: Credential) -> Result<(), ApiError> {
        let mut guard = self.credential.lock().await;
        if let Err(e) = self.store.save(&credential).await {
            error!(error = %e, "Failed to persist credential, keeping the previous one");
            self.set_state(if guard.is_some() {
                TokenState::Active
            } else {
                TokenState::NoCredential
            });
            return Err(ApiError::credential_store(e));
        }
        *guard = Some(credential);
        self.loaded.store(true, Ordering::Release);
        self.set_state(TokenState::Active);
        Ok(())
    }

    /// Issues an authenticated API call.
    ///
    /// A token-invalid response triggers one refresh (or re-login) and one
    /// retry of the same request.
    pub async fn call<T, F>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        build: F,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        let token = self.access_token(cancel).await?;
        let api = self.api();
        match api.call(operation, cancel, |http| build(http, &token)).await {
            Err(e) if e.kind() == ErrorKind::TokenInvalid => {
                info!(operation, "Access token rejected, refreshing and retrying once");
                let fresh = self.refresh(&token, cancel).await?;
                api.call(operation, cancel, |http| build(http, &fresh.access_token))
                    .await
            }
            other => other,
        }
    }
}
