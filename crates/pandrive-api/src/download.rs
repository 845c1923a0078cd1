//! Download URL cache and content pull
//!
//! Download URLs are resolved per pick code and carry their own expiry as a
//! unix timestamp in the `t` query parameter. A URL is reused until a safety
//! margin before that point. Each pick code has its own async lock, so
//! concurrent readers of one object share a single resolve call.

use std::{collections::HashMap, io, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::TryStreamExt;
use pandrive_core::{
    config::DownloadConfig,
    domain::ByteRange,
    ports::RemoteReader,
};
use reqwest::{header, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::{io::StreamReader, sync::CancellationToken};
use tracing::{debug, instrument};
use url::Url;

use crate::{
    auth::TokenManager,
    wire::{string_lenient, u64_lenient},
    ApiError,
};

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UrlField {
    Nested {
        #[serde(default, deserialize_with = "string_lenient")]
        url: String,
    },
    Plain(String),
}

impl UrlField {
    fn into_string(self) -> String {
        match self {
            UrlField::Nested { url } | UrlField::Plain(url) => url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DownloadEntry {
    #[serde(default, deserialize_with = "string_lenient")]
    file_name: String,
    #[serde(default, deserialize_with = "u64_lenient")]
    file_size: u64,
    #[serde(default, deserialize_with = "string_lenient")]
    pick_code: String,
    url: Option<UrlField>,
}

/// `downurl` data: keyed by file id, or a plain list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DownloadData {
    Keyed(HashMap<String, DownloadEntry>),
    List(Vec<DownloadEntry>),
}

impl DownloadData {
    fn into_entries(self) -> Vec<DownloadEntry> {
        match self {
            DownloadData::Keyed(map) => map.into_values().collect(),
            DownloadData::List(list) => list,
        }
    }
}

// ============================================================================
// DownloadUrl
// ============================================================================

/// A resolved, time-limited download URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadUrl {
    pub url: String,
    pub file_name: String,
    pub file_size: u64,
    /// `None` when the URL carries no expiry; such URLs are not reused
    pub expires_at: Option<DateTime<Utc>>,
}

impl DownloadUrl {
    pub fn new(url: String, file_name: String, file_size: u64) -> Self {
        let expires_at = expiry_from_url(&url);
        Self {
            url,
            file_name,
            file_size,
            expires_at,
        }
    }

    /// Usable for at least `margin` more.
    pub fn is_fresh(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        self.expires_at
            .map(|at| Utc::now() + margin < at)
            .unwrap_or(false)
    }
}

/// Reads the unix expiry from the URL's `t` query parameter.
pub fn expiry_from_url(raw: &str) -> Option<DateTime<Utc>> {
    let url = Url::parse(raw).ok()?;
    let t = url
        .query_pairs()
        .find(|(key, _)| key == "t")
        .and_then(|(_, value)| value.parse::<i64>().ok())?;
    DateTime::from_timestamp(t, 0)
}

// ============================================================================
// DownloadCache
// ============================================================================

/// Resolves and caches download URLs, and opens content streams
pub struct DownloadCache {
    tokens: Arc<TokenManager>,
    entries: DashMap<String, Arc<Mutex<Option<DownloadUrl>>>>,
    expiry_margin: Duration,
}

impl std::fmt::Debug for DownloadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCache")
            .field("entries", &self.entries.len())
            .field("expiry_margin", &self.expiry_margin)
            .finish()
    }
}

impl DownloadCache {
    pub fn new(tokens: Arc<TokenManager>, config: &DownloadConfig) -> Self {
        Self {
            tokens,
            entries: DashMap::new(),
            expiry_margin: Duration::from_secs(config.url_expiry_margin_secs),
        }
    }

    /// Cached URL for `pick_code`, resolving it when missing or near expiry.
    pub async fn url(&self, pick_code: &str, cancel: &CancellationToken) -> Result<DownloadUrl, ApiError> {
        let slot = self.entries.entry(pick_code.to_string()).or_default().clone();
        let mut cached = slot.lock().await;
        if let Some(url) = cached.as_ref() {
            if url.is_fresh(self.expiry_margin) {
                debug!(pick_code, "Download URL cache hit");
                return Ok(url.clone());
            }
        }
        self.prune(pick_code);
        let fresh = self.resolve(pick_code, cancel).await?;
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    /// Forgets the cached URL for `pick_code`.
    pub fn invalidate(&self, pick_code: &str) {
        self.entries.remove(pick_code);
    }

    /// Number of pick codes with a cache slot.
    pub fn cached(&self) -> usize {
        self.entries.len()
    }

    /// Drops idle slots whose URL can no longer be reused.
    fn prune(&self, keep: &str) {
        let margin = self.expiry_margin;
        let before = self.entries.len();
        self.entries.retain(|pick_code, slot| {
            pick_code == keep
                || match slot.try_lock() {
                    Ok(cached) => cached.as_ref().is_some_and(|url| url.is_fresh(margin)),
                    Err(_) => true,
                }
        });
        let pruned = before.saturating_sub(self.entries.len());
        if pruned > 0 {
            debug!(pruned, "Dropped expired download URLs");
        }
    }

    async fn resolve(&self, pick_code: &str, cancel: &CancellationToken) -> Result<DownloadUrl, ApiError> {
        let url = self.tokens.api().api_url("/open/ufile/downurl");
        let form = [("pick_code", pick_code)];
        let data: DownloadData = self
            .tokens
            .call(&format!("download url {}", pick_code), cancel, |http, token| {
                http.post(&url).bearer_auth(token).form(&form)
            })
            .await?;

        let entries = data.into_entries();
        let entry = entries
            .iter()
            .position(|e| e.pick_code.eq_ignore_ascii_case(pick_code))
            .or(if entries.len() == 1 { Some(0) } else { None })
            .and_then(|i| entries.into_iter().nth(i))
            .ok_or_else(|| ApiError::InvalidResponse(format!("no download entry for {}", pick_code)))?;
        let raw = entry
            .url
            .map(UrlField::into_string)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ApiError::InvalidResponse(format!("download entry for {} has no url", pick_code)))?;

        let resolved = DownloadUrl::new(raw, entry.file_name, entry.file_size);
        debug!(pick_code, expires_at = ?resolved.expires_at, "Resolved download URL");
        Ok(resolved)
    }

    /// Opens the content of `pick_code`, optionally restricted to `range`.
    ///
    /// A URL refused by the CDN is re-resolved once.
    #[instrument(skip(self, cancel))]
    pub async fn open(
        &self,
        pick_code: &str,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<RemoteReader, ApiError> {
        let url = self.url(pick_code, cancel).await?;
        match self.fetch(&url, range, cancel).await {
            Err(ApiError::Http { status, .. }) if matches!(status, 403 | 404 | 410) => {
                debug!(pick_code, status, "Download URL refused, resolving again");
                self.invalidate(pick_code);
                let url = self.url(pick_code, cancel).await?;
                self.fetch(&url, range, cancel).await
            }
            other => other,
        }
    }

    async fn fetch(
        &self,
        url: &DownloadUrl,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<RemoteReader, ApiError> {
        let response = self
            .tokens
            .api()
            .retry_policy()
            .run(cancel, |_| self.fetch_once(url, range), ApiError::is_retryable)
            .await?;

        if range.is_some() && response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(ApiError::InvalidResponse(format!(
                "range request answered with {}",
                response.status()
            )));
        }
        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn fetch_once(&self, url: &DownloadUrl, range: Option<ByteRange>) -> Result<Response, ApiError> {
        let mut request = self.tokens.api().http().get(&url.url);
        if let Some(range) = range {
            request = request.header(header::RANGE, range.to_header());
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Http {
            status: status.as_u16(),
            body: body.chars().take(256).collect(),
        })
    }
}
