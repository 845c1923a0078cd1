//! Object-storage tier client
//!
//! Bytes go to an S3-compatible store with short-lived STS credentials the
//! provider hands out through `GET /open/upload/get_token`. Requests are signed
//! with AWS Signature V4 and the provider's completion callback travels in the
//! `x-oss-callback` headers; the store invokes it server-side and relays its
//! JSON answer, which is the authoritative identity of the uploaded file.
//!
//! Every method here is a single attempt. Retries, ordering and abort-on-failure
//! belong to the upload engine.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use hmac::{Hmac, Mac};
use pandrive_core::{config::StorageConfig, domain::RemoteObject, ports::ITransferObserver};
use regex::Regex;
use reqwest::{header, Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    auth::TokenManager,
    hash::Reopenable,
    negotiate::UploadTicket,
    wire::{i64_lenient, opt_bool_lenient, string_lenient, u64_lenient, ApiResponse, OneOrMany},
    ApiError,
};

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Lifetime assumed when the token response carries no expiration, in minutes
const DEFAULT_CREDENTIAL_TTL_MINUTES: i64 = 15;

/// Error codes meaning the STS credential is no longer accepted
const EXPIRED_CREDENTIAL_CODES: &[&str] = &["InvalidAccessKeyId", "SecurityTokenExpired", "ExpiredToken"];

// ============================================================================
// Storage credentials
// ============================================================================

/// Short-lived STS credential for the storage tier
#[derive(Clone, PartialEq, Eq)]
pub struct StorageCredential {
    pub endpoint: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub security_token: String,
    pub expires_at: DateTime<Utc>,
}

impl StorageCredential {
    pub fn expires_within(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        Utc::now() + margin >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl fmt::Debug for StorageCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCredential")
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .field("security_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Deserialize)]
struct StorageTokenData {
    #[serde(default, deserialize_with = "string_lenient")]
    endpoint: String,
    #[serde(rename = "AccessKeyId", default, deserialize_with = "string_lenient")]
    access_key_id: String,
    #[serde(rename = "AccessKeySecret", default, deserialize_with = "string_lenient")]
    access_key_secret: String,
    #[serde(rename = "SecurityToken", default, deserialize_with = "string_lenient")]
    security_token: String,
    #[serde(rename = "Expiration", default, deserialize_with = "string_lenient")]
    expiration: String,
}

impl StorageTokenData {
    fn into_credential(self, fetched_at: DateTime<Utc>) -> Result<StorageCredential, ApiError> {
        if self.endpoint.is_empty() || self.access_key_id.is_empty() || self.access_key_secret.is_empty() {
            return Err(ApiError::InvalidResponse(
                "storage token without endpoint or keys".into(),
            ));
        }
        let expires_at = DateTime::parse_from_rfc3339(&self.expiration)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(fetched_at + chrono::Duration::minutes(DEFAULT_CREDENTIAL_TTL_MINUTES));
        Ok(StorageCredential {
            endpoint: self.endpoint,
            access_key_id: self.access_key_id,
            access_key_secret: self.access_key_secret,
            security_token: self.security_token,
            expires_at,
        })
    }
}

/// Hands out storage credentials
#[async_trait]
pub trait StorageCredentialSource: Send + Sync {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<StorageCredential, ApiError>;
}

/// Fetches credentials from the provider API with the caller's bearer token
#[derive(Debug, Clone)]
pub struct ProviderStorageCredentials {
    tokens: Arc<TokenManager>,
}

impl ProviderStorageCredentials {
    pub fn new(tokens: Arc<TokenManager>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl StorageCredentialSource for ProviderStorageCredentials {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<StorageCredential, ApiError> {
        let url = self.tokens.api().api_url("/open/upload/get_token");
        let fetched_at = Utc::now();
        let data: OneOrMany<StorageTokenData> = self
            .tokens
            .call("storage token", cancel, |http, token| {
                http.get(&url).bearer_auth(token)
            })
            .await?;
        data.into_first()
            .ok_or_else(|| ApiError::InvalidResponse("empty storage token response".into()))?
            .into_credential(fetched_at)
    }
}

// ============================================================================
// Callback result
// ============================================================================

/// File identity reported by the provider's completion callback
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackData {
    #[serde(default, deserialize_with = "string_lenient")]
    pub file_id: String,
    #[serde(default, deserialize_with = "string_lenient")]
    pub pick_code: String,
    #[serde(default, deserialize_with = "string_lenient")]
    pub sha1: String,
    #[serde(default, deserialize_with = "string_lenient")]
    pub file_name: String,
    #[serde(default, deserialize_with = "u64_lenient")]
    pub file_size: u64,
}

impl CallbackData {
    /// Checks the reported hash against `expected_sha1` and builds the object identity.
    pub fn into_remote_object(
        self,
        expected_sha1: Option<&str>,
        fallback_name: &str,
        size: u64,
        parent_id: &str,
    ) -> Result<RemoteObject, ApiError> {
        if let Some(expected) = expected_sha1 {
            if !self.sha1.is_empty() && !self.sha1.eq_ignore_ascii_case(expected) {
                return Err(ApiError::ContentValidation {
                    code: 0,
                    message: format!(
                        "provider stored sha1 {} but local content hashes to {}",
                        self.sha1, expected
                    ),
                });
            }
        }
        let sha1 = if self.sha1.is_empty() {
            expected_sha1.map(str::to_uppercase)
        } else {
            Some(self.sha1.to_uppercase())
        };
        Ok(RemoteObject {
            file_id: self.file_id,
            pick_code: self.pick_code,
            sha1,
            name: if self.file_name.is_empty() {
                fallback_name.to_string()
            } else {
                self.file_name
            },
            size: if self.file_size == 0 { size } else { self.file_size },
            parent_id: Some(parent_id.to_string()),
        })
    }
}

/// One callback answer `{state, code, message, data}`
#[derive(Debug, Deserialize)]
struct CallbackReply {
    #[serde(default, deserialize_with = "opt_bool_lenient")]
    state: Option<bool>,
    #[serde(default, deserialize_with = "i64_lenient")]
    code: i64,
    #[serde(default, deserialize_with = "string_lenient")]
    message: String,
    #[serde(default)]
    data: Value,
}

impl ApiResponse for CallbackReply {
    fn error(&self) -> Option<ApiError> {
        if self.state.unwrap_or(self.code == 0) {
            return None;
        }
        Some(ApiError::ContentValidation {
            code: self.code,
            message: if self.message.is_empty() {
                "completion callback reported failure".into()
            } else {
                self.message.clone()
            },
        })
    }
}

/// Parses the relayed callback body, which may be an object or an array.
pub fn parse_callback(body: &[u8]) -> Result<CallbackData, ApiError> {
    let replies: OneOrMany<CallbackReply> = serde_json::from_slice(body)
        .map_err(|e| ApiError::InvalidResponse(format!("malformed callback result: {}", e)))?;
    let reply = replies
        .into_first()
        .ok_or_else(|| ApiError::InvalidResponse("empty callback result".into()))?;
    if let Some(err) = reply.error() {
        return Err(err);
    }
    let data: OneOrMany<CallbackData> = serde_json::from_value(reply.data)
        .map_err(|e| ApiError::InvalidResponse(format!("unexpected callback data: {}", e)))?;
    let data = data
        .into_first()
        .ok_or_else(|| ApiError::InvalidResponse("callback result without data".into()))?;
    if data.file_id.is_empty() {
        return Err(ApiError::InvalidResponse("callback result without file id".into()));
    }
    Ok(data)
}

// ============================================================================
// Multipart bookkeeping
// ============================================================================

/// A part the store has acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u64,
    pub etag: String,
}

fn complete_body(parts: &[CompletedPart]) -> String {
    let mut xml = String::from("<CompleteMultipartUpload>");
    for part in parts {
        xml.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number, part.etag
        ));
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

fn xml_tag(xml: &str, tag: &str) -> Option<String> {
    let re = Regex::new(&format!(r"<{}[^>]*>([^<]*)</{}>", tag, tag)).ok()?;
    re.captures(xml)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|text| !text.is_empty())
}

// ============================================================================
// Signature V4
// ============================================================================

/// What the signature covers for one request
pub(crate) struct SigningInput<'a> {
    pub method: &'a str,
    pub canonical_uri: &'a str,
    pub canonical_query: &'a str,
    /// Lowercase header names; every entry is signed
    pub headers: &'a BTreeMap<String, String>,
    pub payload_hash: &'a str,
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ApiError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| ApiError::Signing(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Builds the `Authorization` header value.
pub(crate) fn authorization(
    input: &SigningInput<'_>,
    access_key_id: &str,
    secret: &str,
    region: &str,
    now: DateTime<Utc>,
) -> Result<String, ApiError> {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    let mut canonical_headers = String::new();
    for (name, value) in input.headers {
        canonical_headers.push_str(&format!("{}:{}\n", name, value.trim()));
    }
    let signed_headers = input
        .headers
        .keys()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        input.method,
        input.canonical_uri,
        input.canonical_query,
        canonical_headers,
        signed_headers,
        input.payload_hash
    );

    let scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, b"s3")?;
    let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

    Ok(format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        access_key_id, scope, signed_headers, signature
    ))
}

/// Sorted, encoded query string; also the canonical query for signing.
fn canonical_query(params: &[(&str, String)]) -> String {
    let mut pairs: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Object URL in path-style (`endpoint/bucket/key`) or virtual-hosted (`bucket.endpoint/key`) form.
fn object_url(
    endpoint: &str,
    bucket: &str,
    key: &str,
    path_style: bool,
    query: &str,
) -> Result<Url, ApiError> {
    let (scheme, host) = match endpoint.split_once("://") {
        Some((scheme, host)) => (scheme, host),
        None => ("https", endpoint),
    };
    let host = host.trim_end_matches('/');
    let key = key
        .trim_start_matches('/')
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");

    let mut raw = if path_style {
        format!("{}://{}/{}/{}", scheme, host, bucket, key)
    } else {
        format!("{}://{}.{}/{}", scheme, bucket, host, key)
    };
    if !query.is_empty() {
        raw.push('?');
        raw.push_str(query);
    }
    Url::parse(&raw).map_err(|e| ApiError::InvalidResponse(format!("invalid storage endpoint {}: {}", endpoint, e)))
}

// ============================================================================
// StorageClient
// ============================================================================

/// Storage-tier settings
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub region: String,
    pub path_style: bool,
    /// Refresh the credential when it expires within this margin
    pub credential_margin: Duration,
    /// Per-request ceiling for part and single-shot transfers
    pub transfer_timeout: Duration,
}

impl From<&StorageConfig> for StorageSettings {
    fn from(config: &StorageConfig) -> Self {
        Self {
            region: config.region.clone(),
            path_style: config.path_style,
            credential_margin: Duration::from_secs(config.credential_margin_secs),
            transfer_timeout: Duration::from_secs(config.transfer_timeout_secs),
        }
    }
}

enum Payload {
    Empty,
    Buffered(Bytes),
    Streamed { body: reqwest::Body, len: u64 },
}

impl Payload {
    fn hash(&self) -> String {
        match self {
            Payload::Empty => sha256_hex(b""),
            Payload::Buffered(bytes) => sha256_hex(bytes),
            Payload::Streamed { .. } => UNSIGNED_PAYLOAD.to_string(),
        }
    }
}

/// Signed single-attempt calls against the storage tier
pub struct StorageClient {
    http: Client,
    source: Arc<dyn StorageCredentialSource>,
    settings: StorageSettings,
    cached: Mutex<Option<StorageCredential>>,
}

impl fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageClient")
            .field("settings", &self.settings)
            .finish()
    }
}

impl StorageClient {
    pub fn new(http: Client, source: Arc<dyn StorageCredentialSource>, settings: StorageSettings) -> Self {
        Self {
            http,
            source,
            settings,
            cached: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    /// Current credential, refetched when it is inside the refresh margin.
    pub async fn credential(&self, cancel: &CancellationToken) -> Result<StorageCredential, ApiError> {
        let mut cached = self.cached.lock().await;
        if let Some(credential) = cached.as_ref() {
            if !credential.expires_within(self.settings.credential_margin) {
                return Ok(credential.clone());
            }
            debug!(expires_at = %credential.expires_at, "Storage credential near expiry");
        }
        let fresh = self.source.fetch(cancel).await?;
        info!(
            access_key_id = %fresh.access_key_id,
            expires_at = %fresh.expires_at,
            "Fetched storage credential"
        );
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drops the cached credential so the next call fetches a new one.
    pub async fn invalidate_credential(&self) {
        *self.cached.lock().await = None;
    }

    /// Opens a multipart session and returns its upload id.
    pub async fn initiate(&self, ticket: &UploadTicket, cancel: &CancellationToken) -> Result<String, ApiError> {
        let query = [("sequential", String::new()), ("uploads", String::new())];
        let response = self
            .send(Method::POST, ticket, &query, Payload::Empty, Vec::new(), cancel)
            .await?;
        let body = response.text().await?;
        let upload_id = xml_tag(&body, "UploadId")
            .ok_or_else(|| ApiError::InvalidResponse("initiate response without UploadId".into()))?;
        debug!(object = %ticket.object, upload_id = %upload_id, "Opened multipart session");
        Ok(upload_id)
    }

    /// Uploads one part and returns its ETag.
    pub async fn upload_part(
        &self,
        ticket: &UploadTicket,
        upload_id: &str,
        part_number: u64,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<String, ApiError> {
        let query = [
            ("partNumber", part_number.to_string()),
            ("uploadId", upload_id.to_string()),
        ];
        let response = self
            .send(Method::PUT, ticket, &query, Payload::Buffered(body), Vec::new(), cancel)
            .await?;
        response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ApiError::InvalidResponse(format!("part {} acknowledged without ETag", part_number)))
    }

    /// Completes the session; the store runs the provider callback and relays its answer.
    pub async fn complete(
        &self,
        ticket: &UploadTicket,
        upload_id: &str,
        parts: &[CompletedPart],
        cancel: &CancellationToken,
    ) -> Result<CallbackData, ApiError> {
        let query = [("uploadId", upload_id.to_string())];
        let body = Bytes::from(complete_body(parts));
        let response = self
            .send(
                Method::POST,
                ticket,
                &query,
                Payload::Buffered(body),
                callback_headers(ticket),
                cancel,
            )
            .await?;
        parse_callback(&response.bytes().await?)
    }

    /// Abandons the session and releases its parts.
    pub async fn abort(&self, ticket: &UploadTicket, upload_id: &str, cancel: &CancellationToken) -> Result<(), ApiError> {
        let query = [("uploadId", upload_id.to_string())];
        self.send(Method::DELETE, ticket, &query, Payload::Empty, Vec::new(), cancel)
            .await?;
        debug!(object = %ticket.object, upload_id = %upload_id, "Aborted multipart session");
        Ok(())
    }

    /// Single-shot upload of a buffered payload.
    pub async fn put(&self, ticket: &UploadTicket, body: Bytes, cancel: &CancellationToken) -> Result<CallbackData, ApiError> {
        let response = self
            .send(Method::PUT, ticket, &[], Payload::Buffered(body), callback_headers(ticket), cancel)
            .await?;
        parse_callback(&response.bytes().await?)
    }

    /// Single-shot upload streamed from a fresh reader of `source`.
    pub async fn put_stream(
        &self,
        ticket: &UploadTicket,
        source: &dyn Reopenable,
        observer: Option<Arc<dyn ITransferObserver>>,
        cancel: &CancellationToken,
    ) -> Result<CallbackData, ApiError> {
        let reader = source.open().await?;
        let stream = ReaderStream::new(reader).inspect_ok(move |chunk| {
            if let Some(observer) = &observer {
                observer.on_bytes(chunk.len() as u64);
            }
        });
        let payload = Payload::Streamed {
            body: reqwest::Body::wrap_stream(stream),
            len: source.len(),
        };
        let response = self
            .send(Method::PUT, ticket, &[], payload, callback_headers(ticket), cancel)
            .await?;
        parse_callback(&response.bytes().await?)
    }

    async fn send(
        &self,
        method: Method,
        ticket: &UploadTicket,
        query: &[(&str, String)],
        payload: Payload,
        extra_headers: Vec<(&'static str, String)>,
        cancel: &CancellationToken,
    ) -> Result<Response, ApiError> {
        let credential = self.credential(cancel).await?;
        let query = canonical_query(query);
        let url = object_url(
            &credential.endpoint,
            &ticket.bucket,
            &ticket.object,
            self.settings.path_style,
            &query,
        )?;

        let now = Utc::now();
        let payload_hash = payload.hash();
        let mut signed = BTreeMap::new();
        signed.insert("host".to_string(), host_header(&url));
        signed.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        signed.insert("x-amz-date".to_string(), now.format("%Y%m%dT%H%M%SZ").to_string());
        if !credential.security_token.is_empty() {
            signed.insert("x-amz-security-token".to_string(), credential.security_token.clone());
        }
        let auth = authorization(
            &SigningInput {
                method: method.as_str(),
                canonical_uri: url.path(),
                canonical_query: &query,
                headers: &signed,
                payload_hash: &payload_hash,
            },
            &credential.access_key_id,
            &credential.access_key_secret,
            &self.settings.region,
            now,
        )?;

        let mut request = self
            .http
            .request(method.clone(), url)
            .timeout(self.settings.transfer_timeout)
            .header(header::AUTHORIZATION, auth);
        for (name, value) in signed.iter().filter(|(name, _)| name.as_str() != "host") {
            request = request.header(name.as_str(), value.as_str());
        }
        for (name, value) in extra_headers {
            request = request.header(name, value);
        }
        request = match payload {
            Payload::Empty => request,
            Payload::Buffered(bytes) => request.body(bytes),
            Payload::Streamed { body, len } => request.header(header::CONTENT_LENGTH, len).body(body),
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        // The store answers 203 when the provider callback failed.
        if status.is_success() && status != StatusCode::NON_AUTHORITATIVE_INFORMATION {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let err = storage_error(status.as_u16(), &body, credential.is_expired());
        if matches!(err, ApiError::StorageCredentialExpired(_)) {
            warn!(status = status.as_u16(), "Storage credential rejected, dropping cached credential");
            self.invalidate_credential().await;
        }
        Err(err)
    }
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn callback_headers(ticket: &UploadTicket) -> Vec<(&'static str, String)> {
    let mut headers = vec![("x-oss-callback", STANDARD.encode(&ticket.callback))];
    if !ticket.callback_var.is_empty() {
        headers.push(("x-oss-callback-var", STANDARD.encode(&ticket.callback_var)));
    }
    headers
}

fn storage_error(status: u16, body: &str, credential_expired: bool) -> ApiError {
    let code = xml_tag(body, "Code").unwrap_or_default();
    let message = xml_tag(body, "Message").unwrap_or_else(|| body.chars().take(256).collect());

    if status == 403
        && (EXPIRED_CREDENTIAL_CODES.contains(&code.as_str())
            || (code == "AccessDenied" && credential_expired))
    {
        return ApiError::StorageCredentialExpired(format!("{}: {}", code, message));
    }
    if code == "CallbackFailed" {
        return ApiError::ContentValidation {
            code: i64::from(status),
            message,
        };
    }
    ApiError::Storage {
        status,
        code,
        message,
    }
}
