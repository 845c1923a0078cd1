//! Instant-upload negotiation
//!
//! The provider deduplicates by content hash. An `init` call submits the
//! hashes and answers with a status:
//!
//! | status | meaning |
//! |---|---|
//! | 2 | the provider already has the bytes; the file now exists |
//! | 1 | bytes must be uploaded; the response carries the storage ticket |
//! | 7 | prove possession: hash the returned byte range and resubmit |
//! | 6, 8 | authentication refused |

use std::sync::Arc;

use pandrive_core::domain::{ByteRange, RemoteObject, UploadTarget};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    auth::TokenManager,
    hash::{range_sha1, ContentHashes, Reopenable},
    wire::{i64_lenient, string_lenient, OneOrMany},
    ApiError,
};

const STATUS_MUST_UPLOAD: i64 = 1;
const STATUS_DEDUP: i64 = 2;
const STATUS_AUTH_REFUSED: i64 = 6;
const STATUS_SIGN_REQUIRED: i64 = 7;
const STATUS_AUTH_FAILED: i64 = 8;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct CallbackSpec {
    #[serde(default, deserialize_with = "string_lenient")]
    callback: String,
    #[serde(default, deserialize_with = "string_lenient")]
    callback_var: String,
}

#[derive(Debug, Default, Deserialize)]
struct InitData {
    #[serde(default, deserialize_with = "i64_lenient")]
    status: i64,
    #[serde(default, deserialize_with = "string_lenient")]
    pick_code: String,
    #[serde(default, deserialize_with = "string_lenient")]
    sign_key: String,
    #[serde(default, deserialize_with = "string_lenient")]
    sign_check: String,
    #[serde(default, deserialize_with = "string_lenient")]
    file_id: String,
    #[serde(default, deserialize_with = "string_lenient")]
    bucket: String,
    #[serde(default, deserialize_with = "string_lenient")]
    object: String,
    #[serde(default)]
    callback: Option<OneOrMany<CallbackSpec>>,
}

impl InitData {
    fn into_ticket(self) -> Result<UploadTicket, ApiError> {
        if self.bucket.is_empty() || self.object.is_empty() {
            return Err(ApiError::InvalidResponse(
                "upload ticket without bucket or object".into(),
            ));
        }
        let callback = self
            .callback
            .and_then(OneOrMany::into_first)
            .unwrap_or_default();
        if callback.callback.is_empty() {
            return Err(ApiError::InvalidResponse("upload ticket without callback".into()));
        }
        Ok(UploadTicket {
            bucket: self.bucket,
            object: self.object,
            callback: callback.callback,
            callback_var: callback.callback_var,
            pick_code: self.pick_code,
        })
    }
}

// ============================================================================
// Public types
// ============================================================================

/// Where and how to deliver bytes after a "must upload" answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTicket {
    pub bucket: String,
    pub object: String,
    /// Opaque callback the storage tier invokes on completion
    pub callback: String,
    pub callback_var: String,
    pub pick_code: String,
}

/// Terminal outcome of a negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// Content already on the provider; no bytes were sent
    Dedup(RemoteObject),
    /// Bytes must be uploaded with this ticket
    MustUpload(UploadTicket),
}

/// Progress of one negotiation; dropped once a terminal status arrives
#[derive(Debug, Clone)]
struct NegotiationState {
    full_sha1: String,
    pre_sha1: String,
    pick_code: Option<String>,
    sign_key: Option<String>,
    sign_range: Option<ByteRange>,
    sign_val: Option<String>,
}

impl NegotiationState {
    fn new(hashes: &ContentHashes) -> Self {
        Self {
            full_sha1: hashes.sha1.clone(),
            pre_sha1: hashes.pre_sha1.clone(),
            pick_code: None,
            sign_key: None,
            sign_range: None,
            sign_val: None,
        }
    }
}

/// Parses the provider's `"start-end"` challenge range.
pub fn parse_sign_range(raw: &str) -> Result<ByteRange, ApiError> {
    raw.parse::<ByteRange>().map_err(ApiError::from)
}

fn upload_target(parent_folder_id: &str) -> String {
    format!("U_1_{}", parent_folder_id)
}

// ============================================================================
// Negotiator
// ============================================================================

/// Drives the init/challenge loop
#[derive(Debug, Clone)]
pub struct Negotiator {
    tokens: Arc<TokenManager>,
    max_sign_rounds: u32,
}

impl Negotiator {
    pub fn new(tokens: Arc<TokenManager>, max_sign_rounds: u32) -> Self {
        Self {
            tokens,
            max_sign_rounds,
        }
    }

    /// Submits the hashes and answers range challenges until a terminal status.
    #[instrument(skip_all, fields(path = %target.logical_path))]
    pub async fn negotiate(
        &self,
        target: &UploadTarget,
        hashes: &ContentHashes,
        source: &dyn Reopenable,
        cancel: &CancellationToken,
    ) -> Result<Negotiation, ApiError> {
        let mut state = NegotiationState::new(hashes);
        let mut rounds = 0;

        loop {
            let data = self.init(target, hashes.size, &state, cancel).await?;
            if !data.pick_code.is_empty() {
                state.pick_code = Some(data.pick_code.clone());
            }

            match data.status {
                STATUS_DEDUP => {
                    if data.file_id.is_empty() {
                        return Err(ApiError::InvalidResponse(
                            "instant upload succeeded without a file id".into(),
                        ));
                    }
                    info!(file_id = %data.file_id, size = hashes.size, "Instant upload matched existing content");
                    return Ok(Negotiation::Dedup(RemoteObject {
                        file_id: data.file_id,
                        pick_code: state.pick_code.unwrap_or_default(),
                        sha1: Some(state.full_sha1),
                        name: target.leaf_name.clone(),
                        size: hashes.size,
                        parent_id: Some(target.parent_folder_id.clone()),
                    }));
                }
                STATUS_MUST_UPLOAD => {
                    debug!(pick_code = %data.pick_code, "Provider requires upload");
                    return data.into_ticket().map(Negotiation::MustUpload);
                }
                STATUS_SIGN_REQUIRED => {
                    if rounds >= self.max_sign_rounds {
                        warn!(rounds, "Secondary authentication did not settle");
                        return Err(ApiError::Provider {
                            code: STATUS_SIGN_REQUIRED,
                            message: format!(
                                "secondary authentication still required after {} rounds",
                                rounds
                            ),
                        });
                    }
                    rounds += 1;
                    let range = parse_sign_range(&data.sign_check)?;
                    let sign_val = range_sha1(source, range).await?;
                    debug!(round = rounds, range = %range, "Answering range challenge");
                    state.sign_key = Some(data.sign_key);
                    state.sign_range = Some(range);
                    state.sign_val = Some(sign_val);
                }
                status @ (STATUS_AUTH_REFUSED | STATUS_AUTH_FAILED) => {
                    return Err(ApiError::Provider {
                        code: status,
                        message: format!("upload authentication refused (status {})", status),
                    });
                }
                other => {
                    return Err(ApiError::InvalidResponse(format!(
                        "unknown upload init status {}",
                        other
                    )));
                }
            }
        }
    }

    async fn init(
        &self,
        target: &UploadTarget,
        size: u64,
        state: &NegotiationState,
        cancel: &CancellationToken,
    ) -> Result<InitData, ApiError> {
        let url = self.tokens.api().api_url("/open/upload/init");
        let mut form: Vec<(&str, String)> = vec![
            ("file_name", target.leaf_name.clone()),
            ("file_size", size.to_string()),
            ("target", upload_target(&target.parent_folder_id)),
            ("fileid", state.full_sha1.clone()),
            ("preid", state.pre_sha1.clone()),
            ("topupload", "0".to_string()),
        ];
        if let Some(pick_code) = &state.pick_code {
            form.push(("pick_code", pick_code.clone()));
        }
        if let (Some(key), Some(val)) = (&state.sign_key, &state.sign_val) {
            if let Some(range) = state.sign_range {
                debug!(range = %range, "Resubmitting init with range signature");
            }
            form.push(("sign_key", key.clone()));
            form.push(("sign_val", val.clone()));
        }

        let operation = format!("upload init {}", target.logical_path);
        let data: OneOrMany<InitData> = self
            .tokens
            .call(&operation, cancel, |http, token| {
                http.post(&url).bearer_auth(token).form(&form)
            })
            .await?;
        data.into_first()
            .ok_or_else(|| ApiError::InvalidResponse("empty upload init response".into()))
    }

    /// Requests a storage ticket without hashes, for unhashed uploads.
    pub async fn sample_init(
        &self,
        target: &UploadTarget,
        cancel: &CancellationToken,
    ) -> Result<UploadTicket, ApiError> {
        let url = self.tokens.api().api_url("/open/upload/sample_init");
        let mut form: Vec<(&str, String)> = vec![
            ("file_name", target.leaf_name.clone()),
            ("target", upload_target(&target.parent_folder_id)),
        ];
        if let Some(size) = target.size {
            form.push(("file_size", size.to_string()));
        }

        let operation = format!("upload sample_init {}", target.logical_path);
        let data: OneOrMany<InitData> = self
            .tokens
            .call(&operation, cancel, |http, token| {
                http.post(&url).bearer_auth(token).form(&form)
            })
            .await?;
        data.into_first()
            .ok_or_else(|| ApiError::InvalidResponse("empty sample_init response".into()))?
            .into_ticket()
    }
}
