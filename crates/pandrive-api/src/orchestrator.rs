//! Upload strategy selection
//!
//! Per attempt, in order:
//! 1. `hash_only` mode: negotiate, and fail unless the provider deduplicates.
//! 2. `stream` mode, or a source of unknown size: skip negotiation and take
//!    an unhashed ticket.
//! 3. Otherwise negotiate. Dedup ends the upload; a transient negotiation
//!    failure falls back to an unhashed ticket.
//! 4. Multipart at or above the threshold, single-shot below it.
//! 5. A completion rejected for content re-hashes the source and retries the
//!    whole attempt, a bounded number of times.

use std::{io, sync::Arc};

use pandrive_core::{
    config::{UploadConfig, UploadMode},
    domain::{ChunkSizing, RemoteObject, UploadTarget, MIB},
    ports::{ITransferObserver, RemoteReader},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    hash::{hash_source, pre_sha1, spool, ContentHashes, Reopenable},
    negotiate::{Negotiation, Negotiator, UploadTicket},
    storage::CallbackData,
    upload::ChunkUploader,
    ApiError, ErrorKind,
};

/// Upload thresholds in bytes
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub mode: UploadMode,
    pub multipart_threshold: u64,
    pub stream_limit: u64,
    pub spool_memory_limit: u64,
    pub validation_retries: u32,
    pub max_sign_rounds: u32,
    pub sizing: ChunkSizing,
}

impl From<&UploadConfig> for UploadSettings {
    fn from(config: &UploadConfig) -> Self {
        Self {
            mode: config.mode,
            multipart_threshold: config.multipart_threshold_mb * MIB,
            stream_limit: config.stream_limit_mb * MIB,
            spool_memory_limit: config.spool_memory_limit_mb * MIB,
            validation_retries: config.validation_retries,
            max_sign_rounds: config.max_sign_rounds,
            sizing: config.chunk_sizing(),
        }
    }
}

/// Bytes handed to the orchestrator
pub enum UploadInput {
    /// Can be read as often as needed
    Reopenable(Box<dyn Reopenable>),
    /// Readable once; spooled before anything else happens
    OneShot(RemoteReader),
}

/// Everything one upload needs besides the bytes
#[derive(Clone, Default)]
pub struct UploadRequest {
    /// SHA1 from an upstream system, trusted until the provider disagrees
    pub known_sha1: Option<String>,
    pub observer: Option<Arc<dyn ITransferObserver>>,
    pub cancel: CancellationToken,
}

/// Picks the upload path and drives fallback between paths
#[derive(Debug, Clone)]
pub struct UploadOrchestrator {
    negotiator: Negotiator,
    uploader: ChunkUploader,
    settings: UploadSettings,
}

impl UploadOrchestrator {
    pub fn new(negotiator: Negotiator, uploader: ChunkUploader, settings: UploadSettings) -> Self {
        Self {
            negotiator,
            uploader,
            settings,
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Uploads `input` to `target` and returns the provider's identity for it.
    #[instrument(skip_all, fields(path = %target.logical_path))]
    pub async fn upload(
        &self,
        target: &UploadTarget,
        input: UploadInput,
        request: UploadRequest,
    ) -> Result<RemoteObject, ApiError> {
        let size_known = target.size.is_some();
        let (source, mut hashes): (Box<dyn Reopenable>, Option<ContentHashes>) = match input {
            UploadInput::Reopenable(source) => (source, None),
            UploadInput::OneShot(reader) => {
                let (spooled, hashes) = spool(reader, self.settings.spool_memory_limit).await?;
                debug!(size = hashes.size, "Spooled one-shot source");
                (Box::new(spooled) as Box<dyn Reopenable>, Some(hashes))
            }
        };
        if let Some(expected) = target.size {
            if expected != source.len() {
                return Err(ApiError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("source holds {} bytes, {} announced", source.len(), expected),
                )));
            }
        }
        let target = target.with_size(source.len());

        let mut known_sha1 = request.known_sha1.clone();
        let mut validation_failures = 0;
        loop {
            let result = self
                .attempt(&target, &*source, size_known, &mut hashes, known_sha1.as_deref(), &request)
                .await;
            match result {
                Err(e)
                    if e.kind() == ErrorKind::ContentValidation
                        && validation_failures < self.settings.validation_retries =>
                {
                    validation_failures += 1;
                    warn!(
                        attempt = validation_failures,
                        error = %e,
                        "Provider rejected uploaded content, re-hashing and retrying"
                    );
                    known_sha1 = None;
                    hashes = Some(hash_source(&*source).await?);
                }
                other => return other,
            }
        }
    }

    async fn attempt(
        &self,
        target: &UploadTarget,
        source: &dyn Reopenable,
        size_known: bool,
        hashes: &mut Option<ContentHashes>,
        known_sha1: Option<&str>,
        request: &UploadRequest,
    ) -> Result<RemoteObject, ApiError> {
        let cancel = &request.cancel;
        let size = source.len();
        let mode = self.settings.mode;

        if mode == UploadMode::HashOnly {
            let hashes = self.ensure_hashes(source, hashes, known_sha1).await?;
            return match self.negotiator.negotiate(target, &hashes, source, cancel).await? {
                Negotiation::Dedup(object) => Ok(self.deduplicated(object, size, request)),
                Negotiation::MustUpload(_) => Err(ApiError::DedupRequired(target.logical_path.clone())),
            };
        }

        let unhashed = mode == UploadMode::Stream || !size_known;
        let ticket = if unhashed {
            debug!(mode = ?mode, size_known, "Skipping instant upload");
            self.negotiator.sample_init(target, cancel).await?
        } else {
            let content = self.ensure_hashes(source, hashes, known_sha1).await?;
            match self.negotiator.negotiate(target, &content, source, cancel).await {
                Ok(Negotiation::Dedup(object)) => return Ok(self.deduplicated(object, size, request)),
                Ok(Negotiation::MustUpload(ticket)) => ticket,
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "Instant upload negotiation failed, uploading without it");
                    self.negotiator.sample_init(target, cancel).await?
                }
                Err(e) => return Err(e),
            }
        };

        let data = self.transfer(&ticket, source, unhashed, request).await?;
        let expected = hashes.as_ref().map(|h| h.sha1.clone()).or_else(|| known_sha1.map(str::to_string));
        let object = data.into_remote_object(
            expected.as_deref(),
            &target.leaf_name,
            size,
            &target.parent_folder_id,
        )?;
        info!(file_id = %object.file_id, pick_code = %object.pick_code, size, "Upload finished");
        Ok(object)
    }

    async fn transfer(
        &self,
        ticket: &UploadTicket,
        source: &dyn Reopenable,
        unhashed: bool,
        request: &UploadRequest,
    ) -> Result<CallbackData, ApiError> {
        let size = source.len();
        let observer = request.observer.as_ref();
        let cancel = &request.cancel;

        let streamed = (self.settings.mode == UploadMode::Stream || size <= self.settings.stream_limit)
            && unhashed
            && size <= self.uploader.sizing().max_part_size;
        if streamed {
            self.uploader.put_streamed(ticket, source, observer, cancel).await
        } else if size >= self.settings.multipart_threshold {
            self.uploader.upload_multipart(ticket, source, observer, cancel).await
        } else {
            self.uploader.put_single(ticket, source, observer, cancel).await
        }
    }

    /// Hashes already computed, the upstream SHA1 plus a pre-hash, or a full pass.
    async fn ensure_hashes(
        &self,
        source: &dyn Reopenable,
        hashes: &mut Option<ContentHashes>,
        known_sha1: Option<&str>,
    ) -> Result<ContentHashes, ApiError> {
        if let Some(hashes) = hashes {
            return Ok(hashes.clone());
        }
        let computed = match known_sha1 {
            Some(sha1) => ContentHashes {
                sha1: sha1.to_uppercase(),
                pre_sha1: pre_sha1(source).await?,
                size: source.len(),
            },
            None => hash_source(source).await?,
        };
        *hashes = Some(computed.clone());
        Ok(computed)
    }

    fn deduplicated(&self, object: RemoteObject, size: u64, request: &UploadRequest) -> RemoteObject {
        if let Some(observer) = &request.observer {
            observer.on_server_side_copy(size);
        }
        object
    }
}
