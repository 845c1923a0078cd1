//! PanRemoteStorage - IRemoteStorage implementation for the provider
//!
//! Composes the path resolver, the upload orchestrator and the download
//! cache behind the host-facing push/pull contract.
//!
//! ## Design Notes
//!
//! - One [`TokenManager`] (and through it one pacer) is shared by every
//!   component built here, so uploads, URL resolution and storage-token
//!   fetches all draw on the same account quota.
//! - The port speaks `anyhow`; the typed [`ApiError`] stays reachable as the
//!   error source for callers that need the classification.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use pandrive_core::{
    config::Config,
    domain::{ByteRange, RemoteObject, UploadTarget},
    ports::{
        ICredentialStore, ILoginPresenter, IPathResolver, IRemoteStorage, PushOptions, PushSource,
        RemoteReader,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    auth::{DeviceCodeFlow, TokenManager},
    client::ApiClient,
    download::DownloadCache,
    hash::{FileSource, MemorySource, Reopenable},
    negotiate::Negotiator,
    orchestrator::{UploadInput, UploadOrchestrator, UploadRequest, UploadSettings},
    retry::RetryPolicy,
    storage::{ProviderStorageCredentials, StorageClient, StorageSettings},
    upload::{ChunkUploader, PartBufferPool},
    ApiError,
};

/// Push/pull adapter for the provider
pub struct PanRemoteStorage {
    tokens: Arc<TokenManager>,
    resolver: Arc<dyn IPathResolver>,
    uploads: UploadOrchestrator,
    downloads: DownloadCache,
}

impl std::fmt::Debug for PanRemoteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanRemoteStorage")
            .field("tokens", &self.tokens)
            .field("uploads", &self.uploads)
            .field("downloads", &self.downloads)
            .finish_non_exhaustive()
    }
}

impl PanRemoteStorage {
    pub fn new(
        tokens: Arc<TokenManager>,
        resolver: Arc<dyn IPathResolver>,
        uploads: UploadOrchestrator,
        downloads: DownloadCache,
    ) -> Self {
        Self {
            tokens,
            resolver,
            uploads,
            downloads,
        }
    }

    /// Wires every component from the configuration.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn ICredentialStore>,
        presenter: Arc<dyn ILoginPresenter>,
        resolver: Arc<dyn IPathResolver>,
    ) -> Result<Self, ApiError> {
        let api = ApiClient::from_config(config)?;
        let flow = DeviceCodeFlow::new(api.clone(), &config.auth);
        let tokens = Arc::new(TokenManager::new(flow, &config.auth, store, presenter));

        let settings = UploadSettings::from(&config.upload);
        let storage = Arc::new(StorageClient::new(
            api.http().clone(),
            Arc::new(ProviderStorageCredentials::new(tokens.clone())),
            StorageSettings::from(&config.storage),
        ));
        let uploader = ChunkUploader::new(
            storage,
            Arc::new(PartBufferPool::new(config.upload.part_buffers)),
            RetryPolicy::from(&config.retry),
            settings.sizing,
        );
        let negotiator = Negotiator::new(tokens.clone(), settings.max_sign_rounds);
        let uploads = UploadOrchestrator::new(negotiator, uploader, settings);
        let downloads = DownloadCache::new(tokens.clone(), &config.download);

        Ok(Self::new(tokens, resolver, uploads, downloads))
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn downloads(&self) -> &DownloadCache {
        &self.downloads
    }
}

#[async_trait]
impl IRemoteStorage for PanRemoteStorage {
    async fn push(
        &self,
        logical_path: &str,
        source: PushSource,
        options: PushOptions,
    ) -> Result<RemoteObject> {
        let parent = self
            .resolver
            .resolve_parent(logical_path)
            .await
            .with_context(|| format!("Failed to resolve parent folder of {}", logical_path))?;

        let (input, size) = match source {
            PushSource::File(path) => {
                let file = FileSource::new(path.clone())
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                let len = file.len();
                (UploadInput::Reopenable(Box::new(file)), options.size.or(Some(len)))
            }
            PushSource::Memory(bytes) => {
                let len = bytes.len() as u64;
                (UploadInput::Reopenable(Box::new(MemorySource(bytes))), Some(len))
            }
            PushSource::Stream(reader) => (UploadInput::OneShot(reader), options.size),
        };

        let target = UploadTarget::new(logical_path, size, parent.leaf_name, parent.parent_id)?;
        debug!(path = logical_path, parent_id = %target.parent_folder_id, size = ?size, "Pushing file");

        let request = UploadRequest {
            known_sha1: options.known_sha1,
            observer: options.observer,
            cancel: options.cancel,
        };
        let object = self
            .uploads
            .upload(&target, input, request)
            .await
            .with_context(|| format!("Failed to push {}", logical_path))?;

        if let Err(e) = self.resolver.record_upload(logical_path, &object).await {
            warn!(path = logical_path, error = %e, "Directory cache did not record upload");
        }
        Ok(object)
    }

    async fn pull(
        &self,
        logical_path: &str,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<RemoteReader> {
        let object = self
            .resolver
            .lookup_file(logical_path)
            .await
            .with_context(|| format!("Failed to look up {}", logical_path))?
            .ok_or_else(|| anyhow!("No remote file at {}", logical_path))?;

        self.downloads
            .open(&object.pick_code, range, cancel)
            .await
            .with_context(|| format!("Failed to pull {}", logical_path))
    }
}
