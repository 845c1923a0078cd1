//! Remote storage port (driving contract used by the sync engine)
//!
//! The host synchronization engine sees the provider only through
//! "push a file to a logical path" and "pull a file from a logical path".
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` at the port boundary; the adapter keeps its typed
//!   error underneath as the error source.
//! - Cancellation is carried in [`PushOptions`] and as an argument to `pull`,
//!   so every network call made on the host's behalf can be abandoned.

use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use super::notification::ITransferObserver;
use crate::domain::{ByteRange, RemoteObject};

/// Boxed reader returned by `pull`
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Where the bytes of a push come from
pub enum PushSource {
    /// A local file that can be reopened at will
    File(PathBuf),
    /// Bytes already in memory
    Memory(Bytes),
    /// A one-shot reader; spooled locally if it has to be read twice
    Stream(RemoteReader),
}

impl fmt::Debug for PushSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushSource::File(path) => f.debug_tuple("File").field(path).finish(),
            PushSource::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
            PushSource::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Per-push options
#[derive(Clone, Default)]
pub struct PushOptions {
    /// Size in bytes if known up front; `None` marks a pure streaming source
    pub size: Option<u64>,
    /// SHA1 supplied by an upstream system, trusted as-is
    pub known_sha1: Option<String>,
    /// Optional progress accounting
    pub observer: Option<Arc<dyn ITransferObserver>>,
    /// Cancels every network call made for this push
    pub cancel: CancellationToken,
}

impl fmt::Debug for PushOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushOptions")
            .field("size", &self.size)
            .field("known_sha1", &self.known_sha1)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl PushOptions {
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_known_sha1(mut self, sha1: impl Into<String>) -> Self {
        self.known_sha1 = Some(sha1.into());
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ITransferObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Host-facing push/pull contract
#[async_trait]
pub trait IRemoteStorage: Send + Sync {
    /// Uploads `source` to `logical_path` and returns the provider's identity for it
    async fn push(
        &self,
        logical_path: &str,
        source: PushSource,
        options: PushOptions,
    ) -> Result<RemoteObject>;

    /// Opens the content at `logical_path`, optionally restricted to `range`
    async fn pull(
        &self,
        logical_path: &str,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<RemoteReader>;
}
