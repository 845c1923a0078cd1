//! Upload engine: multipart, single-shot and streamed transfers
//!
//! Multipart uploads send parts **one at a time, in order**; the storage
//! session is opened in sequential mode and rejects out-of-order parts. Each
//! part is read completely into a pooled buffer first, so a failed attempt is
//! retried from memory without touching the source again.
//!
//! A session ends exactly once: completed, or aborted after any failure
//! (cancellation included). Abort errors are logged and never replace the
//! error that caused them.

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use pandrive_core::{
    domain::{ChunkPlan, ChunkSizing},
    ports::ITransferObserver,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    hash::Reopenable,
    negotiate::UploadTicket,
    retry::RetryPolicy,
    storage::{CallbackData, CompletedPart, StorageClient},
    ApiError,
};

// ============================================================================
// PartBufferPool
// ============================================================================

/// Recycles part buffers between parts and between uploads
#[derive(Debug)]
pub struct PartBufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    max_idle: usize,
}

impl PartBufferPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// An empty buffer able to hold `len` bytes.
    pub fn take(&self, len: usize) -> BytesMut {
        let mut buf = self.buffers.lock().unwrap().pop().unwrap_or_default();
        buf.clear();
        buf.reserve(len);
        buf
    }

    /// Returns a part's bytes to the pool; the allocation is reused when no
    /// request still holds it.
    pub fn give(&self, part: Bytes) {
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_idle {
            buffers.push(BytesMut::from(part));
        }
    }

    pub fn idle(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

// ============================================================================
// UploadSession
// ============================================================================

/// Lifecycle of one multipart session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Completed,
    Aborted,
}

/// One open multipart session and the parts acknowledged so far
#[derive(Debug)]
pub struct UploadSession {
    pub ticket: UploadTicket,
    pub upload_id: String,
    parts: Vec<CompletedPart>,
    state: SessionState,
}

impl UploadSession {
    pub fn new(ticket: UploadTicket, upload_id: String) -> Self {
        Self {
            ticket,
            upload_id,
            parts: Vec::new(),
            state: SessionState::Open,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Acknowledged parts, in increasing part-number order.
    pub fn parts(&self) -> &[CompletedPart] {
        &self.parts
    }

    /// Records the next acknowledged part; part numbers must increase by one.
    pub fn record(&mut self, part: CompletedPart) -> Result<(), ApiError> {
        let expected = self.parts.len() as u64 + 1;
        if self.state != SessionState::Open || part.part_number != expected {
            return Err(ApiError::InvalidResponse(format!(
                "part {} recorded out of order (expected {}, session {:?})",
                part.part_number, expected, self.state
            )));
        }
        self.parts.push(part);
        Ok(())
    }

    fn finish(&mut self, state: SessionState) -> bool {
        if self.state != SessionState::Open {
            return false;
        }
        self.state = state;
        true
    }
}

// ============================================================================
// ChunkUploader
// ============================================================================

/// Moves bytes into the storage tier under an upload ticket
#[derive(Debug, Clone)]
pub struct ChunkUploader {
    storage: Arc<StorageClient>,
    pool: Arc<PartBufferPool>,
    retry: RetryPolicy,
    sizing: ChunkSizing,
}

impl ChunkUploader {
    pub fn new(
        storage: Arc<StorageClient>,
        pool: Arc<PartBufferPool>,
        retry: RetryPolicy,
        sizing: ChunkSizing,
    ) -> Self {
        Self {
            storage,
            pool,
            retry,
            sizing,
        }
    }

    pub fn sizing(&self) -> &ChunkSizing {
        &self.sizing
    }

    /// Multipart upload of the whole source.
    #[instrument(skip_all, fields(object = %ticket.object, size = source.len()))]
    pub async fn upload_multipart(
        &self,
        ticket: &UploadTicket,
        source: &dyn Reopenable,
        observer: Option<&Arc<dyn ITransferObserver>>,
        cancel: &CancellationToken,
    ) -> Result<CallbackData, ApiError> {
        let size = source.len();
        let plan = ChunkPlan::for_size(Some(size), &self.sizing)?;

        let upload_id = self
            .retry
            .run(
                cancel,
                |_| self.storage.initiate(ticket, cancel),
                ApiError::is_retryable,
            )
            .await?;
        let mut session = UploadSession::new(ticket.clone(), upload_id);
        info!(
            upload_id = %session.upload_id,
            chunk_size = plan.chunk_size,
            parts = ?plan.total_parts,
            "Starting multipart upload"
        );

        match self.drive(&mut session, plan, size, source, observer, cancel).await {
            Ok(data) => Ok(data),
            Err(e) => {
                self.abort(&mut session).await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        session: &mut UploadSession,
        plan: ChunkPlan,
        size: u64,
        source: &dyn Reopenable,
        observer: Option<&Arc<dyn ITransferObserver>>,
        cancel: &CancellationToken,
    ) -> Result<CallbackData, ApiError> {
        let total_parts = plan.total_parts.unwrap_or(1);
        let mut reader = source.open().await?;

        for part_number in 1..=total_parts {
            let len = plan.part_len(part_number, size);
            let part = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                part = self.read_part(&mut reader, len) => part?,
            };

            let result = self
                .retry
                .run(
                    cancel,
                    |attempt| {
                        if attempt > 1 {
                            debug!(part_number, attempt, "Retrying part");
                        }
                        self.storage.upload_part(
                            &session.ticket,
                            &session.upload_id,
                            part_number,
                            part.clone(),
                            cancel,
                        )
                    },
                    ApiError::is_retryable,
                )
                .await;
            let part_len = part.len() as u64;
            self.pool.give(part);

            let etag = result.map_err(|e| e.context(format!("upload part {}/{}", part_number, total_parts)))?;
            session.record(CompletedPart { part_number, etag })?;
            if let Some(observer) = observer {
                observer.on_bytes(part_len);
            }
            debug!(part_number, total_parts, bytes = part_len, "Part uploaded");
        }

        let data = self
            .retry
            .run(
                cancel,
                |_| {
                    self.storage
                        .complete(&session.ticket, &session.upload_id, session.parts(), cancel)
                },
                ApiError::is_retryable,
            )
            .await
            .map_err(|e| e.context("complete multipart upload"))?;
        session.finish(SessionState::Completed);
        info!(upload_id = %session.upload_id, file_id = %data.file_id, "Multipart upload completed");
        Ok(data)
    }

    async fn read_part<R>(&self, reader: &mut R, len: u64) -> Result<Bytes, ApiError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = self.pool.take(len as usize);
        let mut limited = reader.take(len);
        while (buf.len() as u64) < len {
            if limited.read_buf(&mut buf).await? == 0 {
                return Err(ApiError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("source ended after {} of {} part bytes", buf.len(), len),
                )));
            }
        }
        Ok(buf.freeze())
    }

    /// Aborts an open session; failures are logged only.
    async fn abort(&self, session: &mut UploadSession) {
        if !session.finish(SessionState::Aborted) {
            return;
        }
        // The caller's token may already be cancelled; abort runs regardless.
        let cancel = CancellationToken::new();
        match self
            .storage
            .abort(&session.ticket, &session.upload_id, &cancel)
            .await
        {
            Ok(()) => info!(upload_id = %session.upload_id, parts = session.parts().len(), "Multipart upload aborted"),
            Err(e) => warn!(upload_id = %session.upload_id, error = %e, "Failed to abort multipart upload"),
        }
    }

    /// One PUT carrying the whole buffered payload.
    #[instrument(skip_all, fields(object = %ticket.object, size = source.len()))]
    pub async fn put_single(
        &self,
        ticket: &UploadTicket,
        source: &dyn Reopenable,
        observer: Option<&Arc<dyn ITransferObserver>>,
        cancel: &CancellationToken,
    ) -> Result<CallbackData, ApiError> {
        let mut reader = source.open().await?;
        let body = self.read_part(&mut reader, source.len()).await?;
        let result = self
            .retry
            .run(
                cancel,
                |_| self.storage.put(ticket, body.clone(), cancel),
                ApiError::is_retryable,
            )
            .await;
        let len = body.len() as u64;
        self.pool.give(body);

        let data = result.map_err(|e| e.context("single-shot put"))?;
        if let Some(observer) = observer {
            observer.on_bytes(len);
        }
        info!(file_id = %data.file_id, "Single-shot upload completed");
        Ok(data)
    }

    /// One PUT streamed from the source, reopened on every attempt.
    #[instrument(skip_all, fields(object = %ticket.object, size = source.len()))]
    pub async fn put_streamed(
        &self,
        ticket: &UploadTicket,
        source: &dyn Reopenable,
        observer: Option<&Arc<dyn ITransferObserver>>,
        cancel: &CancellationToken,
    ) -> Result<CallbackData, ApiError> {
        let data = self
            .retry
            .run(
                cancel,
                |_| self.storage.put_stream(ticket, source, observer.cloned(), cancel),
                ApiError::is_retryable,
            )
            .await
            .map_err(|e| e.context("streamed put"))?;
        info!(file_id = %data.file_id, "Streamed upload completed");
        Ok(data)
    }
}
