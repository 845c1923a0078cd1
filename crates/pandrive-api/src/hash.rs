//! Content hashing and re-readable upload sources
//!
//! The provider identifies content by uppercase-hex SHA1 of the whole file
//! plus SHA1 of its first 128 KiB. Uploads may need the bytes several times
//! (hash, range challenge, transfer, validation retry), so every source is a
//! [`Reopenable`]: something that can hand out a fresh reader on demand.
//! One-shot readers are spooled into memory or a temporary file first,
//! hashing in the same pass.

use std::{io, path::PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use pandrive_core::domain::{ByteRange, DomainError, PRE_HASH_SIZE};
use sha1::{Digest, Sha1};
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::ApiError;

/// Read granularity for hashing and spooling
const READ_BUF: usize = 64 * 1024;

pub type SourceReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Uppercase hex SHA1 of `data`.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(data))
}

// ============================================================================
// Reopenable sources
// ============================================================================

/// A source that can produce a fresh reader for the same bytes
#[async_trait]
pub trait Reopenable: Send + Sync {
    /// Reader positioned at the first byte.
    async fn open(&self) -> io::Result<SourceReader>;

    /// Reader positioned at `offset`.
    async fn open_at(&self, offset: u64) -> io::Result<SourceReader> {
        let mut reader = self.open().await?;
        let skipped = tokio::io::copy(&mut (&mut reader).take(offset), &mut tokio::io::sink()).await?;
        if skipped < offset {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "offset beyond end of source",
            ));
        }
        Ok(reader)
    }

    /// Total size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A local file, reopened by path
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    pub async fn new(path: PathBuf) -> io::Result<Self> {
        let len = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, len })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl Reopenable for FileSource {
    async fn open(&self) -> io::Result<SourceReader> {
        Ok(Box::new(tokio::fs::File::open(&self.path).await?))
    }

    async fn open_at(&self, offset: u64) -> io::Result<SourceReader> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(io::SeekFrom::Start(offset)).await?;
        Ok(Box::new(file))
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Bytes already in memory
#[derive(Debug, Clone)]
pub struct MemorySource(pub Bytes);

#[async_trait]
impl Reopenable for MemorySource {
    async fn open(&self) -> io::Result<SourceReader> {
        Ok(Box::new(io::Cursor::new(self.0.clone())))
    }

    async fn open_at(&self, offset: u64) -> io::Result<SourceReader> {
        let start = (offset as usize).min(self.0.len());
        Ok(Box::new(io::Cursor::new(self.0.slice(start..))))
    }

    fn len(&self) -> u64 {
        self.0.len() as u64
    }
}

/// A one-shot stream captured locally; the temp file is removed on drop
#[derive(Debug)]
pub enum SpooledSource {
    Memory(MemorySource),
    File { path: TempPath, len: u64 },
}

#[async_trait]
impl Reopenable for SpooledSource {
    async fn open(&self) -> io::Result<SourceReader> {
        match self {
            SpooledSource::Memory(source) => source.open().await,
            SpooledSource::File { path, .. } => {
                Ok(Box::new(tokio::fs::File::open(&**path).await?))
            }
        }
    }

    async fn open_at(&self, offset: u64) -> io::Result<SourceReader> {
        match self {
            SpooledSource::Memory(source) => source.open_at(offset).await,
            SpooledSource::File { path, .. } => {
                let mut file = tokio::fs::File::open(&**path).await?;
                file.seek(io::SeekFrom::Start(offset)).await?;
                Ok(Box::new(file))
            }
        }
    }

    fn len(&self) -> u64 {
        match self {
            SpooledSource::Memory(source) => source.len(),
            SpooledSource::File { len, .. } => *len,
        }
    }
}

// ============================================================================
// Hashing
// ============================================================================

/// Hashes the provider asks for during negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHashes {
    /// SHA1 of the whole content
    pub sha1: String,
    /// SHA1 of the first 128 KiB; empty for empty content
    pub pre_sha1: String,
    pub size: u64,
}

/// Accumulates full and pre-hash over a byte stream fed in order
struct HashPair {
    full: Sha1,
    pre: Sha1,
    seen: u64,
}

impl HashPair {
    fn new() -> Self {
        Self {
            full: Sha1::new(),
            pre: Sha1::new(),
            seen: 0,
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        self.full.update(chunk);
        if self.seen < PRE_HASH_SIZE {
            let take = ((PRE_HASH_SIZE - self.seen) as usize).min(chunk.len());
            self.pre.update(&chunk[..take]);
        }
        self.seen += chunk.len() as u64;
    }

    fn finish(self) -> ContentHashes {
        let pre_sha1 = if self.seen == 0 {
            String::new()
        } else {
            hex::encode_upper(self.pre.finalize())
        };
        ContentHashes {
            sha1: hex::encode_upper(self.full.finalize()),
            pre_sha1,
            size: self.seen,
        }
    }
}

/// Computes full and pre-hash in one pass over the source.
pub async fn hash_source(source: &dyn Reopenable) -> Result<ContentHashes, ApiError> {
    let mut reader = source.open().await?;
    let mut hashes = HashPair::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hashes.update(&buf[..n]);
    }
    Ok(hashes.finish())
}

/// SHA1 of the first 128 KiB only (used when the full hash is supplied).
pub async fn pre_sha1(source: &dyn Reopenable) -> Result<String, ApiError> {
    if source.is_empty() {
        return Ok(String::new());
    }
    let range = ByteRange::new(0, source.len().min(PRE_HASH_SIZE) - 1)?;
    range_sha1(source, range).await
}

/// SHA1 of the inclusive byte range `[start, end]` of the source.
pub async fn range_sha1(source: &dyn Reopenable, range: ByteRange) -> Result<String, ApiError> {
    if range.end >= source.len() {
        return Err(DomainError::InvalidRange(format!(
            "{} is outside content of {} bytes",
            range,
            source.len()
        ))
        .into());
    }
    let mut reader = source.open_at(range.start).await?.take(range.len());
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; READ_BUF];
    let mut read = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        read += n as u64;
    }
    if read != range.len() {
        return Err(ApiError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("source ended after {} of {} bytes in range {}", read, range.len(), range),
        )));
    }
    Ok(hex::encode_upper(hasher.finalize()))
}

// ============================================================================
// Spooling
// ============================================================================

/// Drains a one-shot reader into a re-readable source, hashing as it goes.
///
/// Content stays in memory up to `memory_limit` bytes, then moves to a
/// temporary file.
pub async fn spool<R>(
    mut reader: R,
    memory_limit: u64,
) -> Result<(SpooledSource, ContentHashes), ApiError>
where
    R: AsyncRead + Unpin,
{
    let mut hashes = HashPair::new();
    let mut memory: Vec<u8> = Vec::new();
    let mut file: Option<(tokio::fs::File, TempPath)> = None;
    let mut buf = vec![0u8; READ_BUF];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        hashes.update(chunk);

        if file.is_none() && (memory.len() + n) as u64 > memory_limit {
            let (std_file, path) = tempfile::NamedTempFile::new()?.into_parts();
            let mut spill = tokio::fs::File::from_std(std_file);
            spill.write_all(&memory).await?;
            debug!(
                spilled = memory.len(),
                path = %path.display(),
                "Spool exceeded memory limit, moving to temp file"
            );
            memory = Vec::new();
            file = Some((spill, path));
        }

        match file.as_mut() {
            Some((spill, _)) => spill.write_all(chunk).await?,
            None => memory.extend_from_slice(chunk),
        }
    }

    let hashes = hashes.finish();
    let source = match file {
        Some((mut spill, path)) => {
            spill.flush().await?;
            SpooledSource::File {
                path,
                len: hashes.size,
            }
        }
        None => SpooledSource::Memory(MemorySource(Bytes::from(memory))),
    };
    Ok((source, hashes))
}
