//! Upload planning types
//!
//! - [`UploadTarget`] - where an upload lands, resolved once per attempt
//! - [`ChunkPlan`] / [`ChunkSizing`] - size-tiered part sizing for multipart uploads
//! - [`ByteRange`] - inclusive byte range used by the secondary-auth challenge
//! - [`RemoteObject`] - final identity of an object on the provider

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Number of leading bytes covered by the pre-hash.
pub const PRE_HASH_SIZE: u64 = 128 * KIB;

// ============================================================================
// UploadTarget
// ============================================================================

/// Destination of one upload attempt
///
/// Immutable for the duration of the attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    /// Logical path as seen by the sync engine (e.g. `docs/report.pdf`)
    pub logical_path: String,
    /// Size in bytes, `None` for pure streaming sources
    pub size: Option<u64>,
    /// File name of the new object
    pub leaf_name: String,
    /// Provider identifier of the parent folder
    pub parent_folder_id: String,
}

impl UploadTarget {
    pub fn new(
        logical_path: impl Into<String>,
        size: Option<u64>,
        leaf_name: impl Into<String>,
        parent_folder_id: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let leaf_name = leaf_name.into();
        if leaf_name.is_empty() || leaf_name.contains('/') {
            return Err(DomainError::InvalidPath(format!(
                "invalid leaf name {:?}",
                leaf_name
            )));
        }
        Ok(Self {
            logical_path: logical_path.into(),
            size,
            leaf_name,
            parent_folder_id: parent_folder_id.into(),
        })
    }

    /// Same target with a size learned after spooling.
    pub fn with_size(&self, size: u64) -> Self {
        Self {
            size: Some(size),
            ..self.clone()
        }
    }
}

// ============================================================================
// RemoteObject
// ============================================================================

/// A file as identified by the provider after upload or lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// Provider file identifier
    pub file_id: String,
    /// Pick code, used to resolve download URLs
    pub pick_code: String,
    /// Uppercase hex SHA1 of the content, when known
    pub sha1: Option<String>,
    /// File name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Parent folder identifier, when known
    pub parent_id: Option<String>,
}

// ============================================================================
// Chunk planning
// ============================================================================

/// Files up to this size go up as a single part.
const SINGLE_PART_LIMIT: u64 = 100 * MIB;

/// (largest file size in band, part size for the band)
const SIZE_TIERS: &[(u64, u64)] = &[
    (200 * MIB, 10 * MIB),
    (500 * MIB, 20 * MIB),
    (GIB, 50 * MIB),
    (2 * GIB, 100 * MIB),
];

/// Part size for files above the last tier, and for unknown sizes.
const TOP_TIER_PART: u64 = 200 * MIB;

/// Provider-imposed multipart limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizing {
    pub min_part_size: u64,
    pub max_part_size: u64,
    pub max_parts: u64,
}

impl Default for ChunkSizing {
    fn default() -> Self {
        Self {
            min_part_size: 100 * KIB,
            max_part_size: 5 * GIB,
            max_parts: 10_000,
        }
    }
}

impl ChunkSizing {
    fn check(&self) -> Result<(), DomainError> {
        if self.min_part_size == 0 || self.max_parts == 0 {
            return Err(DomainError::InvalidChunkSizing(
                "min part size and max parts must be greater than 0".into(),
            ));
        }
        if self.min_part_size > self.max_part_size {
            return Err(DomainError::InvalidChunkSizing(format!(
                "min part size {} exceeds max part size {}",
                self.min_part_size, self.max_part_size
            )));
        }
        Ok(())
    }

    /// Largest file that fits in `max_parts` parts of `max_part_size`.
    pub fn max_file_size(&self) -> u64 {
        self.max_part_size.saturating_mul(self.max_parts)
    }
}

/// Part size and count for one multipart upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunk_size: u64,
    /// `None` when the file size is unknown up front
    pub total_parts: Option<u64>,
}

fn tier_part_size(size: u64) -> u64 {
    if size <= SINGLE_PART_LIMIT {
        return size;
    }
    SIZE_TIERS
        .iter()
        .find(|(limit, _)| size <= *limit)
        .map(|(_, part)| *part)
        .unwrap_or(TOP_TIER_PART)
}

impl ChunkPlan {
    /// Picks a part size from the size-tiered table, clamped to `sizing`.
    ///
    /// Guarantees `min_part_size <= chunk_size <= max_part_size` and
    /// `total_parts <= max_parts`.
    pub fn for_size(size: Option<u64>, sizing: &ChunkSizing) -> Result<Self, DomainError> {
        sizing.check()?;

        let Some(size) = size else {
            return Ok(Self {
                chunk_size: TOP_TIER_PART.clamp(sizing.min_part_size, sizing.max_part_size),
                total_parts: None,
            });
        };

        if size > sizing.max_file_size() {
            return Err(DomainError::FileTooLarge {
                size,
                max: sizing.max_file_size(),
            });
        }

        let floor = size.div_ceil(sizing.max_parts);
        let chunk_size = tier_part_size(size)
            .clamp(sizing.min_part_size, sizing.max_part_size)
            .max(floor);
        let total_parts = size.div_ceil(chunk_size).max(1);

        Ok(Self {
            chunk_size,
            total_parts: Some(total_parts),
        })
    }

    /// Length of the 1-based `part_number` for a file of `size` bytes.
    pub fn part_len(&self, part_number: u64, size: u64) -> u64 {
        let offset = (part_number.saturating_sub(1)).saturating_mul(self.chunk_size);
        size.saturating_sub(offset).min(self.chunk_size)
    }
}

// ============================================================================
// ByteRange
// ============================================================================

/// Inclusive byte range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Result<Self, DomainError> {
        if end < start {
            return Err(DomainError::InvalidRange(format!("{}-{}", start, end)));
        }
        Ok(Self { start, end })
    }

    /// Number of bytes covered, both ends included.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value for an HTTP `Range` header.
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl FromStr for ByteRange {
    type Err = DomainError;

    /// Parses the provider's `"start-end"` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DomainError::InvalidRange(s.to_string());
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start = start.trim().parse::<u64>().map_err(|_| invalid())?;
        let end = end.trim().parse::<u64>().map_err(|_| invalid())?;
        Self::new(start, end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
