//! Path resolution port (directory-cache collaborator)
//!
//! Maps logical paths used by the sync engine onto provider folder and file
//! identifiers. Listing, caching and folder creation are the implementor's
//! business; the adapter only asks for the answers.

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::RemoteObject;

/// Parent folder and leaf name for a logical path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedParent {
    /// Provider identifier of the parent folder (created if missing)
    pub parent_id: String,
    /// Final path component
    pub leaf_name: String,
}

#[async_trait]
pub trait IPathResolver: Send + Sync {
    /// Resolves (creating intermediate folders as needed) the parent of `logical_path`.
    async fn resolve_parent(&self, logical_path: &str) -> Result<ResolvedParent>;

    /// Looks up an existing file, `None` if the path does not exist.
    async fn lookup_file(&self, logical_path: &str) -> Result<Option<RemoteObject>>;

    /// Lets the cache learn about an object that was just uploaded.
    async fn record_upload(&self, _logical_path: &str, _object: &RemoteObject) -> Result<()> {
        Ok(())
    }
}
