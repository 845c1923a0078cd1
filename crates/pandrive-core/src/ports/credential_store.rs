//! Credential persistence port
//!
//! The credential is the only state that must survive a restart. The token
//! manager saves every newly issued credential through this port before it
//! hands the token to callers.

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::Credential;

/// Durable storage for the single adapter credential
#[async_trait]
pub trait ICredentialStore: Send + Sync {
    /// Loads the stored credential, `None` if nothing was stored yet
    async fn load(&self) -> Result<Option<Credential>>;

    /// Replaces the stored credential
    async fn save(&self, credential: &Credential) -> Result<()>;

    /// Removes the stored credential; succeeds if there was none
    async fn clear(&self) -> Result<()>;
}
