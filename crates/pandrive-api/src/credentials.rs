//! Credential store implementations
//!
//! - [`KeyringCredentialStore`] - JSON in the OS keyring (GNOME Keyring, KDE Wallet, ...)
//! - [`FileCredentialStore`] - YAML file, owner-only permissions on unix
//! - [`MemoryCredentialStore`] - process-local, for tests and embedding

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use pandrive_core::{
    config::{AuthConfig, CredentialStoreKind},
    domain::Credential,
    ports::ICredentialStore,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Keyring service name for storing the credential
const KEYRING_SERVICE: &str = "pandrive";

/// Keyring user the credential is stored under
const KEYRING_USER: &str = "default";

/// Builds the store selected in the auth configuration.
pub fn store_from_config(config: &AuthConfig) -> Arc<dyn ICredentialStore> {
    match config.credential_store {
        CredentialStoreKind::Keyring => Arc::new(KeyringCredentialStore::default()),
        CredentialStoreKind::File => Arc::new(FileCredentialStore::new(config.credential_file.clone())),
    }
}

// ============================================================================
// KeyringCredentialStore
// ============================================================================

/// Stores the credential as JSON in the system keyring
///
/// Keyring calls are blocking (D-Bus on Linux), so they run on the blocking pool.
#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service: String,
    user: String,
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE, KEYRING_USER)
    }
}

impl KeyringCredentialStore {
    pub fn new(service: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user: user.into(),
        }
    }

    fn entry(service: &str, user: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(service, user).context("Failed to create keyring entry")
    }
}

#[async_trait]
impl ICredentialStore for KeyringCredentialStore {
    async fn load(&self) -> Result<Option<Credential>> {
        let (service, user) = (self.service.clone(), self.user.clone());
        tokio::task::spawn_blocking(move || {
            let entry = Self::entry(&service, &user)?;
            match entry.get_password() {
                Ok(json) => {
                    let credential: Credential = serde_json::from_str(&json)
                        .context("Failed to deserialize credential from keyring")?;
                    debug!(service = %service, "Loaded credential from keyring");
                    Ok(Some(credential))
                }
                Err(keyring::Error::NoEntry) => {
                    debug!(service = %service, "No credential found in keyring");
                    Ok(None)
                }
                Err(e) => Err(anyhow::Error::new(e).context("Failed to read from keyring")),
            }
        })
        .await
        .context("Keyring task panicked")?
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        let json = serde_json::to_string(credential).context("Failed to serialize credential")?;
        let (service, user) = (self.service.clone(), self.user.clone());
        tokio::task::spawn_blocking(move || {
            Self::entry(&service, &user)?
                .set_password(&json)
                .context("Failed to store credential in keyring")?;
            debug!(service = %service, "Stored credential in keyring");
            Ok(())
        })
        .await
        .context("Keyring task panicked")?
    }

    async fn clear(&self) -> Result<()> {
        let (service, user) = (self.service.clone(), self.user.clone());
        tokio::task::spawn_blocking(move || {
            match Self::entry(&service, &user)?.delete_credential() {
                Ok(()) => {
                    info!(service = %service, "Cleared credential from keyring");
                    Ok(())
                }
                Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(anyhow::Error::new(e).context("Failed to delete from keyring")),
            }
        })
        .await
        .context("Keyring task panicked")?
    }
}

// ============================================================================
// FileCredentialStore
// ============================================================================

/// Stores the credential as a YAML document
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl ICredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credential>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let credential = serde_yaml::from_str(&contents).with_context(|| {
                    format!("Failed to parse credential file {}", self.path.display())
                })?;
                Ok(Some(credential))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to read credential file {}", self.path.display()))),
        }
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(credential).context("Failed to serialize credential")?;

        // Replaced atomically through a sibling file
        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, yaml)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .context("Failed to restrict credential file permissions")?;
        }
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), "Stored credential file");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "Removed credential file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to remove credential file")),
        }
    }
}

// ============================================================================
// MemoryCredentialStore
// ============================================================================

/// Keeps the credential in memory and counts saves
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<Option<Credential>>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new(initial: Option<Credential>) -> Self {
        Self {
            inner: Mutex::new(initial),
            saves: Default::default(),
        }
    }

    /// Number of successful `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub async fn current(&self) -> Option<Credential> {
        self.inner.lock().await.clone()
    }
}

#[async_trait]
impl ICredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credential>> {
        Ok(self.inner.lock().await.clone())
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        *self.inner.lock().await = Some(credential.clone());
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.inner.lock().await = None;
        Ok(())
    }
}
