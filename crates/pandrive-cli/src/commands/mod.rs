//! CLI subcommands and the wiring they share

pub mod auth;
pub mod completions;
pub mod config;
pub mod transfer;

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use pandrive_api::{credentials::store_from_config, provider::PanRemoteStorage};
use pandrive_core::{
    config::Config,
    domain::RemoteObject,
    ports::{
        ILoginPresenter, IPathResolver, ITransferObserver, LoginProgress, LoginPrompt,
        ResolvedParent,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::output::{get_formatter, OutputFormat, OutputFormatter};

/// Everything a command needs from the global flags
pub struct CliContext {
    pub config: Config,
    pub config_path: PathBuf,
    pub format: OutputFormat,
    pub quiet: bool,
}

impl CliContext {
    pub fn new(config: Config, config_path: PathBuf, format: OutputFormat, quiet: bool) -> Self {
        Self {
            config,
            config_path,
            format,
            quiet,
        }
    }

    pub fn formatter(&self) -> Box<dyn OutputFormatter> {
        get_formatter(self.format, self.quiet)
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Builds the adapter with the configured credential store.
    pub fn remote(&self, resolver: Arc<dyn IPathResolver>) -> Result<PanRemoteStorage> {
        let store = store_from_config(&self.config.auth);
        let presenter = Arc::new(TerminalPresenter::new(self.format));
        PanRemoteStorage::from_config(&self.config, store, presenter, resolver)
            .context("Failed to set up the provider client")
    }
}

/// Cancellation token tripped by Ctrl-C
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupted, cancelling");
            trigger.cancel();
        }
    });
    cancel
}

/// Prints the login QR payload and status changes to the terminal
pub struct TerminalPresenter {
    formatter: Box<dyn OutputFormatter>,
    format: OutputFormat,
}

impl TerminalPresenter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            formatter: get_formatter(format, false),
            format,
        }
    }
}

impl ILoginPresenter for TerminalPresenter {
    fn present(&self, prompt: &LoginPrompt) {
        if self.format == OutputFormat::Json {
            self.formatter.print_json(&serde_json::json!({
                "event": "login_prompt",
                "device_uid": prompt.device_uid,
                "qr_payload": prompt.qr_payload,
            }));
            return;
        }
        self.formatter
            .info("Scan this code with the provider's mobile app to approve the login:");
        self.formatter.info("");
        self.formatter.info(&prompt.qr_payload);
        self.formatter.info("");
    }

    fn progress(&self, progress: LoginProgress) {
        match progress {
            LoginProgress::Waiting => self.formatter.info("Waiting for the code to be scanned..."),
            LoginProgress::Scanned => self.formatter.info("Scanned, confirm the login on the phone"),
            LoginProgress::Approved => self.formatter.info("Login approved"),
        }
    }
}

/// Resolves every logical path into one fixed remote folder
///
/// The CLI has no directory cache, so the leaf name is the last path
/// component and lookups always miss.
#[derive(Debug)]
pub struct FixedFolderResolver {
    folder_id: String,
}

impl FixedFolderResolver {
    pub fn new(folder_id: impl Into<String>) -> Self {
        Self {
            folder_id: folder_id.into(),
        }
    }
}

#[async_trait]
impl IPathResolver for FixedFolderResolver {
    async fn resolve_parent(&self, logical_path: &str) -> Result<ResolvedParent> {
        let leaf_name = logical_path
            .rsplit('/')
            .find(|part| !part.is_empty())
            .with_context(|| format!("No file name in {:?}", logical_path))?;
        Ok(ResolvedParent {
            parent_id: self.folder_id.clone(),
            leaf_name: leaf_name.to_string(),
        })
    }

    async fn lookup_file(&self, _logical_path: &str) -> Result<Option<RemoteObject>> {
        Ok(None)
    }
}

/// Sums transferred and instantly completed bytes for the final report
#[derive(Debug, Default)]
pub struct ByteCounter {
    sent: AtomicU64,
    copied: AtomicU64,
}

impl ByteCounter {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn copied(&self) -> u64 {
        self.copied.load(Ordering::Relaxed)
    }
}

impl ITransferObserver for ByteCounter {
    fn on_bytes(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::Relaxed);
    }

    fn on_server_side_copy(&self, size: u64) {
        self.copied.fetch_add(size, Ordering::Relaxed);
    }
}
