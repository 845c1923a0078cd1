//! Put and get commands
//!
//! `pandrive put` pushes a local file (or stdin) into a remote folder through
//! the full upload pipeline; `pandrive get` fetches content by pick code.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use pandrive_core::{
    domain::ByteRange,
    ports::{IRemoteStorage, PushOptions, PushSource},
};
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::{cancel_on_ctrl_c, ByteCounter, CliContext, FixedFolderResolver};
use crate::output::human_bytes;

/// Root folder of the drive
const ROOT_FOLDER: &str = "0";

#[derive(Debug, clap::Args)]
pub struct PutCommand {
    /// Local file to upload, or `-` to read stdin
    pub source: PathBuf,

    /// Remote folder identifier
    #[arg(long, default_value = ROOT_FOLDER)]
    pub folder_id: String,

    /// Remote file name (defaults to the local file name)
    #[arg(long)]
    pub name: Option<String>,

    /// Size of stdin input, if known
    #[arg(long)]
    pub size: Option<u64>,

    /// SHA1 of the content, if already known
    #[arg(long)]
    pub sha1: Option<String>,
}

impl PutCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let fmt = ctx.formatter();
        let from_stdin = self.source.as_os_str() == "-";

        let name = match (&self.name, from_stdin) {
            (Some(name), _) => name.clone(),
            (None, true) => anyhow::bail!("--name is required when reading stdin"),
            (None, false) => self
                .source
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .with_context(|| format!("No file name in {}", self.source.display()))?,
        };

        let remote = ctx.remote(Arc::new(FixedFolderResolver::new(&self.folder_id)))?;
        let counter = Arc::new(ByteCounter::default());
        let mut options = PushOptions::default()
            .with_observer(counter.clone())
            .with_cancel(cancel_on_ctrl_c());
        if let Some(size) = self.size {
            options = options.with_size(size);
        }
        if let Some(sha1) = &self.sha1 {
            options = options.with_known_sha1(sha1.to_uppercase());
        }

        let source = if from_stdin {
            PushSource::Stream(Box::new(tokio::io::stdin()))
        } else {
            PushSource::File(self.source.clone())
        };

        info!(name = %name, folder_id = %self.folder_id, "Uploading");
        let object = remote.push(&name, source, options).await?;

        if ctx.is_json() {
            fmt.print_json(&serde_json::json!({
                "success": true,
                "file_id": object.file_id,
                "pick_code": object.pick_code,
                "name": object.name,
                "size": object.size,
                "sha1": object.sha1,
                "bytes_sent": counter.sent(),
                "instant": counter.copied() > 0,
            }));
            return Ok(());
        }

        if counter.copied() > 0 {
            fmt.success(&format!("{} already on the drive, completed instantly", object.name));
        } else {
            fmt.success(&format!("Uploaded {}", object.name));
        }
        fmt.field("File id", &object.file_id);
        fmt.field("Pick code", &object.pick_code);
        fmt.field("Size", &human_bytes(object.size));
        fmt.field("Sent", &human_bytes(counter.sent()));
        Ok(())
    }
}

#[derive(Debug, clap::Args)]
pub struct GetCommand {
    /// Pick code of the file
    pub pick_code: String,

    /// Output path, or `-` for stdout (defaults to the remote file name)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Inclusive byte range, e.g. `0-1023`
    #[arg(long, value_parser = parse_range)]
    pub range: Option<ByteRange>,
}

impl GetCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let fmt = ctx.formatter();
        let cancel = cancel_on_ctrl_c();
        let remote = ctx.remote(Arc::new(FixedFolderResolver::new(ROOT_FOLDER)))?;
        let downloads = remote.downloads();

        let url = downloads.url(&self.pick_code, &cancel).await?;
        let output = match &self.output {
            Some(path) => path.clone(),
            None if url.file_name.is_empty() => PathBuf::from(&self.pick_code),
            None => PathBuf::from(&url.file_name),
        };

        let mut reader = downloads.open(&self.pick_code, self.range, &cancel).await?;
        info!(pick_code = %self.pick_code, output = %output.display(), "Downloading");

        if output.as_os_str() == "-" {
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut reader, &mut stdout).await?;
            stdout.flush().await?;
            return Ok(());
        }

        let mut file = tokio::fs::File::create(&output)
            .await
            .with_context(|| format!("Failed to create {}", output.display()))?;
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .with_context(|| format!("Failed to write {}", output.display()))?;
        file.flush().await?;

        if ctx.is_json() {
            fmt.print_json(&serde_json::json!({
                "success": true,
                "pick_code": self.pick_code,
                "path": output.display().to_string(),
                "bytes": written,
            }));
        } else {
            fmt.success(&format!("Saved {}", output.display()));
            fmt.field("Size", &human_bytes(written));
        }
        Ok(())
    }
}

fn parse_range(raw: &str) -> Result<ByteRange, String> {
    raw.parse::<ByteRange>().map_err(|e| e.to_string())
}
