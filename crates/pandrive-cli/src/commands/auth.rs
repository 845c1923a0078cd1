//! Auth commands - Login, Logout, and Status
//!
//! Provides the `pandrive auth` CLI subcommands which:
//! 1. `login`  - Runs the device-code PKCE flow, printing the QR payload to
//!    scan, and stores the resulting credential.
//! 2. `logout` - Clears the stored credential.
//! 3. `status` - Shows whether a credential is stored and when it expires.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;
use pandrive_api::{
    auth::{DeviceCodeFlow, TokenManager},
    client::ApiClient,
    credentials::store_from_config,
};
use tracing::info;

use super::{cancel_on_ctrl_c, CliContext, TerminalPresenter};
use crate::output::OutputFormatter;

#[derive(Debug, Subcommand)]
pub enum AuthCommand {
    /// Log in by scanning a QR code with the provider's mobile app
    Login {
        /// Client identifier issued by the provider's open platform
        #[arg(long)]
        client_id: Option<String>,
        /// Log in again even if a credential is already stored
        #[arg(long)]
        force: bool,
    },
    /// Remove stored credentials
    Logout,
    /// Check authentication status
    Status,
}

impl AuthCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let fmt = ctx.formatter();
        match self {
            AuthCommand::Login { client_id, force } => {
                self.execute_login(ctx, client_id.as_deref(), *force, &*fmt)
                    .await
            }
            AuthCommand::Logout => self.execute_logout(ctx, &*fmt).await,
            AuthCommand::Status => self.execute_status(ctx, &*fmt).await,
        }
    }

    async fn execute_login(
        &self,
        ctx: &CliContext,
        cli_client_id: Option<&str>,
        force: bool,
        fmt: &dyn OutputFormatter,
    ) -> Result<()> {
        let mut auth = ctx.config.auth.clone();
        if let Some(client_id) = cli_client_id {
            auth.client_id = Some(client_id.to_string());
        }
        if auth.client_id.is_none() {
            anyhow::bail!(
                "No client_id provided. Use --client-id or set auth.client_id in {}",
                ctx.config_path.display()
            );
        }

        let tokens = token_manager(ctx, &auth)?;
        if !force {
            if let Some(existing) = tokens.credential().await? {
                if !existing.is_expired() {
                    fmt.success("Already logged in");
                    fmt.info("Use --force to log in again");
                    return Ok(());
                }
            }
        }

        info!("Starting device-code login");
        let cancel = cancel_on_ctrl_c();
        let credential = tokens.login(&cancel).await.context("Login failed")?;

        if ctx.is_json() {
            fmt.print_json(&serde_json::json!({
                "success": true,
                "expires_at": credential.expires_at.to_rfc3339(),
            }));
        } else {
            fmt.success("Logged in");
            fmt.field("Expires", &credential.expires_at.to_rfc3339());
        }
        Ok(())
    }

    async fn execute_logout(&self, ctx: &CliContext, fmt: &dyn OutputFormatter) -> Result<()> {
        let tokens = token_manager(ctx, &ctx.config.auth)?;
        tokens.logout().await.context("Failed to clear stored credential")?;

        info!("Logged out");
        fmt.success("Logged out, stored credential removed");
        Ok(())
    }

    async fn execute_status(&self, ctx: &CliContext, fmt: &dyn OutputFormatter) -> Result<()> {
        let tokens = token_manager(ctx, &ctx.config.auth)?;
        let credential = tokens
            .credential()
            .await
            .context("Failed to read stored credential")?;

        if ctx.is_json() {
            let json = match &credential {
                Some(c) => serde_json::json!({
                    "authenticated": true,
                    "expired": c.is_expired(),
                    "expires_at": c.expires_at.to_rfc3339(),
                    "store": format!("{:?}", ctx.config.auth.credential_store).to_lowercase(),
                }),
                None => serde_json::json!({ "authenticated": false }),
            };
            fmt.print_json(&json);
            return Ok(());
        }

        match credential {
            Some(c) if c.is_expired() => {
                fmt.warn("Access token expired; it will be refreshed on the next call");
                fmt.field("Expired at", &c.expires_at.to_rfc3339());
            }
            Some(c) => {
                let remaining = c.expires_at - Utc::now();
                fmt.success("Authenticated");
                fmt.field("Expires", &c.expires_at.to_rfc3339());
                fmt.field("Remaining", &format!("{} min", remaining.num_minutes()));
            }
            None => {
                fmt.warn("Not logged in");
                fmt.info("Run 'pandrive auth login' to authenticate");
            }
        }
        Ok(())
    }
}

fn token_manager(
    ctx: &CliContext,
    auth: &pandrive_core::config::AuthConfig,
) -> Result<Arc<TokenManager>> {
    let api = ApiClient::from_config(&ctx.config).context("Failed to set up the API client")?;
    let flow = DeviceCodeFlow::new(api, auth);
    Ok(Arc::new(TokenManager::new(
        flow,
        auth,
        store_from_config(auth),
        Arc::new(TerminalPresenter::new(ctx.format)),
    )))
}
