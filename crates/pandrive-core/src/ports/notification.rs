//! Login presentation and transfer accounting ports
//!
//! Both are fire-and-forget callbacks: the adapter never waits on them and
//! implementations must not block.

use serde::{Deserialize, Serialize};

// ============================================================================
// Login presentation
// ============================================================================

/// Payload the user has to scan or open to approve a device login
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginPrompt {
    /// Device identifier of the pending login
    pub device_uid: String,
    /// Content of the QR code (a URL the provider's mobile app understands)
    pub qr_payload: String,
}

/// Progress of a pending device login as reported by the status endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginProgress {
    /// Waiting for the user to scan the code
    Waiting,
    /// Code scanned, waiting for confirmation
    Scanned,
    /// User confirmed the login
    Approved,
}

/// Shows the device-code login payload to the end user out of band
pub trait ILoginPresenter: Send + Sync {
    /// Called once per login attempt with the payload to display
    fn present(&self, prompt: &LoginPrompt);

    /// Called whenever the polled status changes
    fn progress(&self, _progress: LoginProgress) {}
}

// ============================================================================
// Transfer accounting
// ============================================================================

/// Receives byte counts for one push, kept separate from the data source
pub trait ITransferObserver: Send + Sync {
    /// `bytes` more were sent to the storage tier
    fn on_bytes(&self, bytes: u64);

    /// The provider already had the content; `size` bytes completed instantly
    fn on_server_side_copy(&self, size: u64);
}
