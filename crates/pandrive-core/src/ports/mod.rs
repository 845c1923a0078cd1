//! Port definitions (hexagonal architecture interfaces)
//!
//! The adapter in `pandrive-api` implements [`IRemoteStorage`] and depends on
//! the remaining ports, whose implementations are supplied by the host.
//!
//! ## Ports Overview
//!
//! - [`IRemoteStorage`] - push/pull a file given a logical path (host-facing contract)
//! - [`IPathResolver`] - directory cache: logical path to provider identifiers
//! - [`ICredentialStore`] - durable storage for the bearer credential
//! - [`ILoginPresenter`] - shows the device-code login payload to the user
//! - [`ITransferObserver`] - byte accounting for progress reporting

pub mod credential_store;
pub mod notification;
pub mod path_resolver;
pub mod remote_storage;

pub use credential_store::ICredentialStore;
pub use notification::{ILoginPresenter, ITransferObserver, LoginProgress, LoginPrompt};
pub use path_resolver::{IPathResolver, ResolvedParent};
pub use remote_storage::{IRemoteStorage, PushOptions, PushSource, RemoteReader};
