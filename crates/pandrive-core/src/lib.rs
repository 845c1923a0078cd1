//! pandrive core - Domain types, configuration and port definitions
//!
//! This crate holds everything the provider adapter shares without touching
//! the network:
//! - **Domain types** - `Credential`, `PendingLogin`, `UploadTarget`, `ChunkPlan`, `RemoteObject`
//! - **Configuration** - YAML-backed [`config::Config`] with validation and a builder
//! - **Port definitions** - Traits for collaborators: `IRemoteStorage`, `IPathResolver`,
//!   `ICredentialStore`, `ILoginPresenter`, `ITransferObserver`
//!
//! # Architecture
//!
//! Ports & adapters: the `pandrive-api` crate implements `IRemoteStorage` on top
//! of the provider HTTP API and consumes the remaining ports, which are supplied
//! by the host (directory cache, login UI, progress accounting).

pub mod config;
pub mod domain;
pub mod ports;
