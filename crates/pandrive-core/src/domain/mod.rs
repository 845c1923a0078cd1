//! Domain entities and business rules
//!
//! - Credential lifecycle records (bearer credential, pending device login)
//! - Upload planning types (target, chunk plan, byte ranges)
//! - Remote object identity returned by the provider
//! - Domain-specific error types

pub mod credential;
pub mod errors;
pub mod upload;

// Re-export commonly used types
pub use credential::{Credential, PendingLogin};
pub use errors::DomainError;
pub use upload::{
    ByteRange, ChunkPlan, ChunkSizing, RemoteObject, UploadTarget, GIB, KIB, MIB, PRE_HASH_SIZE,
};
