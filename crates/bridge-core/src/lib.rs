//! uibridge core - shared domain types
//!
//! This crate provides the domain types shared between the bridge daemon
//! (`bridged`) and its clients:
//! - `context` - execution contexts exposed by the remote application
//! - `snapshot` - captured UI state, canonical form, and change detection
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`
//! (outside static pattern construction), `panic!()`, or `todo!()`.

pub mod context;
pub mod error;
pub mod snapshot;

// Re-exports for convenience
pub use context::{ContextEvent, ContextId, ContextRegistry, ExecutionContext};
pub use error::{DomainError, DomainResult};
pub use snapshot::{
    canonicalize, content_hash, hash_canonical, CapturedState, ChangeDetector, Snapshot,
    SnapshotHash,
};
