//! Versioned response cache for intercepted requests.
//!
//! This module provides:
//! - Named, versioned generations of stored responses, keyed by (method, URL)
//! - A SQLite store with per-key upserts and atomic whole-generation deletes
//! - The install/activate lifecycle that fills the static generation and garbage
//!   collects stale ones on version rollover
//! - Tracking for cache writes detached from the request that produced them

mod generations;
mod pending;
mod storage;
mod traits;

pub use generations::{ActivationOutcome, CacheGenerationManager, InstallReport, Lifecycle};
pub use pending::PendingWrites;
pub use storage::{CachedEntry, GenerationInfo, GenerationStore, SqliteStorage};
pub use traits::{CacheResult, CanonicalKey, GenerationId, ResponseSource};
