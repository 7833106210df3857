//! Action archive for fanwatch
//!
//! This crate provides:
//! - Append-only action journal (sled embedded DB, ULID-keyed)
//! - Retention policies and pruning

pub mod journal;
pub mod retention;

// Re-exports
pub use journal::{ActionJournal, JournalEntry};
pub use retention::{PruneReport, Pruner, RetentionPolicy};

/// Result type for journal operations
pub type Result<T> = anyhow::Result<T>;
