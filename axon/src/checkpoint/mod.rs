//! Checkpointing: named snapshots of session state across restarts.
//!
//! A [`Checkpoint`] captures everything the loop needs to resume: the state
//! snapshot, the step cursor, and any pending interrupts. Checkpoints are
//! immutable once saved and identified by `(session_id, name)`; they persist
//! beyond session end (retention is external).
//!
//! # Main types
//!
//! - [`Checkpointer`]: `save` / `load` / `list` / `delete`.
//! - [`MemorySaver`]: in-memory backend for tests and single-process runs.
//! - [`StoreSaver`]: persists blobs through any [`Store`] with bounded
//!   at-least-once save retries.
//!
//! **Interaction**: the loop saves under `interrupt_<id>` when a rule parks
//! it and deletes that checkpoint on resolution; `Agent::resume` loads it.
//!
//! [`Store`]: crate::store::Store

mod memory_saver;
mod store_saver;

pub use memory_saver::MemorySaver;
pub use store_saver::StoreSaver;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::interrupt::Interrupt;

/// Error type for checkpoint operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckpointError {
    #[error("not found: {session_id}/{name}")]
    NotFound { session_id: String, name: String },
    #[error("serialization: {0}")]
    Serialization(String),
    /// Backend fault; retryable.
    #[error("storage: {0}")]
    Storage(String),
}

impl CheckpointError {
    /// Transient failures may be retried; the rest are permanent.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// One named, immutable snapshot of a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub name: String,
    pub state_snapshot: HashMap<String, Value>,
    /// Step index the loop resumes from.
    pub step_cursor: usize,
    pub pending_interrupts: Vec<Interrupt>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        session_id: impl Into<String>,
        name: impl Into<String>,
        state_snapshot: HashMap<String, Value>,
        step_cursor: usize,
        pending_interrupts: Vec<Interrupt>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            name: name.into(),
            state_snapshot,
            step_cursor,
            pending_interrupts,
            created_at: Utc::now(),
        }
    }
}

/// Saves and loads checkpoints by `(session_id, name)`.
///
/// `save` has at-least-once semantics over the backing medium; `load` is
/// consistent with the latest successful save for that identity.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn load(&self, session_id: &str, name: &str) -> Result<Checkpoint, CheckpointError>;

    /// Checkpoint names for a session, ordered by save time.
    async fn list(&self, session_id: &str) -> Result<Vec<String>, CheckpointError>;

    async fn delete(&self, session_id: &str, name: &str) -> Result<(), CheckpointError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_transient_the_rest_permanent() {
        assert!(CheckpointError::Storage("io".into()).is_transient());
        assert!(!CheckpointError::Serialization("bad".into()).is_transient());
        assert!(!CheckpointError::NotFound {
            session_id: "s".into(),
            name: "n".into()
        }
        .is_transient());
    }
}
