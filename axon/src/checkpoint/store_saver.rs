//! Checkpointer over any [`Store`] backend.
//!
//! Blobs are serialized with `serde_json` into the namespace
//! `["checkpoints", <session_id>]`. Saves retry a bounded number of times on
//! transient backend faults, giving at-least-once semantics; a re-saved blob
//! is byte-identical, so replays are harmless.

use async_trait::async_trait;
use std::sync::Arc;

use super::{Checkpoint, CheckpointError, Checkpointer};
use crate::store::{Namespace, Store, StoreError};

const SAVE_ATTEMPTS: u32 = 3;

/// [`Checkpointer`] persisting through an injected [`Store`].
pub struct StoreSaver {
    store: Arc<dyn Store>,
}

impl StoreSaver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn namespace(session_id: &str) -> Namespace {
        vec!["checkpoints".to_string(), session_id.to_string()]
    }
}

fn storage_err(e: StoreError) -> CheckpointError {
    CheckpointError::Storage(e.to_string())
}

#[async_trait]
impl Checkpointer for StoreSaver {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let value = serde_json::to_value(checkpoint)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let ns = Self::namespace(&checkpoint.session_id);

        let mut last = None;
        for _ in 0..SAVE_ATTEMPTS {
            match self.store.put(&ns, &checkpoint.name, &value, None).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => last = Some(e),
                Err(e) => return Err(storage_err(e)),
            }
        }
        Err(storage_err(last.unwrap_or(StoreError::Backend(
            "save retries exhausted".to_string(),
        ))))
    }

    async fn load(&self, session_id: &str, name: &str) -> Result<Checkpoint, CheckpointError> {
        let ns = Self::namespace(session_id);
        let value = self
            .store
            .get(&ns, name)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| CheckpointError::NotFound {
                session_id: session_id.to_string(),
                name: name.to_string(),
            })?;
        serde_json::from_value(value).map_err(|e| CheckpointError::Serialization(e.to_string()))
    }

    async fn list(&self, session_id: &str) -> Result<Vec<String>, CheckpointError> {
        self.store
            .list(&Self::namespace(session_id))
            .await
            .map_err(storage_err)
    }

    async fn delete(&self, session_id: &str, name: &str) -> Result<(), CheckpointError> {
        self.store
            .delete(&Self::namespace(session_id), name)
            .await
            .map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use std::collections::HashMap;

    #[tokio::test]
    async fn round_trips_through_the_store() {
        let saver = StoreSaver::new(Arc::new(InMemoryStore::new()));
        let cp = Checkpoint::new(
            "sess",
            "interrupt_1",
            HashMap::from([("a".to_string(), json!({"deep": [1, 2]}))]),
            4,
            vec![],
        );
        saver.save(&cp).await.unwrap();

        let loaded = saver.load("sess", "interrupt_1").await.unwrap();
        assert_eq!(loaded.state_snapshot, cp.state_snapshot);
        assert_eq!(loaded.step_cursor, 4);
        assert_eq!(loaded.session_id, "sess");

        assert_eq!(
            saver.list("sess").await.unwrap(),
            vec!["interrupt_1".to_string()]
        );

        saver.delete("sess", "interrupt_1").await.unwrap();
        assert!(saver.load("sess", "interrupt_1").await.is_err());
    }
}
