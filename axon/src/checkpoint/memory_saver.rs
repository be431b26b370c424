//! In-memory checkpointer. Not persistent.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Checkpoint, CheckpointError, Checkpointer};

/// In-memory [`Checkpointer`] keyed by `(session_id, name)`.
///
/// **Interaction**: default saver when none is injected; also the fixture
/// the interrupt/resume tests run against.
pub struct MemorySaver {
    inner: RwLock<HashMap<(String, String), (Checkpoint, DateTime<Utc>)>>,
}

impl MemorySaver {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("saver lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemorySaver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Checkpointer for MemorySaver {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let key = (checkpoint.session_id.clone(), checkpoint.name.clone());
        self.inner
            .write()
            .expect("saver lock")
            .insert(key, (checkpoint.clone(), Utc::now()));
        Ok(())
    }

    async fn load(&self, session_id: &str, name: &str) -> Result<Checkpoint, CheckpointError> {
        self.inner
            .read()
            .expect("saver lock")
            .get(&(session_id.to_string(), name.to_string()))
            .map(|(cp, _)| cp.clone())
            .ok_or_else(|| CheckpointError::NotFound {
                session_id: session_id.to_string(),
                name: name.to_string(),
            })
    }

    async fn list(&self, session_id: &str) -> Result<Vec<String>, CheckpointError> {
        let guard = self.inner.read().expect("saver lock");
        let mut named: Vec<(&DateTime<Utc>, &String)> = guard
            .iter()
            .filter(|((sid, _), _)| sid == session_id)
            .map(|((_, name), (_, saved_at))| (saved_at, name))
            .collect();
        named.sort();
        Ok(named.into_iter().map(|(_, name)| name.clone()).collect())
    }

    async fn delete(&self, session_id: &str, name: &str) -> Result<(), CheckpointError> {
        self.inner
            .write()
            .expect("saver lock")
            .remove(&(session_id.to_string(), name.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap as Map;

    fn checkpoint(name: &str) -> Checkpoint {
        Checkpoint::new(
            "sess",
            name,
            Map::from([("k".to_string(), json!(1))]),
            2,
            vec![],
        )
    }

    #[tokio::test]
    async fn save_then_load_is_deep_equal() {
        let saver = MemorySaver::new();
        let cp = checkpoint("a");
        saver.save(&cp).await.unwrap();
        let loaded = saver.load("sess", "a").await.unwrap();
        assert_eq!(loaded.state_snapshot, cp.state_snapshot);
        assert_eq!(loaded.step_cursor, 2);
        assert!(loaded.pending_interrupts.is_empty());
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let saver = MemorySaver::new();
        let err = saver.load("sess", "missing").await.unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_orders_by_save_time_and_scopes_by_session() {
        let saver = MemorySaver::new();
        saver.save(&checkpoint("first")).await.unwrap();
        saver.save(&checkpoint("second")).await.unwrap();
        let mut other = checkpoint("elsewhere");
        other.session_id = "other".into();
        saver.save(&other).await.unwrap();

        let names = saver.list("sess").await.unwrap();
        assert_eq!(names, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn delete_then_load_is_not_found() {
        let saver = MemorySaver::new();
        saver.save(&checkpoint("a")).await.unwrap();
        saver.delete("sess", "a").await.unwrap();
        assert!(saver.load("sess", "a").await.is_err());
        // Deleting again is fine.
        saver.delete("sess", "a").await.unwrap();
    }

    #[tokio::test]
    async fn save_overwrites_same_identity() {
        let saver = MemorySaver::new();
        saver.save(&checkpoint("a")).await.unwrap();
        let mut newer = checkpoint("a");
        newer.step_cursor = 9;
        saver.save(&newer).await.unwrap();
        assert_eq!(saver.load("sess", "a").await.unwrap().step_cursor, 9);
        assert_eq!(saver.len(), 1);
    }
}
