//! Per-session mutable state.
//!
//! One [`SessionState`] exists per top-level invocation. It is a keyed store
//! of JSON values plus session metadata, safe for concurrent readers with
//! serialized writes. Every mutation bumps `last_modified` and publishes a
//! [`StateChange`] on the watch feed.
//!
//! # Main types
//!
//! - [`SessionState`]: `get` / `set` / `delete` / `snapshot` / `merge` /
//!   [`SessionState::watch`]. All operations return immediately; no I/O.
//! - [`StateChange`]: one mutation as seen by watchers.
//!
//! **Interaction**: created by the loop on entry; mutated by the loop,
//! middleware, and runtime-aware tools through their [`ToolRuntime`]
//! handle; snapshotted by the checkpointer on interrupt boundaries.
//!
//! [`ToolRuntime`]: crate::tool::ToolRuntime

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

/// One observed mutation of a [`SessionState`].
///
/// `value` is `Some` for a set and `None` for a delete.
#[derive(Clone, Debug)]
pub struct StateChange {
    pub key: String,
    pub value: Option<Value>,
    pub at: DateTime<Utc>,
}

struct Inner {
    entries: HashMap<String, Value>,
    last_modified: DateTime<Utc>,
}

/// Thread-safe keyed state for one session.
///
/// Reads take the read lock; writes take the write lock, so readers never
/// observe a partial update. [`SessionState::snapshot`] deep-copies the map
/// and can be used without further locking.
pub struct SessionState {
    session_id: String,
    created_at: DateTime<Utc>,
    inner: RwLock<Inner>,
    changes: broadcast::Sender<StateChange>,
}

/// Capacity of the watch feed; slow watchers observe `Lagged` rather than
/// blocking writers.
const WATCH_CAPACITY: usize = 256;

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        let (changes, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            session_id: session_id.into(),
            created_at: now,
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                last_modified: now,
            }),
            changes,
        }
    }

    /// Rebuilds a session from a snapshot, e.g. when resuming from a
    /// checkpoint. `last_modified` restarts at now.
    pub fn from_snapshot(session_id: impl Into<String>, snapshot: HashMap<String, Value>) -> Self {
        let state = Self::new(session_id);
        {
            let mut inner = state.inner.write().expect("state lock poisoned");
            inner.entries = snapshot;
        }
        state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.inner.read().expect("state lock poisoned").last_modified
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner
            .read()
            .expect("state lock poisoned")
            .entries
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let now = Utc::now();
        {
            let mut inner = self.inner.write().expect("state lock poisoned");
            inner.entries.insert(key.clone(), value.clone());
            inner.last_modified = now;
        }
        let _ = self.changes.send(StateChange {
            key,
            value: Some(value),
            at: now,
        });
    }

    /// Removes `key`. Returns the previous value, if any.
    pub fn delete(&self, key: &str) -> Option<Value> {
        let now = Utc::now();
        let removed = {
            let mut inner = self.inner.write().expect("state lock poisoned");
            let removed = inner.entries.remove(key);
            if removed.is_some() {
                inner.last_modified = now;
            }
            removed
        };
        if removed.is_some() {
            let _ = self.changes.send(StateChange {
                key: key.to_string(),
                value: None,
                at: now,
            });
        }
        removed
    }

    /// Deep-copied view of the whole map, usable without further locking.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.inner
            .read()
            .expect("state lock poisoned")
            .entries
            .clone()
    }

    /// Merges every entry of `other` into this state in one write, last
    /// write wins. Watchers see one change per merged key.
    pub fn merge(&self, other: HashMap<String, Value>) {
        if other.is_empty() {
            return;
        }
        let now = Utc::now();
        {
            let mut inner = self.inner.write().expect("state lock poisoned");
            for (k, v) in &other {
                inner.entries.insert(k.clone(), v.clone());
            }
            inner.last_modified = now;
        }
        for (key, value) in other {
            let _ = self.changes.send(StateChange {
                key,
                value: Some(value),
                at: now,
            });
        }
    }

    /// Subscribes to the change feed. Only mutations after the call are
    /// observed.
    pub fn watch(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("state lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently present, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("state lock poisoned")
            .entries
            .keys()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("session_id", &self.session_id)
            .field("created_at", &self.created_at)
            .field("len", &self.len())
            .finish()
    }
}
