//! Interrupts: parked decision points that suspend a reasoning loop.
//!
//! User-configured [`InterruptRule`]s are evaluated at decision points
//! (after parse, before tool dispatch). When a predicate fires, the loop
//! snapshots its state through the checkpointer, registers the interrupt
//! here, and parks on a per-interrupt channel until it is resolved,
//! expired, or the run is cancelled.
//!
//! # Main types
//!
//! - [`Interrupt`]: the parked decision record, TTL'd by [`InterruptPriority`].
//! - [`InterruptRule`]: `{predicate, build}` pair evaluated at [`DecisionPoint`]s.
//! - [`InterruptManager`]: the pending map plus resolve/expire plumbing and
//!   on-create / on-resolved hooks.
//!
//! **Interaction**: owned by the agent; `Agent::resume` resolves a pending
//! interrupt either in-flight (a parked loop wakes) or from its checkpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::state::SessionState;

/// What the parked loop is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    Approval,
    Input,
    Review,
    Decision,
}

/// Priority determines the wait TTL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl InterruptPriority {
    /// Time a pending interrupt of this priority may wait before expiring.
    pub fn ttl(&self) -> Duration {
        match self {
            Self::Critical => Duration::from_secs(5 * 60),
            Self::High => Duration::from_secs(15 * 60),
            Self::Medium => Duration::from_secs(60 * 60),
            Self::Low => Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptStatus {
    Pending,
    Resolved,
    Expired,
}

/// The caller's answer to a parked interrupt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    /// Continue the run. `payload` may carry requested input.
    Approve { payload: Option<Value> },
    /// Terminate the run with status cancelled.
    Reject { reason: Option<String> },
}

impl Resolution {
    pub fn approve() -> Self {
        Self::Approve { payload: None }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: Some(reason.into()),
        }
    }

    pub fn is_approve(&self) -> bool {
        matches!(self, Self::Approve { .. })
    }
}

/// A parked decision point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Interrupt {
    pub id: String,
    /// Session whose loop parked on this interrupt.
    pub session_id: String,
    pub kind: InterruptKind,
    pub priority: InterruptPriority,
    pub message: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Session state at the moment the rule fired.
    pub state_snapshot: HashMap<String, Value>,
    pub resolution: Option<Resolution>,
    pub status: InterruptStatus,
}

impl Interrupt {
    /// Fresh pending interrupt with a generated id.
    pub fn new(
        session_id: impl Into<String>,
        spec: InterruptSpec,
        state_snapshot: HashMap<String, Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            kind: spec.kind,
            priority: spec.priority,
            message: spec.message,
            payload: spec.payload,
            created_at: Utc::now(),
            state_snapshot,
            resolution: None,
            status: InterruptStatus::Pending,
        }
    }

    /// Checkpoint name used while this interrupt is parked.
    pub fn checkpoint_name(&self) -> String {
        format!("interrupt_{}", self.id)
    }
}

/// Where in the loop a rule is being evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionPhase {
    /// Right after the parser produced a step.
    AfterParse,
    /// Right before tool calls are dispatched.
    BeforeToolDispatch,
}

/// The event a rule predicate sees: phase, step index, and a JSON detail
/// (parsed thought / planned call descriptors).
#[derive(Clone, Debug)]
pub struct DecisionPoint {
    pub phase: DecisionPhase,
    pub step_index: usize,
    pub detail: Value,
}

/// What a fired rule wants to raise.
#[derive(Clone, Debug)]
pub struct InterruptSpec {
    pub kind: InterruptKind,
    pub priority: InterruptPriority,
    pub message: String,
    pub payload: Value,
}

type Predicate = dyn Fn(&SessionState, &DecisionPoint) -> bool + Send + Sync;
type Builder = dyn Fn(&SessionState, &DecisionPoint) -> InterruptSpec + Send + Sync;

/// A `{predicate, build_interrupt}` pair evaluated at decision points.
pub struct InterruptRule {
    predicate: Box<Predicate>,
    build: Box<Builder>,
}

impl InterruptRule {
    pub fn new<P, B>(predicate: P, build: B) -> Self
    where
        P: Fn(&SessionState, &DecisionPoint) -> bool + Send + Sync + 'static,
        B: Fn(&SessionState, &DecisionPoint) -> InterruptSpec + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
            build: Box::new(build),
        }
    }

    /// Returns the spec to raise when the predicate fires.
    pub fn evaluate(&self, state: &SessionState, point: &DecisionPoint) -> Option<InterruptSpec> {
        if (self.predicate)(state, point) {
            Some((self.build)(state, point))
        } else {
            None
        }
    }
}

impl std::fmt::Debug for InterruptRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptRule").finish_non_exhaustive()
    }
}

/// Outcome of parking on an interrupt.
#[derive(Clone, Debug, PartialEq)]
pub enum WaitOutcome {
    Resolved(Resolution),
    Expired,
    Cancelled,
}

type Hook = Arc<dyn Fn(&Interrupt) + Send + Sync>;

struct PendingEntry {
    interrupt: Interrupt,
    waker: Option<oneshot::Sender<Resolution>>,
}

/// Pending-interrupt registry for one agent.
///
/// All mutation is behind one mutex; waits happen on per-interrupt oneshot
/// channels so resolution never contends with the map lock.
pub struct InterruptManager {
    pending: Mutex<HashMap<String, PendingEntry>>,
    on_create: Mutex<Vec<Hook>>,
    on_resolved: Mutex<Vec<Hook>>,
}

impl InterruptManager {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            on_create: Mutex::new(Vec::new()),
            on_resolved: Mutex::new(Vec::new()),
        }
    }

    pub fn on_create<F>(&self, hook: F)
    where
        F: Fn(&Interrupt) + Send + Sync + 'static,
    {
        self.on_create.lock().expect("hook lock").push(Arc::new(hook));
    }

    pub fn on_resolved<F>(&self, hook: F)
    where
        F: Fn(&Interrupt) + Send + Sync + 'static,
    {
        self.on_resolved
            .lock()
            .expect("hook lock")
            .push(Arc::new(hook));
    }

    /// Places a pending interrupt in the registry and returns the channel
    /// the parked loop waits on. Fires the on-create hooks. The caller
    /// checkpoints *before* registering, so hooks observe a saved snapshot.
    pub fn register(&self, interrupt: Interrupt) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(
            interrupt.id.clone(),
            PendingEntry {
                interrupt: interrupt.clone(),
                waker: Some(tx),
            },
        );
        for hook in self.on_create.lock().expect("hook lock").iter() {
            hook(&interrupt);
        }
        rx
    }

    /// Builds and registers in one call.
    pub fn create(
        &self,
        session_id: &str,
        spec: InterruptSpec,
        state_snapshot: HashMap<String, Value>,
    ) -> (Interrupt, oneshot::Receiver<Resolution>) {
        let interrupt = Interrupt::new(session_id, spec, state_snapshot);
        let rx = self.register(interrupt.clone());
        (interrupt, rx)
    }

    /// Re-registers an interrupt restored from a checkpoint (no waker; it
    /// resolves through [`InterruptManager::resolve`] then continues via the
    /// checkpoint path).
    pub fn restore(&self, interrupt: Interrupt) {
        self.pending.lock().expect("pending lock").insert(
            interrupt.id.clone(),
            PendingEntry {
                interrupt,
                waker: None,
            },
        );
    }

    /// Attaches a resolution to a pending interrupt and wakes the parked
    /// loop when one is waiting. Fires the on-resolved hooks.
    pub fn resolve(&self, id: &str, resolution: Resolution) -> Result<Interrupt, AgentError> {
        let mut guard = self.pending.lock().expect("pending lock");
        let entry = guard
            .get_mut(id)
            .ok_or_else(|| AgentError::NotFound(format!("interrupt {id}")))?;
        if entry.interrupt.status != InterruptStatus::Pending {
            return Err(AgentError::Validation(format!(
                "interrupt {id} is {:?}, not pending",
                entry.interrupt.status
            )));
        }
        entry.interrupt.resolution = Some(resolution.clone());
        entry.interrupt.status = InterruptStatus::Resolved;
        let resolved = entry.interrupt.clone();
        let waker = entry.waker.take();
        drop(guard);

        if let Some(tx) = waker {
            // Receiver gone means the loop already unwound; the attached
            // resolution is still observable via `get`.
            let _ = tx.send(resolution);
        }
        for hook in self.on_resolved.lock().expect("hook lock").iter() {
            hook(&resolved);
        }
        Ok(resolved)
    }

    /// Parks until the interrupt is resolved, its priority TTL elapses, or
    /// `cancel` fires. On TTL the interrupt transitions to expired.
    pub async fn wait(
        &self,
        id: &str,
        ttl: Duration,
        cancel: &CancellationToken,
        rx: oneshot::Receiver<Resolution>,
    ) -> WaitOutcome {
        tokio::select! {
            res = rx => match res {
                Ok(resolution) => WaitOutcome::Resolved(resolution),
                // Sender dropped without a resolution: treat as expiry.
                Err(_) => {
                    self.mark_expired(id);
                    WaitOutcome::Expired
                }
            },
            _ = tokio::time::sleep(ttl) => {
                self.mark_expired(id);
                WaitOutcome::Expired
            }
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        }
    }

    fn mark_expired(&self, id: &str) {
        if let Some(entry) = self.pending.lock().expect("pending lock").get_mut(id) {
            if entry.interrupt.status == InterruptStatus::Pending {
                entry.interrupt.status = InterruptStatus::Expired;
                entry.waker = None;
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Interrupt> {
        self.pending
            .lock()
            .expect("pending lock")
            .get(id)
            .map(|e| e.interrupt.clone())
    }

    /// Drops the entry, e.g. once its checkpoint has been deleted.
    pub fn remove(&self, id: &str) -> Option<Interrupt> {
        self.pending
            .lock()
            .expect("pending lock")
            .remove(id)
            .map(|e| e.interrupt)
    }

    /// Pending (unresolved, unexpired) interrupts, oldest first.
    pub fn pending(&self) -> Vec<Interrupt> {
        let guard = self.pending.lock().expect("pending lock");
        let mut out: Vec<Interrupt> = guard
            .values()
            .filter(|e| e.interrupt.status == InterruptStatus::Pending)
            .map(|e| e.interrupt.clone())
            .collect();
        out.sort_by_key(|i| i.created_at);
        out
    }
}

impl Default for InterruptManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InterruptManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptManager")
            .field("pending", &self.pending.lock().expect("pending lock").len())
            .finish()
    }
}
