//! Input, output, and step-log types for one agent invocation.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::cache::fingerprint;
use crate::error::ErrorKind;
use crate::executor::ToolCallRecord;

/// Input to `Agent::invoke` / `Agent::stream`.
///
/// `context` is ordered so the cache fingerprint is construction-order
/// independent.
#[derive(Clone, Debug, Default)]
pub struct AgentInput {
    pub task: String,
    pub instruction: Option<String>,
    pub context: BTreeMap<String, Value>,
}

impl AgentInput {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Cache key over (task, instruction, ordered context).
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.task, self.instruction.as_deref(), &self.context)
    }

    /// Context rendered as `key: value` lines for the user message.
    pub fn context_lines(&self) -> Vec<String> {
        self.context
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}: {s}"),
                other => format!("{k}: {other}"),
            })
            .collect()
    }
}

/// Terminal condition of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// The step bound was reached before a Final Answer.
    Partial,
    Failed,
    Cancelled,
    /// An interrupt outlived its priority TTL.
    Expired,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

/// What one reasoning step recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    Thought,
    Action,
    Final,
    Error,
}

/// One entry of the append-only step log, ordered by `step_index`.
#[derive(Clone, Debug)]
pub struct ReasoningStep {
    pub step_index: usize,
    pub kind: StepKind,
    pub description: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_result: Option<String>,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
}

impl ReasoningStep {
    pub(crate) fn thought(step_index: usize, description: impl Into<String>) -> Self {
        Self {
            step_index,
            kind: StepKind::Thought,
            description: description.into(),
            tool_name: None,
            tool_input: None,
            tool_result: None,
            duration: Duration::ZERO,
            success: true,
            error: None,
        }
    }

    pub(crate) fn action(step_index: usize, record: &ToolCallRecord) -> Self {
        Self {
            step_index,
            kind: StepKind::Action,
            description: format!("call {}", record.name),
            tool_name: Some(record.name.clone()),
            tool_input: Some(record.input.clone()),
            tool_result: Some(record.observation_text()),
            duration: record.duration,
            success: record.success,
            error: record.error.as_ref().map(|e| e.to_string()),
        }
    }

    pub(crate) fn final_answer(step_index: usize, answer: impl Into<String>) -> Self {
        Self {
            step_index,
            kind: StepKind::Final,
            description: answer.into(),
            tool_name: None,
            tool_input: None,
            tool_result: None,
            duration: Duration::ZERO,
            success: true,
            error: None,
        }
    }

    pub(crate) fn failure(step_index: usize, error: impl std::fmt::Display) -> Self {
        Self {
            step_index,
            kind: StepKind::Error,
            description: error.to_string(),
            tool_name: None,
            tool_input: None,
            tool_result: None,
            duration: Duration::ZERO,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Terminal output of one invocation.
#[derive(Clone, Debug)]
pub struct AgentOutput {
    pub status: RunStatus,
    pub result: Value,
    /// Human-readable description of the terminal condition.
    pub message: String,
    pub reasoning_steps: Vec<ReasoningStep>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub timestamp: DateTime<Utc>,
    pub latency: Duration,
    pub metadata: HashMap<String, Value>,
}

impl AgentOutput {
    /// Exit code for CLI collaborators: 0 success, 2 validation-class
    /// failure, 3 transient/unavailable, 4 cancelled, 5 partial,
    /// 6 expired.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Success => 0,
            RunStatus::Partial => 5,
            RunStatus::Cancelled => 4,
            RunStatus::Expired => 6,
            RunStatus::Failed => self
                .metadata
                .get("error_kind")
                .and_then(Value::as_str)
                .map_or(2, |kind| match kind {
                    "transient" | "rate_limited" | "timeout" => 3,
                    _ => 2,
                }),
        }
    }

    /// Highest step index present, if any step was recorded.
    pub fn last_step_index(&self) -> Option<usize> {
        self.reasoning_steps.iter().map(|s| s.step_index).max()
    }
}

pub(crate) fn error_kind_metadata(kind: ErrorKind) -> Value {
    Value::String(kind.to_string())
}
