//! ReAct output parser: free-form LLM text into structured steps.
//!
//! The dialect is line-keyed: lines beginning (after optional whitespace)
//! with `Thought:`, `Action:`, `Action Input:`, `Observation:`, or
//! `Final Answer:` delimit fields; a field's content runs until the next
//! keyword. `Action Input:` is parsed as fenced-JSON first, then raw
//! braces, then kept as a bare string. `Final Answer:` wins when both it
//! and an `Action` appear; an `Action` without input defaults to `{}`.
//!
//! # Main types
//!
//! - [`parse`]: text → [`ParsedStep`] or a `Parse` error when no structure
//!   is found.
//! - [`format_step`] / [`format_final`] / [`format_observation`]: the
//!   inverse dialect, used for scratchpad assembly; `parse(format_step(…))`
//!   round-trips.
//!
//! Multiple `Action` blocks in one completion are collected in order; the
//! loop dispatches them as one parallel batch.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::error::AgentError;

/// One action the LLM proposed.
#[derive(Clone, Debug, PartialEq)]
pub struct ProposedAction {
    pub tool: String,
    pub input: Value,
}

/// Parsed form of one LLM completion.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedStep {
    /// Thought plus one or more tool actions, in text order.
    Action {
        thought: String,
        actions: Vec<ProposedAction>,
    },
    /// Terminal step.
    Final { thought: String, answer: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Field {
    Thought,
    Action,
    ActionInput,
    Observation,
    FinalAnswer,
}

/// Keyword match at the start of a line. `Action Input:` is probed before
/// `Action:` since the latter is a prefix of the former.
fn keyword(line: &str) -> Option<(Field, &str)> {
    const KEYWORDS: [(&str, Field); 5] = [
        ("Thought:", Field::Thought),
        ("Action Input:", Field::ActionInput),
        ("Action:", Field::Action),
        ("Observation:", Field::Observation),
        ("Final Answer:", Field::FinalAnswer),
    ];
    let trimmed = line.trim_start();
    for (kw, field) in KEYWORDS {
        if let Some(rest) = trimmed.strip_prefix(kw) {
            return Some((field, rest));
        }
    }
    None
}

static FENCED_JSON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"```(?:json)?\s*([\s\S]*?)```").unwrap_or_else(|e| panic!("fence regex: {e}"))
});

/// `Action Input:` content → structured value.
///
/// Fenced JSON, then raw braces, then the trimmed text as a string. Empty
/// content is the empty object.
fn parse_action_input(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return json!({});
    }
    if let Some(fence) = FENCED_JSON.captures(trimmed) {
        if let Some(inner) = fence.get(1) {
            if let Ok(value) = serde_json::from_str::<Value>(inner.as_str().trim()) {
                return value;
            }
        }
    }
    if let (Some(open), Some(close)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if open < close {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[open..=close]) {
                return value;
            }
        }
    }
    Value::String(trimmed.to_string())
}

/// Parses one LLM completion into a structured step.
///
/// Returns a `Parse` error when the text contains neither an `Action` nor a
/// `Final Answer`, or when the structure is inconsistent (an input without
/// an action, an action without a tool name).
pub fn parse(text: &str) -> Result<ParsedStep, AgentError> {
    let mut segments: Vec<(Field, String)> = Vec::new();
    for line in text.lines() {
        match keyword(line) {
            Some((field, rest)) => segments.push((field, rest.trim().to_string())),
            None => {
                if let Some((_, buffer)) = segments.last_mut() {
                    if !buffer.is_empty() {
                        buffer.push('\n');
                    }
                    buffer.push_str(line.trim_end());
                }
                // Text before the first keyword is preamble; dropped.
            }
        }
    }

    let thought = segments
        .iter()
        .filter(|(f, _)| *f == Field::Thought)
        .map(|(_, t)| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    // Final Answer wins over any Action in the same completion.
    if let Some((_, answer)) = segments.iter().find(|(f, _)| *f == Field::FinalAnswer) {
        return Ok(ParsedStep::Final {
            thought,
            answer: answer.trim().to_string(),
        });
    }

    let mut actions: Vec<ProposedAction> = Vec::new();
    for (field, content) in &segments {
        match field {
            Field::Action => {
                let tool = content
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                if tool.is_empty() {
                    return Err(AgentError::Parse("Action without a tool name".into()));
                }
                actions.push(ProposedAction {
                    tool,
                    input: json!({}),
                });
            }
            Field::ActionInput => match actions.last_mut() {
                Some(action) => action.input = parse_action_input(content),
                None => {
                    return Err(AgentError::Parse(
                        "Action Input without a preceding Action".into(),
                    ))
                }
            },
            Field::Thought | Field::Observation | Field::FinalAnswer => {}
        }
    }

    if actions.is_empty() {
        return Err(AgentError::Parse(
            "no Action or Final Answer in LLM output".into(),
        ));
    }
    Ok(ParsedStep::Action { thought, actions })
}

/// Formats one action step in the dialect; inverse of [`parse`].
pub fn format_step(thought: &str, action: &str, input: &Value) -> String {
    format!("Thought: {thought}\nAction: {action}\nAction Input: {input}")
}

/// Formats a terminal step in the dialect.
pub fn format_final(thought: &str, answer: &str) -> String {
    format!("Thought: {thought}\nFinal Answer: {answer}")
}

/// Scratchpad entry for one executed action.
pub fn format_observation(thought: &str, action: &str, input: &Value, observation: &str) -> String {
    format!(
        "Thought: {thought}\nAction: {action}\nAction Input: {input}\nObservation: {observation}"
    )
}
