//! Dependency-graph execution: topological batches over `execute_parallel`.
//!
//! Nodes whose dependencies are all resolved run together in one parallel
//! batch. Duplicate ids, unknown dependencies, and cycles are rejected as a
//! bad graph before anything runs.

use std::collections::{HashMap, HashSet};

use crate::error::AgentError;
use crate::executor::{CallEnv, ToolCall, ToolCallRecord, ToolExecutor};

/// A DAG of tool calls keyed by node id.
///
/// ```
/// use axon::executor::{CallGraph, ToolCall};
/// use serde_json::json;
///
/// let graph = CallGraph::new()
///     .node("fetch", ToolCall::new("http", json!({"url": "..."})), [] as [&str; 0])
///     .node("summarize", ToolCall::new("llm", json!({})), ["fetch"]);
/// ```
#[derive(Debug, Default)]
pub struct CallGraph {
    nodes: Vec<(String, ToolCall, Vec<String>)>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node<I, S>(mut self, id: impl Into<String>, call: ToolCall, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes.push((
            id.into(),
            call,
            deps.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn bad_graph(message: impl std::fmt::Display) -> AgentError {
    AgentError::Validation(format!("bad graph: {message}"))
}

pub(crate) async fn execute(
    executor: &ToolExecutor,
    env: &CallEnv,
    graph: CallGraph,
) -> Result<HashMap<String, ToolCallRecord>, AgentError> {
    let ids: HashSet<&str> = graph.nodes.iter().map(|(id, _, _)| id.as_str()).collect();
    if ids.len() != graph.nodes.len() {
        return Err(bad_graph("duplicate node id"));
    }
    for (id, _, deps) in &graph.nodes {
        for dep in deps {
            if !ids.contains(dep.as_str()) {
                return Err(bad_graph(format!("node {id:?} depends on unknown {dep:?}")));
            }
            if dep == id {
                return Err(bad_graph(format!("node {id:?} depends on itself")));
            }
        }
    }

    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (id, _, deps) in &graph.nodes {
        indegree.entry(id.as_str()).or_insert(0);
        for dep in deps {
            *indegree.entry(id.as_str()).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(id.as_str());
        }
    }

    // Kahn pass on a copy proves acyclicity before any tool runs.
    {
        let mut degrees = indegree.clone();
        let mut ready: Vec<&str> = degrees
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = ready.pop() {
            visited += 1;
            for next in dependents.get(id).into_iter().flatten() {
                let d = degrees
                    .get_mut(next)
                    .ok_or_else(|| AgentError::Internal("degree bookkeeping".into()))?;
                *d -= 1;
                if *d == 0 {
                    ready.push(*next);
                }
            }
        }
        if visited != graph.nodes.len() {
            return Err(bad_graph("cycle detected"));
        }
    }

    let calls_by_id: HashMap<&str, &ToolCall> = graph
        .nodes
        .iter()
        .map(|(id, call, _)| (id.as_str(), call))
        .collect();

    let mut results: HashMap<String, ToolCallRecord> = HashMap::with_capacity(graph.nodes.len());
    let mut degrees = indegree;
    // Insertion order keeps batches deterministic for equal readiness.
    let mut ready: Vec<&str> = graph
        .nodes
        .iter()
        .map(|(id, _, _)| id.as_str())
        .filter(|id| degrees.get(id) == Some(&0))
        .collect();

    while !ready.is_empty() {
        let batch_ids = std::mem::take(&mut ready);
        let batch_calls: Vec<ToolCall> = batch_ids
            .iter()
            .map(|id| (*calls_by_id[id]).clone())
            .collect();
        let records = executor.execute_parallel(env, batch_calls).await;

        let mut batch_failed = false;
        for (id, record) in batch_ids.iter().zip(records) {
            batch_failed |= !record.success;
            results.insert((*id).to_string(), record);
        }
        if batch_failed && executor.config().fail_fast {
            return Ok(results);
        }

        for id in batch_ids {
            for next in dependents.get(id).into_iter().flatten() {
                let d = degrees
                    .get_mut(next)
                    .ok_or_else(|| AgentError::Internal("degree bookkeeping".into()))?;
                *d -= 1;
                if *d == 0 {
                    ready.push(*next);
                }
            }
        }
    }

    Ok(results)
}
