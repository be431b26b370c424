//! Tool registry: name → tool lookup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::AgentError;
use crate::tool::Tool;

/// Holds the tools one agent can dispatch.
///
/// Registration validates the tool's schema up front so dispatch-time
/// validation can assume a well-formed schema.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool. Re-registering a name replaces the previous tool.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        tool.schema()
            .validate()
            .map_err(|e| AgentError::Validation(format!("tool {:?}: {e}", tool.name())))?;
        self.tools.insert(tool.name().to_string(), tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// `name: description` lines for prompt assembly, sorted by name.
    pub fn descriptors(&self) -> Vec<String> {
        self.names()
            .into_iter()
            .map(|name| {
                let description = self
                    .tools
                    .get(&name)
                    .map(|t| t.description().to_string())
                    .unwrap_or_default();
                if description.is_empty() {
                    name
                } else {
                    format!("{name}: {description}")
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{FnTool, PropertySchema, ToolSchema};

    fn tool(name: &str, description: &str) -> Arc<dyn Tool> {
        Arc::new(
            FnTool::new(name, ToolSchema::object(), |input| async move { Ok(input) })
                .with_description(description),
        )
    }

    #[test]
    fn register_lookup_and_sorted_names() {
        let mut registry = ToolRegistry::new();
        registry.register(tool("zeta", "last")).unwrap();
        registry.register(tool("alpha", "first")).unwrap();

        assert!(registry.contains("alpha"));
        assert!(registry.get("zeta").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["alpha".to_string(), "zeta".to_string()]);
        assert_eq!(
            registry.descriptors(),
            vec!["alpha: first".to_string(), "zeta: last".to_string()]
        );
    }

    #[test]
    fn registering_an_invalid_schema_fails() {
        let mut registry = ToolRegistry::new();
        let bad = FnTool::new(
            "bad",
            ToolSchema::object().property("n", PropertySchema::number().range(9.0, 1.0)),
            |input| async move { Ok(input) },
        );
        let err = registry.register(Arc::new(bad)).unwrap_err();
        assert!(err.to_string().contains("bad"));
        assert!(registry.is_empty());
    }

    #[test]
    fn reregistering_replaces() {
        let mut registry = ToolRegistry::new();
        registry.register(tool("t", "one")).unwrap();
        registry.register(tool("t", "two")).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.descriptors(), vec!["t: two".to_string()]);
    }
}
