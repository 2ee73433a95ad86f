use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::params::ParamSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDescription {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub metadata: IndexMap<String, Value>,
}

impl McpToolDescription {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            metadata: IndexMap::default(),
        }
    }

    pub fn from_params(
        name: impl Into<String>,
        description: impl Into<String>,
        params: &[ParamSpec],
    ) -> Self {
        Self::new(name, description, ParamSpec::to_json_schema(params))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolResult {
    pub content: Value,
    #[serde(default)]
    pub metadata: IndexMap<String, Value>,
}

impl McpToolResult {
    pub fn new(content: Value) -> Self {
        Self {
            content,
            metadata: IndexMap::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum McpToolError {
    #[error("tool invocation failed: {0}")]
    Invocation(String),
    #[error("tool rejected input: {0}")]
    InvalidInput(String),
}

pub type McpToolResultT = Result<McpToolResult, McpToolError>;

#[async_trait]
pub trait McpTool: Send + Sync {
    fn description(&self) -> &McpToolDescription;
    async fn invoke(&self, args: Value) -> McpToolResultT;
}

/// Ordered set of tools offered to the model for one turn.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: IndexMap<String, Arc<dyn McpTool>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tool: Arc<dyn McpTool>) {
        let name = tool.description().name.clone();
        self.tools.insert(name, tool);
    }

    pub fn with(mut self, tool: Arc<dyn McpTool>) -> Self {
        self.insert(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn McpTool>> {
        self.tools.get(name).cloned()
    }

    pub fn descriptions(&self) -> Vec<McpToolDescription> {
        self.tools
            .values()
            .map(|tool| tool.description().clone())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.names())
            .finish()
    }
}
