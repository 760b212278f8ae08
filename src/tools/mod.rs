//! Tool registry
//!
//! Tools are tagged records of name, parameter schemas, and handler.
//! The registry validates calls against the declared parameters before
//! any handler runs, and derives the LLM-facing JSON schema from the
//! record rather than hand-written descriptions.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::providers::ToolDefinition;
use crate::types::ToolError;

pub mod memory;

pub use memory::register_memory_tools;

/// Declared type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParameterKind {
    fn json_type(&self) -> &'static str {
        match self {
            ParameterKind::String => "string",
            ParameterKind::Number => "number",
            ParameterKind::Boolean => "boolean",
            ParameterKind::Object => "object",
            ParameterKind::Array => "array",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            ParameterKind::String => value.is_string(),
            ParameterKind::Number => value.is_number(),
            ParameterKind::Boolean => value.is_boolean(),
            ParameterKind::Object => value.is_object(),
            ParameterKind::Array => value.is_array(),
        }
    }
}

/// One declared parameter of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub kind: ParameterKind,
    pub required: bool,
    pub description: String,
    /// Optional full JSON schema overriding the derived one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl ToolParameter {
    pub fn required(name: &str, kind: ParameterKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
            description: description.to_string(),
            schema: None,
        }
    }

    pub fn optional(name: &str, kind: ParameterKind, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

/// Caller context threaded through tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
}

/// Executable behavior of a tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, input: &Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// A registered tool.
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    pub category: Option<String>,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolSpec {
    /// JSON-schema-compatible definition for LLM function calling.
    pub fn definition(&self) -> ToolDefinition {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let schema = param.schema.clone().unwrap_or_else(|| {
                json!({
                    "type": param.kind.json_type(),
                    "description": param.description,
                })
            });
            properties.insert(param.name.clone(), schema);
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }

    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        let object = input
            .as_object()
            .ok_or_else(|| ToolError::InvalidParameters {
                tool: self.name.clone(),
                reason: "input must be a JSON object".to_string(),
            })?;

        for param in &self.parameters {
            match object.get(&param.name) {
                Some(value) => {
                    if !param.kind.matches(value) {
                        return Err(ToolError::InvalidParameters {
                            tool: self.name.clone(),
                            reason: format!(
                                "parameter '{}' must be of type {}",
                                param.name,
                                param.kind.json_type()
                            ),
                        });
                    }
                }
                None if param.required => {
                    return Err(ToolError::InvalidParameters {
                        tool: self.name.clone(),
                        reason: format!("missing required parameter '{}'", param.name),
                    });
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// Name → tool map with validated execution.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: ToolSpec) {
        if self.tools.contains_key(&spec.name) {
            tracing::warn!(tool = %spec.name, "replacing registered tool");
        }
        self.tools.insert(spec.name.clone(), spec);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<ToolSpec> {
        self.tools.get(name).map(|t| t.value().clone())
    }

    pub fn list(&self) -> Vec<ToolSpec> {
        let mut tools: Vec<ToolSpec> = self.tools.iter().map(|t| t.value().clone()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Definitions for every registered tool, name-sorted.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.list().iter().map(|t| t.definition()).collect()
    }

    /// Validate and run a tool call.
    pub async fn execute(
        &self,
        name: &str,
        input: &Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let spec = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        spec.validate(input)?;
        tracing::debug!(tool = %name, "executing tool");
        spec.handler.execute(input, ctx).await
    }
}
