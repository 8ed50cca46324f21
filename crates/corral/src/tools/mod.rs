//! Tool providers: external processes or HTTP services speaking MCP, each
//! exposing a set of callable tools to the model that owns the connection.

mod client;
mod manager;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use client::{McpProviderClient, ProviderClient};
pub use manager::ToolProviderManager;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("provider disconnected: {0}")]
    ProviderDisconnected(String),

    #[error("tool call failed: {0}")]
    CallFailed(String),
}

/// A callable tool as advertised to models: plain name, human description,
/// and a JSON-schema-shaped parameter description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        ToolSpec {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// Accept either the native shape (`{name, description, inputSchema}`)
    /// or the OpenAI function shape
    /// (`{type: "function", function: {name, description, parameters}}`).
    pub fn from_request_value(value: &Value) -> Option<ToolSpec> {
        let source = match value.get("function") {
            Some(function) if value.get("type").and_then(Value::as_str) == Some("function") => {
                function
            }
            _ => value,
        };
        let name = source.get("name")?.as_str()?;
        if name.is_empty() {
            return None;
        }
        let description = source
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let schema = source
            .get("parameters")
            .or_else(|| source.get("inputSchema"))
            .or_else(|| source.get("input_schema"))
            .cloned()
            .unwrap_or(Value::Null);
        Some(ToolSpec::new(name, description, schema))
    }

    /// Whether the schema describes any parameters at all.
    pub fn has_parameters(&self) -> bool {
        self.input_schema
            .get("properties")
            .and_then(Value::as_object)
            .is_some_and(|props| !props.is_empty())
    }

    /// One line per parameter: `name (type, required): description`.
    pub fn parameter_lines(&self) -> Vec<String> {
        let Some(props) = self.input_schema.get("properties").and_then(Value::as_object) else {
            return Vec::new();
        };
        let required: Vec<&str> = self
            .input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        props
            .iter()
            .map(|(name, schema)| {
                let kind = schema
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("any");
                let requirement = if required.contains(&name.as_str()) {
                    "required"
                } else {
                    "optional"
                };
                let description = schema
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if description.is_empty() {
                    format!("{name} ({kind}, {requirement})")
                } else {
                    format!("{name} ({kind}, {requirement}): {description}")
                }
            })
            .collect()
    }
}
