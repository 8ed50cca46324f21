//! Tool-call dialect codecs.
//!
//! Each locally-served model speaks one of a closed set of conventions for
//! requesting tool invocations in plain text. A codec knows how to advertise
//! tools in the system prompt, spot and parse call markup in model output,
//! wrap tool results for the next turn, and strip markup from the text shown
//! to clients.

mod bracket;
mod tag_json;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::message::{Message, Role};
use crate::tools::ToolSpec;

pub use bracket::BracketDialect;
pub use tag_json::{TagJsonDialect, TagStyle};

#[derive(Debug, Error)]
pub enum DialectError {
    #[error("unknown dialect: {0}")]
    Unknown(String),
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Map<String, Value>) -> Self {
        ToolCall {
            name: name.into(),
            arguments,
        }
    }
}

/// The closed set of supported tool-call conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Tag-delimited JSON calls (`<tool_call>{...}</tool_call>`).
    Hermes,
    /// Square-bracket function calls (`[lookup(q='rust')]`).
    Llama,
    /// Same wire format as `Hermes` with Qwen-flavored prompt instructions.
    Qwen,
}

impl Dialect {
    pub fn from_tag(tag: &str) -> Result<Self, DialectError> {
        match tag {
            "hermes" => Ok(Dialect::Hermes),
            "llama" => Ok(Dialect::Llama),
            "qwen" => Ok(Dialect::Qwen),
            other => Err(DialectError::Unknown(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Hermes => "hermes",
            Dialect::Llama => "llama",
            Dialect::Qwen => "qwen",
        }
    }

    /// Codec factory.
    pub fn codec(self) -> Arc<dyn ToolDialect> {
        match self {
            Dialect::Hermes => Arc::new(TagJsonDialect::new(TagStyle::Hermes)),
            Dialect::Qwen => Arc::new(TagJsonDialect::new(TagStyle::Qwen)),
            Dialect::Llama => Arc::new(BracketDialect),
        }
    }
}

pub trait ToolDialect: Send + Sync {
    /// Text block appended to the system prompt to advertise `tools`.
    /// Empty input produces an empty block.
    fn format_tools_for_prompt(&self, tools: &[ToolSpec]) -> String;

    /// Cheap syntactic probe for call markup.
    fn has_tool_calls(&self, text: &str) -> bool;

    /// Parse every call in `text`, in order. Malformed entries are skipped;
    /// a call with no arguments gets an empty mapping.
    fn parse_tool_calls(&self, text: &str) -> Vec<ToolCall>;

    /// Wrap a tool's return value so the next prompt carries it back.
    fn format_tool_result(&self, name: &str, result: &Value) -> String;

    /// `text` with all call markup excised, trimmed.
    fn get_text_content(&self, text: &str) -> String;

    fn build_message(&self, role: Role, content: &str) -> Message {
        Message::new(role, content)
    }
}

/// Render a result value the way all dialects embed it: strings verbatim,
/// everything else as compact JSON.
pub(crate) fn stringify_result(result: &Value) -> String {
    match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
