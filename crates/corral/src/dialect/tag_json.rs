//! Tag-delimited JSON dialect: calls wrapped in `<tool_call>` tags, results
//! returned in `<tool_response>` tags. Used by Hermes- and Qwen-family
//! models; the two differ only in the instruction text advertised to the
//! model.

use indoc::formatdoc;
use serde_json::{json, Value};

use super::{stringify_result, ToolCall, ToolDialect};
use crate::tools::ToolSpec;

const CALL_OPEN: &str = "<tool_call>";
const CALL_CLOSE: &str = "</tool_call>";
const RESPONSE_OPEN: &str = "<tool_response>";
const RESPONSE_CLOSE: &str = "</tool_response>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagStyle {
    Hermes,
    Qwen,
}

pub struct TagJsonDialect {
    style: TagStyle,
}

impl TagJsonDialect {
    pub fn new(style: TagStyle) -> Self {
        TagJsonDialect { style }
    }

    fn describe_tools(tools: &[ToolSpec]) -> String {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                })
                .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Convert one parsed JSON object into a call, or `None` if malformed.
    fn call_from_value(value: &Value) -> Option<ToolCall> {
        let obj = value.as_object()?;
        let name = obj.get("name")?.as_str()?;
        if name.is_empty() {
            return None;
        }
        let arguments = match obj.get("arguments") {
            None | Some(Value::Null) => serde_json::Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return None,
        };
        Some(ToolCall::new(name, arguments))
    }
}

impl ToolDialect for TagJsonDialect {
    fn format_tools_for_prompt(&self, tools: &[ToolSpec]) -> String {
        if tools.is_empty() {
            return String::new();
        }
        let tool_lines = Self::describe_tools(tools);
        match self.style {
            TagStyle::Hermes => formatdoc! {r#"

                You have access to the following tools. Each line is a JSON
                description of one tool:

                {tool_lines}

                To call a tool, respond with a JSON object wrapped in {CALL_OPEN} tags:
                {CALL_OPEN}
                {{"name": "tool_name", "arguments": {{"param": "value"}}}}
                {CALL_CLOSE}

                You may emit several {CALL_OPEN} blocks to call several tools.
                Tool output will be returned to you inside {RESPONSE_OPEN} tags.
                Once you have the information you need, answer the user directly
                without any tool markup."#
            },
            TagStyle::Qwen => formatdoc! {r#"

                # Tools

                You may call one or more functions to assist with the user query.

                You are provided with function signatures within <tools></tools> XML tags:
                <tools>
                {tool_lines}
                </tools>

                For each function call, return a json object with function name and
                arguments within {CALL_OPEN}{CALL_CLOSE} XML tags:
                {CALL_OPEN}
                {{"name": <function-name>, "arguments": <args-json-object>}}
                {CALL_CLOSE}

                Results arrive inside {RESPONSE_OPEN}{RESPONSE_CLOSE} tags. When no
                further calls are needed, reply to the user in plain text."#
            },
        }
    }

    fn has_tool_calls(&self, text: &str) -> bool {
        text.contains(CALL_OPEN)
    }

    fn parse_tool_calls(&self, text: &str) -> Vec<ToolCall> {
        let mut calls = Vec::new();
        let mut rest = text;
        while let Some(open) = rest.find(CALL_OPEN) {
            let after_open = &rest[open + CALL_OPEN.len()..];
            let Some(close) = after_open.find(CALL_CLOSE) else {
                break;
            };
            let inner = after_open[..close].trim();
            match serde_json::from_str::<Value>(inner) {
                Ok(Value::Array(items)) => {
                    calls.extend(items.iter().filter_map(Self::call_from_value));
                }
                Ok(value) => calls.extend(Self::call_from_value(&value)),
                Err(_) => {}
            }
            rest = &after_open[close + CALL_CLOSE.len()..];
        }
        calls
    }

    fn format_tool_result(&self, name: &str, result: &Value) -> String {
        let payload = json!({
            "name": name,
            "result": stringify_result(result),
        });
        format!("{RESPONSE_OPEN}\n{payload}\n{RESPONSE_CLOSE}")
    }

    fn get_text_content(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find(CALL_OPEN) {
            out.push_str(&rest[..open]);
            let after_open = &rest[open + CALL_OPEN.len()..];
            match after_open.find(CALL_CLOSE) {
                Some(close) => rest = &after_open[close + CALL_CLOSE.len()..],
                None => {
                    // Unterminated block: drop everything after the tag.
                    rest = "";
                    break;
                }
            }
        }
        out.push_str(rest);
        out.trim().to_string()
    }
}
