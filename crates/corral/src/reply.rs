//! The tool-execution loop: drives model ↔ tool round-trips for one chat
//! request until the model produces a final answer, a repeated call list
//! trips the loop detector, or the iteration cap stops it.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dialect::ToolCall;
use crate::message::{Message, Role};
use crate::models::LoadedModel;
use crate::tools::ToolSpec;
use crate::wire::{self, ResponseSink, SinkClosed, Wire};

/// Most model ↔ tool rounds for a single request.
pub const MAX_TOOL_ITERATIONS: usize = 10;

/// A call list seen this many times aborts the loop.
const LOOP_SIGNATURE_LIMIT: usize = 3;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    BadRequest(String),

    #[error("client disconnected")]
    Disconnected,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<SinkClosed> for ChatError {
    fn from(_: SinkClosed) -> Self {
        ChatError::Disconnected
    }
}

/// Run one chat request against a resident model and write the response
/// (streamed or complete) into `sink`.
pub async fn run_chat(
    record: &Arc<LoadedModel>,
    messages: &[Message],
    tools_override: Option<Vec<ToolSpec>>,
    streaming: bool,
    wire: Wire,
    sink: &ResponseSink,
) -> Result<(), ChatError> {
    let codec = record.dialect.clone();
    let tools = tools_override.unwrap_or_else(|| record.tool_specs.clone());

    let mut system = format!(
        "{}\n\nCurrent date and time: {}{}",
        record.entry.system_prompt,
        Utc::now().to_rfc3339(),
        codec.format_tools_for_prompt(&tools),
    );
    let client_system: Vec<&str> = messages
        .iter()
        .filter(|message| message.role == Role::System)
        .map(|message| message.content.as_str())
        .collect();
    if !client_system.is_empty() {
        system = format!("{}\n{}", client_system.join("\n"), system);
    }

    // Fresh inference context per request; dropped on every exit path.
    let mut session = record
        .artifact
        .clone()
        .start_chat(&system, record.entry.context_size)
        .await
        .map_err(ChatError::Internal)?;

    let (history, last) = match messages.split_last() {
        Some((last, history)) => (history, last),
        None => return Err(ChatError::BadRequest("messages must not be empty".into())),
    };
    for message in history {
        if message.role == Role::User {
            session.add_user_turn(&message.content);
        }
    }
    if last.role != Role::User {
        return Err(ChatError::BadRequest(
            "last message must have role \"user\"".into(),
        ));
    }

    let mut current_input = last.content.clone();
    let mut attempted: Vec<ToolCall> = Vec::new();
    let mut signatures: Vec<String> = Vec::new();
    let mut final_text: Option<String> = None;
    let mut rounds = 0;

    for _ in 0..MAX_TOOL_ITERATIONS {
        let response = session.prompt(&current_input).await?;
        rounds += 1;

        if !codec.has_tool_calls(&response) {
            final_text = Some(codec.get_text_content(&response));
            break;
        }
        let calls = codec.parse_tool_calls(&response);
        if calls.is_empty() {
            // Markup probe fired but nothing parsed; take the text as final.
            final_text = Some(codec.get_text_content(&response));
            break;
        }
        debug!(model = %record.name, calls = calls.len(), round = rounds, "executing tool calls");

        let signature = call_signature(&calls);
        signatures.push(signature.clone());
        let repeats = signatures.iter().filter(|s| **s == signature).count();
        if repeats >= LOOP_SIGNATURE_LIMIT {
            let names = unique_names(&calls);
            warn!(model = %record.name, tools = %names, "tool-call loop detected");
            final_text = Some(format!(
                "I wasn't able to get the right information — I kept trying to call {names} with the same arguments without success."
            ));
            break;
        }

        let mut parts = Vec::with_capacity(calls.len());
        {
            let providers = record.tools.lock().await;
            for call in &calls {
                attempted.push(call.clone());
                let (result, success) =
                    match providers.call_tool(&call.name, &call.arguments).await {
                        Ok(value) => (value, true),
                        Err(e) => {
                            warn!(tool = %call.name, error = %e, "tool call failed");
                            (Value::String(e.to_string()), false)
                        }
                    };

                let mut part = codec.format_tool_result(&call.name, &result);
                if !success || is_empty_result(&result) {
                    if let Some(spec) = tools.iter().find(|spec| spec.name == call.name) {
                        if spec.has_parameters() {
                            part.push_str("\n\n");
                            part.push_str(&parameter_guidance(spec));
                        }
                    }
                }
                parts.push(part);
            }
        }
        current_input = parts.join("\n\n");
    }

    let content = final_text.unwrap_or_else(|| {
        warn!(model = %record.name, rounds, "tool iteration cap reached");
        "I was unable to complete this request — too many tool calls were needed.".to_string()
    });
    info!(model = %record.name, rounds, tool_calls = attempted.len(), streaming, "chat complete");

    emit(record, &content, &attempted, streaming, wire, sink)
}

fn emit(
    record: &Arc<LoadedModel>,
    content: &str,
    attempted: &[ToolCall],
    streaming: bool,
    wire_format: Wire,
    sink: &ResponseSink,
) -> Result<(), ChatError> {
    let model = record.name.as_str();
    let calls = (!attempted.is_empty()).then_some(attempted);
    match (streaming, wire_format) {
        (true, Wire::Native) => {
            for word in content.split_whitespace() {
                sink.send_frame(&wire::native_frame(model, &format!("{word} ")))?;
            }
            sink.send_frame(&wire::native_final_frame(model))?;
        }
        (true, Wire::OpenAi) => {
            let id = wire::completion_id();
            for word in content.split_whitespace() {
                sink.send_event(&wire::openai_chunk(
                    &id,
                    model,
                    Some(&format!("{word} ")),
                    None,
                ))?;
            }
            sink.send_event(&wire::openai_chunk(&id, model, None, Some("stop")))?;
            sink.send_done_event()?;
        }
        (false, Wire::Native) => {
            let body = wire::native_completion(model, content, calls);
            sink.send_bytes(body.to_string().into())?;
        }
        (false, Wire::OpenAi) => {
            let body = wire::openai_completion(&wire::completion_id(), model, content, calls);
            sink.send_bytes(body.to_string().into())?;
        }
    }
    Ok(())
}

/// Deterministic serialization of a call list, for loop detection.
fn call_signature(calls: &[ToolCall]) -> String {
    serde_json::to_string(calls).unwrap_or_default()
}

fn unique_names(calls: &[ToolCall]) -> String {
    let mut names: Vec<&str> = Vec::new();
    for call in calls {
        if !names.contains(&call.name.as_str()) {
            names.push(&call.name);
        }
    }
    names.join(", ")
}

/// A result the model cannot act on: nothing, or an empty container.
fn is_empty_result(result: &Value) -> bool {
    match result {
        Value::Null => true,
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed.is_empty() || matches!(trimmed, "[]" | "{}" | "null")
        }
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Parameter listing appended to unhelpful tool results so the model can
/// correct its arguments instead of repeating them.
fn parameter_guidance(spec: &ToolSpec) -> String {
    let mut block = format!("Parameters for {}:\n", spec.name);
    for line in spec.parameter_lines() {
        block.push_str("- ");
        block.push_str(&line);
        block.push('\n');
    }
    block.push_str(&format!(
        "Do not call {} again with the same arguments; adjust them or answer with what you have.",
        spec.name
    ));
    block
}
