//! Wire formats for the two HTTP dialects, plus the response sink the
//! scheduler and tool-execution loop write into.
//!
//! Native responses are NDJSON frames; OpenAI-style responses are SSE
//! `data:` lines terminated by `data: [DONE]`.

use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::dialect::ToolCall;

/// Which HTTP dialect a request speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wire {
    Native,
    OpenAi,
}

#[derive(Debug, Error)]
#[error("client disconnected")]
pub struct SinkClosed;

/// Write side of a response body. Clones share the same underlying channel;
/// the sink reports closed once the HTTP layer has dropped the read side.
#[derive(Clone)]
pub struct ResponseSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ResponseSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ResponseSink { tx }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn send_bytes(&self, bytes: Bytes) -> Result<(), SinkClosed> {
        self.tx.send(bytes).map_err(|_| SinkClosed)
    }

    /// One NDJSON frame.
    pub fn send_frame(&self, frame: &Value) -> Result<(), SinkClosed> {
        self.send_bytes(Bytes::from(format!("{frame}\n")))
    }

    /// One SSE data line.
    pub fn send_event(&self, payload: &Value) -> Result<(), SinkClosed> {
        self.send_bytes(Bytes::from(format!("data: {payload}\n\n")))
    }

    pub fn send_done_event(&self) -> Result<(), SinkClosed> {
        self.send_bytes(Bytes::from_static(b"data: [DONE]\n\n"))
    }
}

fn zero_timings(frame: &mut Value) {
    if let Some(obj) = frame.as_object_mut() {
        for field in [
            "total_duration",
            "load_duration",
            "prompt_eval_count",
            "prompt_eval_duration",
            "eval_count",
            "eval_duration",
        ] {
            obj.insert(field.to_string(), json!(0));
        }
    }
}

/// Streaming content frame (`done: false`).
pub fn native_frame(model: &str, content: &str) -> Value {
    json!({
        "model": model,
        "created_at": Utc::now().to_rfc3339(),
        "message": {"role": "assistant", "content": content},
        "done": false,
    })
}

/// Keep-alive frame written while a streaming request waits in the queue.
pub fn native_heartbeat(model: &str) -> Value {
    native_frame(model, "")
}

/// Terminal streaming frame.
pub fn native_final_frame(model: &str) -> Value {
    let mut frame = json!({
        "model": model,
        "created_at": Utc::now().to_rfc3339(),
        "message": {"role": "assistant", "content": ""},
        "done": true,
        "done_reason": "stop",
    });
    zero_timings(&mut frame);
    frame
}

/// Complete non-streaming native response.
pub fn native_completion(model: &str, content: &str, tool_calls: Option<&[ToolCall]>) -> Value {
    let mut message = json!({"role": "assistant", "content": content});
    if let Some(calls) = tool_calls {
        message["tool_calls"] = Value::Array(calls.iter().map(native_tool_call).collect());
    }
    let mut frame = json!({
        "model": model,
        "created_at": Utc::now().to_rfc3339(),
        "message": message,
        "done": true,
        "done_reason": "stop",
    });
    zero_timings(&mut frame);
    frame
}

/// Ollama-shaped tool call entry: arguments stay a JSON object.
pub fn native_tool_call(call: &ToolCall) -> Value {
    json!({
        "function": {
            "name": call.name,
            "arguments": call.arguments,
        }
    })
}

pub fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

/// OpenAI streaming chunk. `content` is absent on the finish chunk.
pub fn openai_chunk(
    id: &str,
    model: &str,
    content: Option<&str>,
    finish_reason: Option<&str>,
) -> Value {
    let mut delta = json!({});
    if let Some(text) = content {
        delta["content"] = json!(text);
    }
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}

/// Complete non-streaming OpenAI response.
pub fn openai_completion(
    id: &str,
    model: &str,
    content: &str,
    tool_calls: Option<&[ToolCall]>,
) -> Value {
    let mut message = json!({"role": "assistant", "content": content});
    if let Some(calls) = tool_calls {
        message["tool_calls"] = Value::Array(calls.iter().map(openai_tool_call).collect());
    }
    json!({
        "id": id,
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
    })
}

/// OpenAI-shaped tool call entry: synthetic id, stringified arguments.
pub fn openai_tool_call(call: &ToolCall) -> Value {
    json!({
        "id": format!("call_{}", Uuid::new_v4().simple()),
        "type": "function",
        "function": {
            "name": call.name,
            "arguments": Value::Object(call.arguments.clone()).to_string(),
        }
    })
}
