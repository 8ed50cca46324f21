//! Tool-execution loop behavior: loop detection, the iteration cap,
//! result feedback with parameter guidance, replay rules, and both wire
//! emissions.

mod common;

use serde_json::{json, Value};

use common::{loaded_record, ScriptedArtifact, StaticToolClient};
use corral::dialect::Dialect;
use corral::message::Message;
use corral::reply::{run_chat, ChatError, MAX_TOOL_ITERATIONS};
use corral::tools::ToolSpec;
use corral::wire::{ResponseSink, Wire};

fn lookup_tool() -> ToolSpec {
    ToolSpec::new(
        "x",
        "look something up",
        json!({
            "properties": {"q": {"type": "number", "description": "the query"}},
            "required": ["q"]
        }),
    )
}

fn collect(mut rx: tokio::sync::mpsc::UnboundedReceiver<bytes::Bytes>) -> String {
    let mut out = String::new();
    while let Ok(chunk) = rx.try_recv() {
        out.push_str(std::str::from_utf8(&chunk).unwrap());
    }
    out
}

fn parse_body(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap()
}

#[tokio::test]
async fn repeated_identical_calls_trip_the_loop_detector() {
    // The model insists on the same call; the tool keeps returning nothing.
    let artifact = ScriptedArtifact::standalone(|_, _| {
        "<tool_call>{\"name\":\"x\",\"arguments\":{\"q\":1}}</tool_call>".to_string()
    });
    let record = loaded_record(
        "m",
        Dialect::Hermes,
        artifact.clone(),
        vec![lookup_tool()],
        StaticToolClient::new(&[("x", json!(""))]),
    );

    let (sink, rx) = ResponseSink::channel();
    run_chat(
        &record,
        &[Message::user("hi")],
        None,
        false,
        Wire::Native,
        &sink,
    )
    .await
    .unwrap();

    assert_eq!(artifact.prompt_count(), 3);
    let body = parse_body(&collect(rx));
    let content = body["message"]["content"].as_str().unwrap();
    assert!(content.starts_with("I wasn't able to get the right information"));
    assert!(content.contains('x'));
    assert_eq!(body["done"], true);
}

#[tokio::test]
async fn two_repeats_do_not_trip_the_detector() {
    // Same call twice, then a final answer.
    let artifact = ScriptedArtifact::standalone(|index, _| match index {
        0 | 1 => "<tool_call>{\"name\":\"x\",\"arguments\":{\"q\":1}}</tool_call>".to_string(),
        _ => "All done.".to_string(),
    });
    let record = loaded_record(
        "m",
        Dialect::Hermes,
        artifact.clone(),
        vec![lookup_tool()],
        StaticToolClient::new(&[("x", json!("fine"))]),
    );

    let (sink, rx) = ResponseSink::channel();
    run_chat(
        &record,
        &[Message::user("hi")],
        None,
        false,
        Wire::Native,
        &sink,
    )
    .await
    .unwrap();

    assert_eq!(artifact.prompt_count(), 3);
    let body = parse_body(&collect(rx));
    assert_eq!(body["message"]["content"], "All done.");
}

#[tokio::test]
async fn unique_calls_hit_the_iteration_cap() {
    let artifact = ScriptedArtifact::standalone(|index, _| {
        format!("<tool_call>{{\"name\":\"x\",\"arguments\":{{\"i\":{index}}}}}</tool_call>")
    });
    let record = loaded_record(
        "m",
        Dialect::Hermes,
        artifact.clone(),
        vec![lookup_tool()],
        StaticToolClient::new(&[("x", json!("ok"))]),
    );

    let (sink, rx) = ResponseSink::channel();
    run_chat(
        &record,
        &[Message::user("go")],
        None,
        false,
        Wire::Native,
        &sink,
    )
    .await
    .unwrap();

    assert_eq!(artifact.prompt_count(), MAX_TOOL_ITERATIONS);
    let body = parse_body(&collect(rx));
    let content = body["message"]["content"].as_str().unwrap();
    assert!(content.starts_with("I was unable to complete this request"));
    // Every attempted call is reported.
    assert_eq!(
        body["message"]["tool_calls"].as_array().unwrap().len(),
        MAX_TOOL_ITERATIONS
    );
}

#[tokio::test]
async fn tool_results_feed_the_next_prompt() {
    let artifact = ScriptedArtifact::standalone(|index, _| match index {
        0 => "<tool_call>{\"name\":\"x\",\"arguments\":{\"q\":7}}</tool_call>".to_string(),
        _ => "Found it.".to_string(),
    });
    let record = loaded_record(
        "m",
        Dialect::Hermes,
        artifact.clone(),
        vec![lookup_tool()],
        StaticToolClient::new(&[("x", json!("seven things"))]),
    );

    let (sink, rx) = ResponseSink::channel();
    run_chat(
        &record,
        &[Message::user("count")],
        None,
        false,
        Wire::Native,
        &sink,
    )
    .await
    .unwrap();

    let inputs = artifact.inputs.lock().clone();
    assert_eq!(inputs[0], "count");
    assert!(inputs[1].contains("<tool_response>"));
    assert!(inputs[1].contains("seven things"));
    // A useful result needs no parameter guidance.
    assert!(!inputs[1].contains("Parameters for"));

    let body = parse_body(&collect(rx));
    assert_eq!(body["message"]["content"], "Found it.");
    assert_eq!(
        body["message"]["tool_calls"][0]["function"]["name"],
        "x"
    );
}

#[tokio::test]
async fn empty_results_and_failures_get_parameter_guidance() {
    let artifact = ScriptedArtifact::standalone(|index, _| match index {
        0 => "<tool_call>{\"name\":\"x\",\"arguments\":{\"q\":1}}</tool_call>".to_string(),
        _ => "Giving up politely.".to_string(),
    });
    let record = loaded_record(
        "m",
        Dialect::Hermes,
        artifact.clone(),
        vec![lookup_tool()],
        StaticToolClient::new(&[("x", json!("__fail__"))]),
    );

    let (sink, _rx) = ResponseSink::channel();
    run_chat(
        &record,
        &[Message::user("hi")],
        None,
        false,
        Wire::Native,
        &sink,
    )
    .await
    .unwrap();

    let inputs = artifact.inputs.lock().clone();
    assert!(inputs[1].contains("q (number, required): the query"));
    assert!(inputs[1].contains("Do not call x again with the same arguments"));
}

#[tokio::test]
async fn only_user_history_is_replayed_and_last_must_be_user() {
    let artifact = ScriptedArtifact::standalone(|_, _| "fine".to_string());
    let record = loaded_record(
        "m",
        Dialect::Hermes,
        artifact.clone(),
        vec![],
        StaticToolClient::new(&[]),
    );

    let messages = vec![
        Message::system("Always rhyme."),
        Message::user("one"),
        Message::assistant("two"),
        Message::user("three"),
        Message::user("four"),
    ];
    let (sink, _rx) = ResponseSink::channel();
    run_chat(&record, &messages, None, false, Wire::Native, &sink)
        .await
        .unwrap();

    assert_eq!(*artifact.replays.lock(), vec!["one", "three"]);
    assert_eq!(artifact.inputs.lock().first().unwrap(), "four");

    let systems = artifact.captured_systems();
    assert!(systems[0].starts_with("Always rhyme.\n"));
    assert!(systems[0].contains("You are m."));
    assert!(systems[0].contains("Current date and time:"));

    // Non-user finale is a bad request.
    let messages = vec![Message::user("hi"), Message::assistant("hello")];
    let (sink, _rx) = ResponseSink::channel();
    let err = run_chat(&record, &messages, None, false, Wire::Native, &sink)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::BadRequest(_)));

    let (sink, _rx) = ResponseSink::channel();
    let err = run_chat(&record, &[], None, false, Wire::Native, &sink)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::BadRequest(_)));
}

#[tokio::test]
async fn native_streaming_emits_words_then_a_done_frame() {
    let artifact = ScriptedArtifact::standalone(|_, _| "three word answer".to_string());
    let record = loaded_record(
        "m",
        Dialect::Hermes,
        artifact,
        vec![],
        StaticToolClient::new(&[]),
    );

    let (sink, rx) = ResponseSink::channel();
    run_chat(
        &record,
        &[Message::user("hi")],
        None,
        true,
        Wire::Native,
        &sink,
    )
    .await
    .unwrap();

    let raw = collect(rx);
    let frames: Vec<Value> = raw.lines().map(|line| parse_body(line)).collect();
    assert_eq!(frames.len(), 4);
    let words: String = frames[..3]
        .iter()
        .map(|f| f["message"]["content"].as_str().unwrap())
        .collect();
    assert_eq!(words.trim_end(), "three word answer");
    assert!(frames[..3].iter().all(|f| f["done"] == false));
    assert_eq!(frames[3]["done"], true);
    assert_eq!(frames[3]["done_reason"], "stop");
}

#[tokio::test]
async fn openai_streaming_emits_sse_chunks_terminated_by_done() {
    let artifact = ScriptedArtifact::standalone(|_, _| "hi there".to_string());
    let record = loaded_record(
        "m",
        Dialect::Hermes,
        artifact,
        vec![],
        StaticToolClient::new(&[]),
    );

    let (sink, rx) = ResponseSink::channel();
    run_chat(
        &record,
        &[Message::user("hi")],
        None,
        true,
        Wire::OpenAi,
        &sink,
    )
    .await
    .unwrap();

    let raw = collect(rx);
    let events: Vec<&str> = raw
        .split("\n\n")
        .filter(|part| !part.is_empty())
        .collect();
    assert_eq!(events.last().unwrap(), &"data: [DONE]");

    let chunks: Vec<Value> = events[..events.len() - 1]
        .iter()
        .map(|event| parse_body(event.strip_prefix("data: ").unwrap()))
        .collect();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0]["object"], "chat.completion.chunk");
    assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "hi ");
    assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");
    assert!(chunks[2]["choices"][0]["delta"].get("content").is_none());
}

#[tokio::test]
async fn openai_completion_carries_stringified_tool_call_arguments() {
    let artifact = ScriptedArtifact::standalone(|index, _| match index {
        0 => "<tool_call>{\"name\":\"x\",\"arguments\":{\"q\":5}}</tool_call>".to_string(),
        _ => "done".to_string(),
    });
    let record = loaded_record(
        "m",
        Dialect::Hermes,
        artifact,
        vec![lookup_tool()],
        StaticToolClient::new(&[("x", json!("five"))]),
    );

    let (sink, rx) = ResponseSink::channel();
    run_chat(
        &record,
        &[Message::user("hi")],
        None,
        false,
        Wire::OpenAi,
        &sink,
    )
    .await
    .unwrap();

    let body = parse_body(&collect(rx));
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "done");
    let call = &body["choices"][0]["message"]["tool_calls"][0];
    assert_eq!(call["type"], "function");
    assert_eq!(call["function"]["arguments"], "{\"q\":5}");
    assert!(call["id"].as_str().unwrap().starts_with("call_"));
    assert_eq!(body["usage"]["total_tokens"], 0);
}

#[tokio::test]
async fn per_request_tools_override_replaces_the_model_tool_list() {
    let artifact = ScriptedArtifact::standalone(|_, _| "plain".to_string());
    let record = loaded_record(
        "m",
        Dialect::Hermes,
        artifact.clone(),
        vec![lookup_tool()],
        StaticToolClient::new(&[]),
    );

    // An explicit empty override advertises no tools at all.
    let (sink, _rx) = ResponseSink::channel();
    run_chat(
        &record,
        &[Message::user("hi")],
        Some(vec![]),
        false,
        Wire::Native,
        &sink,
    )
    .await
    .unwrap();
    let systems = artifact.captured_systems();
    assert!(!systems[0].contains("<tool_call>"));

    // Without an override the record's snapshot is advertised.
    let (sink, _rx) = ResponseSink::channel();
    run_chat(
        &record,
        &[Message::user("hi")],
        None,
        false,
        Wire::Native,
        &sink,
    )
    .await
    .unwrap();
    let systems = artifact.captured_systems();
    assert!(systems[1].contains("look something up"));
}

#[tokio::test]
async fn bracket_dialect_round_trips_through_the_loop() {
    let artifact = ScriptedArtifact::standalone(|index, _| match index {
        0 => "[x(q=2)]".to_string(),
        _ => "answer".to_string(),
    });
    let record = loaded_record(
        "m",
        Dialect::Llama,
        artifact.clone(),
        vec![lookup_tool()],
        StaticToolClient::new(&[("x", json!("two"))]),
    );

    let (sink, rx) = ResponseSink::channel();
    run_chat(
        &record,
        &[Message::user("hi")],
        None,
        false,
        Wire::Native,
        &sink,
    )
    .await
    .unwrap();

    let inputs = artifact.inputs.lock().clone();
    assert_eq!(inputs[1], "Function x returned: two");
    let body = parse_body(&collect(rx));
    assert_eq!(body["message"]["content"], "answer");
}
