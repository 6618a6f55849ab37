//! Canned Messages API payloads.

use bytes::Bytes;
use serde_json::{Value, json};

/// A `POST /v1/messages` body with alternating user/assistant turns.
pub fn messages_request(model: &str, turns: &[&str], stream: bool) -> Value {
    let messages: Vec<Value> = turns
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            json!({"role": role, "content": text})
        })
        .collect();
    json!({
        "model": model,
        "max_tokens": 1024,
        "stream": stream,
        "messages": messages,
    })
}

/// A non-streaming Messages API response.
pub fn json_response(id: &str, model: &str, input: u64, output: u64, tools: &[&str]) -> Value {
    let mut content = vec![json!({"type": "text", "text": "ok"})];
    for (i, tool) in tools.iter().enumerate() {
        content.push(json!({
            "type": "tool_use",
            "id": format!("toolu_{}", i),
            "name": tool,
            "input": {},
        }));
    }
    json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": if tools.is_empty() { "end_turn" } else { "tool_use" },
        "usage": {
            "input_tokens": input,
            "output_tokens": output,
            "cache_creation_input_tokens": 0,
            "cache_read_input_tokens": 0,
        },
    })
}

fn event(name: &str, data: Value) -> Bytes {
    Bytes::from(format!("event: {}\ndata: {}\n\n", name, data))
}

/// A streamed Messages API response, one SSE event per chunk.
pub fn sse_events(id: &str, model: &str, input: u64, output: u64, tools: &[&str]) -> Vec<Bytes> {
    let mut events = vec![event(
        "message_start",
        json!({
            "type": "message_start",
            "message": {
                "id": id,
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [],
                "usage": {"input_tokens": input, "output_tokens": 1},
            },
        }),
    )];

    events.push(event(
        "content_block_start",
        json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {"type": "text", "text": ""},
        }),
    ));
    events.push(event(
        "content_block_delta",
        json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": "Hi"},
        }),
    ));
    events.push(event(
        "content_block_stop",
        json!({"type": "content_block_stop", "index": 0}),
    ));

    for (i, tool) in tools.iter().enumerate() {
        let index = i + 1;
        events.push(event(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {
                    "type": "tool_use",
                    "id": format!("toolu_{}", i),
                    "name": tool,
                    "input": {},
                },
            }),
        ));
        events.push(event(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": index}),
        ));
    }

    events.push(event(
        "message_delta",
        json!({
            "type": "message_delta",
            "delta": {"stop_reason": if tools.is_empty() { "end_turn" } else { "tool_use" }},
            "usage": {"output_tokens": output},
        }),
    ));
    events.push(event("message_stop", json!({"type": "message_stop"})));
    events
}

/// Rechunk `chunks` into pieces of `size` bytes, splitting events mid-line.
pub fn rechunk(chunks: &[Bytes], size: usize) -> Vec<Bytes> {
    let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
    joined
        .chunks(size.max(1))
        .map(Bytes::copy_from_slice)
        .collect()
}
