//! Line-delimited JSON-RPC server used as a stand-in stdio backend in tests.
//!
//! Environment knobs:
//! - `FAKE_BACKEND_RECORD`: append every received line to this file.
//! - `FAKE_BACKEND_PID_FILE`: append this process's pid on startup.
//! - `FAKE_BACKEND_BANNER`: print this non-JSON line to stdout on startup.
//! - `FAKE_BACKEND_EXIT_CODE`: exit immediately with this status.

use std::fs::OpenOptions;
use std::io::{BufRead, Write};
use std::time::Duration;

use serde_json::{json, Value};

fn append_line(path: &str, line: &str) {
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{line}");
    }
}

fn emit(text: &str) {
    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();
    let _ = writeln!(stdout, "{text}");
    let _ = stdout.flush();
}

fn reply(id: Value, result: Value) {
    emit(&json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string());
}

fn reply_error(id: Value, code: i64, message: &str) {
    emit(&json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}).to_string());
}

fn text_content(text: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": text.into()}]})
}

fn call_tool(id: Value, params: &Value) {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
    match name {
        "ping" => reply(id, text_content("pong")),
        "echo" => reply(id, json!({"arguments": arguments})),
        "sleep" => {
            let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(100);
            std::thread::sleep(Duration::from_millis(ms));
            reply(id, text_content(format!("slept {ms}ms")));
        }
        "silent" => {}
        "sign_in" => {
            let filled = |field: &str| {
                arguments
                    .get(field)
                    .and_then(Value::as_str)
                    .is_some_and(|value| !value.is_empty())
            };
            let signed_in = filled("email") && filled("password");
            reply(id, text_content(json!({"signedIn": signed_in}).to_string()));
        }
        "notify_then_reply" => {
            emit(
                &json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/progress",
                    "params": {"progress": 1},
                })
                .to_string(),
            );
            reply(id, text_content("done"));
        }
        "pretty" => {
            let response = json!({"jsonrpc": "2.0", "id": id, "result": text_content("pretty")});
            emit(&serde_json::to_string_pretty(&response).unwrap_or_default());
        }
        other => reply_error(id, -32601, &format!("unknown tool: {other}")),
    }
}

fn main() {
    if let Ok(path) = std::env::var("FAKE_BACKEND_PID_FILE") {
        append_line(&path, &std::process::id().to_string());
    }
    if let Some(code) = std::env::var("FAKE_BACKEND_EXIT_CODE")
        .ok()
        .and_then(|code| code.parse::<i32>().ok())
    {
        eprintln!("fake backend exiting with {code}");
        std::process::exit(code);
    }
    if let Ok(banner) = std::env::var("FAKE_BACKEND_BANNER") {
        emit(&banner);
    }
    let record = std::env::var("FAKE_BACKEND_RECORD").ok();

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        if let Some(path) = record.as_deref() {
            append_line(path, &line);
        }
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            eprintln!("fake backend ignoring non-JSON line");
            continue;
        };
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        match request.get("method").and_then(Value::as_str) {
            Some("initialize") => reply(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake-stdio-backend", "version": "0.1.0"},
                }),
            ),
            Some("tools/list") => reply(
                id,
                json!({"tools": [
                    {"name": "ping"},
                    {"name": "echo"},
                    {"name": "sleep"},
                    {"name": "sign_in"},
                ]}),
            ),
            Some("tools/call") => call_tool(id, &params),
            Some(other) => reply_error(id, -32601, &format!("method not found: {other}")),
            None => reply_error(id, -32600, "missing method"),
        }
    }
}
