#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_runtime::{is_recognized_method, normalize_request};
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = serde_json::from_slice::<Value>(data) else {
        return;
    };
    let method = payload
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);
    let Ok(normalized) = normalize_request(payload) else {
        return;
    };

    assert!(normalized.get("id").is_some());
    match method {
        Some(method) if !is_recognized_method(&method) => {
            assert_eq!(normalized["method"], "tools/call");
            assert_eq!(normalized["params"]["name"], method.as_str());
            assert!(!normalized["params"]["arguments"].is_null());
        }
        Some(method) => assert_eq!(normalized["method"], method.as_str()),
        None => assert!(normalized.get("method").is_none()),
    }
});
