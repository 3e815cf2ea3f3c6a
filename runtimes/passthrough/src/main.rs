//! Passthrough handler: reads a handler envelope on stdin, writes the input back.
//!
//! Register it in `stately.toml`:
//!
//! ```toml
//! [handlers.passthrough]
//! command = "runtimes/passthrough/target/release/stately-passthrough"
//! ```
//!
//! Setting `PASSTHROUGH_FAIL` (for example through a Task state's
//! `environment`) makes it answer with an error of that type instead, which
//! is handy for exercising `Retry` and `Catch` rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Read;

#[derive(Deserialize)]
struct HandlerInput {
    #[serde(default)]
    input: Value,
    #[serde(default)]
    context: Value,
}

#[derive(Serialize)]
struct HandlerOutput {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(rename = "errorType", skip_serializing_if = "Option::is_none")]
    error_type: Option<String>,
}

impl HandlerOutput {
    fn ok(output: Value) -> Self {
        Self {
            status: "ok".into(),
            output: Some(output),
            error: None,
            error_type: None,
        }
    }

    fn error(error_type: &str, message: String) -> Self {
        Self {
            status: "error".into(),
            output: None,
            error: Some(message),
            error_type: Some(error_type.to_string()),
        }
    }
}

/// Core processing logic, separated for testability.
fn process(raw: &str, fail_with: Option<&str>) -> HandlerOutput {
    let envelope: HandlerInput = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => return HandlerOutput::error("InvalidInput", format!("Invalid input JSON: {e}")),
    };

    if let Some(error_type) = fail_with {
        let state = envelope
            .context
            .get("stateName")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        return HandlerOutput::error(error_type, format!("asked to fail in state {state}"));
    }

    HandlerOutput::ok(envelope.input)
}

fn main() {
    let mut raw = String::new();
    let result = match std::io::stdin().read_to_string(&mut raw) {
        Ok(_) => {
            let fail_with = std::env::var("PASSTHROUGH_FAIL").ok();
            process(&raw, fail_with.as_deref())
        }
        Err(e) => HandlerOutput::error("InvalidInput", format!("Failed to read stdin: {e}")),
    };

    match serde_json::to_string(&result) {
        Ok(json) => print!("{json}"),
        Err(_) => print!(r#"{{"status":"error","error":"serialization failed"}}"#),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_passthrough_echoes_input() {
        let raw = json!({
            "input": {"deep": {"nested": {"value": 42}}},
            "context": {"stateName": "Echo", "retryCount": 0}
        })
        .to_string();
        let result = process(&raw, None);
        assert_eq!(result.status, "ok");
        assert_eq!(result.output.unwrap()["deep"]["nested"]["value"], 42);
    }

    #[test]
    fn test_passthrough_missing_input_is_null() {
        let result = process(&json!({}).to_string(), None);
        assert_eq!(result.status, "ok");
        assert_eq!(result.output.unwrap(), Value::Null);
    }

    #[test]
    fn test_passthrough_requested_failure() {
        let raw = json!({"input": {}, "context": {"stateName": "Charge"}}).to_string();
        let result = process(&raw, Some("PaymentDeclined"));
        assert_eq!(result.status, "error");
        assert_eq!(result.error_type.as_deref(), Some("PaymentDeclined"));
        assert!(result.error.unwrap().contains("Charge"));
    }

    #[test]
    fn test_passthrough_invalid_json() {
        let result = process("not json at all", None);
        assert_eq!(result.status, "error");
        assert!(result.error.unwrap().contains("Invalid input JSON"));
    }
}
