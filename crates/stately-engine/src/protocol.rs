//! Wire protocol for out-of-process task handlers.
//!
//! A command handler receives a `HandlerInput` on stdin and writes a
//! `HandlerOutput` to stdout, both as JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-invocation facts handed to a task handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    /// Identifier of the run this invocation belongs to.
    pub execution_arn: String,
    /// Name of the Task state being executed.
    pub state_name: String,
    /// Retries already spent on this state.
    pub retry_count: u32,
    /// Environment overrides declared on the state.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// Input envelope sent to a handler process on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerInput {
    /// The effective state input.
    pub input: Value,
    /// Invocation facts.
    pub context: InvocationContext,
}

/// Output envelope expected from a handler process on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerOutput {
    /// Execution status: "ok" or "error".
    pub status: String,
    /// Task result when status is "ok".
    #[serde(default)]
    pub output: Option<Value>,
    /// Error message if status is "error".
    #[serde(default)]
    pub error: Option<String>,
    /// Error name used for Retry/Catch matching.
    #[serde(default, rename = "errorType")]
    pub error_type: Option<String>,
    /// Optional stack or diagnostic trace.
    #[serde(default)]
    pub trace: Option<String>,
}

impl HandlerOutput {
    /// Returns true if the handler reported success.
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Successful envelope carrying `output`.
    pub fn ok(output: Value) -> Self {
        Self {
            status: "ok".to_string(),
            output: Some(output),
            error: None,
            error_type: None,
            trace: None,
        }
    }

    /// Failed envelope.
    pub fn error(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            output: None,
            error: Some(message.into()),
            error_type: Some(error_type.into()),
            trace: None,
        }
    }
}
