//! StartExecution endpoint.

use std::sync::Arc;

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{Result, ServerError};
use crate::state::AppState;

/// Body of `POST /`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionRequest {
    /// ARN whose last `:` segment names the machine.
    pub state_machine_arn: String,
    /// Execution input as a JSON-encoded string. Absent means `{}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Caller-supplied execution name. Logged only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Response of `POST /`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionResponse {
    /// Start time in epoch milliseconds.
    pub start_date: i64,
    pub execution_arn: String,
}

/// Resolve the machine, start it at its `StartAt` state and return at once.
pub async fn start_execution_handler(
    State(state): State<AppState>,
    body: std::result::Result<Json<StartExecutionRequest>, JsonRejection>,
) -> Result<Json<StartExecutionResponse>> {
    let Json(request) = body.map_err(|e| ServerError::BadRequest(e.body_text()))?;

    let (key, machine) = state
        .machines
        .find_by_arn(&request.state_machine_arn)
        .ok_or_else(|| {
            ServerError::NotFound(format!(
                "state machine '{}' does not exist",
                request.state_machine_arn
            ))
        })?;

    let input: Value = match request.input.as_deref() {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| ServerError::BadRequest(format!("input is not valid JSON: {e}")))?,
        None => Value::Object(Default::default()),
    };

    let machine_name = machine.name.as_deref().unwrap_or(key);
    let definition = Arc::new(machine.definition.clone());
    let start_at = definition.start_at.clone();

    let started = state
        .executor
        .start_execution(machine_name, definition, &start_at, input);

    info!(
        execution_arn = %started.execution_arn,
        state_machine = %machine_name,
        name = request.name.as_deref().unwrap_or(""),
        "Execution started"
    );

    Ok(Json(StartExecutionResponse {
        start_date: started.start_date.timestamp_millis(),
        execution_arn: started.execution_arn,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request: StartExecutionRequest = serde_json::from_str(
            r#"{"stateMachineArn": "arn:aws:states:us-east-1:123:stateMachine:orders", "input": "{\"a\":1}"}"#,
        )
        .unwrap();
        assert!(request.state_machine_arn.ends_with(":orders"));
        assert_eq!(request.input.as_deref(), Some(r#"{"a":1}"#));
        assert!(request.name.is_none());
    }

    #[test]
    fn test_response_wire_format() {
        let response = StartExecutionResponse {
            start_date: 1_700_000_000_000,
            execution_arn: "orders-Start-1700000000000".to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["startDate"], 1_700_000_000_000_i64);
        assert_eq!(json["executionArn"], "orders-Start-1700000000000");
    }
}
