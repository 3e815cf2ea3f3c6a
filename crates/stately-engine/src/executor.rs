//! The state machine interpreter.
//!
//! Provides `Executor`, which walks a definition from a start state to a
//! terminal state. Each state goes through the same pipeline:
//!
//! `InputPath` → `Parameters` → dispatch → `ResultPath` → `OutputPath` → advance
//!
//! Transitions, retries and catch redirects all loop back to the top of
//! [`Executor::run`]; the run never recurses.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::choice::ChoiceEvaluator;
use crate::context::ExecutionContext;
use crate::definition::{StateDefinition, StateMachineDefinition, StateType};
use crate::error::{ErrorCause, ErrorOutput, ExecutionError, Result};
use crate::invoker::{TaskError, TaskInvoker, is_service_resource};
use crate::path::{
    PathError, apply_input_path, apply_output_path, apply_parameters, apply_result_path,
    select_required,
};
use crate::protocol::InvocationContext;

/// Error name reported by a Fail state that sets no `Error`.
const DEFAULT_FAIL_ERROR: &str = "States.Fail";

/// Identifiers returned when a run is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedExecution {
    pub execution_arn: String,
    pub start_date: DateTime<Utc>,
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Reached a Succeed state or an `End` state.
    Succeeded,
    /// Reached a Fail state or an error nothing recovered from.
    Failed,
    /// Reached a state type the engine cannot execute.
    Unsupported,
}

/// Result of a completed run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Run identifier.
    pub execution_arn: String,
    /// Final status.
    pub status: ExecutionStatus,
    /// Output of the terminal state (successful runs only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// What went wrong (unsuccessful runs only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorOutput>,
    /// Input of the state the run stopped in (unsuccessful runs only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_input: Option<Value>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}

/// What a state asked the run to do next.
enum Step {
    Advance { next: String, output: Value },
    Succeed(Value),
    Fail(ErrorOutput),
}

/// Drives runs of state machine definitions.
///
/// Cheap to clone; clones share the same collaborators.
#[derive(Clone)]
pub struct Executor {
    invoker: Arc<dyn TaskInvoker>,
    choices: Arc<dyn ChoiceEvaluator>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(invoker: Arc<dyn TaskInvoker>, choices: Arc<dyn ChoiceEvaluator>) -> Self {
        Self { invoker, choices }
    }

    /// Start a run in the background and return its identifiers immediately.
    ///
    /// The outcome is only reported through tracing. Must be called from
    /// within a tokio runtime.
    pub fn start_execution(
        &self,
        machine_name: &str,
        state_machine: Arc<StateMachineDefinition>,
        start_state: &str,
        input: Value,
    ) -> StartedExecution {
        let ctx = ExecutionContext::new(machine_name, state_machine, start_state, input);
        let started = StartedExecution {
            execution_arn: ctx.execution_arn().to_string(),
            start_date: ctx.start_date(),
        };

        let executor = self.clone();
        let execution_arn = started.execution_arn.clone();
        let handle = tokio::spawn(async move {
            executor.run(ctx).await;
        });
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                error!(execution_arn = %execution_arn, error = %e, "Execution task aborted");
            }
        });

        started
    }

    /// Drive a run to completion.
    pub async fn run(&self, mut ctx: ExecutionContext) -> ExecutionResult {
        info!(
            execution_arn = %ctx.execution_arn(),
            state_machine = %ctx.machine_name(),
            state = %ctx.current_state(),
            "Execution started"
        );

        loop {
            let machine = Arc::clone(ctx.state_machine());
            let state = match machine.state(ctx.current_state()) {
                Ok(state) => state,
                Err(e) => return self.finish_with_error(ctx, e),
            };

            info!(
                execution_arn = %ctx.execution_arn(),
                state = %ctx.current_state(),
                state_type = %state.state_type,
                retry = ctx.retry_count(),
                "Entering state"
            );
            debug!(execution_arn = %ctx.execution_arn(), input = %ctx.input(), "State input");

            match self.step(&ctx, state).await {
                Ok(Step::Advance { next, output }) => {
                    debug!(execution_arn = %ctx.execution_arn(), %next, output = %output, "State output");
                    if let Err(e) = ctx.advance(&next, output) {
                        return self.finish_with_error(ctx, e);
                    }
                }
                Ok(Step::Succeed(output)) => {
                    info!(
                        execution_arn = %ctx.execution_arn(),
                        state = %ctx.current_state(),
                        "Execution succeeded"
                    );
                    return ExecutionResult {
                        execution_arn: ctx.execution_arn().to_string(),
                        status: ExecutionStatus::Succeeded,
                        output: Some(output),
                        error: None,
                        last_input: None,
                    };
                }
                Ok(Step::Fail(failure)) => {
                    error!(
                        execution_arn = %ctx.execution_arn(),
                        state = %ctx.current_state(),
                        error = %failure.error,
                        cause = %failure.cause.error_message,
                        "Execution failed at Fail state"
                    );
                    return ExecutionResult {
                        execution_arn: ctx.execution_arn().to_string(),
                        status: ExecutionStatus::Failed,
                        output: None,
                        error: Some(failure),
                        last_input: Some(ctx.into_input()),
                    };
                }
                Err(e) => {
                    if let Err(fatal) = self.recover(&mut ctx, state, e) {
                        return self.finish_with_error(ctx, fatal);
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Per-state pipeline
    // -----------------------------------------------------------------------

    async fn step(&self, ctx: &ExecutionContext, state: &StateDefinition) -> Result<Step> {
        let name = ctx.current_state();
        let global_input = ctx.input();

        match state.state_type {
            StateType::Parallel | StateType::Unknown => {
                return Err(ExecutionError::UnsupportedStateType {
                    state: name.to_string(),
                    state_type: state.state_type.to_string(),
                });
            }
            StateType::Fail => return Ok(Step::Fail(fail_state_error(state))),
            _ => {}
        }

        let path_error = |source: PathError| ExecutionError::Path {
            state: name.to_string(),
            source,
        };

        let effective = apply_input_path(global_input, &state.input_path).map_err(path_error)?;
        let effective =
            apply_parameters(effective, state.parameters.as_ref()).map_err(path_error)?;

        let result = match state.state_type {
            StateType::Choice => {
                let next = self
                    .choices
                    .next_state(state, &effective)
                    .map_err(|source| ExecutionError::Choice {
                        state: name.to_string(),
                        source,
                    })?;
                // Choice only redirects; the next state sees the untouched input.
                return Ok(Step::Advance {
                    next,
                    output: global_input.clone(),
                });
            }
            StateType::Task => Some(self.invoke_task(ctx, state, effective).await?),
            StateType::Pass => Some(state.result.clone().unwrap_or_else(|| json!({}))),
            StateType::Wait => {
                let duration = wait_duration(name, state, &effective)?;
                debug!(state = %name, wait_ms = duration.as_millis() as u64, "Waiting");
                tokio::time::sleep(duration).await;
                None
            }
            _ => None,
        };

        let data = match result {
            Some(result) if state.produces_result() => {
                apply_result_path(global_input.clone(), &state.result_path, result)
                    .map_err(path_error)?
            }
            _ => global_input.clone(),
        };

        let output = apply_output_path(data, &state.output_path).map_err(|e| match e {
            PathError::NoMatch { path } => ExecutionError::InvalidOutputPath {
                state: name.to_string(),
                path,
            },
            other => path_error(other),
        })?;

        if state.is_terminal() {
            return Ok(Step::Succeed(output));
        }

        let next = state
            .next
            .clone()
            .ok_or_else(|| ExecutionError::MissingTransition {
                state: name.to_string(),
            })?;
        Ok(Step::Advance { next, output })
    }

    async fn invoke_task(
        &self,
        ctx: &ExecutionContext,
        state: &StateDefinition,
        input: Value,
    ) -> Result<Value> {
        if let Some(resource) = state.resource.as_deref().filter(|r| is_service_resource(r)) {
            return Ok(self.invoker.invoke_service(resource, input).await?);
        }

        let handler = state.handler_name().ok_or_else(|| {
            TaskError::failed(
                "States.Runtime",
                format!(
                    "Task state '{}' has neither a Resource nor a handler",
                    ctx.current_state()
                ),
            )
        })?;

        let context = InvocationContext {
            execution_arn: ctx.execution_arn().to_string(),
            state_name: ctx.current_state().to_string(),
            retry_count: ctx.retry_count(),
            environment: state.environment.clone(),
        };
        Ok(self.invoker.invoke_handler(handler, input, &context).await?)
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Apply Retry, then Catch. Returns the error back when neither handles it.
    fn recover(
        &self,
        ctx: &mut ExecutionContext,
        state: &StateDefinition,
        error: ExecutionError,
    ) -> Result<()> {
        if !error.is_recoverable() {
            return Err(error);
        }
        let error_name = error.error_name();

        if let Some(retrier) = state.retrier_for(&error_name) {
            if ctx.retry_count() < retrier.max_attempts() {
                let retry = ctx.record_retry();
                warn!(
                    execution_arn = %ctx.execution_arn(),
                    state = %ctx.current_state(),
                    retry,
                    max_attempts = retrier.max_attempts(),
                    error = %error,
                    "Task failed, retrying"
                );
                return Ok(());
            }
        }

        if let Some(catcher) = state.catcher_for(&error_name) {
            let payload = error.to_output().to_value();
            let merged = apply_result_path(ctx.input().clone(), &catcher.result_path, payload)
                .map_err(|source| ExecutionError::CatchMerge {
                    state: ctx.current_state().to_string(),
                    caught: error_name.clone(),
                    source,
                })?;
            warn!(
                execution_arn = %ctx.execution_arn(),
                state = %ctx.current_state(),
                next = %catcher.next,
                error = %error,
                "Task failed, caught"
            );
            ctx.advance(&catcher.next, merged)?;
            return Ok(());
        }

        Err(error)
    }

    fn finish_with_error(&self, ctx: ExecutionContext, error: ExecutionError) -> ExecutionResult {
        let status = match error {
            ExecutionError::UnsupportedStateType { .. } => ExecutionStatus::Unsupported,
            _ => ExecutionStatus::Failed,
        };
        error!(
            execution_arn = %ctx.execution_arn(),
            state = %ctx.current_state(),
            error_name = %error.error_name(),
            error = %error,
            "Execution failed"
        );
        ExecutionResult {
            execution_arn: ctx.execution_arn().to_string(),
            status,
            output: None,
            error: Some(error.to_output()),
            last_input: Some(ctx.into_input()),
        }
    }
}

fn fail_state_error(state: &StateDefinition) -> ErrorOutput {
    let name = state
        .error
        .clone()
        .unwrap_or_else(|| DEFAULT_FAIL_ERROR.to_string());
    ErrorOutput {
        error: name.clone(),
        cause: ErrorCause {
            error_type: name,
            error_message: state.cause.clone().unwrap_or_default(),
            trace: None,
        },
    }
}

// ---------------------------------------------------------------------------
// Wait
// ---------------------------------------------------------------------------

/// Resolve how long a Wait state suspends the run.
///
/// Fields are tried in the order `Seconds`, `SecondsPath`, `Timestamp`,
/// `TimestampPath`. A `Seconds` value that is not a number falls through to
/// the next field.
fn wait_duration(state_name: &str, state: &StateDefinition, input: &Value) -> Result<Duration> {
    let invalid = |reason: String| ExecutionError::InvalidWaitTime {
        state: state_name.to_string(),
        reason,
    };
    let mut reason = None;

    if let Some(seconds) = &state.seconds {
        match seconds_to_duration(seconds) {
            Some(duration) => return Ok(duration),
            None => reason = Some(format!("Seconds value {seconds} is not a valid number")),
        }
    }

    if let Some(path) = &state.seconds_path {
        let value = select_required(input, path).map_err(|e| invalid(e.to_string()))?;
        return seconds_to_duration(&value).ok_or_else(|| {
            invalid(format!(
                "SecondsPath '{path}' resolved to {value}, which is not a valid number"
            ))
        });
    }

    if let Some(timestamp) = &state.timestamp {
        return until(timestamp).ok_or_else(|| {
            invalid(format!("Timestamp '{timestamp}' is not an RFC 3339 timestamp"))
        });
    }

    if let Some(path) = &state.timestamp_path {
        let value = select_required(input, path).map_err(|e| invalid(e.to_string()))?;
        return value.as_str().and_then(until).ok_or_else(|| {
            invalid(format!(
                "TimestampPath '{path}' resolved to {value}, which is not an RFC 3339 timestamp"
            ))
        });
    }

    Err(invalid(reason.unwrap_or_else(|| {
        "one of Seconds, SecondsPath, Timestamp or TimestampPath is required".to_string()
    })))
}

/// A non-negative number of seconds, given as a number or a numeric string.
fn seconds_to_duration(value: &Value) -> Option<Duration> {
    let seconds = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    Duration::try_from_secs_f64(seconds).ok()
}

/// Time left until an RFC 3339 instant; zero when it has passed.
fn until(timestamp: &str) -> Option<Duration> {
    let target = DateTime::parse_from_rfc3339(timestamp).ok()?;
    let remaining = target.with_timezone(&Utc) - Utc::now();
    Some(remaining.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_state(fields: Value) -> StateDefinition {
        let mut state = json!({"Type": "Wait", "Next": "Done"});
        if let (Value::Object(base), Value::Object(extra)) = (&mut state, fields) {
            base.extend(extra);
        }
        serde_json::from_value(state).unwrap()
    }

    #[test]
    fn test_seconds_to_duration() {
        assert_eq!(seconds_to_duration(&json!(2)), Some(Duration::from_secs(2)));
        assert_eq!(
            seconds_to_duration(&json!(0.5)),
            Some(Duration::from_millis(500))
        );
        assert_eq!(seconds_to_duration(&json!(" 3 ")), Some(Duration::from_secs(3)));
        assert_eq!(seconds_to_duration(&json!("soon")), None);
        assert_eq!(seconds_to_duration(&json!(-1)), None);
        assert_eq!(seconds_to_duration(&json!(null)), None);
    }

    #[test]
    fn test_wait_duration_from_seconds_path() {
        let state = wait_state(json!({"SecondsPath": "$.delay"}));
        let duration = wait_duration("W", &state, &json!({"delay": 4})).unwrap();
        assert_eq!(duration, Duration::from_secs(4));
    }

    #[test]
    fn test_invalid_seconds_falls_through_to_path() {
        let state = wait_state(json!({"Seconds": "abc", "SecondsPath": "$.delay"}));
        let duration = wait_duration("W", &state, &json!({"delay": "1"})).unwrap();
        assert_eq!(duration, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_wait_time() {
        let state = wait_state(json!({"Seconds": "abc"}));
        let err = wait_duration("W", &state, &json!({})).unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidWaitTime { ref state, .. } if state == "W"));

        let state = wait_state(json!({"SecondsPath": "$.delay"}));
        let err = wait_duration("W", &state, &json!({"delay": "later"})).unwrap_err();
        assert_eq!(err.error_name(), "InvalidWaitTimeError");

        let err = wait_duration("W", &state, &json!({})).unwrap_err();
        assert_eq!(err.error_name(), "InvalidWaitTimeError");

        let state = wait_state(json!({}));
        assert!(wait_duration("W", &state, &json!({})).is_err());
    }

    #[test]
    fn test_past_timestamp_waits_zero() {
        let state = wait_state(json!({"Timestamp": "2001-01-01T00:00:00Z"}));
        assert_eq!(
            wait_duration("W", &state, &json!({})).unwrap(),
            Duration::ZERO
        );

        let state = wait_state(json!({"TimestampPath": "$.at"}));
        assert_eq!(
            wait_duration("W", &state, &json!({"at": "2001-01-01T00:00:00+01:00"})).unwrap(),
            Duration::ZERO
        );
        assert!(wait_duration("W", &state, &json!({"at": "yesterday"})).is_err());
    }

    #[test]
    fn test_future_timestamp_waits() {
        let at = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        let state = wait_state(json!({"Timestamp": at}));
        let duration = wait_duration("W", &state, &json!({})).unwrap();
        assert!(duration > Duration::from_secs(3500));
    }

    #[test]
    fn test_fail_state_error() {
        let state: StateDefinition = serde_json::from_value(json!({
            "Type": "Fail", "Error": "OrderRejected", "Cause": "out of stock"
        }))
        .unwrap();
        let failure = fail_state_error(&state);
        assert_eq!(failure.error, "OrderRejected");
        assert_eq!(failure.cause.error_message, "out of stock");

        let bare: StateDefinition = serde_json::from_value(json!({"Type": "Fail"})).unwrap();
        assert_eq!(fail_state_error(&bare).error, DEFAULT_FAIL_ERROR);
    }

    #[test]
    fn test_execution_status_serializes_uppercase() {
        assert_eq!(
            serde_json::to_value(ExecutionStatus::Unsupported).unwrap(),
            json!("UNSUPPORTED")
        );
    }
}
