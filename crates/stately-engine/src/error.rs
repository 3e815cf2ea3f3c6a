//! Error types for the execution engine.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::choice::ChoiceError;
use crate::invoker::TaskError;
use crate::path::PathError;

/// Result type for execution operations.
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Errors that can stop or redirect a run.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A task handler or service integration failed.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// `OutputPath` selected nothing.
    #[error("State '{state}': OutputPath '{path}' does not match any value in the state output")]
    InvalidOutputPath { state: String, path: String },

    /// A Wait state could not resolve a valid duration.
    #[error("State '{state}': invalid wait time: {reason}")]
    InvalidWaitTime { state: String, reason: String },

    /// The state type cannot be executed.
    #[error("State '{state}': unsupported state type '{state_type}'")]
    UnsupportedStateType { state: String, state_type: String },

    /// A transition named a state that does not exist.
    #[error("State not found: {0}")]
    StateNotFound(String),

    /// A non-terminal state has no `Next`.
    #[error("State '{state}' has no Next and is not an End state")]
    MissingTransition { state: String },

    /// InputPath, Parameters or ResultPath could not be applied.
    #[error("State '{state}': {source}")]
    Path {
        state: String,
        #[source]
        source: PathError,
    },

    /// A `Catch` matched but its `ResultPath` could not merge the error.
    #[error("State '{state}': could not merge caught error '{caught}': {source}")]
    CatchMerge {
        state: String,
        caught: String,
        #[source]
        source: PathError,
    },

    /// The choice evaluator could not pick a branch.
    #[error("State '{state}': {source}")]
    Choice {
        state: String,
        #[source]
        source: ChoiceError,
    },
}

impl ExecutionError {
    /// Whether `Retry` and `Catch` rules may handle this error.
    ///
    /// Only failures raised by the task itself are recoverable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExecutionError::Task(_))
    }

    /// Name matched against `ErrorEquals` and reported as `Error`.
    pub fn error_name(&self) -> String {
        match self {
            ExecutionError::Task(e) => e.error_name().to_string(),
            ExecutionError::InvalidOutputPath { .. } => "InvalidOutputPathError".to_string(),
            ExecutionError::InvalidWaitTime { .. } => "InvalidWaitTimeError".to_string(),
            ExecutionError::UnsupportedStateType { .. } => {
                "UnsupportedStateTypeError".to_string()
            }
            ExecutionError::StateNotFound(_) => "StateNotFoundError".to_string(),
            ExecutionError::MissingTransition { .. } => "MissingTransitionError".to_string(),
            ExecutionError::Path { .. } | ExecutionError::CatchMerge { .. } => {
                "InvalidPathError".to_string()
            }
            ExecutionError::Choice { .. } => "States.NoChoiceMatched".to_string(),
        }
    }

    /// Human-readable message without the error name.
    pub fn message(&self) -> String {
        match self {
            ExecutionError::Task(e) => e.message(),
            other => other.to_string(),
        }
    }

    /// Structured payload describing this error.
    pub fn to_output(&self) -> ErrorOutput {
        let name = self.error_name();
        let trace = match self {
            ExecutionError::Task(e) => e.trace().map(str::to_string),
            _ => None,
        };
        ErrorOutput {
            error: name.clone(),
            cause: ErrorCause {
                error_type: name,
                error_message: self.message(),
                trace,
            },
        }
    }
}

/// Error payload merged into state input by `Catch`, and reported on failed runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorOutput {
    pub error: String,
    pub cause: ErrorCause,
}

impl ErrorOutput {
    /// The payload as a JSON value, ready to be merged with `ResultPath`.
    pub fn to_value(&self) -> Value {
        let mut cause = json!({
            "errorType": self.cause.error_type,
            "errorMessage": self.cause.error_message,
        });
        if let Some(trace) = &self.cause.trace {
            cause["trace"] = Value::String(trace.clone());
        }
        json!({ "Error": self.error, "Cause": cause })
    }
}

/// The `Cause` member of an [`ErrorOutput`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCause {
    pub error_type: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Errors raised while loading or validating definitions.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// Failed to read a definition file.
    #[error("Failed to read definition file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON parse error.
    #[error("Invalid JSON definition: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parse error.
    #[error("Invalid YAML definition: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Structural problem found by validation.
    #[error("Invalid state machine: {0}")]
    Invalid(String),
}
