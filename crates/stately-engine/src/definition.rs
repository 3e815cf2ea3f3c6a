//! Declarative state machine definition parser.
//!
//! Parses JSON (or YAML) state machine documents into `StateMachineDefinition`
//! structs and offers an optional structural validation pass.
//!
//! # Example JSON
//!
//! ```json
//! {
//!   "orders": {
//!     "name": "OrderFlow",
//!     "definition": {
//!       "StartAt": "Charge",
//!       "States": {
//!         "Charge": {
//!           "Type": "Task",
//!           "Resource": "arn:aws:lambda:us-east-1:000000000000:function:charge",
//!           "handler": "charge",
//!           "ResultPath": "$.receipt",
//!           "Retry": [{ "ErrorEquals": ["States.ALL"], "MaxAttempts": 2 }],
//!           "Catch": [{ "ErrorEquals": ["States.ALL"], "Next": "Refund", "ResultPath": "$.error" }],
//!           "Next": "Done"
//!         },
//!         "Refund": { "Type": "Pass", "Result": { "refunded": true }, "End": true },
//!         "Done": { "Type": "Succeed" }
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! References between states are not checked while parsing; the executor
//! reports a missing state when it tries to transition into it. Call
//! [`StateMachineDefinition::validate`] to check them up front.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{DefinitionError, ExecutionError};
use crate::path::PathSpec;

/// Retry budget used when a retry rule omits `MaxAttempts`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Error name that matches every error in `ErrorEquals`.
pub const ERROR_ALL: &str = "States.ALL";

/// Error name that matches every task failure in `ErrorEquals`.
pub const ERROR_TASK_FAILED: &str = "States.TaskFailed";

/// Top-level document: state machines keyed by their identifier.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct DefinitionFile {
    pub machines: BTreeMap<String, StateMachine>,
}

/// One named state machine entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateMachine {
    /// Display name used in state machine ARNs. Falls back to the map key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The states and the start state.
    pub definition: StateMachineDefinition,
}

/// The states of one workflow plus the state it starts at.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateMachineDefinition {
    /// Name of the first state to run.
    pub start_at: String,

    /// All states by name.
    pub states: HashMap<String, StateDefinition>,

    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// The kind of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum StateType {
    Task,
    Pass,
    Wait,
    Choice,
    Succeed,
    Fail,
    Parallel,
    /// Any type name this engine does not know.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateType::Task => "Task",
            StateType::Pass => "Pass",
            StateType::Wait => "Wait",
            StateType::Choice => "Choice",
            StateType::Succeed => "Succeed",
            StateType::Fail => "Fail",
            StateType::Parallel => "Parallel",
            StateType::Unknown => "Unknown",
        };
        write!(f, "{name}")
    }
}

/// A single state.
///
/// All type-specific fields live on one record; which of them apply is
/// decided by `state_type`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateDefinition {
    #[serde(rename = "Type")]
    pub state_type: StateType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    // -- Data flow ----------------------------------------------------------
    #[serde(default, skip_serializing_if = "PathSpec::is_omitted")]
    pub input_path: PathSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,

    #[serde(default, skip_serializing_if = "PathSpec::is_omitted")]
    pub result_path: PathSpec,

    #[serde(default, skip_serializing_if = "PathSpec::is_omitted")]
    pub output_path: PathSpec,

    // -- Transitions --------------------------------------------------------
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,

    #[serde(default)]
    pub end: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<RetryRule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<CatchRule>,

    // -- Task ---------------------------------------------------------------
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    /// Registered handler name. Falls back to `Resource` when absent.
    #[serde(default, rename = "handler", skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    /// Per-invocation environment overrides handed to the handler.
    #[serde(default, rename = "environment", skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,

    // -- Pass ---------------------------------------------------------------
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    // -- Wait ---------------------------------------------------------------
    /// Number of seconds, or a numeric string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_path: Option<String>,

    /// RFC 3339 instant to wait until.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_path: Option<String>,

    // -- Choice -------------------------------------------------------------
    /// Branching rules, interpreted by the `ChoiceEvaluator`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    // -- Fail ---------------------------------------------------------------
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,

    // -- Parallel -----------------------------------------------------------
    /// Parsed so that documents load; branches are never executed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Value>,
}

/// A `Retry` entry.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RetryRule {
    /// Error names this rule applies to. Absent means every error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_equals: Option<Vec<String>>,

    /// Retries allowed after the first attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Accepted for compatibility; retries are immediate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<f64>,

    /// Accepted for compatibility; retries are immediate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_rate: Option<f64>,
}

impl RetryRule {
    /// Effective retry budget.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    /// Whether this rule covers the named error.
    pub fn matches(&self, error_name: &str) -> bool {
        matches_error(self.error_equals.as_deref(), error_name)
    }
}

/// A `Catch` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatchRule {
    /// Error names this rule applies to. Absent means every error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_equals: Option<Vec<String>>,

    /// State to redirect to.
    pub next: String,

    /// Where the synthesized error lands in the state input.
    #[serde(default, skip_serializing_if = "PathSpec::is_omitted")]
    pub result_path: PathSpec,
}

impl CatchRule {
    /// Whether this rule covers the named error.
    pub fn matches(&self, error_name: &str) -> bool {
        matches_error(self.error_equals.as_deref(), error_name)
    }
}

fn matches_error(error_equals: Option<&[String]>, error_name: &str) -> bool {
    match error_equals {
        None => true,
        Some(names) => names.iter().any(|name| {
            name == ERROR_ALL || name == ERROR_TASK_FAILED || name == error_name
        }),
    }
}

impl StateDefinition {
    /// Create a state of the given type with every optional field empty.
    pub fn new(state_type: StateType) -> Self {
        Self {
            state_type,
            comment: None,
            input_path: PathSpec::Omitted,
            parameters: None,
            result_path: PathSpec::Omitted,
            output_path: PathSpec::Omitted,
            next: None,
            end: false,
            retry: Vec::new(),
            catch: Vec::new(),
            resource: None,
            handler: None,
            environment: HashMap::new(),
            result: None,
            seconds: None,
            seconds_path: None,
            timestamp: None,
            timestamp_path: None,
            choices: Vec::new(),
            default: None,
            error: None,
            cause: None,
            branches: Vec::new(),
        }
    }

    /// Whether completing this state ends the run.
    pub fn is_terminal(&self) -> bool {
        self.end || matches!(self.state_type, StateType::Succeed | StateType::Fail)
    }

    /// Whether this state's work produces a result that goes through `ResultPath`.
    pub fn produces_result(&self) -> bool {
        matches!(
            self.state_type,
            StateType::Task | StateType::Pass | StateType::Parallel
        )
    }

    /// Identity of the user handler for a Task state.
    pub fn handler_name(&self) -> Option<&str> {
        self.handler.as_deref().or(self.resource.as_deref())
    }

    /// First retry rule covering the named error.
    pub fn retrier_for(&self, error_name: &str) -> Option<&RetryRule> {
        self.retry.iter().find(|rule| rule.matches(error_name))
    }

    /// First catch rule covering the named error.
    pub fn catcher_for(&self, error_name: &str) -> Option<&CatchRule> {
        self.catch.iter().find(|rule| rule.matches(error_name))
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl DefinitionFile {
    /// Parse a definition document from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse a definition document from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, DefinitionError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a definition document, choosing the format by file extension.
    pub fn from_file(path: &Path) -> Result<Self, DefinitionError> {
        let content = std::fs::read_to_string(path).map_err(|e| DefinitionError::Read {
            path: path.display().to_string(),
            source: e,
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yml") | Some("yaml")
        );
        let file = if is_yaml {
            Self::from_yaml(&content)?
        } else {
            Self::from_json(&content)?
        };

        debug!(
            "Loaded {} state machine(s) from {}",
            file.machines.len(),
            path.display()
        );
        Ok(file)
    }

    /// Find a machine by its `name`, falling back to its key.
    ///
    /// Returns the key together with the machine.
    pub fn find(&self, name: &str) -> Option<(&str, &StateMachine)> {
        self.machines
            .iter()
            .find(|(_, machine)| machine.name.as_deref() == Some(name))
            .or_else(|| self.machines.get_key_value(name))
            .map(|(key, machine)| (key.as_str(), machine))
    }

    /// Find a machine from a state machine ARN (its last `:` segment).
    pub fn find_by_arn(&self, arn: &str) -> Option<(&str, &StateMachine)> {
        let name = arn.rsplit(':').next().unwrap_or(arn);
        self.find(name)
    }

    /// Machine keys in sorted order.
    pub fn keys(&self) -> Vec<&str> {
        self.machines.keys().map(String::as_str).collect()
    }

    /// Validate every machine in the file.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        for (key, machine) in &self.machines {
            machine.definition.validate().map_err(|e| match e {
                DefinitionError::Invalid(msg) => {
                    DefinitionError::Invalid(format!("State machine '{key}': {msg}"))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

impl StateMachineDefinition {
    /// Look up a state, failing when the name is unknown.
    pub fn state(&self, name: &str) -> Result<&StateDefinition, ExecutionError> {
        self.states
            .get(name)
            .ok_or_else(|| ExecutionError::StateNotFound(name.to_string()))
    }

    /// Whether a state with this name exists.
    pub fn has_state(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Validate the definition.
    ///
    /// Checks:
    /// - `StartAt` names a state
    /// - Every `Next`, `Default`, Choice rule `Next` and Catch `Next` names a state
    /// - Task, Pass, Wait and Parallel states have `Next` or `End`
    /// - Choice states have at least one rule
    /// - Every state type is known
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if !self.has_state(&self.start_at) {
            return Err(DefinitionError::Invalid(format!(
                "StartAt '{}' does not name a state",
                self.start_at
            )));
        }

        let mut names: Vec<&String> = self.states.keys().collect();
        names.sort();

        for name in names {
            let state = &self.states[name];
            let check = |target: &str, field: &str| -> Result<(), DefinitionError> {
                if self.has_state(target) {
                    Ok(())
                } else {
                    Err(DefinitionError::Invalid(format!(
                        "State '{name}' {field} references unknown state '{target}'"
                    )))
                }
            };

            if let Some(next) = &state.next {
                check(next, "Next")?;
            }
            if let Some(default) = &state.default {
                check(default, "Default")?;
            }
            for catcher in &state.catch {
                check(&catcher.next, "Catch")?;
            }
            for rule in &state.choices {
                if let Some(next) = rule.get("Next").and_then(Value::as_str) {
                    check(next, "Choice rule")?;
                }
            }

            match state.state_type {
                StateType::Task | StateType::Pass | StateType::Wait | StateType::Parallel
                    if !state.end && state.next.is_none() =>
                {
                    return Err(DefinitionError::Invalid(format!(
                        "State '{name}' must have either 'Next' or 'End'"
                    )));
                }
                StateType::Choice if state.choices.is_empty() => {
                    return Err(DefinitionError::Invalid(format!(
                        "Choice state '{name}' has no rules"
                    )));
                }
                StateType::Unknown => {
                    return Err(DefinitionError::Invalid(format!(
                        "State '{name}' has an unsupported Type"
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ORDER_FLOW: &str = r#"
{
  "orders": {
    "name": "OrderFlow",
    "definition": {
      "Comment": "Charge then finish",
      "StartAt": "Charge",
      "States": {
        "Charge": {
          "Type": "Task",
          "Resource": "arn:aws:lambda:us-east-1:000000000000:function:charge",
          "handler": "charge",
          "environment": { "CURRENCY": "EUR" },
          "InputPath": "$.order",
          "ResultPath": "$.receipt",
          "OutputPath": null,
          "Retry": [{ "ErrorEquals": ["Timeout"], "MaxAttempts": 2 }],
          "Catch": [{ "ErrorEquals": ["States.ALL"], "Next": "Refund", "ResultPath": "$.error" }],
          "Next": "Done"
        },
        "Refund": { "Type": "Pass", "Result": { "refunded": true }, "End": true },
        "Done": { "Type": "Succeed" }
      }
    }
  }
}
"#;

    #[test]
    fn test_parse_json_definition() {
        let file = DefinitionFile::from_json(ORDER_FLOW).unwrap();
        let (key, machine) = file.find("OrderFlow").unwrap();
        assert_eq!(key, "orders");
        assert_eq!(machine.definition.start_at, "Charge");
        assert_eq!(machine.definition.comment.as_deref(), Some("Charge then finish"));

        let charge = machine.definition.state("Charge").unwrap();
        assert_eq!(charge.state_type, StateType::Task);
        assert_eq!(charge.handler_name(), Some("charge"));
        assert_eq!(charge.environment["CURRENCY"], "EUR");
        assert_eq!(charge.input_path, PathSpec::path("$.order"));
        assert_eq!(charge.output_path, PathSpec::Null);
        assert_eq!(charge.result_path, PathSpec::path("$.receipt"));
        assert_eq!(charge.retry[0].max_attempts(), 2);
        assert_eq!(charge.catch[0].next, "Refund");
        assert!(!charge.is_terminal());

        let refund = machine.definition.state("Refund").unwrap();
        assert_eq!(refund.result, Some(json!({"refunded": true})));
        assert!(refund.is_terminal());
        assert_eq!(refund.input_path, PathSpec::Omitted);
    }

    #[test]
    fn test_parse_yaml_definition() {
        let yaml = r#"
hello:
  definition:
    StartAt: Wait
    States:
      Wait:
        Type: Wait
        Seconds: 1
        Next: Greet
      Greet:
        Type: Task
        Resource: greet
        ResultPath: ~
        End: true
"#;
        let file = DefinitionFile::from_yaml(yaml).unwrap();
        let (_, machine) = file.find("hello").unwrap();
        let greet = machine.definition.state("Greet").unwrap();
        assert_eq!(greet.result_path, PathSpec::Null);
        assert_eq!(greet.handler_name(), Some("greet"));
        let wait = machine.definition.state("Wait").unwrap();
        assert_eq!(wait.seconds, Some(json!(1)));
        machine.definition.validate().unwrap();
    }

    #[test]
    fn test_from_file_picks_format() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("machines.json");
        std::fs::write(&json_path, ORDER_FLOW).unwrap();
        let file = DefinitionFile::from_file(&json_path).unwrap();
        assert_eq!(file.keys(), vec!["orders"]);

        let yaml_path = dir.path().join("machines.yml");
        std::fs::write(
            &yaml_path,
            "m:\n  definition:\n    StartAt: A\n    States:\n      A:\n        Type: Succeed\n",
        )
        .unwrap();
        let file = DefinitionFile::from_file(&yaml_path).unwrap();
        assert!(file.find("m").is_some());
    }

    #[test]
    fn test_from_file_missing() {
        let err = DefinitionFile::from_file(Path::new("/nonexistent/machines.json")).unwrap_err();
        assert!(matches!(err, DefinitionError::Read { .. }));
    }

    #[test]
    fn test_find_by_arn() {
        let file = DefinitionFile::from_json(ORDER_FLOW).unwrap();
        let arn = "arn:aws:states:us-east-1:000000000000:stateMachine:OrderFlow";
        let (key, _) = file.find_by_arn(arn).unwrap();
        assert_eq!(key, "orders");
        assert!(file.find_by_arn("arn:aws:states:::stateMachine:Other").is_none());
    }

    #[test]
    fn test_unknown_state_type_parses() {
        let state: StateDefinition =
            serde_json::from_value(json!({"Type": "Map", "End": true})).unwrap();
        assert_eq!(state.state_type, StateType::Unknown);
    }

    #[test]
    fn test_state_lookup_missing() {
        let file = DefinitionFile::from_json(ORDER_FLOW).unwrap();
        let (_, machine) = file.find("orders").unwrap();
        let err = machine.definition.state("Nope").unwrap_err();
        assert!(matches!(err, ExecutionError::StateNotFound(name) if name == "Nope"));
    }

    #[test]
    fn test_rule_matching() {
        let any = RetryRule::default();
        assert!(any.matches("Whatever"));
        assert_eq!(any.max_attempts(), DEFAULT_MAX_ATTEMPTS);

        let specific = RetryRule {
            error_equals: Some(vec!["Timeout".into()]),
            ..Default::default()
        };
        assert!(specific.matches("Timeout"));
        assert!(!specific.matches("Other"));

        let all = CatchRule {
            error_equals: Some(vec![ERROR_ALL.into()]),
            next: "X".into(),
            result_path: PathSpec::Omitted,
        };
        assert!(all.matches("Anything"));
    }

    #[test]
    fn test_retrier_and_catcher_pick_first_match() {
        let mut state = StateDefinition::new(StateType::Task);
        state.retry = vec![
            RetryRule {
                error_equals: Some(vec!["Timeout".into()]),
                max_attempts: Some(5),
                ..Default::default()
            },
            RetryRule {
                max_attempts: Some(1),
                ..Default::default()
            },
        ];
        assert_eq!(state.retrier_for("Timeout").unwrap().max_attempts(), 5);
        assert_eq!(state.retrier_for("Boom").unwrap().max_attempts(), 1);
        assert!(state.catcher_for("Boom").is_none());
    }

    #[test]
    fn test_valid_definition_validates() {
        let file = DefinitionFile::from_json(ORDER_FLOW).unwrap();
        file.validate().unwrap();
    }

    #[test]
    fn test_validate_unknown_start() {
        let def: StateMachineDefinition = serde_json::from_value(json!({
            "StartAt": "Missing",
            "States": { "A": { "Type": "Succeed" } }
        }))
        .unwrap();
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("StartAt 'Missing'"));
    }

    #[test]
    fn test_validate_unknown_next() {
        let def: StateMachineDefinition = serde_json::from_value(json!({
            "StartAt": "A",
            "States": { "A": { "Type": "Pass", "Next": "B" } }
        }))
        .unwrap();
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("unknown state 'B'"));
    }

    #[test]
    fn test_validate_missing_transition() {
        let def: StateMachineDefinition = serde_json::from_value(json!({
            "StartAt": "A",
            "States": { "A": { "Type": "Task", "Resource": "x" } }
        }))
        .unwrap();
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("must have either"));
    }

    #[test]
    fn test_validate_choice_targets() {
        let def: StateMachineDefinition = serde_json::from_value(json!({
            "StartAt": "Pick",
            "States": {
                "Pick": {
                    "Type": "Choice",
                    "Choices": [{ "Variable": "$.x", "NumericEquals": 1, "Next": "Ghost" }],
                    "Default": "Done"
                },
                "Done": { "Type": "Succeed" }
            }
        }))
        .unwrap();
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("Choice rule"));
    }

    #[test]
    fn test_validate_file_names_machine() {
        let file = DefinitionFile::from_json(
            r#"{"broken": {"definition": {"StartAt": "A", "States": {"A": {"Type": "Map", "End": true}}}}}"#,
        )
        .unwrap();
        let err = file.validate().unwrap_err();
        assert!(err.to_string().contains("State machine 'broken'"));
    }

    #[test]
    fn test_roundtrip_serialize_keeps_null_paths() {
        let file = DefinitionFile::from_json(ORDER_FLOW).unwrap();
        let serialized = serde_json::to_string(&file).unwrap();
        let parsed_back = DefinitionFile::from_json(&serialized).unwrap();
        let (_, machine) = parsed_back.find("orders").unwrap();
        let charge = machine.definition.state("Charge").unwrap();
        assert_eq!(charge.output_path, PathSpec::Null);
        assert_eq!(charge.input_path, PathSpec::path("$.order"));
    }
}
