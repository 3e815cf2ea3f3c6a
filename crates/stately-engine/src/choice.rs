//! Choice state evaluation.
//!
//! The executor treats the rules of a Choice state as opaque and asks a
//! [`ChoiceEvaluator`] for the name of the next state. [`RuleEvaluator`] is the
//! default collaborator and understands the usual rule language:
//!
//! ```json
//! {
//!   "Choices": [
//!     { "Variable": "$.total", "NumericGreaterThan": 100, "Next": "Review" },
//!     { "And": [
//!         { "Variable": "$.country", "StringEquals": "NL" },
//!         { "Not": { "Variable": "$.express", "BooleanEquals": true } }
//!       ],
//!       "Next": "Slow" }
//!   ],
//!   "Default": "Ship"
//! }
//! ```

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::definition::StateDefinition;
use crate::path::JsonPath;

/// Errors from choice evaluation. These are never recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChoiceError {
    /// No rule matched and there is no `Default`.
    #[error("no choice rule matched and no Default is set")]
    NoChoiceMatched,

    /// A rule is malformed.
    #[error("choice rule {index} is invalid: {reason}")]
    InvalidRule { index: usize, reason: String },
}

/// Picks the next state of a Choice state.
pub trait ChoiceEvaluator: Send + Sync {
    /// Name of the state to continue with, given the effective input.
    fn next_state(&self, state: &StateDefinition, input: &Value) -> Result<String, ChoiceError>;
}

/// Evaluates `Choices` in order; the first matching rule wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleEvaluator;

impl RuleEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ChoiceEvaluator for RuleEvaluator {
    fn next_state(&self, state: &StateDefinition, input: &Value) -> Result<String, ChoiceError> {
        for (index, rule) in state.choices.iter().enumerate() {
            let invalid = |reason: String| ChoiceError::InvalidRule { index, reason };

            let next = rule
                .get("Next")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("missing Next".to_string()))?;

            if evaluate(rule, input).map_err(invalid)? {
                debug!(rule = index, next, "Choice rule matched");
                return Ok(next.to_string());
            }
        }

        match &state.default {
            Some(default) => {
                debug!(next = %default, "No choice rule matched, using Default");
                Ok(default.clone())
            }
            None => Err(ChoiceError::NoChoiceMatched),
        }
    }
}

// ---------------------------------------------------------------------------
// Rule evaluation
// ---------------------------------------------------------------------------

/// Keys that never name a comparison.
const RESERVED_KEYS: &[&str] = &["Variable", "Next", "Comment"];

fn evaluate(rule: &Value, input: &Value) -> Result<bool, String> {
    let Value::Object(fields) = rule else {
        return Err("rule must be an object".to_string());
    };

    if let Some(rules) = fields.get("And") {
        let rules = rules.as_array().ok_or("And must be an array")?;
        for inner in rules {
            if !evaluate(inner, input)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }
    if let Some(rules) = fields.get("Or") {
        let rules = rules.as_array().ok_or("Or must be an array")?;
        for inner in rules {
            if evaluate(inner, input)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    if let Some(inner) = fields.get("Not") {
        return Ok(!evaluate(inner, input)?);
    }

    let variable = fields
        .get("Variable")
        .and_then(Value::as_str)
        .ok_or("missing Variable")?;
    let (operator, operand) = fields
        .iter()
        .find(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .ok_or("missing comparison operator")?;

    let path = JsonPath::parse(variable).map_err(|e| e.to_string())?;
    let value = path.select(input);
    compare(operator, operand, value, input)
}

fn compare(
    operator: &str,
    operand: &Value,
    value: Option<&Value>,
    input: &Value,
) -> Result<bool, String> {
    if operator == "IsPresent" {
        return Ok(value.is_some() == expect_bool(operator, operand)?);
    }

    let Some(value) = value else {
        return Ok(false);
    };

    match operator {
        "IsNull" => return Ok(value.is_null() == expect_bool(operator, operand)?),
        "IsString" => return Ok(value.is_string() == expect_bool(operator, operand)?),
        "IsNumeric" => return Ok(value.is_number() == expect_bool(operator, operand)?),
        "IsBoolean" => return Ok(value.is_boolean() == expect_bool(operator, operand)?),
        "IsTimestamp" => {
            let is_timestamp = value.as_str().and_then(parse_timestamp).is_some();
            return Ok(is_timestamp == expect_bool(operator, operand)?);
        }
        _ => {}
    }

    // `…Path` comparisons take their comparand from the input.
    let (operator, comparand) = match operator.strip_suffix("Path") {
        Some(base) => {
            let path = operand
                .as_str()
                .ok_or_else(|| format!("{operator} must be a path string"))?;
            let path = JsonPath::parse(path).map_err(|e| e.to_string())?;
            match path.select(input) {
                Some(found) => (base, found),
                None => return Ok(false),
            }
        }
        None => (operator, operand),
    };

    if operator == "StringMatches" {
        let pattern = comparand
            .as_str()
            .ok_or("StringMatches needs a string pattern")?;
        return Ok(value.as_str().is_some_and(|s| wildcard_match(pattern, s)));
    }

    if operator == "BooleanEquals" {
        return Ok(match (value.as_bool(), comparand.as_bool()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        });
    }

    let (family, relation) = split_operator(operator)?;
    let ordering = match family {
        "String" => match (value.as_str(), comparand.as_str()) {
            (Some(a), Some(b)) => Some(a.cmp(b)),
            _ => None,
        },
        "Numeric" => match (value.as_f64(), comparand.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
        "Timestamp" => match (
            value.as_str().and_then(parse_timestamp),
            comparand.as_str().and_then(parse_timestamp),
        ) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => None,
        },
        _ => None,
    };

    Ok(ordering.is_some_and(|ordering| relation_holds(relation, ordering)))
}

fn expect_bool(operator: &str, operand: &Value) -> Result<bool, String> {
    operand
        .as_bool()
        .ok_or_else(|| format!("{operator} must be a boolean"))
}

fn split_operator(operator: &str) -> Result<(&'static str, &str), String> {
    for family in ["String", "Numeric", "Timestamp"] {
        if let Some(relation) = operator.strip_prefix(family) {
            if matches!(
                relation,
                "Equals" | "LessThan" | "GreaterThan" | "LessThanEquals" | "GreaterThanEquals"
            ) {
                return Ok((family, relation));
            }
        }
    }
    Err(format!("unknown comparison operator '{operator}'"))
}

fn relation_holds(relation: &str, ordering: Ordering) -> bool {
    match relation {
        "Equals" => ordering == Ordering::Equal,
        "LessThan" => ordering == Ordering::Less,
        "GreaterThan" => ordering == Ordering::Greater,
        "LessThanEquals" => ordering != Ordering::Greater,
        "GreaterThanEquals" => ordering != Ordering::Less,
        _ => false,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}

/// Match `text` against a pattern where `*` matches any run of characters
/// and `\*` matches a literal asterisk.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    // Tokenize: Some(c) is a literal, None is a wildcard.
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => tokens.push(Some(escaped)),
                None => tokens.push(Some('\\')),
            },
            '*' => tokens.push(None),
            other => tokens.push(Some(other)),
        }
    }

    let text: Vec<char> = text.chars().collect();
    let (mut t, mut p) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match tokens.get(p) {
            Some(Some(c)) if *c == text[t] => {
                t += 1;
                p += 1;
            }
            Some(None) => {
                backtrack = Some((p, t));
                p += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    tokens[p..].iter().all(Option::is_none)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StateType;
    use serde_json::json;

    fn choice_state(choices: Value, default: Option<&str>) -> StateDefinition {
        let mut state = StateDefinition::new(StateType::Choice);
        state.choices = choices.as_array().unwrap().clone();
        state.default = default.map(str::to_string);
        state
    }

    fn next(choices: Value, default: Option<&str>, input: Value) -> Result<String, ChoiceError> {
        RuleEvaluator::new().next_state(&choice_state(choices, default), &input)
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let choices = json!([
            { "Variable": "$.n", "NumericGreaterThan": 10, "Next": "Big" },
            { "Variable": "$.n", "NumericGreaterThan": 0, "Next": "Small" }
        ]);
        assert_eq!(next(choices.clone(), None, json!({"n": 20})).unwrap(), "Big");
        assert_eq!(next(choices.clone(), None, json!({"n": 5})).unwrap(), "Small");
        assert_eq!(
            next(choices, Some("Zero"), json!({"n": 0})).unwrap(),
            "Zero"
        );
    }

    #[test]
    fn test_no_match_without_default() {
        let choices = json!([{ "Variable": "$.n", "NumericEquals": 1, "Next": "One" }]);
        assert_eq!(
            next(choices, None, json!({"n": 2})).unwrap_err(),
            ChoiceError::NoChoiceMatched
        );
    }

    #[test]
    fn test_missing_variable_is_false() {
        let choices = json!([
            { "Variable": "$.missing", "StringEquals": "x", "Next": "A" },
            { "Not": { "Variable": "$.missing", "IsPresent": true }, "Next": "B" }
        ]);
        assert_eq!(next(choices, None, json!({})).unwrap(), "B");
    }

    #[test]
    fn test_string_comparisons() {
        let choices = json!([
            { "Variable": "$.s", "StringLessThan": "m", "Next": "Early" },
            { "Variable": "$.s", "StringGreaterThanEquals": "m", "Next": "Late" }
        ]);
        assert_eq!(next(choices.clone(), None, json!({"s": "apple"})).unwrap(), "Early");
        assert_eq!(next(choices, None, json!({"s": "zebra"})).unwrap(), "Late");
    }

    #[test]
    fn test_combinators() {
        let choices = json!([{
            "And": [
                { "Variable": "$.country", "StringEquals": "NL" },
                { "Or": [
                    { "Variable": "$.total", "NumericGreaterThanEquals": 100 },
                    { "Variable": "$.vip", "BooleanEquals": true }
                ]}
            ],
            "Next": "Priority"
        }]);
        assert_eq!(
            next(choices.clone(), Some("Normal"), json!({"country": "NL", "total": 5, "vip": true}))
                .unwrap(),
            "Priority"
        );
        assert_eq!(
            next(choices, Some("Normal"), json!({"country": "BE", "total": 500})).unwrap(),
            "Normal"
        );
    }

    #[test]
    fn test_path_comparisons() {
        let choices = json!([
            { "Variable": "$.spent", "NumericGreaterThanPath": "$.budget", "Next": "Over" }
        ]);
        assert_eq!(
            next(choices.clone(), Some("Ok"), json!({"spent": 12, "budget": 10})).unwrap(),
            "Over"
        );
        assert_eq!(
            next(choices, Some("Ok"), json!({"spent": 12})).unwrap(),
            "Ok"
        );
    }

    #[test]
    fn test_timestamp_comparisons() {
        let choices = json!([{
            "Variable": "$.at",
            "TimestampLessThan": "2024-01-01T00:00:00Z",
            "Next": "Before"
        }]);
        assert_eq!(
            next(choices.clone(), Some("After"), json!({"at": "2023-06-01T12:00:00+02:00"})).unwrap(),
            "Before"
        );
        assert_eq!(
            next(choices.clone(), Some("After"), json!({"at": "2024-06-01T00:00:00Z"})).unwrap(),
            "After"
        );
        assert_eq!(
            next(choices, Some("After"), json!({"at": "not a time"})).unwrap(),
            "After"
        );
    }

    #[test]
    fn test_type_checks() {
        let choices = json!([
            { "Variable": "$.v", "IsNull": true, "Next": "Null" },
            { "Variable": "$.v", "IsNumeric": true, "Next": "Number" },
            { "Variable": "$.v", "IsTimestamp": true, "Next": "Time" },
            { "Variable": "$.v", "IsString": true, "Next": "String" },
            { "Variable": "$.v", "IsBoolean": true, "Next": "Bool" }
        ]);
        assert_eq!(next(choices.clone(), None, json!({"v": null})).unwrap(), "Null");
        assert_eq!(next(choices.clone(), None, json!({"v": 1.5})).unwrap(), "Number");
        assert_eq!(
            next(choices.clone(), None, json!({"v": "2024-01-01T00:00:00Z"})).unwrap(),
            "Time"
        );
        assert_eq!(next(choices.clone(), None, json!({"v": "text"})).unwrap(), "String");
        assert_eq!(next(choices, None, json!({"v": false})).unwrap(), "Bool");
    }

    #[test]
    fn test_string_matches() {
        assert!(wildcard_match("*.log", "server.log"));
        assert!(wildcard_match("a*b*c", "a123b456c"));
        assert!(!wildcard_match("a*b", "a123c"));
        assert!(wildcard_match(r"literal\*", "literal*"));
        assert!(!wildcard_match(r"literal\*", "literalX"));
        assert!(wildcard_match("*", ""));

        let choices = json!([{ "Variable": "$.file", "StringMatches": "*.csv", "Next": "Csv" }]);
        assert_eq!(
            next(choices, Some("Other"), json!({"file": "data.csv"})).unwrap(),
            "Csv"
        );
    }

    #[test]
    fn test_invalid_rules() {
        let missing_next = json!([{ "Variable": "$.n", "NumericEquals": 1 }]);
        assert!(matches!(
            next(missing_next, None, json!({"n": 1})).unwrap_err(),
            ChoiceError::InvalidRule { index: 0, .. }
        ));

        let unknown_op = json!([{ "Variable": "$.n", "NumericIsBig": 1, "Next": "X" }]);
        assert!(matches!(
            next(unknown_op, None, json!({"n": 1})).unwrap_err(),
            ChoiceError::InvalidRule { .. }
        ));
    }
}
