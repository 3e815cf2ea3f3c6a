//! Per-run execution state.
//!
//! An `ExecutionContext` is created once per run and owned exclusively by it.
//! It tracks which state is current, the data value flowing into that state,
//! and the retry counter scoped to the current state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::definition::{StateDefinition, StateMachineDefinition};
use crate::error::{ExecutionError, Result};

/// Build the run identifier `"{machine}-{state}-{start millis}"`.
///
/// Two runs of the same machine and state started within the same
/// millisecond get the same identifier.
pub fn execution_arn(machine_name: &str, start_state: &str, start_date: DateTime<Utc>) -> String {
    format!(
        "{machine_name}-{start_state}-{}",
        start_date.timestamp_millis()
    )
}

/// The mutable record of one run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    execution_arn: String,
    machine_name: String,
    state_machine: Arc<StateMachineDefinition>,
    current_state: String,
    start_date: DateTime<Utc>,
    retry_count: u32,
    input: Value,
}

impl ExecutionContext {
    /// Create a context positioned at `start_state`, stamped with the current time.
    pub fn new(
        machine_name: impl Into<String>,
        state_machine: Arc<StateMachineDefinition>,
        start_state: impl Into<String>,
        input: Value,
    ) -> Self {
        Self::with_start_date(machine_name, state_machine, start_state, input, Utc::now())
    }

    /// Create a context with an explicit start time.
    pub fn with_start_date(
        machine_name: impl Into<String>,
        state_machine: Arc<StateMachineDefinition>,
        start_state: impl Into<String>,
        input: Value,
        start_date: DateTime<Utc>,
    ) -> Self {
        let machine_name = machine_name.into();
        let current_state = start_state.into();
        Self {
            execution_arn: execution_arn(&machine_name, &current_state, start_date),
            machine_name,
            state_machine,
            current_state,
            start_date,
            retry_count: 0,
            input,
        }
    }

    pub fn execution_arn(&self) -> &str {
        &self.execution_arn
    }

    pub fn machine_name(&self) -> &str {
        &self.machine_name
    }

    pub fn state_machine(&self) -> &Arc<StateMachineDefinition> {
        &self.state_machine
    }

    pub fn current_state(&self) -> &str {
        &self.current_state
    }

    pub fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    /// Retries already spent on the current state.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// The value entering the current state, before any transform.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Definition of the current state.
    pub fn current_definition(&self) -> Result<&StateDefinition> {
        self.state_machine.state(&self.current_state)
    }

    /// Count one more retry of the current state and return the new total.
    pub fn record_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    /// Move to `next` with `input` as its incoming value.
    ///
    /// Fails without moving when `next` is not a state of this machine.
    pub fn advance(&mut self, next: &str, input: Value) -> Result<()> {
        if !self.state_machine.has_state(next) {
            return Err(ExecutionError::StateNotFound(next.to_string()));
        }
        self.current_state = next.to_string();
        self.input = input;
        self.retry_count = 0;
        Ok(())
    }

    /// Consume the context, returning the last input.
    pub fn into_input(self) -> Value {
        self.input
    }
}
