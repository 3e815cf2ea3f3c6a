//! Application state shared across handlers.

use std::sync::Arc;

use stately_engine::{DefinitionFile, Executor};

use crate::config::ServerConfig;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Runs started executions in the background.
    pub executor: Executor,

    /// Loaded state machines, resolved by ARN per request.
    pub machines: Arc<DefinitionFile>,

    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Create a new application state.
    pub fn new(executor: Executor, machines: DefinitionFile, config: ServerConfig) -> Self {
        Self {
            executor,
            machines: Arc::new(machines),
            config: Arc::new(config),
        }
    }
}
