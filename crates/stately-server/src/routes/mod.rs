//! API routes.

pub mod executions;
pub mod health;

pub use executions::{StartExecutionRequest, StartExecutionResponse, start_execution_handler};
pub use health::{HealthResponse, health_routes};
