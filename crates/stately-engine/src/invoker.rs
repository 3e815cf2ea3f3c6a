//! Task invocation seam.
//!
//! The executor never calls user code directly. A Task state is handed to a
//! [`TaskInvoker`], which routes it either to a built-in service integration
//! (resources starting with [`SERVICE_RESOURCE_PREFIX`]) or to a registered
//! handler.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::handler::HandlerRegistry;
use crate::protocol::InvocationContext;
use crate::service::ServiceRegistry;

/// Resource prefix that selects a built-in service integration.
pub const SERVICE_RESOURCE_PREFIX: &str = "arn:aws:states:::";

/// Returns true when `resource` names a service integration.
pub fn is_service_resource(resource: &str) -> bool {
    resource.starts_with(SERVICE_RESOURCE_PREFIX)
}

/// Failure raised by a task. These are the only recoverable errors.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The handler or integration ran and reported an error.
    #[error("{name}: {message}")]
    Failed {
        name: String,
        message: String,
        trace: Option<String>,
    },

    /// No integration is registered for the resource.
    #[error("No service integration registered for resource '{0}'")]
    UnknownService(String),

    /// No handler is registered under the name.
    #[error("No handler registered as '{0}'")]
    UnknownHandler(String),
}

impl TaskError {
    /// A named failure with a message.
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        TaskError::Failed {
            name: name.into(),
            message: message.into(),
            trace: None,
        }
    }

    /// Attach a trace to a `Failed` error. Other variants are returned unchanged.
    pub fn with_trace(self, trace: impl Into<String>) -> Self {
        match self {
            TaskError::Failed { name, message, .. } => TaskError::Failed {
                name,
                message,
                trace: Some(trace.into()),
            },
            other => other,
        }
    }

    /// Name matched against `ErrorEquals`.
    pub fn error_name(&self) -> &str {
        match self {
            TaskError::Failed { name, .. } => name,
            TaskError::UnknownService(_) => "UnknownServiceError",
            TaskError::UnknownHandler(_) => "UnknownHandlerError",
        }
    }

    /// Message without the error name.
    pub fn message(&self) -> String {
        match self {
            TaskError::Failed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn trace(&self) -> Option<&str> {
        match self {
            TaskError::Failed { trace, .. } => trace.as_deref(),
            _ => None,
        }
    }
}

/// Runs the work behind Task states.
#[async_trait]
pub trait TaskInvoker: Send + Sync {
    /// Call the built-in integration identified by `resource`.
    async fn invoke_service(&self, resource: &str, input: Value) -> Result<Value, TaskError>;

    /// Call the user handler identified by `handler`.
    async fn invoke_handler(
        &self,
        handler: &str,
        input: Value,
        context: &InvocationContext,
    ) -> Result<Value, TaskError>;
}

/// Invoker backed by a service registry and a handler registry.
#[derive(Clone, Default)]
pub struct RegistryInvoker {
    services: ServiceRegistry,
    handlers: HandlerRegistry,
}

impl RegistryInvoker {
    pub fn new(services: ServiceRegistry, handlers: HandlerRegistry) -> Self {
        Self { services, handlers }
    }

    /// The registered service integrations.
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// The registered handlers.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }
}

impl std::fmt::Debug for RegistryInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryInvoker")
            .field("services", &self.services.resources())
            .field("handlers", &self.handlers.names())
            .finish()
    }
}

#[async_trait]
impl TaskInvoker for RegistryInvoker {
    async fn invoke_service(&self, resource: &str, input: Value) -> Result<Value, TaskError> {
        let service = self
            .services
            .get(resource)
            .ok_or_else(|| TaskError::UnknownService(resource.to_string()))?;
        debug!(resource, "Invoking service integration");
        service.call(input).await
    }

    async fn invoke_handler(
        &self,
        handler: &str,
        input: Value,
        context: &InvocationContext,
    ) -> Result<Value, TaskError> {
        let task_handler = self
            .handlers
            .get(handler)
            .ok_or_else(|| TaskError::UnknownHandler(handler.to_string()))?;
        debug!(handler, execution_arn = %context.execution_arn, "Invoking handler");
        task_handler.handle(input, context).await
    }
}
