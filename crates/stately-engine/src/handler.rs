//! Task handlers and the handler registry.
//!
//! Handlers are the user code behind Task states. Two implementations ship
//! with the engine:
//!
//! - [`FnHandler`] wraps an async closure (embedding, tests)
//! - [`CommandHandler`] runs an executable speaking the JSON protocol in
//!   [`crate::protocol`]
//!
//! ## Command protocol
//!
//! **stdin** (JSON): a [`HandlerInput`] with the effective input and the
//! invocation context.
//!
//! **stdout** (JSON): a [`HandlerOutput`]; `{"status": "ok", "output": ...}`
//! or `{"status": "error", "errorType": "...", "error": "..."}`.
//!
//! **stderr**: captured and logged via tracing.
//!
//! **exit code**: non-zero is treated as a task failure.
//!
//! The state's `environment` overrides are set on the child process only.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::invoker::TaskError;
use crate::protocol::{HandlerInput, HandlerOutput, InvocationContext};

/// Default timeout for handler subprocesses.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// User code invoked by Task states.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Name the handler is registered under.
    fn name(&self) -> &str;

    /// Run the handler on the effective state input.
    async fn handle(&self, input: Value, context: &InvocationContext) -> Result<Value, TaskError>;
}

// ---------------------------------------------------------------------------
// Closure handlers
// ---------------------------------------------------------------------------

/// Type alias for the async function behind an [`FnHandler`].
///
/// Takes the input and an owned copy of the context.
pub type HandlerFn = Arc<
    dyn Fn(Value, InvocationContext) -> BoxFuture<'static, Result<Value, TaskError>>
        + Send
        + Sync,
>;

/// A handler backed by an async closure.
#[derive(Clone)]
pub struct FnHandler {
    name: String,
    func: HandlerFn,
}

impl FnHandler {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(move |input, context| func(input, context).boxed()),
        }
    }
}

impl std::fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

#[async_trait]
impl TaskHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, input: Value, context: &InvocationContext) -> Result<Value, TaskError> {
        (self.func)(input, context.clone()).await
    }
}

// ---------------------------------------------------------------------------
// Subprocess handlers
// ---------------------------------------------------------------------------

/// A handler backed by an executable using the JSON stdin/stdout protocol.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    name: String,
    command: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    /// Base environment from configuration; state overrides win.
    env: HashMap<String, String>,
    timeout: Duration,
}

impl CommandHandler {
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set the subprocess timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn failure(&self, kind: &str, message: String) -> TaskError {
        TaskError::failed(kind, format!("handler '{}': {message}", self.name))
    }
}

#[async_trait]
impl TaskHandler for CommandHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, input: Value, context: &InvocationContext) -> Result<Value, TaskError> {
        let envelope = HandlerInput {
            input,
            context: context.clone(),
        };
        let stdin_json = serde_json::to_vec(&envelope)
            .map_err(|e| self.failure("HandlerProtocolError", e.to_string()))?;

        let mut command = tokio::process::Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .envs(&self.env)
            .envs(&context.environment);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            self.failure(
                "HandlerSpawnError",
                format!("failed to spawn {}: {e}", self.command.display()),
            )
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&stdin_json).await;
            let _ = stdin.shutdown().await;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(self.failure("HandlerProcessError", e.to_string())),
            Err(_) => {
                warn!(handler = %self.name, timeout_ms = self.timeout.as_millis() as u64, "Handler timed out");
                return Err(self.failure(
                    "States.Timeout",
                    format!("timed out after {}ms", self.timeout.as_millis()),
                ));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            debug!(handler = %self.name, stderr = %stderr.trim(), "Handler stderr");
        }

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            let message = if stderr.trim().is_empty() {
                format!("exited with code {exit_code}")
            } else {
                format!("exited with code {exit_code}: {}", stderr.trim())
            };
            return Err(self.failure("HandlerProcessError", message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let response: HandlerOutput = serde_json::from_str(stdout.trim()).map_err(|e| {
            self.failure("HandlerProtocolError", format!("invalid output envelope: {e}"))
        })?;

        if response.is_ok() {
            return Ok(response.output.unwrap_or(Value::Null));
        }

        let error = TaskError::failed(
            response.error_type.unwrap_or_else(|| "HandlerError".to_string()),
            response
                .error
                .unwrap_or_else(|| "handler reported an error".to_string()),
        );
        Err(match response.trace {
            Some(trace) => error.with_trace(trace),
            None => error,
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Handlers by name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    ///
    /// If a handler with the same name already exists, it will be replaced.
    pub fn register<H: TaskHandler + 'static>(&mut self, handler: H) {
        let name = handler.name().to_string();
        self.handlers.insert(name, Arc::new(handler));
    }

    /// Register a handler from an Arc.
    pub fn register_arc(&mut self, handler: Arc<dyn TaskHandler>) {
        let name = handler.name().to_string();
        self.handlers.insert(name, handler);
    }

    /// Get a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn create_script(dir: &std::path::Path, name: &str, script: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn context_with_env(key: &str, value: &str) -> InvocationContext {
        InvocationContext {
            execution_arn: "m-S-1".into(),
            state_name: "S".into(),
            retry_count: 0,
            environment: HashMap::from([(key.to_string(), value.to_string())]),
        }
    }

    #[tokio::test]
    async fn test_fn_handler_sees_context() {
        let handler = FnHandler::new("ctx", |_input, ctx| async move {
            Ok(json!({"state": ctx.state_name, "mode": ctx.environment.get("MODE")}))
        });
        let out = handler
            .handle(json!({}), &context_with_env("MODE", "dry"))
            .await
            .unwrap();
        assert_eq!(out, json!({"state": "S", "mode": "dry"}));
    }

    #[test]
    fn test_registry_register_and_replace() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        registry.register(FnHandler::new("b", |_i, _c| async { Ok(json!(1)) }));
        registry.register_arc(Arc::new(FnHandler::new("a", |_i, _c| async { Ok(json!(2)) })));
        registry.register(FnHandler::new("b", |_i, _c| async { Ok(json!(3)) }));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.contains("a"));
        assert!(registry.get("c").is_none());
    }

    #[tokio::test]
    async fn test_command_handler_ok() {
        let tmp = TempDir::new().unwrap();
        let script = create_script(
            tmp.path(),
            "ok.sh",
            r#"#!/bin/bash
cat > /dev/null
echo '{"status": "ok", "output": {"greeting": "hello"}}'
"#,
        );
        let handler = CommandHandler::new("ok", script);
        let out = handler
            .handle(json!({}), &InvocationContext::default())
            .await
            .unwrap();
        assert_eq!(out, json!({"greeting": "hello"}));
    }

    #[tokio::test]
    async fn test_command_handler_receives_envelope() {
        let tmp = TempDir::new().unwrap();
        let script = create_script(
            tmp.path(),
            "mirror.sh",
            r#"#!/bin/bash
input=$(cat)
echo "{\"status\": \"ok\", \"output\": $input}"
"#,
        );
        let handler = CommandHandler::new("mirror", script);
        let out = handler
            .handle(json!({"n": 5}), &context_with_env("MODE", "x"))
            .await
            .unwrap();
        assert_eq!(out["input"]["n"], 5);
        assert_eq!(out["context"]["stateName"], "S");
    }

    #[tokio::test]
    async fn test_command_handler_env_overrides_child_only() {
        let tmp = TempDir::new().unwrap();
        let script = create_script(
            tmp.path(),
            "env.sh",
            r#"#!/bin/bash
cat > /dev/null
echo "{\"status\": \"ok\", \"output\": {\"value\": \"$STATELY_TEST_OVERRIDE\", \"base\": \"$BASE_VAR\"}}"
"#,
        );
        let handler = CommandHandler::new("env", script).with_env(HashMap::from([
            ("BASE_VAR".to_string(), "base".to_string()),
            ("STATELY_TEST_OVERRIDE".to_string(), "from-config".to_string()),
        ]));
        let out = handler
            .handle(json!({}), &context_with_env("STATELY_TEST_OVERRIDE", "from-state"))
            .await
            .unwrap();
        assert_eq!(out, json!({"value": "from-state", "base": "base"}));
        assert!(std::env::var("STATELY_TEST_OVERRIDE").is_err());
    }

    #[tokio::test]
    async fn test_command_handler_error_envelope() {
        let tmp = TempDir::new().unwrap();
        let script = create_script(
            tmp.path(),
            "err.sh",
            r#"#!/bin/bash
cat > /dev/null
echo '{"status": "error", "errorType": "PaymentDeclined", "error": "card expired", "trace": "charge()"}'
"#,
        );
        let handler = CommandHandler::new("err", script);
        let err = handler
            .handle(json!({}), &InvocationContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_name(), "PaymentDeclined");
        assert_eq!(err.message(), "card expired");
        assert_eq!(err.trace(), Some("charge()"));
    }

    #[tokio::test]
    async fn test_command_handler_nonzero_exit() {
        let tmp = TempDir::new().unwrap();
        let script = create_script(
            tmp.path(),
            "fail.sh",
            r#"#!/bin/bash
echo "bad thing happened" >&2
exit 3
"#,
        );
        let handler = CommandHandler::new("fail", script);
        let err = handler
            .handle(json!({}), &InvocationContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_name(), "HandlerProcessError");
        assert!(err.message().contains("exited with code 3"));
        assert!(err.message().contains("bad thing happened"));
    }

    #[tokio::test]
    async fn test_command_handler_timeout() {
        let tmp = TempDir::new().unwrap();
        let script = create_script(tmp.path(), "slow.sh", "#!/bin/bash\nsleep 60\n");
        let handler =
            CommandHandler::new("slow", script).with_timeout(Duration::from_millis(100));
        let err = handler
            .handle(json!({}), &InvocationContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_name(), "States.Timeout");
    }

    #[tokio::test]
    async fn test_command_handler_bad_output() {
        let tmp = TempDir::new().unwrap();
        let script = create_script(
            tmp.path(),
            "raw.sh",
            "#!/bin/bash\ncat > /dev/null\necho 'just text'\n",
        );
        let handler = CommandHandler::new("raw", script);
        let err = handler
            .handle(json!({}), &InvocationContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_name(), "HandlerProtocolError");
    }

    #[tokio::test]
    async fn test_command_handler_missing_command() {
        let handler = CommandHandler::new("missing", "/nonexistent/handler.sh");
        let err = handler
            .handle(json!({}), &InvocationContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_name(), "HandlerSpawnError");
    }
}
