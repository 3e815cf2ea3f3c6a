//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [server]                 # bind address and port
//! [definitions]            # state machine definition file
//! [services.sqs]           # queue transport for sqs:sendMessage
//! [handlers.charge]        # one command handler per table
//! [logging]                # log level and JSON log directory
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Default server port.
pub const DEFAULT_PORT: u16 = 8014;

/// Default bind address.
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Default timeout for command handlers, in seconds.
pub const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 30;

/// Default timeout for HTTP queue requests, in seconds.
pub const DEFAULT_QUEUE_TIMEOUT_SECS: u64 = 10;

/// Default number of messages the in-memory transport keeps per queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatelyConfig {
    /// Server configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    /// Definition file location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definitions: Option<DefinitionsConfig>,

    /// Service integration settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<ServicesConfig>,

    /// Command handlers by name.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub handlers: HashMap<String, HandlerConfig>,

    /// Logging configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

impl StatelyConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections replace wholesale; handlers merge by name.
    pub fn merge(&mut self, other: StatelyConfig) {
        if other.server.is_some() {
            self.server = other.server;
        }

        if other.definitions.is_some() {
            self.definitions = other.definitions;
        }

        if other.services.is_some() {
            self.services = other.services;
        }

        for (name, handler) in other.handlers {
            self.handlers.insert(name, handler);
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// The server section, or defaults.
    pub fn server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    /// The SQS section, or defaults.
    pub fn sqs(&self) -> SqsConfig {
        self.services
            .as_ref()
            .map(|s| s.sqs.clone())
            .unwrap_or_default()
    }

    /// The logging section, or defaults.
    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Configured definition file, if any.
    pub fn definitions_path(&self) -> Option<&PathBuf> {
        self.definitions.as_ref().and_then(|d| d.path.as_ref())
    }

    /// Check every handler entry.
    pub fn validate(&self) -> Result<()> {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        for name in names {
            self.handlers[name].validate(name)?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to listen on.
    pub port: u16,
    /// Address to bind to.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Definitions
// ─────────────────────────────────────────────────────────────────────────────

/// Where state machine definitions are loaded from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefinitionsConfig {
    /// JSON or YAML definition file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Services
// ─────────────────────────────────────────────────────────────────────────────

/// Built-in service integration settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub sqs: SqsConfig,
}

/// How `sqs:sendMessage` delivers messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueTransportKind {
    /// Keep messages in process memory.
    #[default]
    Memory,
    /// Post to the queue URL over HTTP.
    Http,
}

/// `[services.sqs]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqsConfig {
    pub transport: QueueTransportKind,
    /// Request timeout for the HTTP transport.
    pub timeout_secs: u64,
    /// Messages kept per queue by the memory transport.
    pub memory_capacity: usize,
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            transport: QueueTransportKind::Memory,
            timeout_secs: DEFAULT_QUEUE_TIMEOUT_SECS,
            memory_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// A command handler entry (`[handlers.<name>]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Executable to run.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Working directory for the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Static environment for the process; state overrides win.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Per-invocation timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl HandlerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            timeout_secs: None,
        }
    }

    /// Effective timeout in seconds.
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(DEFAULT_HANDLER_TIMEOUT_SECS)
    }

    /// Check that the entry can be turned into a runnable handler.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::InvalidHandler {
                name: name.to_string(),
                reason: "command is empty".to_string(),
            });
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::InvalidHandler {
                name: name.to_string(),
                reason: "timeout_secs must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Console filter directive (e.g. `info`, `stately_engine=debug`).
    pub level: String,
    /// Directory for daily-rotated JSON log files. Unset disables file logging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_dir: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[server]
port = 9000
bind = "0.0.0.0"

[definitions]
path = "machines.yml"

[services.sqs]
transport = "http"
timeout_secs = 5
memory_capacity = 50

[handlers.charge]
command = "./handlers/charge.sh"
args = ["--mode", "test"]
env = { CURRENCY = "EUR" }
timeout_secs = 10

[handlers.notify]
command = "notify"

[logging]
level = "debug"
json_dir = "/var/log/stately"
"#;

    #[test]
    fn test_parse_full_config() {
        let config = StatelyConfig::from_toml(FULL).unwrap();

        assert_eq!(config.server().port, 9000);
        assert_eq!(config.server().bind, "0.0.0.0");
        assert_eq!(
            config.definitions_path(),
            Some(&PathBuf::from("machines.yml"))
        );
        assert_eq!(config.sqs().transport, QueueTransportKind::Http);
        assert_eq!(config.sqs().timeout_secs, 5);
        assert_eq!(config.sqs().memory_capacity, 50);

        let charge = &config.handlers["charge"];
        assert_eq!(charge.command, "./handlers/charge.sh");
        assert_eq!(charge.args, vec!["--mode", "test"]);
        assert_eq!(charge.env["CURRENCY"], "EUR");
        assert_eq!(charge.timeout_secs(), 10);
        assert_eq!(
            config.handlers["notify"].timeout_secs(),
            DEFAULT_HANDLER_TIMEOUT_SECS
        );

        assert_eq!(config.logging().level, "debug");
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config_defaults() {
        let config = StatelyConfig::from_toml("").unwrap();
        assert_eq!(config.server(), ServerConfig::default());
        assert_eq!(config.server().port, DEFAULT_PORT);
        assert_eq!(config.sqs().transport, QueueTransportKind::Memory);
        assert_eq!(config.sqs().memory_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.logging().level, "info");
        assert!(config.definitions_path().is_none());
        assert!(config.handlers.is_empty());
    }

    #[test]
    fn test_partial_server_section() {
        let config = StatelyConfig::from_toml("[server]\nport = 1234\n").unwrap();
        assert_eq!(config.server().port, 1234);
        assert_eq!(config.server().bind, DEFAULT_BIND);
    }

    #[test]
    fn test_handler_requires_command() {
        let err = StatelyConfig::from_toml("[handlers.x]\nargs = []\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let mut config = StatelyConfig::new();
        config
            .handlers
            .insert("blank".to_string(), HandlerConfig::new("  "));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("handler 'blank'"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = StatelyConfig::new();
        let mut handler = HandlerConfig::new("run");
        handler.timeout_secs = Some(0);
        config.handlers.insert("slow".to_string(), handler);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_transport_rejected() {
        let err = StatelyConfig::from_toml("[services.sqs]\ntransport = \"carrier-pigeon\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_merge_overrides_sections_and_handlers() {
        let mut base = StatelyConfig::from_toml(FULL).unwrap();
        let overlay = StatelyConfig::from_toml(
            r#"
[server]
port = 7000

[handlers.charge]
command = "./other.sh"

[handlers.refund]
command = "./refund.sh"
"#,
        )
        .unwrap();

        base.merge(overlay);

        assert_eq!(base.server().port, 7000);
        assert_eq!(base.server().bind, DEFAULT_BIND);
        assert_eq!(base.handlers["charge"].command, "./other.sh");
        assert!(base.handlers.contains_key("notify"));
        assert!(base.handlers.contains_key("refund"));
        assert_eq!(base.sqs().transport, QueueTransportKind::Http);
        assert_eq!(base.logging().level, "debug");
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = StatelyConfig::from_toml(FULL).unwrap();
        let serialized = config.to_toml().unwrap();
        let parsed = StatelyConfig::from_toml(&serialized).unwrap();
        assert_eq!(parsed, config);
    }
}
