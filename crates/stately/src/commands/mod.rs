//! CLI command handlers.

pub mod config;
pub mod run;
pub mod serve;
pub mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use tracing::{debug, info};

use stately_config::discovery::ConfigSource;
use stately_config::{LoadedConfig, QueueTransportKind, StatelyConfig};
use stately_engine::{
    CommandHandler, DefinitionFile, Executor, HandlerRegistry, HttpQueueTransport, InMemoryQueue,
    QueueTransport, RegistryInvoker, RuleEvaluator, ServiceRegistry, SqsSendMessage,
};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Verbose output enabled.
    pub verbose: bool,
    /// Resolved configuration and where it came from.
    pub config: LoadedConfig,
}

/// Load the explicit config file, or discover the user and project layers.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    match explicit {
        Some(path) => {
            let config = stately_config::load_config_file(path)?;
            Ok(LoadedConfig {
                config,
                sources: vec![ConfigSource {
                    path: path.to_path_buf(),
                    loaded: true,
                }],
                warnings: Vec::new(),
            })
        }
        None => Ok(stately_config::load_config(None)?),
    }
}

/// Pick the definitions file: the flag wins over `[definitions] path`.
pub fn definitions_path(flag: Option<PathBuf>, config: &StatelyConfig) -> Result<PathBuf> {
    match flag.or_else(|| config.definitions_path().cloned()) {
        Some(path) => Ok(path),
        None => bail!("no definitions file: pass --definitions or set [definitions] path"),
    }
}

/// Load a definitions file.
pub fn load_definitions(path: &Path) -> Result<DefinitionFile> {
    let definitions = DefinitionFile::from_file(path)
        .with_context(|| format!("loading definitions from {}", path.display()))?;
    debug!(path = %path.display(), machines = ?definitions.keys(), "Definitions loaded");
    Ok(definitions)
}

/// Build an executor with the handlers and services named in the config.
pub fn build_executor(config: &StatelyConfig) -> Result<Executor> {
    let mut handlers = HandlerRegistry::new();
    for (name, entry) in &config.handlers {
        entry.validate(name)?;
        let mut handler = CommandHandler::new(name.clone(), &entry.command)
            .with_args(entry.args.clone())
            .with_env(entry.env.clone())
            .with_timeout(Duration::from_secs(entry.timeout_secs()));
        if let Some(cwd) = &entry.cwd {
            handler = handler.with_cwd(cwd);
        }
        handlers.register(handler);
    }

    let sqs = config.sqs();
    let transport: Arc<dyn QueueTransport> = match sqs.transport {
        QueueTransportKind::Memory => {
            Arc::new(InMemoryQueue::with_capacity(sqs.memory_capacity))
        }
        QueueTransportKind::Http => {
            Arc::new(HttpQueueTransport::new(Duration::from_secs(sqs.timeout_secs))?)
        }
    };
    let mut services = ServiceRegistry::new();
    services.register(SqsSendMessage::new(transport));

    info!(
        handlers = ?handlers.names(),
        services = ?services.resources(),
        "Task registry ready"
    );

    Ok(Executor::new(
        Arc::new(RegistryInvoker::new(services, handlers)),
        Arc::new(RuleEvaluator::new()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stately_config::HandlerConfig;

    #[test]
    fn test_definitions_flag_overrides_config() {
        let config = StatelyConfig::from_toml("[definitions]\npath = \"from-config.json\"\n").unwrap();

        let chosen = definitions_path(Some(PathBuf::from("flag.json")), &config).unwrap();
        assert_eq!(chosen, PathBuf::from("flag.json"));

        let fallback = definitions_path(None, &config).unwrap();
        assert_eq!(fallback, PathBuf::from("from-config.json"));
    }

    #[test]
    fn test_definitions_path_required() {
        assert!(definitions_path(None, &StatelyConfig::new()).is_err());
    }

    #[test]
    fn test_build_executor_rejects_empty_handler_command() {
        let mut config = StatelyConfig::new();
        config
            .handlers
            .insert("broken".to_string(), HandlerConfig::new(""));
        assert!(build_executor(&config).is_err());
    }

    #[test]
    fn test_build_executor_with_handlers() {
        let mut config = StatelyConfig::new();
        config
            .handlers
            .insert("echo".to_string(), HandlerConfig::new("cat"));
        assert!(build_executor(&config).is_ok());
    }
}
