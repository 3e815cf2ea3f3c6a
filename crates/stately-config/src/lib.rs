//! Configuration system for Stately.
//!
//! Provides TOML-based configuration with:
//! - Server bind address and port (`[server]`)
//! - The state machine definition file (`[definitions]`)
//! - Built-in service integrations (`[services.sqs]`)
//! - Named command handlers (`[handlers.<name>]`)
//! - Log level and JSON log directory (`[logging]`)
//! - Config file layering (user config + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    LoadedConfig, load_config, load_config_file, load_config_with_options, user_config_dir,
    user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
