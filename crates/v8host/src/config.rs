//! Context configuration.
//!
//! Options come from defaults, an optional TOML file and `V8HOST_*`
//! environment variables, merged in that order.

use std::path::Path;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Environment variable prefix for [`ContextOptions::load`].
pub const ENV_PREFIX: &str = "V8HOST_";

/// Errors from loading or validating [`ContextOptions`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Options applied when an execution context is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    /// Name of the global namespace object holding `print`, `log` and `cb`.
    pub global_name: String,
    /// Capture stack traces for uncaught exceptions.
    pub capture_stack_traces: bool,
    /// Frames captured for uncaught exception messages when
    /// `capture_stack_traces` is set.
    pub stack_trace_limit: i32,
    /// Initial V8 heap size in bytes. Requires `max_heap_size`.
    pub initial_heap_size: Option<usize>,
    /// Maximum V8 heap size in bytes.
    pub max_heap_size: Option<usize>,
    /// Capacity of the command channel used by thread-hosted contexts.
    pub command_buffer: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            global_name: "V8Engine".to_string(),
            capture_stack_traces: true,
            stack_trace_limit: 10,
            initial_heap_size: None,
            max_heap_size: None,
            command_buffer: 32,
        }
    }
}

impl ContextOptions {
    /// Load options from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let options: Self = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(Box::new)?;
        options.validate()?;
        Ok(options)
    }

    /// Check option combinations that V8 would otherwise reject or abort on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global_name.is_empty() {
            return Err(ConfigError::Invalid("global_name must not be empty".into()));
        }
        if self.command_buffer == 0 {
            return Err(ConfigError::Invalid("command_buffer must be at least 1".into()));
        }
        match (self.initial_heap_size, self.max_heap_size) {
            (Some(_), None) => Err(ConfigError::Invalid(
                "initial_heap_size requires max_heap_size to be set as well".into(),
            )),
            (Some(initial), Some(max)) if initial > max => Err(ConfigError::Invalid(format!(
                "initial_heap_size ({}) cannot exceed max_heap_size ({})",
                initial, max
            ))),
            _ => Ok(()),
        }
    }
}
