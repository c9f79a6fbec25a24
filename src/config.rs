//! Machine configuration types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Default operand stack size in cells
pub const DEFAULT_STACK_CAPACITY: usize = 32 * 256;

/// Default heap size in cells
pub const DEFAULT_HEAP_CAPACITY: usize = 32 * 2560;

/// Default limit on nested calls
pub const DEFAULT_MAX_CALL_DEPTH: usize = 1024;

/// Conventional config file name
pub const CONFIG_FILE_NAME: &str = "stackvm.toml";

/// Error type for loading and saving configuration
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    /// A value that would make the machine unusable
    Invalid(String),
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse config: {}", e),
            ConfigError::Serialize(e) => write!(f, "failed to serialize config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for a [`Machine`](crate::vm::Machine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Operand stack size in cells
    pub stack_capacity: usize,
    /// Heap size in cells
    pub heap_capacity: usize,
    /// Instruction budget per host entry point (None = unlimited)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fuel: Option<u64>,
    /// Deepest allowed nesting of calls
    pub max_call_depth: usize,
    /// Emit a trace event for every executed instruction
    pub trace: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            stack_capacity: DEFAULT_STACK_CAPACITY,
            heap_capacity: DEFAULT_HEAP_CAPACITY,
            fuel: None,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            trace: false,
        }
    }
}

impl MachineConfig {
    /// Reject values the machine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_capacity == 0 {
            return Err(ConfigError::Invalid(
                "stack_capacity must be positive".to_string(),
            ));
        }
        if self.heap_capacity == 0 {
            return Err(ConfigError::Invalid(
                "heap_capacity must be positive".to_string(),
            ));
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::Invalid(
                "max_call_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: MachineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load config from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}
