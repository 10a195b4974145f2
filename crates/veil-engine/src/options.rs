//! Obfuscation options
//!
//! Options come from an optional `veil.toml`:
//!
//! ```toml
//! mode = "failfast"
//! annotate_types = true
//! dynamic = false
//! seed = 42
//! ```
//!
//! Every key is optional; command line flags override file values.

use crate::error::VeilError;
use crate::strategy::StrategyKind;
use serde::Deserialize;
use std::path::Path;

/// Conventional configuration file name
pub const CONFIG_FILE_NAME: &str = "veil.toml";

/// How a module is obfuscated
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObfuscationOptions {
    /// Display strategy applied to every proxy
    pub mode: StrategyKind,

    /// Attach type proxies to every eligible declared type
    pub annotate_types: bool,

    /// Place proxies in an embedded module instead of the target
    pub dynamic: bool,

    /// Seed for synthetic values; entropy when absent
    pub seed: Option<u64>,
}

impl ObfuscationOptions {
    /// Parse options from a file
    pub fn from_file(path: &Path) -> Result<Self, VeilError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse options from TOML text
    pub fn from_toml(content: &str) -> Result<Self, VeilError> {
        Ok(toml::from_str(content)?)
    }
}
