//! Engine errors

use thiserror::Error;
use veil_metadata::{ModuleError, VerifyError};

/// Errors raised while configuring or applying the obfuscation
#[derive(Debug, Error)]
pub enum VeilError {
    /// Mode name does not match any display strategy
    #[error("Unknown mode '{0}'. Available modes: empty, mimic, failfast, stackoverflow, statechanger")]
    UnknownMode(String),

    /// Configuration file could not be parsed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] toml::de::Error),

    /// Embedded module is not present in the target
    #[error("Embedded resource '{0}' not found")]
    MissingResource(String),

    /// Reading a file or inflating an embedded resource failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Embedded module could not be decoded
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// Rewritten module failed verification
    #[error(transparent)]
    Verify(#[from] VerifyError),
}
