//! Error types for the CLI layer.

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Result type alias for CLI operations.
pub type CliResult<T> = std::result::Result<T, CliError>;

/// Errors surfaced by the `roostd` binary.
#[derive(Debug, Error)]
pub enum CliError {
    /// An error from the core engine.
    #[error(transparent)]
    Core(#[from] roost_core::RoostError),

    /// An I/O failure while bootstrapping.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A YAML serialization failure while printing diagnostics.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The daemon could not start.
    #[error("{0}")]
    Startup(String),
}
