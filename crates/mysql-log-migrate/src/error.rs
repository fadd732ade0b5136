//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (missing DSN, invalid filter, bad timezone, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source or destination database error
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Could not discover the PK range or column list before work started
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Staging failed: source scan, timestamp parse, chunk write, randomness
    #[error("Stage failed: {0}")]
    Stage(String),

    /// Bulk-load statement failed for a staged chunk
    #[error("Bulk load failed for {path}: {message}")]
    Load { path: String, message: String },

    /// Export bundle could not be read or written
    #[error("Archive error: {0}")]
    Archive(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration was cancelled (SIGINT, SIGTERM, or first error)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Stage error.
    pub fn stage(message: impl Into<String>) -> Self {
        MigrateError::Stage(message.into())
    }

    /// Create a Load error for a chunk path.
    pub fn load(path: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Load {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error: 2 for usage/configuration errors,
    /// 1 for runtime failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) => 2,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
