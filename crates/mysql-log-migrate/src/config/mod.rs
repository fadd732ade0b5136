//! Configuration types and validation.

mod types;
mod validation;

pub use types::*;
pub use validation::validate_filter;

use crate::error::{MigrateError, Result};
use chrono_tz::Tz;

/// Parse an IANA timezone name (for example `UTC` or `America/Los_Angeles`).
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| MigrateError::Config(format!("invalid timezone {:?}", name)))
}

impl MigrateConfig {
    /// Validate the configuration before any work starts.
    pub fn validate(&self) -> Result<()> {
        validation::validate_migrate(self)
    }
}

impl ExportConfig {
    /// Validate the configuration before any work starts.
    pub fn validate(&self) -> Result<()> {
        validation::validate_export(self)
    }
}

impl LoadConfig {
    /// Validate the configuration before any work starts.
    pub fn validate(&self) -> Result<()> {
        validation::validate_load(self)
    }
}
