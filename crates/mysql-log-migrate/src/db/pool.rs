//! Connection pool construction.

use std::str::FromStr;
use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use tracing::info;

use crate::error::{MigrateError, Result};

/// How long a pooled connection may live before being recycled.
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(300);

/// Connection acquisition timeout.
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Open a bounded connection pool from a DSN and smoke-test it.
///
/// The pool is sized for `workers` concurrent statements plus a little
/// headroom for discovery and teardown queries.
pub async fn connect(dsn: &str, workers: usize) -> Result<MySqlPool> {
    let options = MySqlConnectOptions::from_str(dsn)
        .map_err(|e| MigrateError::Config(format!("invalid DSN: {}", e)))?;

    let pool = MySqlPoolOptions::new()
        .max_connections((workers + 2) as u32)
        .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
        .max_lifetime(POOL_MAX_LIFETIME)
        .connect_with(options)
        .await?;

    // Test connection
    sqlx::query("SELECT 1").execute(&pool).await?;

    info!(
        "connected ({} max connections, {}s max lifetime)",
        workers + 2,
        POOL_MAX_LIFETIME.as_secs()
    );

    Ok(pool)
}
