//! Fast-load envelope: relax destination tuning variables for bulk ingestion
//! and restore the exact original values on the way out.
//!
//! Individual `SET GLOBAL` failures are logged and tolerated (some servers
//! mark variables read-only); restore runs under its own timeout, detached
//! from the pipeline's cancellation token, so it executes on every exit path.

use std::time::Duration;

use sqlx::mysql::MySqlPool;
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Restore gets its own bounded window so shutdown cannot hang forever.
const DISABLE_TIMEOUT: Duration = Duration::from_secs(300);

/// User-tunable knobs applied while fast-load is active. Zero means "leave
/// the server value alone".
#[derive(Debug, Clone, Copy, Default)]
pub struct FastLoadSettings {
    pub buffer_pool_size: u64,
    pub io_capacity: u64,
    pub io_capacity_max: u64,
}

/// Snapshot of the destination tuning variables taken before any mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginalSettings {
    pub unique_checks: i64,
    pub foreign_key_checks: i64,
    pub innodb_flush_log_at_trx_commit: i64,
    pub sync_binlog: i64,
    pub innodb_io_capacity: i64,
    pub innodb_io_capacity_max: i64,
    pub innodb_buffer_pool_size: u64,
}

/// Snapshot the current settings, then apply bulk-optimised values.
pub async fn enable_fast_load(pool: &MySqlPool, opts: FastLoadSettings) -> Result<OriginalSettings> {
    info!("enabling fast-load");

    let orig = OriginalSettings {
        unique_checks: read_global_i64(pool, "unique_checks", 1).await,
        foreign_key_checks: read_global_i64(pool, "foreign_key_checks", 1).await,
        innodb_flush_log_at_trx_commit: read_global_i64(pool, "innodb_flush_log_at_trx_commit", 1)
            .await,
        sync_binlog: read_global_i64(pool, "sync_binlog", 1).await,
        innodb_io_capacity: read_global_i64(pool, "innodb_io_capacity", 0).await,
        innodb_io_capacity_max: read_global_i64(pool, "innodb_io_capacity_max", 0).await,
        innodb_buffer_pool_size: read_global_u64(pool, "innodb_buffer_pool_size", 0).await,
    };
    debug!(?orig, "original settings saved");

    log_exec(pool, "SET GLOBAL unique_checks = 0").await;
    log_exec(pool, "SET GLOBAL foreign_key_checks = 0").await;
    log_exec(pool, "SET GLOBAL innodb_flush_log_at_trx_commit = 2").await;
    log_exec(pool, "SET GLOBAL sync_binlog = 0").await;

    if opts.buffer_pool_size > 0 {
        log_exec(
            pool,
            &format!("SET GLOBAL innodb_buffer_pool_size = {}", opts.buffer_pool_size),
        )
        .await;
    }
    if opts.io_capacity > 0 {
        log_exec(
            pool,
            &format!("SET GLOBAL innodb_io_capacity = {}", opts.io_capacity),
        )
        .await;
    }
    if opts.io_capacity_max > 0 {
        log_exec(
            pool,
            &format!("SET GLOBAL innodb_io_capacity_max = {}", opts.io_capacity_max),
        )
        .await;
    }

    log_exec(pool, "SET SESSION sql_log_bin = 0").await;
    log_exec(pool, "ALTER INSTANCE DISABLE INNODB REDO_LOG").await;

    info!("fast-load enabled");
    Ok(orig)
}

/// Restore every mutated variable from the snapshot. Runs under its own
/// timeout and never fails the run: restore errors are logged only.
pub async fn disable_fast_load(pool: &MySqlPool, orig: &OriginalSettings) {
    info!("disabling fast-load and restoring original settings");

    let restore = async {
        log_exec(pool, "ALTER INSTANCE ENABLE INNODB REDO_LOG").await;
        log_exec(pool, "SET SESSION sql_log_bin = 1").await;

        log_exec(
            pool,
            &format!(
                "SET GLOBAL innodb_flush_log_at_trx_commit = {}",
                orig.innodb_flush_log_at_trx_commit
            ),
        )
        .await;
        log_exec(pool, &format!("SET GLOBAL sync_binlog = {}", orig.sync_binlog)).await;
        log_exec(
            pool,
            &format!("SET GLOBAL innodb_io_capacity = {}", orig.innodb_io_capacity),
        )
        .await;
        log_exec(
            pool,
            &format!(
                "SET GLOBAL innodb_io_capacity_max = {}",
                orig.innodb_io_capacity_max
            ),
        )
        .await;
        log_exec(
            pool,
            &format!(
                "SET GLOBAL innodb_buffer_pool_size = {}",
                orig.innodb_buffer_pool_size
            ),
        )
        .await;
        log_exec(pool, &format!("SET GLOBAL unique_checks = {}", orig.unique_checks)).await;
        log_exec(
            pool,
            &format!("SET GLOBAL foreign_key_checks = {}", orig.foreign_key_checks),
        )
        .await;
    };

    match tokio::time::timeout(DISABLE_TIMEOUT, restore).await {
        Ok(()) => info!("fast-load disabled (original settings restored)"),
        Err(_) => warn!(
            "fast-load restore did not finish within {}s",
            DISABLE_TIMEOUT.as_secs()
        ),
    }
}

/// Execute a tuning statement; failures are logged, never fatal.
async fn log_exec(pool: &MySqlPool, query: &str) {
    match sqlx::query(query).execute(pool).await {
        Ok(_) => debug!("fast-load applied: {}", query),
        Err(e) => warn!("fast-load: {} -> {}", query, e),
    }
}

async fn read_global_i64(pool: &MySqlPool, var: &str, default: i64) -> i64 {
    let query = format!("SELECT @@GLOBAL.{}", var);
    match sqlx::query(&query).fetch_one(pool).await {
        Ok(row) => row
            .try_get::<i64, _>(0)
            .or_else(|_| row.try_get::<u64, _>(0).map(|v| v as i64))
            .unwrap_or(default),
        Err(e) => {
            warn!("failed to read {}: {}, using default {}", var, e, default);
            default
        }
    }
}

async fn read_global_u64(pool: &MySqlPool, var: &str, default: u64) -> u64 {
    let query = format!("SELECT @@GLOBAL.{}", var);
    match sqlx::query(&query).fetch_one(pool).await {
        Ok(row) => row
            .try_get::<u64, _>(0)
            .or_else(|_| row.try_get::<i64, _>(0).map(|v| v as u64))
            .unwrap_or(default),
        Err(e) => {
            warn!("failed to read {}: {}, using default {}", var, e, default);
            default
        }
    }
}
