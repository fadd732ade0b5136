//! End-to-end migration: the two-stage staged-chunk pipeline.
//!
//! Shards of the source PK range flow through a bounded shard queue into a
//! pool of stage workers; each worker materialises its shard into a CSV chunk
//! with a synthesised UUIDv7 prepended and hands the chunk to a bounded chunk
//! queue; a pool of load workers ingests chunks through `LOAD DATA INFILE`.
//! Back-pressure comes from the queue bounds; the first worker error cancels
//! the shared token and the pipeline drains to quiescence.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use futures::TryStreamExt;
use sqlx::mysql::MySqlPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::ChunkWriter;
use crate::config::{parse_timezone, MigrateConfig};
use crate::db;
use crate::error::{MigrateError, Result};
use crate::fsutil;
use crate::range::{self, PkRange};
use crate::stats::{self, Counters, Snapshot};
use crate::uuidv7;
use crate::value::{self, TS_FORMAT};

/// Per-statement ceiling on one bulk-load execution.
const LOAD_STATEMENT_TIMEOUT: Duration = Duration::from_secs(600);

/// A completed chunk awaiting ingestion. Produced by a stage worker and
/// consumed by exactly one load worker.
#[derive(Debug, Clone)]
pub struct StagedChunk {
    pub path: PathBuf,
    pub rows: u64,
}

/// Outcome of a migration run.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub rows_staged: u64,
    pub files_staged: u64,
    pub rows_loaded: u64,
    pub files_loaded: u64,
    pub duration: Duration,
}

impl MigrationReport {
    fn from_snapshot(snap: Snapshot, duration: Duration) -> Self {
        Self {
            rows_staged: snap.rows_staged,
            files_staged: snap.files_staged,
            rows_loaded: snap.rows_loaded,
            files_loaded: snap.files_loaded,
            duration,
        }
    }
}

/// The migration driver: owns both pools and the staging directory.
pub struct Migrator {
    cfg: Arc<MigrateConfig>,
    src: MySqlPool,
    dst: MySqlPool,
    staging_dir: PathBuf,
}

impl Migrator {
    /// Validate the configuration, open both pools, and resolve the staging
    /// directory (destination `secure_file_priv`, or the client temp dir in
    /// local-infile mode).
    pub async fn connect(cfg: MigrateConfig) -> Result<Self> {
        cfg.validate()?;

        let src = db::connect(&cfg.src_dsn, cfg.stage_workers).await?;
        info!("connection to source DB opened");
        let dst = db::connect(&cfg.dst_dsn, cfg.load_workers).await?;
        info!("connection to destination DB opened");

        let staging_dir = if cfg.use_local_infile {
            let dir = std::env::temp_dir();
            info!("local-infile mode, staging in {:?}", dir);
            dir
        } else {
            let dir = db::secure_file_priv(&dst).await?.ok_or_else(|| {
                MigrateError::Config(
                    "secure_file_priv is NULL/empty on the destination; \
                     configure it in MySQL and restart, or use --local-infile"
                        .into(),
                )
            })?;
            let dir = PathBuf::from(dir);
            if let Err(e) = fs::create_dir_all(&dir) {
                warn!("cannot create staging directory {:?}: {}", dir, e);
            }
            info!("server-infile mode, staging in {:?}", dir);
            dir
        };

        Ok(Self {
            cfg: Arc::new(cfg),
            src,
            dst,
            staging_dir,
        })
    }

    /// Run the migration to completion or first error. The fast-load envelope
    /// is restored on every exit path before this returns.
    pub async fn run(&self, cancel: CancellationToken) -> Result<MigrationReport> {
        let tz = parse_timezone(&self.cfg.uuid_tz)?;

        let src_columns =
            Arc::new(db::table_columns(&self.src, &self.cfg.src_table).await?);
        let dst_columns =
            Arc::new(db::table_columns(&self.dst, &self.cfg.dst_table).await?);

        if self.cfg.ts_column_idx > src_columns.len() {
            return Err(MigrateError::Config(format!(
                "ts-idx {} exceeds source column count {}",
                self.cfg.ts_column_idx,
                src_columns.len()
            )));
        }

        let src_bounds = db::pk_range(
            &self.src,
            &self.cfg.src_table,
            &self.cfg.src_pk,
            self.cfg.src_filter.as_deref(),
        )
        .await?;
        let dst_max = db::max_pk(&self.dst, &self.cfg.dst_table, &self.cfg.dst_pk).await?;

        let Some((min_pk, max_pk)) =
            range::resolve_bounds(src_bounds.map(|b| b.0), src_bounds.map(|b| b.1), dst_max)
        else {
            info!("no rows to migrate");
            return Ok(MigrationReport::default());
        };
        info!("numeric id range: {} - {}", min_pk, max_pk);

        let shards = range::split_by_width(min_pk, max_pk, self.cfg.chunk_size);
        info!("shards: {}", shards.len());

        let counters = Arc::new(Counters::new());
        let start = Instant::now();

        let fastload_snapshot = if self.cfg.use_fast_load {
            Some(
                db::enable_fast_load(
                    &self.dst,
                    db::FastLoadSettings {
                        buffer_pool_size: self.cfg.buffer_pool_size,
                        io_capacity: self.cfg.io_capacity,
                        io_capacity_max: self.cfg.io_capacity_max,
                    },
                )
                .await?,
            )
        } else {
            None
        };

        let outcome = self
            .run_pipeline(shards, src_columns, dst_columns, tz, counters.clone(), &cancel)
            .await;

        // Restore runs on success, error, and cancellation alike.
        if let Some(ref snapshot) = fastload_snapshot {
            db::disable_fast_load(&self.dst, snapshot).await;
        }

        let snap = counters.snapshot();
        let elapsed = start.elapsed();
        let title = if outcome.is_ok() {
            "[MIGRATE SUCCESS]"
        } else {
            "[MIGRATE FAILED]"
        };
        stats::log_summary(title, snap, elapsed);

        outcome.map(|()| MigrationReport::from_snapshot(snap, elapsed))
    }

    async fn run_pipeline(
        &self,
        shards: Vec<PkRange>,
        src_columns: Arc<Vec<String>>,
        dst_columns: Arc<Vec<String>>,
        tz: Tz,
        counters: Arc<Counters>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (shard_tx, shard_rx) = async_channel::bounded::<PkRange>(shards.len().max(1));
        let (chunk_tx, chunk_rx) =
            async_channel::bounded::<StagedChunk>(self.cfg.stage_workers.max(1));
        let (err_tx, mut err_rx) = mpsc::channel::<MigrateError>(1);

        let producer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for shard in shards {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = shard_tx.send(shard) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                // shard_tx drops here: the shard queue is closed
            })
        };

        let mut stage_handles = Vec::with_capacity(self.cfg.stage_workers);
        for id in 1..=self.cfg.stage_workers {
            let worker = StageWorker {
                id,
                src: self.src.clone(),
                cfg: self.cfg.clone(),
                columns: src_columns.clone(),
                staging_dir: self.staging_dir.clone(),
                tz,
                counters: counters.clone(),
                cancel: cancel.clone(),
            };
            let shard_rx = shard_rx.clone();
            let chunk_tx = chunk_tx.clone();
            let err_tx = err_tx.clone();
            let cancel = cancel.clone();

            stage_handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(shard_rx, chunk_tx).await {
                    report_failure(e, &err_tx, &cancel);
                }
            }));
        }
        drop(shard_rx);
        drop(chunk_tx);

        let mut load_handles = Vec::with_capacity(self.cfg.load_workers);
        for id in 1..=self.cfg.load_workers {
            let worker = LoadWorker {
                id,
                dst: self.dst.clone(),
                cfg: self.cfg.clone(),
                columns: dst_columns.clone(),
                staging_dir: self.staging_dir.clone(),
                counters: counters.clone(),
                cancel: cancel.clone(),
            };
            let chunk_rx = chunk_rx.clone();
            let err_tx = err_tx.clone();
            let cancel = cancel.clone();

            load_handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(chunk_rx).await {
                    report_failure(e, &err_tx, &cancel);
                }
            }));
        }

        // Shutdown order: stage pool first (closing the chunk queue as the
        // workers drop their senders), then the load pool, then the producer.
        for handle in stage_handles {
            if handle.await.is_err() {
                report_failure(
                    MigrateError::stage("stage worker panicked"),
                    &err_tx,
                    cancel,
                );
            }
        }
        for handle in load_handles {
            if handle.await.is_err() {
                report_failure(
                    MigrateError::stage("load worker panicked"),
                    &err_tx,
                    cancel,
                );
            }
        }
        let _ = producer.await;

        // Chunks stranded in the queue by cancellation are scratch files the
        // load pool never claimed; sweep them best-effort.
        while let Ok(job) = chunk_rx.try_recv() {
            let _ = fs::remove_file(&job.path);
        }

        drop(err_tx);
        match err_rx.recv().await {
            Some(e) => Err(e),
            None if cancel.is_cancelled() => Err(MigrateError::Cancelled),
            None => Ok(()),
        }
    }
}

/// Capture the first real error and cancel the pipeline. Later errors are
/// discarded by the bounded channel; `Cancelled` returns are unwinding, not
/// causes.
pub(crate) fn report_failure(
    error: MigrateError,
    err_tx: &mpsc::Sender<MigrateError>,
    cancel: &CancellationToken,
) {
    if !matches!(error, MigrateError::Cancelled) {
        let _ = err_tx.try_send(error);
    }
    cancel.cancel();
}

struct StageWorker {
    id: usize,
    src: MySqlPool,
    cfg: Arc<MigrateConfig>,
    columns: Arc<Vec<String>>,
    staging_dir: PathBuf,
    tz: Tz,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl StageWorker {
    async fn run(
        &self,
        shard_rx: async_channel::Receiver<PkRange>,
        chunk_tx: async_channel::Sender<StagedChunk>,
    ) -> Result<()> {
        let query = db::build_range_select(
            &self.cfg.src_table,
            &self.columns,
            &self.cfg.src_pk,
            self.cfg.src_filter.as_deref(),
            self.cfg.max_exec_ms,
            false,
        );

        loop {
            let shard = tokio::select! {
                _ = self.cancel.cancelled() => return Err(MigrateError::Cancelled),
                shard = shard_rx.recv() => match shard {
                    Ok(shard) => shard,
                    Err(_) => break, // queue closed and drained
                },
            };

            debug!("stage worker {}: shard {}", self.id, shard);
            let Some(job) = self.stage_shard(&query, &shard).await? else {
                debug!("stage worker {}: shard {} is empty", self.id, shard);
                continue;
            };

            self.counters.add_staged(job.rows);
            info!(
                "stage worker {}: staged {} ({} rows)",
                self.id,
                job.path.display(),
                job.rows
            );

            let path = job.path.clone();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = fs::remove_file(&path);
                    return Err(MigrateError::Cancelled);
                }
                sent = chunk_tx.send(job) => {
                    if sent.is_err() {
                        // Load pool is gone; nothing left to feed.
                        let _ = fs::remove_file(&path);
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Materialise one shard into a chunk. Returns `None` for an empty shard:
    /// the file is deleted and no job is enqueued.
    async fn stage_shard(&self, query: &str, shard: &PkRange) -> Result<Option<StagedChunk>> {
        let mut writer = ChunkWriter::create(&self.staging_dir, &self.cfg.src_table, shard)?;

        if let Err(e) = self.scan_into(query, shard, &mut writer).await {
            writer.cleanup_on_error();
            return Err(e);
        }

        if writer.rows_written() == 0 {
            writer.cleanup_on_error();
            return Ok(None);
        }

        let (path, rows) = writer.finish()?;
        Ok(Some(StagedChunk { path, rows }))
    }

    async fn scan_into(
        &self,
        query: &str,
        shard: &PkRange,
        writer: &mut ChunkWriter,
    ) -> Result<()> {
        let mut rows = sqlx::query(query)
            .bind(shard.from.saturating_sub(1))
            .bind(shard.to)
            .fetch(&self.src);

        loop {
            let row = tokio::select! {
                _ = self.cancel.cancelled() => return Err(MigrateError::Cancelled),
                row = rows.try_next() => row?,
            };
            let Some(row) = row else { break };

            let cells = value::render_row(&row)?;

            let ts_raw = &cells[self.cfg.ts_column_idx - 1];
            if ts_raw.is_empty() {
                return Err(MigrateError::stage(format!(
                    "empty timestamp at column {}",
                    self.cfg.ts_column_idx
                )));
            }
            let naive = NaiveDateTime::parse_from_str(ts_raw, TS_FORMAT).map_err(|e| {
                MigrateError::stage(format!("parse timestamp {:?}: {}", ts_raw, e))
            })?;
            let ts = self
                .tz
                .from_local_datetime(&naive)
                .earliest()
                .ok_or_else(|| {
                    MigrateError::stage(format!(
                        "timestamp {:?} does not exist in {}",
                        ts_raw, self.tz
                    ))
                })?;
            let uuid = uuidv7::from_timestamp(&ts)?;

            writer.write_record(
                std::iter::once(uuid.as_str()).chain(cells.iter().map(String::as_str)),
            )?;
        }

        Ok(())
    }
}

struct LoadWorker {
    id: usize,
    dst: MySqlPool,
    cfg: Arc<MigrateConfig>,
    columns: Arc<Vec<String>>,
    staging_dir: PathBuf,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl LoadWorker {
    async fn run(&self, chunk_rx: async_channel::Receiver<StagedChunk>) -> Result<()> {
        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => return Err(MigrateError::Cancelled),
                job = chunk_rx.recv() => match job {
                    Ok(job) => job,
                    Err(_) => break,
                },
            };

            self.load_chunk(&job).await?;
        }

        Ok(())
    }

    async fn load_chunk(&self, job: &StagedChunk) -> Result<()> {
        let statement = db::build_load_data(
            &job.path,
            &self.cfg.dst_table,
            &self.cfg.dst_uuid,
            &self.cfg.dst_ts_column,
            &self.columns,
            self.cfg.use_local_infile,
        );

        let started = Instant::now();
        let result = tokio::time::timeout(
            LOAD_STATEMENT_TIMEOUT,
            sqlx::query(&statement).execute(&self.dst),
        )
        .await;

        // The chunk is consumed exactly once: remove it whether the load
        // succeeded or failed. Removal errors never fail the run.
        if let Err(e) = fsutil::safe_remove_file(&job.path, &self.staging_dir) {
            warn!("load worker {}: remove {:?}: {}", self.id, job.path, e);
        }

        match result {
            Ok(Ok(_)) => {
                self.counters.add_loaded(job.rows);
                info!(
                    "load worker {}: loaded {} (+{} rows) in {:?}",
                    self.id,
                    job.path.display(),
                    job.rows,
                    started.elapsed()
                );
                Ok(())
            }
            Ok(Err(e)) => Err(MigrateError::load(
                job.path.display().to_string(),
                e.to_string(),
            )),
            Err(_) => Err(MigrateError::load(
                job.path.display().to_string(),
                format!(
                    "statement exceeded {}s timeout",
                    LOAD_STATEMENT_TIMEOUT.as_secs()
                ),
            )),
        }
    }
}
