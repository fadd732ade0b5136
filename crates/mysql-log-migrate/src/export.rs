//! One-shot export: stream PK shards into rotated `.csv.gz` chunks and pack
//! them into a gzip tarball for the two-phase migration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::TryStreamExt;
use sqlx::mysql::MySqlPool;
use sqlx::{Column, Row};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chunk::RotatingSink;
use crate::config::{split_columns, ExportConfig};
use crate::db;
use crate::error::{MigrateError, Result};
use crate::fsutil;
use crate::migrate::report_failure;
use crate::progress::Reporter;
use crate::range::{self, PkRange};
use crate::stats::{self, Counters};
use crate::value;

/// Outcome of an export run.
#[derive(Debug, Clone, Default)]
pub struct ExportReport {
    pub rows: u64,
    pub files: u64,
    pub archive_path: Option<PathBuf>,
    pub duration: Duration,
}

/// The export driver.
pub struct Exporter {
    cfg: Arc<ExportConfig>,
    pool: MySqlPool,
}

impl Exporter {
    /// Validate the configuration and open the source pool.
    pub async fn connect(cfg: ExportConfig) -> Result<Self> {
        cfg.validate()?;
        let pool = db::connect(&cfg.dsn, cfg.workers).await?;
        Ok(Self {
            cfg: Arc::new(cfg),
            pool,
        })
    }

    /// Export the table, archive the chunk directory, and remove it.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ExportReport> {
        let bounds = db::pk_range(
            &self.pool,
            &self.cfg.table,
            &self.cfg.pk,
            self.cfg.filter.as_deref(),
        )
        .await?;
        let Some((min_pk, max_pk)) = bounds else {
            info!("no rows to export");
            return Ok(ExportReport::default());
        };
        info!("PK range: [{}..{}]", min_pk, max_pk);

        let shards = range::split_into(min_pk, max_pk, self.cfg.workers);
        let counters = Arc::new(Counters::new());
        let start = Instant::now();

        let reporter = self
            .cfg
            .progress
            .then(|| Reporter::spawn(counters.clone(), (max_pk - min_pk).saturating_add(1), start));

        let columns: Vec<String> = self
            .cfg
            .columns
            .as_deref()
            .map(split_columns)
            .unwrap_or_default();
        let query = Arc::new(db::build_range_select(
            &self.cfg.table,
            &columns,
            &self.cfg.pk,
            self.cfg.filter.as_deref(),
            self.cfg.max_exec_ms,
            true,
        ));

        let (err_tx, mut err_rx) = mpsc::channel::<MigrateError>(1);
        let mut handles = Vec::with_capacity(shards.len());
        for (i, shard) in shards.into_iter().enumerate() {
            let worker = ExportWorker {
                id: i + 1,
                pool: self.pool.clone(),
                cfg: self.cfg.clone(),
                query: query.clone(),
                counters: counters.clone(),
                cancel: cancel.clone(),
            };
            let err_tx = err_tx.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(shard).await {
                    report_failure(e, &err_tx, &cancel);
                }
            }));
        }

        for handle in handles {
            if handle.await.is_err() {
                report_failure(
                    MigrateError::stage("export worker panicked"),
                    &err_tx,
                    &cancel,
                );
            }
        }
        drop(err_tx);
        let first_error = err_rx.recv().await;

        // The reporter stops before the final stats are printed.
        if let Some(reporter) = reporter {
            reporter.stop().await;
        }

        let snap = counters.snapshot();
        let elapsed = start.elapsed();
        let failed = first_error.is_some() || cancel.is_cancelled();
        let title = if failed {
            "[EXPORT FAILED]"
        } else {
            "[EXPORT SUCCESS]"
        };
        stats::log_export_summary(title, snap.rows_staged, snap.files_staged, elapsed);

        if let Some(e) = first_error {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }

        let archive_path = self.archive_and_remove();

        Ok(ExportReport {
            rows: snap.rows_staged,
            files: snap.files_staged,
            archive_path,
            duration: elapsed,
        })
    }

    /// Pack the chunk directory and remove it. Failures leave the directory
    /// in place and are logged, not fatal.
    fn archive_and_remove(&self) -> Option<PathBuf> {
        let out_dir = &self.cfg.out_dir;
        let archive_path = PathBuf::from(format!("{}.tar.gz", out_dir.display()));

        let started = Instant::now();
        match crate::archive::create_tar_gz(out_dir, &archive_path) {
            Ok(()) => {
                info!(
                    "archive created: {} (in {:?})",
                    archive_path.display(),
                    started.elapsed()
                );
                match fsutil::safe_remove_dir(out_dir) {
                    Ok(()) => info!("removed export dir: {}", out_dir.display()),
                    Err(e) => warn!("export dir not removed: {}", e),
                }
                Some(archive_path)
            }
            Err(e) => {
                warn!("cannot archive export dir: {}", e);
                None
            }
        }
    }
}

struct ExportWorker {
    id: usize,
    pool: MySqlPool,
    cfg: Arc<ExportConfig>,
    query: Arc<String>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl ExportWorker {
    async fn run(&self, shard: PkRange) -> Result<()> {
        info!("export worker {}: range {}", self.id, shard);

        let mut sink = RotatingSink::new(
            &self.cfg.out_dir,
            &format!("{}_{:02}", self.cfg.table, self.id),
            self.cfg.chunk_size,
        );

        let result = self.drain_shard(shard, &mut sink).await;

        // Flush whatever is left in the open chunk, even on the error path:
        // resumable bundles beat lost rows.
        match sink.close() {
            Ok(remainder) => {
                if remainder > 0 {
                    self.counters.add_staged(remainder);
                }
                result
            }
            Err(close_err) => match result {
                // A close failure on the success path loses rows and is the
                // primary error.
                Ok(()) => Err(close_err),
                // Teardown errors never mask the primary error.
                Err(e) => {
                    warn!(
                        "export worker {}: chunk close failed: {}",
                        self.id, close_err
                    );
                    Err(e)
                }
            },
        }
    }

    async fn drain_shard(&self, shard: PkRange, sink: &mut RotatingSink) -> Result<()> {
        let mut last = shard.from.saturating_sub(1);
        let mut pk_idx: Option<usize> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }

            let batch_start = last;
            let mut rows = sqlx::query(self.query.as_str())
                .bind(last)
                .bind(shard.to)
                .bind(self.cfg.chunk_size)
                .fetch(&self.pool);

            let mut read = 0u64;
            loop {
                let row = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(MigrateError::Cancelled),
                    row = rows.try_next() => row?,
                };
                let Some(row) = row else { break };

                if pk_idx.is_none() {
                    pk_idx = Some(
                        row.columns()
                            .iter()
                            .position(|c| c.name().eq_ignore_ascii_case(&self.cfg.pk))
                            .ok_or_else(|| {
                                MigrateError::stage(format!(
                                    "no primary key column {:?} in result",
                                    self.cfg.pk
                                ))
                            })?,
                    );
                }

                let cells = value::render_row(&row)?;
                if let Ok(pk) = cells[pk_idx.expect("resolved above")].parse::<u64>() {
                    if pk > last {
                        last = pk;
                    }
                }

                sink.write(cells.iter())?;
                read += 1;

                if let Some(closed) = sink.rotate_if_needed()? {
                    self.counters.add_staged(closed);
                    self.throttle().await;
                }
            }

            if read == 0 || last >= shard.to {
                return Ok(());
            }
            if last == batch_start {
                return Err(MigrateError::stage(format!(
                    "primary key {:?} did not advance past {}; keyset paging requires a numeric pk",
                    self.cfg.pk, last
                )));
            }
        }
    }

    /// Optional pacing between chunks so the source stays responsive.
    async fn throttle(&self) {
        if self.cfg.throttle_rps > 0 {
            let pause = self.cfg.chunk_size as f64 / self.cfg.throttle_rps as f64;
            tokio::time::sleep(Duration::from_secs_f64(pause)).await;
        }
    }
}
