//! Bundle ingestion: stream an export tarball through a stage pool that
//! prepends synthesised identifiers, then bulk-load the staged chunks.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use flate2::read::GzDecoder;
use sqlx::mysql::MySqlPool;
use tokio::sync::mpsc;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::ChunkWriter;
use crate::config::{parse_timezone, LoadConfig};
use crate::db;
use crate::error::{MigrateError, Result};
use crate::fsutil;
use crate::migrate::{report_failure, StagedChunk};
use crate::stats::{self, Counters};
use crate::uuidv7;
use crate::value::TS_FORMAT;

/// Per-statement ceiling on one bulk-load execution.
const LOAD_STATEMENT_TIMEOUT: Duration = Duration::from_secs(600);

/// Read buffer in front of every bundle entry and CSV file.
const BUFFER_SIZE: usize = 1 << 20;

/// Outcome of a bundle-load run.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub rows_loaded: u64,
    pub files_loaded: u64,
    pub duration: Duration,
}

/// The bundle-load driver.
pub struct Importer {
    cfg: Arc<LoadConfig>,
    pool: MySqlPool,
    staging_dir: PathBuf,
}

impl Importer {
    /// Validate the configuration, open the destination pool, and resolve the
    /// server's staging directory.
    pub async fn connect(cfg: LoadConfig) -> Result<Self> {
        cfg.validate()?;
        let pool = db::connect(&cfg.dsn, cfg.workers).await?;

        let staging_dir = db::secure_file_priv(&pool).await?.ok_or_else(|| {
            MigrateError::Config(
                "secure_file_priv is NULL/empty on the destination; \
                 configure it in MySQL and restart"
                    .into(),
            )
        })?;
        let staging_dir = PathBuf::from(staging_dir);
        if let Err(e) = fs::create_dir_all(&staging_dir) {
            warn!("cannot create staging directory {:?}: {}", staging_dir, e);
        }
        info!("staging files under {:?}", staging_dir);

        Ok(Self {
            cfg: Arc::new(cfg),
            pool,
            staging_dir,
        })
    }

    /// Ingest the bundle to completion or first error. The fast-load envelope
    /// is restored on every exit path before this returns.
    pub async fn run(&self, cancel: CancellationToken) -> Result<LoadReport> {
        let tz = parse_timezone(&self.cfg.uuid_tz)?;
        let counters = Arc::new(Counters::new());
        let start = Instant::now();

        let fastload_snapshot = if self.cfg.use_fast_load {
            Some(db::enable_fast_load(&self.pool, db::FastLoadSettings::default()).await?)
        } else {
            None
        };

        let outcome = self.run_pipeline(tz, counters.clone(), &cancel).await;

        if let Some(ref snapshot) = fastload_snapshot {
            db::disable_fast_load(&self.pool, snapshot).await;
        }

        let snap = counters.snapshot();
        let elapsed = start.elapsed();
        let title = if outcome.is_ok() {
            "[IMPORT SUCCESS]"
        } else {
            "[IMPORT FAILED]"
        };
        stats::log_summary(title, snap, elapsed);

        outcome.map(|()| LoadReport {
            rows_loaded: snap.rows_loaded,
            files_loaded: snap.files_loaded,
            duration: elapsed,
        })
    }

    async fn run_pipeline(
        &self,
        tz: Tz,
        counters: Arc<Counters>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let stage_workers = self.cfg.workers;
        let load_workers = self.cfg.load_workers();
        debug!("concurrency: stage={}, load={}", stage_workers, load_workers);

        let (entry_tx, entry_rx) = async_channel::bounded::<PathBuf>(stage_workers);
        let (staged_tx, staged_rx) = async_channel::bounded::<StagedChunk>(stage_workers);
        let (err_tx, mut err_rx) = mpsc::channel::<MigrateError>(1);

        // Producer: unpack bundle entries onto the local disk.
        let producer = {
            let tar_path = self.cfg.tar_path.clone();
            let cancel = cancel.clone();
            let err_tx = err_tx.clone();
            let unpack_cancel = cancel.clone();

            tokio::spawn(async move {
                let unpacked = task::spawn_blocking(move || {
                    unpack_entries(&tar_path, &entry_tx, &unpack_cancel)
                })
                .await;

                match unpacked {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => report_failure(e, &err_tx, &cancel),
                    Err(_) => report_failure(
                        MigrateError::Archive("bundle reader panicked".into()),
                        &err_tx,
                        &cancel,
                    ),
                }
            })
        };

        let mut stage_handles = Vec::with_capacity(stage_workers);
        for id in 1..=stage_workers {
            let worker = StageWorker {
                id,
                cfg: self.cfg.clone(),
                staging_dir: self.staging_dir.clone(),
                tz,
                counters: counters.clone(),
                cancel: cancel.clone(),
            };
            let entry_rx = entry_rx.clone();
            let staged_tx = staged_tx.clone();
            let err_tx = err_tx.clone();
            let cancel = cancel.clone();

            stage_handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(entry_rx, staged_tx).await {
                    report_failure(e, &err_tx, &cancel);
                }
            }));
        }
        drop(staged_tx);

        let mut load_handles = Vec::with_capacity(load_workers);
        for id in 1..=load_workers {
            let worker = LoadWorker {
                id,
                pool: self.pool.clone(),
                cfg: self.cfg.clone(),
                staging_dir: self.staging_dir.clone(),
                counters: counters.clone(),
                cancel: cancel.clone(),
            };
            let staged_rx = staged_rx.clone();
            let err_tx = err_tx.clone();
            let cancel = cancel.clone();

            load_handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(staged_rx).await {
                    report_failure(e, &err_tx, &cancel);
                }
            }));
        }

        for handle in stage_handles {
            if handle.await.is_err() {
                report_failure(MigrateError::stage("stage worker panicked"), &err_tx, cancel);
            }
        }

        // The stage pool is gone; close the entry queue so a producer blocked
        // mid-send unwinds, then sweep scratch files it left behind.
        entry_rx.close();
        while let Ok(path) = entry_rx.try_recv() {
            let _ = fs::remove_file(&path);
        }
        let _ = producer.await;

        for handle in load_handles {
            if handle.await.is_err() {
                report_failure(MigrateError::stage("load worker panicked"), &err_tx, cancel);
            }
        }

        // Sweep staged chunks stranded by cancellation.
        while let Ok(job) = staged_rx.try_recv() {
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

/// Copy every chunk entry of the bundle to a uniquely named scratch file and
/// enqueue its path. Runs on the blocking pool.
fn unpack_entries(
    tar_path: &Path,
    entry_tx: &async_channel::Sender<PathBuf>,
    cancel: &CancellationToken,
) -> Result<()> {
    debug!("reading bundle {:?}", tar_path);

    crate::archive::for_each_entry(tar_path, |name, reader| {
        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }

        let base = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "entry.csv".to_string());
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let scratch = std::env::temp_dir().join(format!("{}_{}", nanos, base));

        let copied = (|| -> Result<()> {
            let mut out = BufWriter::with_capacity(BUFFER_SIZE, File::create(&scratch)?);
            std::io::copy(reader, &mut out)?;
            out.flush()?;
            Ok(())
        })();
        if let Err(e) = copied {
            let _ = fs::remove_file(&scratch);
            return Err(MigrateError::Archive(format!("unpack {}: {}", name, e)));
        }

        if entry_tx.send_blocking(scratch.clone()).is_err() {
            let _ = fs::remove_file(&scratch);
            return Err(MigrateError::Cancelled);
        }

        Ok(())
    })
}

struct StageWorker {
    id: usize,
    cfg: Arc<LoadConfig>,
    staging_dir: PathBuf,
    tz: Tz,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl StageWorker {
    async fn run(
        &self,
        entry_rx: async_channel::Receiver<PathBuf>,
        staged_tx: async_channel::Sender<StagedChunk>,
    ) -> Result<()> {
        loop {
            let scratch = tokio::select! {
                _ = self.cancel.cancelled() => return Err(MigrateError::Cancelled),
                path = entry_rx.recv() => match path {
                    Ok(path) => path,
                    Err(_) => break,
                },
            };

            let base = scratch
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let staged_path = self.staging_dir.join(format!("{}.uuid.csv", base));

            let ts_idx = self.cfg.uuid_from_idx - 1;
            let tz = self.tz;
            let input = scratch.clone();
            let output = staged_path.clone();
            let staged = task::spawn_blocking(move || stage_csv(&input, output, ts_idx, tz)).await;

            // The scratch copy is consumed by staging either way.
            let _ = fs::remove_file(&scratch);

            let rows = match staged {
                Ok(Ok(rows)) => rows,
                Ok(Err(e)) => {
                    return Err(MigrateError::stage(format!("stage {}: {}", base, e)))
                }
                Err(_) => return Err(MigrateError::stage(format!("stage {} panicked", base))),
            };

            if rows == 0 {
                debug!("stage worker {}: {} is empty", self.id, base);
                continue;
            }

            self.counters.add_staged(rows);
            debug!("stage worker {}: staged {} rows from {}", self.id, rows, base);

            let path = staged_path.clone();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = fs::remove_file(&path);
                    return Err(MigrateError::Cancelled);
                }
                sent = staged_tx.send(StagedChunk { path: staged_path, rows }) => {
                    if sent.is_err() {
                        let _ = fs::remove_file(&path);
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Re-write one exported CSV with a synthesised identifier prepended to every
/// record. Transparently decompresses `.gz` inputs. Returns the row count;
/// zero-row inputs leave no staged file behind.
fn stage_csv(input: &Path, output: PathBuf, ts_idx: usize, tz: Tz) -> Result<u64> {
    let file = File::open(input)?;
    let reader: Box<dyn Read> = if input
        .extension()
        .map(|e| e.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
    {
        Box::new(BufReader::with_capacity(
            BUFFER_SIZE,
            GzDecoder::new(BufReader::with_capacity(BUFFER_SIZE, file)),
        ))
    } else {
        Box::new(BufReader::with_capacity(BUFFER_SIZE, file))
    };

    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut writer = ChunkWriter::create_at(output)?;

    let result = (|| -> Result<()> {
        for (line, record) in csv_reader.records().enumerate() {
            let record =
                record.map_err(|e| MigrateError::stage(format!("line {}: {}", line + 1, e)))?;

            let ts_raw = record.get(ts_idx).map(str::trim).ok_or_else(|| {
                MigrateError::stage(format!(
                    "line {}: datetime index out of range (cols={})",
                    line + 1,
                    record.len()
                ))
            })?;
            if ts_raw.is_empty() {
                return Err(MigrateError::stage(format!("line {}: empty datetime", line + 1)));
            }

            let naive = NaiveDateTime::parse_from_str(ts_raw, TS_FORMAT).map_err(|e| {
                MigrateError::stage(format!("line {}: parse {:?}: {}", line + 1, ts_raw, e))
            })?;
            let ts = tz.from_local_datetime(&naive).earliest().ok_or_else(|| {
                MigrateError::stage(format!(
                    "line {}: timestamp {:?} does not exist in {}",
                    line + 1,
                    ts_raw,
                    tz
                ))
            })?;
            let uuid = uuidv7::from_timestamp(&ts)?;

            writer.write_record(std::iter::once(uuid.as_str()).chain(record.iter()))?;
        }
        Ok(())
    })();

    if let Err(e) = result {
        writer.cleanup_on_error();
        return Err(e);
    }

    if writer.rows_written() == 0 {
        writer.cleanup_on_error();
        return Ok(0);
    }

    let (_, rows) = writer.finish()?;
    Ok(rows)
}

struct LoadWorker {
    id: usize,
    pool: MySqlPool,
    cfg: Arc<LoadConfig>,
    staging_dir: PathBuf,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl LoadWorker {
    async fn run(&self, staged_rx: async_channel::Receiver<StagedChunk>) -> Result<()> {
        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => return Err(MigrateError::Cancelled),
                job = staged_rx.recv() => match job {
                    Ok(job) => job,
                    Err(_) => break,
                },
            };

            let statement = db::build_load_data(
                &job.path,
                &self.cfg.dst_table,
                &self.cfg.dst_columns[0],
                &self.cfg.dst_ts_column,
                &self.cfg.dst_columns,
                false,
            );

            let started = Instant::now();
            let result = tokio::time::timeout(
                LOAD_STATEMENT_TIMEOUT,
                sqlx::query(&statement).execute(&self.pool),
            )
            .await;

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
                }
                Ok(Err(e)) => {
                    return Err(MigrateError::load(
                        job.path.display().to_string(),
                        e.to_string(),
                    ))
                }
                Err(_) => {
                    return Err(MigrateError::load(
                        job.path.display().to_string(),
                        format!(
                            "statement exceeded {}s timeout",
                            LOAD_STATEMENT_TIMEOUT.as_secs()
                        ),
                    ))
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Tz;
    use std::io::Write as _;

    fn utc() -> Tz {
        "UTC".parse().unwrap()
    }

    #[test]
    fn test_stage_csv_prepends_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("chunk.csv");
        fs::write(&input, "1,2024-01-01 00:00:00,a\n2,2024-01-01 00:00:01,b\n").unwrap();

        let output = dir.path().join("chunk.csv.uuid.csv");
        let rows = stage_csv(&input, output.clone(), 1, utc()).unwrap();
        assert_eq!(rows, 2);

        let content = fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let id = line.split(',').next().unwrap();
            assert_eq!(id.len(), 32);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        }
        // Same record order, identifiers ordered with the timestamps.
        assert!(lines[0] < lines[1]);
        assert!(lines[0].ends_with("1,2024-01-01 00:00:00,a"));
    }

    #[test]
    fn test_stage_csv_reads_gzip_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("chunk.csv.gz");
        let mut gz = flate2::write::GzEncoder::new(
            File::create(&input).unwrap(),
            flate2::Compression::fast(),
        );
        gz.write_all(b"7,2024-06-15 12:30:45,x\n").unwrap();
        gz.finish().unwrap();

        let output = dir.path().join("chunk.uuid.csv");
        let rows = stage_csv(&input, output.clone(), 1, utc()).unwrap();
        assert_eq!(rows, 1);
        assert!(fs::read_to_string(&output).unwrap().contains("7,2024-06-15 12:30:45,x"));
    }

    #[test]
    fn test_stage_csv_rejects_bad_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.uuid.csv");

        let empty_ts = dir.path().join("empty.csv");
        fs::write(&empty_ts, "1,,a\n").unwrap();
        assert!(stage_csv(&empty_ts, output.clone(), 1, utc()).is_err());
        assert!(!output.exists());

        let bad_ts = dir.path().join("bad.csv");
        fs::write(&bad_ts, "1,not-a-date,a\n").unwrap();
        assert!(stage_csv(&bad_ts, output.clone(), 1, utc()).is_err());
        assert!(!output.exists());

        let short = dir.path().join("short.csv");
        fs::write(&short, "1\n").unwrap();
        assert!(stage_csv(&short, output.clone(), 1, utc()).is_err());
        assert!(!output.exists());
    }

    #[test]
    fn test_stage_csv_empty_input_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("empty.csv");
        fs::write(&input, "").unwrap();

        let output = dir.path().join("empty.uuid.csv");
        assert_eq!(stage_csv(&input, output.clone(), 1, utc()).unwrap(), 0);
        assert!(!output.exists());
    }
}
