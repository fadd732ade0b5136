//! Staged chunk files: the buffered CSV writer used by stage workers and the
//! rotating gzip sink used by the one-shot export.
//!
//! Chunk format: comma-separated records, `"` enclosure (only where needed),
//! `\` escape, LF line terminator, UTF-8, no header line.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{MigrateError, Result};
use crate::range::PkRange;

/// Write buffer in front of every chunk file.
const BUFFER_SIZE: usize = 1 << 20;

fn csv_builder() -> csv::WriterBuilder {
    let mut builder = csv::WriterBuilder::new();
    builder
        .quote_style(csv::QuoteStyle::Necessary)
        .double_quote(false)
        .escape(b'\\')
        .terminator(csv::Terminator::Any(b'\n'));
    builder
}

/// Nanosecond suffix keeping concurrently created chunk names unique.
fn unique_suffix() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// A scratch CSV file holding the materialised rows of one shard.
pub struct ChunkWriter {
    path: PathBuf,
    writer: csv::Writer<BufWriter<File>>,
    rows_written: u64,
}

impl ChunkWriter {
    /// Create a chunk file named after the table and shard bounds.
    pub fn create(dir: &Path, table: &str, range: &PkRange) -> Result<Self> {
        let path = dir.join(format!(
            "stage_{}_{}-{}_{}.csv",
            table,
            range.from,
            range.to,
            unique_suffix()
        ));
        Self::create_at(path)
    }

    /// Create a chunk file at an explicit path.
    pub fn create_at(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)?;
        let writer = csv_builder().from_writer(BufWriter::with_capacity(BUFFER_SIZE, file));

        Ok(Self {
            path,
            writer,
            rows_written: 0,
        })
    }

    /// Append one record.
    pub fn write_record<I, F>(&mut self, record: I) -> Result<()>
    where
        I: IntoIterator<Item = F>,
        F: AsRef<[u8]>,
    {
        self.writer
            .write_record(record)
            .map_err(|e| MigrateError::Stage(format!("write chunk: {}", e)))?;
        self.rows_written += 1;
        Ok(())
    }

    /// Rows written so far.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush, durably sync, and close the chunk. On failure the partial file
    /// is removed before the error is returned.
    pub fn finish(self) -> Result<(PathBuf, u64)> {
        let path = self.path;
        let rows = self.rows_written;

        let result = (|| -> Result<()> {
            let buf = self
                .writer
                .into_inner()
                .map_err(|e| MigrateError::Stage(format!("flush chunk: {}", e)))?;
            let file = buf
                .into_inner()
                .map_err(|e| MigrateError::Stage(format!("flush chunk: {}", e)))?;
            file.sync_all()?;
            Ok(())
        })();

        match result {
            Ok(()) => Ok((path, rows)),
            Err(e) => {
                let _ = fs::remove_file(&path);
                Err(e)
            }
        }
    }

    /// Best-effort removal of the chunk file; idempotent.
    pub fn cleanup_on_error(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Rotating gzip CSV sink for the export variant. Chunks are compressed with
/// the fastest deflate level and rotated every `rotate_every` rows.
pub struct RotatingSink {
    dir: PathBuf,
    prefix: String,
    rotate_every: u64,
    seq: u32,
    rows_in_chunk: u64,
    writer: Option<csv::Writer<GzEncoder<BufWriter<File>>>>,
}

impl RotatingSink {
    pub fn new(dir: &Path, prefix: &str, rotate_every: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            rotate_every: rotate_every.max(1),
            seq: 0,
            rows_in_chunk: 0,
            writer: None,
        }
    }

    /// Append one record, opening the next chunk file if none is active.
    pub fn write<I, F>(&mut self, record: I) -> Result<()>
    where
        I: IntoIterator<Item = F>,
        F: AsRef<[u8]>,
    {
        if self.writer.is_none() {
            self.open_next()?;
        }

        self.writer
            .as_mut()
            .expect("sink opened above")
            .write_record(record)
            .map_err(|e| MigrateError::Stage(format!("write export chunk: {}", e)))?;
        self.rows_in_chunk += 1;
        Ok(())
    }

    /// Close the active chunk when it has reached the rotation threshold.
    /// Returns the row count of the closed chunk, if one was closed.
    pub fn rotate_if_needed(&mut self) -> Result<Option<u64>> {
        if self.rows_in_chunk >= self.rotate_every {
            return self.close().map(Some);
        }
        Ok(None)
    }

    /// Rows in the currently open chunk.
    pub fn rows_in_chunk(&self) -> u64 {
        self.rows_in_chunk
    }

    /// Flush and close the active chunk, returning its row count.
    pub fn close(&mut self) -> Result<u64> {
        let rows = self.rows_in_chunk;
        if let Some(writer) = self.writer.take() {
            let gz = writer
                .into_inner()
                .map_err(|e| MigrateError::Stage(format!("flush export chunk: {}", e)))?;
            let mut buf = gz.finish()?;
            buf.flush()?;
        }
        self.rows_in_chunk = 0;
        Ok(rows)
    }

    fn open_next(&mut self) -> Result<()> {
        self.seq += 1;
        fs::create_dir_all(&self.dir)?;

        let path = self.dir.join(format!("{}_{:06}.csv.gz", self.prefix, self.seq));
        let file = File::create(&path)?;
        let gz = GzEncoder::new(
            BufWriter::with_capacity(BUFFER_SIZE, file),
            Compression::fast(),
        );
        self.writer = Some(csv_builder().from_writer(gz));
        self.rows_in_chunk = 0;
        Ok(())
    }
}
