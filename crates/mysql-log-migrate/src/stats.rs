//! Progress counters and the end-of-run summary block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::info;

/// Process-wide monotonic counters, updated by workers with atomic adds and
/// read by the reporter and the final summary.
#[derive(Debug, Default)]
pub struct Counters {
    pub rows_staged: AtomicU64,
    pub files_staged: AtomicU64,
    pub rows_loaded: AtomicU64,
    pub files_loaded: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed chunk of staged rows.
    pub fn add_staged(&self, rows: u64) {
        self.files_staged.fetch_add(1, Ordering::Relaxed);
        self.rows_staged.fetch_add(rows, Ordering::Relaxed);
    }

    /// Record one successfully loaded chunk.
    pub fn add_loaded(&self, rows: u64) {
        self.files_loaded.fetch_add(1, Ordering::Relaxed);
        self.rows_loaded.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            rows_staged: self.rows_staged.load(Ordering::Relaxed),
            files_staged: self.files_staged.load(Ordering::Relaxed),
            rows_loaded: self.rows_loaded.load(Ordering::Relaxed),
            files_loaded: self.files_loaded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub rows_staged: u64,
    pub files_staged: u64,
    pub rows_loaded: u64,
    pub files_loaded: u64,
}

/// Format a count with thousands separators.
pub fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);

    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }

    out
}

/// Log the end-of-run summary block.
pub fn log_summary(title: &str, snapshot: Snapshot, elapsed: Duration) {
    let elapsed = elapsed.max(Duration::from_millis(1));
    let rows_per_sec = snapshot.rows_loaded as f64 / elapsed.as_secs_f64();

    info!("------------------------------------------------------------");
    info!("{}", title);
    info!(
        "staged: files={} rows={}",
        format_count(snapshot.files_staged),
        format_count(snapshot.rows_staged)
    );
    info!(
        "loaded: files={} rows={}",
        format_count(snapshot.files_loaded),
        format_count(snapshot.rows_loaded)
    );
    info!("duration: {:.0?}", elapsed);
    info!("speed: {:.0} rows/s", rows_per_sec);
    info!("------------------------------------------------------------");
}

/// Log the end-of-run summary for the export variant, which only stages.
pub fn log_export_summary(title: &str, rows: u64, files: u64, elapsed: Duration) {
    let elapsed = elapsed.max(Duration::from_millis(1));
    let rows_per_sec = rows as f64 / elapsed.as_secs_f64();
    let avg = if files > 0 { rows / files } else { 0 };

    info!("------------------------------------------------------------");
    info!("{}", title);
    info!("rows: {}", format_count(rows));
    info!("chunks(files): {}", format_count(files));
    info!("avg rows/chunk: {}", format_count(avg));
    info!("duration: {:.0?}", elapsed);
    info!("speed: {:.0} rows/s", rows_per_sec);
    info!("------------------------------------------------------------");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1_000), "1,000");
        assert_eq!(format_count(100_000), "100,000");
        assert_eq!(format_count(1_234_567_890), "1,234,567,890");
    }

    #[test]
    fn test_counters_accumulate() {
        let counters = Counters::new();
        counters.add_staged(100);
        counters.add_staged(50);
        counters.add_loaded(100);

        let snap = counters.snapshot();
        assert_eq!(snap.files_staged, 2);
        assert_eq!(snap.rows_staged, 150);
        assert_eq!(snap.files_loaded, 1);
        assert_eq!(snap.rows_loaded, 100);
    }
}
