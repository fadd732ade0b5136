//! Periodic progress reporting driven by the shared counters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::stats::{format_count, Counters};

const REPORT_EVERY: Duration = Duration::from_secs(1);

/// Background task logging one progress line per second. Must be stopped
/// (and joined) before the final summary is printed so the two never
/// interleave.
pub struct Reporter {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Reporter {
    /// Spawn a reporter over `counters` for a run expected to stage
    /// `planned_rows` rows in total.
    pub fn spawn(counters: Arc<Counters>, planned_rows: u64, start: Instant) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(REPORT_EVERY);
            tick.tick().await; // first tick completes immediately

            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => {}
                }

                let snap = counters.snapshot();
                let elapsed = start.elapsed().as_secs_f64().max(0.001);
                let rps = snap.rows_staged as f64 / elapsed;
                let pct = if planned_rows > 0 {
                    (100.0 * snap.rows_staged as f64 / planned_rows as f64).min(100.0)
                } else {
                    100.0
                };

                let eta = if rps > 0.0 && planned_rows > snap.rows_staged {
                    let remain = (planned_rows - snap.rows_staged) as f64;
                    format!("{}s", (remain / rps) as u64)
                } else {
                    "-".to_string()
                };

                info!(
                    "progress: rows={} ({:.0}/s) files={} {:.1}% ETA={}",
                    format_count(snap.rows_staged),
                    rps,
                    format_count(snap.files_staged),
                    pct,
                    eta
                );
            }
        });

        Self { cancel, handle }
    }

    /// Stop the reporter and wait for its final line to flush.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
