use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::observability::{
    HOLDS_EXPIRED_TOTAL, SWEEP_DURATION_SECONDS, SWEEP_FAILURES_TOTAL, SWEEPS_TOTAL, WAL_COMPACTIONS_TOTAL,
};

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    /// Candidates that errored; left for the next pass.
    pub failed: usize,
    /// True if another pass was already running and this one did nothing.
    pub skipped: bool,
}

/// Periodically cancels unpaid holds whose deadline has passed.
pub struct TimeoutSweeper {
    engine: Arc<Engine>,
    interval: Duration,
    running: Mutex<()>,
}

impl TimeoutSweeper {
    pub fn new(engine: Arc<Engine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            running: Mutex::new(()),
        }
    }

    /// One pass over all expired holds. Overlapping passes are skipped.
    pub async fn sweep_once(&self) -> SweepReport {
        let Ok(_running) = self.running.try_lock() else {
            debug!("sweep already in progress, skipping");
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        };
        let started = Instant::now();
        let now = self.engine.now_ms();
        let candidates = self.engine.collect_expired_holds(now);
        let mut report = SweepReport {
            scanned: candidates.len(),
            ..SweepReport::default()
        };
        for id in candidates {
            match self.engine.expire_hold(id, now).await {
                Ok(Some(session)) => {
                    report.expired += 1;
                    info!(session = %id, booking = %session.booking_id, "expired unpaid hold");
                }
                // Paid, confirmed or cancelled since the scan.
                Ok(None) => debug!(session = %id, "hold no longer eligible"),
                Err(e) => {
                    report.failed += 1;
                    error!(session = %id, "failed to expire hold: {e}");
                }
            }
        }
        metrics::counter!(SWEEPS_TOTAL).increment(1);
        metrics::counter!(HOLDS_EXPIRED_TOTAL).increment(report.expired as u64);
        metrics::counter!(SWEEP_FAILURES_TOTAL).increment(report.failed as u64);
        metrics::histogram!(SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        if report.expired > 0 || report.failed > 0 {
            info!(
                "sweep: {} scanned, {} expired, {} failed",
                report.scanned, report.expired, report.failed
            );
        }
        report
    }

    /// Run until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
                _ = shutdown.cancelled() => {
                    info!("timeout sweeper stopped");
                    return;
                }
            }
        }
    }
}

/// Compact the WAL whenever enough appends have piled up since the last one.
pub async fn run_compactor(
    engine: Arc<Engine>,
    threshold: u64,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => {
                metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
                info!("compacted WAL after {appends} appends");
            }
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
