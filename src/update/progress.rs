//! Batch progress aggregation
//!
//! Tracks completed/total counts for one update batch and coalesces UI
//! refreshes: bursts of increments within the throttle window produce a
//! single trailing-edge callback. Each active download registers a tracker
//! whose byte fraction and smoothed transfer rate are summed with its
//! concurrent peers before folding into the overall percentage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::portal::ProgressSink;

const THROTTLE_WINDOW: Duration = Duration::from_millis(100);
const RATE_EMA_ALPHA: f64 = 0.2;

/// Snapshot handed to the UI refresh callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub total: usize,
    /// Overall batch percentage including every active file's fraction.
    pub percent: f64,
    /// Combined smoothed transfer rate of all active downloads, bytes per
    /// second.
    pub bytes_per_sec: f64,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressSnapshot) + Send + Sync>;

struct Throttle {
    last_emit: Option<Instant>,
    trailing_scheduled: bool,
}

struct ActiveDownload {
    fraction: f64,
    rate: RateEstimator,
}

struct Inner {
    total: usize,
    completed: AtomicUsize,
    next_download_id: AtomicU64,
    /// Fraction and rate per in-flight download, keyed by tracker id, so
    /// concurrent downloads never clobber each other's reports.
    active: Mutex<HashMap<u64, ActiveDownload>>,
    throttle: Mutex<Throttle>,
    callback: ProgressCallback,
}

/// Shared per-batch progress tracker.
#[derive(Clone)]
pub struct ProgressAggregator {
    inner: Arc<Inner>,
}

impl ProgressAggregator {
    pub fn new(total: usize, callback: ProgressCallback) -> Self {
        Self {
            inner: Arc::new(Inner {
                total,
                completed: AtomicUsize::new(0),
                next_download_id: AtomicU64::new(0),
                active: Mutex::new(HashMap::new()),
                throttle: Mutex::new(Throttle {
                    last_emit: None,
                    trailing_scheduled: false,
                }),
                callback,
            }),
        }
    }

    pub fn total(&self) -> usize {
        self.inner.total
    }

    pub fn completed(&self) -> usize {
        self.inner.completed.load(Ordering::SeqCst)
    }

    /// Mark one batch item finished and schedule a throttled refresh.
    pub fn increment(&self) {
        self.inner.completed.fetch_add(1, Ordering::SeqCst);
        self.schedule_emit();
    }

    /// Register one active download. Its fraction counts toward the batch
    /// percentage until the returned tracker is dropped.
    pub fn track_download(&self) -> DownloadTracker {
        let id = self.inner.next_download_id.fetch_add(1, Ordering::SeqCst);
        DownloadTracker {
            aggregator: self.clone(),
            id,
        }
    }

    fn report_bytes(&self, id: u64, downloaded: u64, total: u64) {
        let fraction = if total > 0 {
            (downloaded as f64 / total as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        if let Ok(mut active) = self.inner.active.lock() {
            let entry = active.entry(id).or_insert_with(|| ActiveDownload {
                fraction: 0.0,
                rate: RateEstimator::new(),
            });
            entry.fraction = fraction;
            entry.rate.sample(Instant::now(), downloaded);
        }
        self.schedule_emit();
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let completed = self.completed();
        let (fraction_sum, bytes_per_sec) = self
            .inner
            .active
            .lock()
            .map(|active| {
                active.values().fold((0.0, 0.0), |(fractions, rates), d| {
                    (fractions + d.fraction, rates + d.rate.current())
                })
            })
            .unwrap_or((0.0, 0.0));
        let percent = if self.inner.total > 0 {
            ((completed as f64 + fraction_sum) / self.inner.total as f64 * 100.0).min(100.0)
        } else {
            100.0
        };
        ProgressSnapshot {
            completed,
            total: self.inner.total,
            percent,
            bytes_per_sec,
        }
    }

    /// Emit now if the window has elapsed, otherwise arm one trailing-edge
    /// emission for the end of the window.
    fn schedule_emit(&self) {
        let delay = {
            let Ok(mut throttle) = self.inner.throttle.lock() else {
                return;
            };
            if throttle.trailing_scheduled {
                return;
            }
            let now = Instant::now();
            match throttle.last_emit {
                Some(last) if now.duration_since(last) < THROTTLE_WINDOW => {
                    throttle.trailing_scheduled = true;
                    Some(THROTTLE_WINDOW - now.duration_since(last))
                }
                _ => {
                    throttle.last_emit = Some(now);
                    None
                }
            }
        };

        match delay {
            None => (self.inner.callback)(self.snapshot()),
            Some(delay) => {
                let aggregator = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Ok(mut throttle) = aggregator.inner.throttle.lock() {
                        throttle.trailing_scheduled = false;
                        throttle.last_emit = Some(Instant::now());
                    }
                    (aggregator.inner.callback)(aggregator.snapshot());
                });
            }
        }
    }
}

/// Handle for one in-flight download. Dropping it retires the download's
/// fraction and rate from the aggregate; the owning task's `increment`
/// accounts for the finished item afterwards.
pub struct DownloadTracker {
    aggregator: ProgressAggregator,
    id: u64,
}

impl DownloadTracker {
    /// Byte-level sink bound to this download.
    pub fn sink(&self) -> ProgressSink {
        let aggregator = self.aggregator.clone();
        let id = self.id;
        Arc::new(move |downloaded: u64, total: u64| {
            aggregator.report_bytes(id, downloaded, total);
        })
    }
}

impl Drop for DownloadTracker {
    fn drop(&mut self) {
        if let Ok(mut active) = self.aggregator.inner.active.lock() {
            active.remove(&self.id);
        }
    }
}

/// Exponential-moving-average transfer rate from timestamped byte counts.
struct RateEstimator {
    last: Option<(Instant, u64)>,
    ema: f64,
}

impl RateEstimator {
    fn new() -> Self {
        Self { last: None, ema: 0.0 }
    }

    fn sample(&mut self, at: Instant, bytes: u64) {
        if let Some((prev_at, prev_bytes)) = self.last {
            let elapsed = at.duration_since(prev_at).as_secs_f64();
            if bytes >= prev_bytes && elapsed > 0.0 {
                let instant_rate = (bytes - prev_bytes) as f64 / elapsed;
                self.ema = if self.ema == 0.0 {
                    instant_rate
                } else {
                    RATE_EMA_ALPHA * instant_rate + (1.0 - RATE_EMA_ALPHA) * self.ema
                };
            }
        }
        self.last = Some((at, bytes));
    }

    fn current(&self) -> f64 {
        self.ema
    }
}
