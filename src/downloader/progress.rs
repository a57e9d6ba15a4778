// Progress normalization, phase weighting and cooperative cancellation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::errors::JobError;
use super::models::{EntryUpdate, ItemState};

/// Shared cancellation flag, checked at phase boundaries and polled during
/// long transfers and tool runs.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Receives progress and status from a running job.
///
/// Implementations must tolerate calls from any task.
pub trait Reporter: Send + Sync {
    /// Overall job fraction in [0, 1]
    fn progress(&self, fraction: f64);

    /// Human-readable phase description
    fn status(&self, message: &str);

    /// Lifecycle transition of the item being processed
    fn state(&self, _state: ItemState) {}

    /// Playlist entry changed state or progress
    fn entry(&self, _update: &EntryUpdate) {}
}

/// Slice of the overall 0..1 range owned by one phase
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSpan {
    pub start: f64,
    pub width: f64,
}

impl PhaseSpan {
    pub const fn new(start: f64, width: f64) -> Self {
        Self { start, width }
    }

    /// Map a phase-local fraction onto the overall range
    pub fn at(&self, local: f64) -> f64 {
        let local = if local.is_nan() { 0.0 } else { local.clamp(0.0, 1.0) };
        self.start + self.width * local
    }

    pub fn end(&self) -> f64 {
        self.start + self.width
    }
}

/// Turns raw transport callbacks into a monotonic, rate-bounded sequence.
///
/// Duplicates, regressions and NaN are dropped. Completion (1.0) is always
/// forwarded regardless of the interval.
#[derive(Debug)]
pub struct ProgressNormalizer {
    last: f64,
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl ProgressNormalizer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last: 0.0,
            last_emit: None,
            min_interval,
        }
    }

    pub fn observe_bytes(&mut self, downloaded: u64, total: Option<u64>) -> Option<f64> {
        match total {
            Some(total) if total > 0 => self.observe(downloaded as f64 / total as f64),
            _ => None,
        }
    }

    pub fn observe(&mut self, fraction: f64) -> Option<f64> {
        if fraction.is_nan() {
            return None;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction <= self.last {
            return None;
        }

        let now = Instant::now();
        let due = self
            .last_emit
            .map_or(true, |at| now.duration_since(at) >= self.min_interval);
        if !due && fraction < 1.0 {
            return None;
        }

        self.last = fraction;
        self.last_emit = Some(now);
        Some(fraction)
    }

    /// Emit completion if it was not delivered yet
    pub fn finish(&mut self) -> Option<f64> {
        if self.last >= 1.0 {
            return None;
        }
        self.last = 1.0;
        self.last_emit = Some(Instant::now());
        Some(1.0)
    }
}
