//! Load-aware claim gating
//!
//! The semaphore in the pool is the hard concurrency bound. Watermarks add
//! hysteresis on top: once the pool is nearly full it stops claiming until
//! enough in-flight jobs have finished, instead of claiming one job every
//! time a single slot frees up.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Backpressure configuration
///
/// # Example
///
/// ```
/// use laneq::worker::BackpressureConfig;
///
/// let config = BackpressureConfig::default()
///     .with_high_watermark(0.95)
///     .with_low_watermark(0.75);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// Stop claiming once in-flight / max_concurrency reaches this ratio
    pub high_watermark: f64,

    /// Resume claiming once the ratio falls to this value
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 1.0,
            low_watermark: 0.8,
        }
    }
}

impl BackpressureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the high watermark
    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Set the low watermark
    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Check that the low watermark sits below the high one
    pub fn validate(&self) -> Result<(), BackpressureError> {
        if self.low_watermark >= self.high_watermark {
            return Err(BackpressureError::InvalidConfig(format!(
                "low_watermark ({}) must be below high_watermark ({})",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }
}

/// Backpressure errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),
}

/// In-flight job accounting for one pool
pub struct BackpressureState {
    config: BackpressureConfig,
    in_flight: AtomicUsize,
    max_concurrency: usize,
    accepting: AtomicBool,
    reason: RwLock<Option<String>>,
}

impl BackpressureState {
    pub fn new(config: BackpressureConfig, max_concurrency: usize) -> Self {
        Self {
            config,
            in_flight: AtomicUsize::new(0),
            max_concurrency: max_concurrency.max(1),
            accepting: AtomicBool::new(true),
            reason: RwLock::new(None),
        }
    }

    /// Whether the poller may claim more jobs
    pub fn should_accept(&self) -> bool {
        let ratio = self.load_ratio();

        if self.accepting.load(Ordering::Relaxed) {
            if ratio >= self.config.high_watermark {
                self.accepting.store(false, Ordering::Relaxed);
                *self.reason.write() = Some(format!(
                    "{} of {} slots busy",
                    self.in_flight(),
                    self.max_concurrency
                ));
                return false;
            }
            true
        } else if ratio <= self.config.low_watermark {
            self.accepting.store(true, Ordering::Relaxed);
            *self.reason.write() = None;
            true
        } else {
            false
        }
    }

    /// Jobs currently leased and executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Ratio of busy slots
    pub fn load_ratio(&self) -> f64 {
        self.in_flight() as f64 / self.max_concurrency as f64
    }

    /// Free slots
    pub fn available_slots(&self) -> usize {
        self.max_concurrency.saturating_sub(self.in_flight())
    }

    /// Whether the pool is currently claiming
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    /// Why the pool stopped claiming, if it did
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    pub fn job_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_finished(&self) {
        // Saturate rather than wrap if accounting ever goes wrong
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BackpressureConfig::default();
        assert_eq!(config.high_watermark, 1.0);
        assert_eq!(config.low_watermark, 0.8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_watermarks() {
        let config = BackpressureConfig::new()
            .with_high_watermark(0.5)
            .with_low_watermark(0.6);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hysteresis() {
        let config = BackpressureConfig::new()
            .with_high_watermark(0.8)
            .with_low_watermark(0.5);
        let state = BackpressureState::new(config, 10);
        assert!(state.should_accept());

        for _ in 0..8 {
            state.job_started();
        }
        assert!(!state.should_accept());
        assert!(state.reason().is_some());

        // Between the watermarks: still closed
        state.job_finished();
        state.job_finished();
        assert!(!state.should_accept());

        state.job_finished();
        assert!(state.should_accept());
        assert!(state.reason().is_none());
    }

    #[test]
    fn test_available_slots() {
        let state = BackpressureState::new(BackpressureConfig::default(), 4);
        state.job_started();
        state.job_started();
        assert_eq!(state.available_slots(), 2);
        assert_eq!(state.in_flight(), 2);
    }

    #[test]
    fn test_finished_never_underflows() {
        let state = BackpressureState::new(BackpressureConfig::default(), 4);
        state.job_finished();
        assert_eq!(state.in_flight(), 0);
    }
}
