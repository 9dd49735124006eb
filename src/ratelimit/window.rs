//! Capacity, rate threshold and the window arithmetic derived from them.

use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::store::ttl_millis;

/// Validated limiter parameters.
///
/// The window length is `capacity / rate_threshold` seconds, so admitting
/// `capacity` requests per window admits `rate_threshold` requests per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSettings {
    capacity: u64,
    rate_threshold: f64,
}

impl RateSettings {
    /// Validate and build settings. `max_rate_threshold` is the configured
    /// ceiling the threshold may not exceed.
    pub fn new(capacity: u64, rate_threshold: f64, max_rate_threshold: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(TurnstileError::Config(
                "tokens_per_bucket must be greater than 0".to_string(),
            ));
        }
        if !rate_threshold.is_finite() || rate_threshold <= 0.0 {
            return Err(TurnstileError::Config(format!(
                "rate_threshold must be a positive number, got {}",
                rate_threshold
            )));
        }
        if rate_threshold > max_rate_threshold {
            return Err(TurnstileError::Config(format!(
                "rate_threshold {} exceeds the maximum of {}",
                rate_threshold, max_rate_threshold
            )));
        }
        Ok(Self {
            capacity,
            rate_threshold,
        })
    }

    /// Maximum admitted requests per window.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Target admitted requests per second.
    pub fn rate_threshold(&self) -> f64 {
        self.rate_threshold
    }

    /// Window length in seconds.
    pub fn window_secs(&self) -> f64 {
        self.capacity as f64 / self.rate_threshold
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.window_secs())
    }

    /// Index of the fixed window containing `now`.
    pub fn window_index(&self, now: f64) -> i64 {
        (now / self.window_secs()).floor() as i64
    }

    /// Share of the trailing window that still overlaps the previous fixed
    /// window: 1 at a boundary, approaching 0 just before the next one.
    pub fn previous_window_weight(&self, now: f64) -> f64 {
        let position = now / self.window_secs();
        position.floor() + 1.0 - position
    }

    /// TTL spanning `windows` window lengths, in milliseconds.
    pub fn ttl_ms(&self, windows: f64) -> u64 {
        ttl_millis(self.window_secs() * windows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_derived_from_capacity_and_rate() {
        let settings = RateSettings::new(10, 5.0, 100.0).unwrap();
        assert_eq!(settings.window_secs(), 2.0);
        assert_eq!(settings.window(), Duration::from_secs(2));
        assert_eq!(settings.ttl_ms(2.0), 4000);
    }

    #[test]
    fn test_window_index() {
        let settings = RateSettings::new(10, 10.0, 100.0).unwrap();
        assert_eq!(settings.window_index(0.0), 0);
        assert_eq!(settings.window_index(0.99), 0);
        assert_eq!(settings.window_index(1.0), 1);
        assert_eq!(settings.window_index(41.5), 41);
    }

    #[test]
    fn test_previous_window_weight() {
        let settings = RateSettings::new(10, 5.0, 100.0).unwrap();
        // Window of 2s; 0.5s into window 5 leaves 75% overlap with window 4.
        assert!((settings.previous_window_weight(10.5) - 0.75).abs() < 1e-9);
        assert!((settings.previous_window_weight(10.0) - 1.0).abs() < 1e-9);
        assert!(settings.previous_window_weight(11.999) < 0.001);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        assert!(RateSettings::new(0, 5.0, 100.0).is_err());
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        assert!(RateSettings::new(10, 0.0, 100.0).is_err());
        assert!(RateSettings::new(10, -1.0, 100.0).is_err());
        assert!(RateSettings::new(10, f64::NAN, 100.0).is_err());
    }

    #[test]
    fn test_rejects_rate_above_maximum() {
        let err = RateSettings::new(10, 150.0, 100.0).unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum"));
        assert!(RateSettings::new(10, 100.0, 100.0).is_ok());
    }
}
