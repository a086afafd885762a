//! Adaptive query pacing
//!
//! Two intervals govern how eagerly the tunnel polls its peer:
//!
//! - **ack delay**: how long to wait after fresh data arrived before sending
//!   a pure acknowledgement (and polling for the follow-up)
//! - **keep-alive interval**: how long an idle tunnel waits between probes
//!
//! Failed or empty rounds back both off; rounds that move data tighten them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounds and step factors for [`AdaptiveTiming`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    #[serde(with = "humantime_serde")]
    pub min_ack_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub max_ack_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub initial_ack_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub min_keepalive_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub max_keepalive_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub initial_keepalive_interval: Duration,

    /// Multiplier applied on every unproductive round
    pub backoff_factor: f64,

    /// Divisor applied on every round that carried payload
    pub recovery_factor: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            min_ack_delay: Duration::from_millis(20),
            max_ack_delay: Duration::from_millis(1500),
            initial_ack_delay: Duration::from_millis(200),
            min_keepalive_interval: Duration::from_millis(200),
            max_keepalive_interval: Duration::from_secs(15),
            initial_keepalive_interval: Duration::from_secs(1),
            backoff_factor: 1.5,
            recovery_factor: 2.0,
        }
    }
}

impl TimingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_ack_delay.is_zero() || self.min_keepalive_interval.is_zero() {
            return Err("Minimum pacing intervals must be non-zero".to_string());
        }
        if self.min_ack_delay > self.max_ack_delay {
            return Err("min_ack_delay exceeds max_ack_delay".to_string());
        }
        if self.min_keepalive_interval > self.max_keepalive_interval {
            return Err("min_keepalive_interval exceeds max_keepalive_interval".to_string());
        }
        if !(self.backoff_factor > 1.0) || !self.backoff_factor.is_finite() {
            return Err("backoff_factor must be a finite number above 1.0".to_string());
        }
        if !(self.recovery_factor > 1.0) || !self.recovery_factor.is_finite() {
            return Err("recovery_factor must be a finite number above 1.0".to_string());
        }
        Ok(())
    }
}

/// Snapshot of the current pacing intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub ack_delay: Duration,
    pub keepalive_interval: Duration,
}

/// Pacing controller, owned by one transmission control
#[derive(Debug, Clone)]
pub struct AdaptiveTiming {
    config: TimingConfig,
    ack_delay: Duration,
    keepalive_interval: Duration,
}

impl AdaptiveTiming {
    pub fn new(config: TimingConfig) -> Self {
        let ack_delay = bound(
            config.initial_ack_delay,
            config.min_ack_delay,
            config.max_ack_delay,
        );
        let keepalive_interval = bound(
            config.initial_keepalive_interval,
            config.min_keepalive_interval,
            config.max_keepalive_interval,
        );
        Self {
            config,
            ack_delay,
            keepalive_interval,
        }
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            ack_delay: self.ack_delay,
            keepalive_interval: self.keepalive_interval,
        }
    }

    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    /// Back off after a failed query or a round that moved no data
    pub fn increase_timing_interval(&mut self) {
        let factor = self.config.backoff_factor;
        self.ack_delay = bound(
            grow(self.ack_delay, factor),
            self.config.min_ack_delay,
            self.config.max_ack_delay,
        );
        self.keepalive_interval = bound(
            grow(self.keepalive_interval, factor),
            self.config.min_keepalive_interval,
            self.config.max_keepalive_interval,
        );
    }

    /// Tighten after a round that carried payload
    pub fn decrease_timing_interval(&mut self) {
        let factor = self.config.recovery_factor;
        self.ack_delay = bound(
            self.ack_delay.div_f64(factor),
            self.config.min_ack_delay,
            self.config.max_ack_delay,
        );
        self.keepalive_interval = bound(
            self.keepalive_interval.div_f64(factor),
            self.config.min_keepalive_interval,
            self.config.max_keepalive_interval,
        );
    }
}

/// Clamp without panicking on inverted bounds (max wins)
fn bound(value: Duration, min: Duration, max: Duration) -> Duration {
    value.max(min).min(max)
}

/// Multiply, always advancing by at least a millisecond
fn grow(interval: Duration, factor: f64) -> Duration {
    let scaled = interval.mul_f64(factor);
    scaled.max(interval + Duration::from_millis(1))
}
