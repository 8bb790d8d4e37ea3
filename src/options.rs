//! Component D: validated, immutable lease options.

use std::time::Duration;

use crate::backend::LeaseDuration;
use crate::Error;

/// Configuration shared by every driver. Built through a consuming-self
/// builder, finished by [`LeaseOptionsBuilder::build`], which runs the
/// cross-field validation spec §3 requires and fails eagerly rather than at
/// first use.
#[derive(Clone, Debug)]
pub struct LeaseOptions {
    pub default_duration: LeaseDuration,
    pub auto_renew: bool,
    auto_renew_interval: Option<Duration>,
    pub auto_renew_retry_interval: Duration,
    pub auto_renew_max_retries: u32,
    pub auto_renew_safety_threshold: f64,
    pub acquire_timeout: Option<Duration>,
    pub acquire_retry_interval: Duration,
}

impl LeaseOptions {
    pub fn builder(default_duration: LeaseDuration) -> LeaseOptionsBuilder {
        LeaseOptionsBuilder::new(default_duration)
    }

    /// The effective auto-renew interval: the explicit value if set,
    /// otherwise 2/3 of `default_duration` (spec §3).
    pub fn auto_renew_interval(&self) -> Duration {
        match self.auto_renew_interval {
            Some(d) => d,
            None => match self.default_duration {
                LeaseDuration::Finite(d) => d.mul_f64(2.0 / 3.0),
                LeaseDuration::Infinite => Duration::from_secs(0),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct LeaseOptionsBuilder {
    default_duration: LeaseDuration,
    auto_renew: bool,
    auto_renew_interval: Option<Duration>,
    auto_renew_retry_interval: Duration,
    auto_renew_max_retries: u32,
    auto_renew_safety_threshold: f64,
    acquire_timeout: Option<Duration>,
    acquire_retry_interval: Duration,
}

impl LeaseOptionsBuilder {
    pub fn new(default_duration: LeaseDuration) -> Self {
        Self {
            default_duration,
            auto_renew: true,
            auto_renew_interval: None,
            auto_renew_retry_interval: Duration::from_secs(1),
            auto_renew_max_retries: 3,
            auto_renew_safety_threshold: 0.9,
            acquire_timeout: None,
            acquire_retry_interval: Duration::from_millis(500),
        }
    }

    pub fn auto_renew(mut self, enabled: bool) -> Self {
        self.auto_renew = enabled;
        self
    }

    pub fn auto_renew_interval(mut self, interval: Duration) -> Self {
        self.auto_renew_interval = Some(interval);
        self
    }

    pub fn auto_renew_retry_interval(mut self, interval: Duration) -> Self {
        self.auto_renew_retry_interval = interval;
        self
    }

    pub fn auto_renew_max_retries(mut self, max_retries: u32) -> Self {
        self.auto_renew_max_retries = max_retries;
        self
    }

    pub fn auto_renew_safety_threshold(mut self, threshold: f64) -> Self {
        self.auto_renew_safety_threshold = threshold;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn acquire_retry_interval(mut self, interval: Duration) -> Self {
        self.acquire_retry_interval = interval;
        self
    }

    /// Runs the spec §3 cross-field validation and produces an immutable
    /// [`LeaseOptions`], or an `Error::Configuration` describing the first
    /// violated invariant.
    pub fn build(self) -> Result<LeaseOptions, Error> {
        if !(0.5..=0.95).contains(&self.auto_renew_safety_threshold) {
            return Err(Error::Configuration(format!(
                "auto_renew_safety_threshold must be in [0.5, 0.95], got {}",
                self.auto_renew_safety_threshold
            )));
        }
        if self.auto_renew_retry_interval.is_zero() {
            return Err(Error::Configuration(
                "auto_renew_retry_interval must be positive".into(),
            ));
        }
        if self.acquire_retry_interval.is_zero() {
            return Err(Error::Configuration(
                "acquire_retry_interval must be positive".into(),
            ));
        }

        let default_duration = match self.default_duration {
            LeaseDuration::Finite(d) if d.is_zero() => {
                return Err(Error::Configuration(
                    "default_duration must be positive (or Infinite)".into(),
                ))
            }
            other => other,
        };

        if self.auto_renew {
            if let LeaseDuration::Finite(duration) = default_duration {
                let interval = self
                    .auto_renew_interval
                    .unwrap_or_else(|| duration.mul_f64(2.0 / 3.0));
                let threshold_bound = duration.mul_f64(self.auto_renew_safety_threshold);
                if interval >= threshold_bound {
                    return Err(Error::Configuration(format!(
                        "auto_renew_interval ({interval:?}) must be strictly less than \
                         default_duration * safety_threshold ({threshold_bound:?})"
                    )));
                }
                if self.auto_renew_retry_interval > duration.saturating_sub(interval) {
                    return Err(Error::Configuration(format!(
                        "auto_renew_retry_interval ({:?}) must not exceed \
                         default_duration - auto_renew_interval ({:?})",
                        self.auto_renew_retry_interval,
                        duration.saturating_sub(interval)
                    )));
                }
            }
        }

        Ok(LeaseOptions {
            default_duration,
            auto_renew: self.auto_renew,
            auto_renew_interval: self.auto_renew_interval,
            auto_renew_retry_interval: self.auto_renew_retry_interval,
            auto_renew_max_retries: self.auto_renew_max_retries,
            auto_renew_safety_threshold: self.auto_renew_safety_threshold,
            acquire_timeout: self.acquire_timeout,
            acquire_retry_interval: self.acquire_retry_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let opts = LeaseOptions::builder(LeaseDuration::Finite(Duration::from_secs(30)))
            .build()
            .unwrap();
        assert_eq!(opts.auto_renew_interval(), Duration::from_secs(20));
    }

    #[test]
    fn rejects_interval_past_safety_threshold() {
        let err = LeaseOptions::builder(LeaseDuration::Finite(Duration::from_secs(30)))
            .auto_renew_interval(Duration::from_secs(28))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn rejects_retry_interval_too_large() {
        let err = LeaseOptions::builder(LeaseDuration::Finite(Duration::from_secs(30)))
            .auto_renew_interval(Duration::from_secs(5))
            .auto_renew_retry_interval(Duration::from_secs(26))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn rejects_out_of_range_safety_threshold() {
        let err = LeaseOptions::builder(LeaseDuration::Finite(Duration::from_secs(30)))
            .auto_renew_safety_threshold(0.99)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn infinite_duration_skips_interval_checks() {
        let opts = LeaseOptions::builder(LeaseDuration::Infinite)
            .build()
            .unwrap();
        assert!(opts.auto_renew);
    }
}
