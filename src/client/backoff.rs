/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Exponential backoff shared by the name-resolver retry path and the
//! subchannel reconnect path.

use std::time::Duration;

use rand::Rng;

#[derive(Clone)]
pub(crate) struct BackoffConfig {
    /// The amount of time to backoff after the first failure.
    pub base_delay: Duration,

    /// The factor with which to multiply backoffs after a failed retry.
    /// Should ideally be greater than 1.
    pub multiplier: f64,

    /// The factor with which backoffs are randomized.
    pub jitter: f64,

    /// The upper bound of backoff delay.
    pub max_delay: Duration,
}

/// The backoff configuration with the default values specified at
/// https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md.
pub(crate) const DEFAULT_EXPONENTIAL_CONFIG: BackoffConfig = BackoffConfig {
    base_delay: Duration::from_secs(1),
    multiplier: 1.6,
    jitter: 0.2,
    max_delay: Duration::from_secs(120),
};

/// The deadline applied to a single connection attempt before it is
/// considered failed, per the connection backoff spec.
pub(crate) const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

impl BackoffConfig {
    fn validate(&self) -> Result<(), &'static str> {
        if self.base_delay > self.max_delay {
            return Err("base_delay must not exceed max_delay");
        }
        if self.multiplier < 1.0 {
            return Err("multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("jitter must be within [0, 1]");
        }
        Ok(())
    }
}

pub(crate) struct ExponentialBackoff {
    config: BackoffConfig,

    /// The delay for the next retry, without the random jitter.  Kept as
    /// f64 seconds to avoid accumulating rounding errors.
    next_delay_secs: f64,
}

impl ExponentialBackoff {
    pub(crate) fn new(config: BackoffConfig) -> Result<Self, &'static str> {
        config.validate()?;
        let next_delay_secs = config.base_delay.as_secs_f64();
        Ok(Self {
            config,
            next_delay_secs,
        })
    }

    /// Restarts the schedule from the base delay.  Called after a success.
    pub(crate) fn reset(&mut self) {
        self.next_delay_secs = self.config.base_delay.as_secs_f64();
    }

    /// Returns the duration to wait before the next attempt and advances
    /// the schedule.
    pub(crate) fn backoff_duration(&mut self) -> Duration {
        let unjittered = self.next_delay_secs;
        self.next_delay_secs = self
            .config
            .max_delay
            .as_secs_f64()
            .min(unjittered * self.config.multiplier);
        let jitter_factor = 1.0 + self.config.jitter * rand::rng().random_range(-1.0..1.0);
        Duration::from_secs_f64(unjittered * jitter_factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG.clone()).is_ok());
    }

    #[test]
    fn rejects_invalid_configs() {
        let base = BackoffConfig {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
            max_delay: Duration::from_secs(10),
        };

        let mut cfg = base.clone();
        cfg.base_delay = Duration::from_secs(100);
        assert!(ExponentialBackoff::new(cfg).is_err());

        let mut cfg = base.clone();
        cfg.multiplier = 0.5;
        assert!(ExponentialBackoff::new(cfg).is_err());

        let mut cfg = base.clone();
        cfg.jitter = -0.1;
        assert!(ExponentialBackoff::new(cfg).is_err());

        let mut cfg = base.clone();
        cfg.jitter = 1.5;
        assert!(ExponentialBackoff::new(cfg).is_err());
    }

    #[test]
    fn doubles_until_capped_and_resets() {
        let cfg = BackoffConfig {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
            max_delay: Duration::from_secs(15),
        };
        let mut backoff = ExponentialBackoff::new(cfg).unwrap();
        for _ in 0..2 {
            assert_eq!(backoff.backoff_duration(), Duration::from_secs(1));
            assert_eq!(backoff.backoff_duration(), Duration::from_secs(2));
            assert_eq!(backoff.backoff_duration(), Duration::from_secs(4));
            assert_eq!(backoff.backoff_duration(), Duration::from_secs(8));
            assert_eq!(backoff.backoff_duration(), Duration::from_secs(15));
            assert_eq!(backoff.backoff_duration(), Duration::from_secs(15));
            backoff.reset();
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let cfg = BackoffConfig {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.2,
            max_delay: Duration::from_secs(15),
        };
        let mut backoff = ExponentialBackoff::new(cfg).unwrap();
        let mut expected = 1.0;
        for _ in 0..3 {
            let d = backoff.backoff_duration().as_secs_f64();
            assert!(d >= expected * 0.8 - 1e-9 && d <= expected * 1.2 + 1e-9);
            expected *= 2.0;
        }
    }
}
