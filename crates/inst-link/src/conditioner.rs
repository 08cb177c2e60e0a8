//! Rate conditioning for pulse-counting instruments
//!
//! Instruments such as the Blue Onyx report how many pulses they saw in
//! each fixed sampling interval. The conditioner keeps the last N of
//! those samples in a ring, averages them into a count rate and corrects
//! the result for detector dead time.
//!
//! An estimate is valid only once every slot holds a sample, and only
//! while samples keep arriving: a gap longer than twice the sampling
//! interval flushes the ring.

use inst_protocol::RateConfig;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Smoothed rate in counts per minute
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateEstimate {
    pub value: f64,
    pub valid: bool,
}

impl RateEstimate {
    const INVALID: RateEstimate = RateEstimate {
        value: 0.0,
        valid: false,
    };
}

/// Non-paralyzable dead-time correction `r / (1 - r·τ)`
///
/// `rate` is in counts per second and `tau` in seconds. Returns `None`
/// when the detector would be saturated (`r·τ ≥ 1`) or the input is not
/// a finite, non-negative rate.
pub fn dead_time_correct(rate: f64, tau: f64) -> Option<f64> {
    if !rate.is_finite() || rate < 0.0 || !tau.is_finite() || tau < 0.0 {
        return None;
    }
    let loss = rate * tau;
    if loss >= 1.0 {
        return None;
    }
    Some(rate / (1.0 - loss))
}

#[derive(Debug, Clone)]
pub struct RateConditioner {
    config: RateConfig,
    slots: Vec<Option<u32>>,
    index: usize,
    last_sample: Option<Instant>,
}

impl RateConditioner {
    pub fn new(config: RateConfig) -> Self {
        Self {
            config,
            slots: vec![None; config.slots()],
            index: 0,
            last_sample: None,
        }
    }

    pub fn config(&self) -> &RateConfig {
        &self.config
    }

    /// Record the count for the interval that just ended
    pub fn push_at(&mut self, count: u32, now: Instant) -> RateEstimate {
        if self.is_stale(now) {
            debug!("Sample gap exceeded {:?}, restarting window", self.config.stale_after());
            self.flush();
        }

        self.slots[self.index] = Some(count);
        self.index = (self.index + 1) % self.slots.len();
        self.last_sample = Some(now);
        self.estimate()
    }

    /// Current estimate, invalid if the last sample is too old
    pub fn estimate_at(&self, now: Instant) -> RateEstimate {
        let estimate = self.estimate();
        if self.is_stale(now) {
            return RateEstimate {
                valid: false,
                ..estimate
            };
        }
        estimate
    }

    /// Forget all samples
    pub fn reset(&mut self) {
        self.flush();
        self.last_sample = None;
    }

    /// Samples currently held
    pub fn populated(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn flush(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.index = 0;
    }

    fn is_stale(&self, now: Instant) -> bool {
        self.last_sample
            .is_some_and(|last| now.saturating_duration_since(last) > self.config.stale_after())
    }

    fn estimate(&self) -> RateEstimate {
        let populated = self.populated();
        if populated == 0 {
            return RateEstimate::INVALID;
        }

        let sum: u64 = self.slots.iter().flatten().map(|&c| u64::from(c)).sum();
        let elapsed = populated as f64 * self.config.sample_interval.as_secs_f64();
        let cps = sum as f64 / elapsed;

        match dead_time_correct(cps, self.config.dead_time_secs) {
            Some(corrected) => RateEstimate {
                value: corrected * 60.0,
                valid: populated == self.slots.len(),
            },
            None => {
                warn!("Count rate {:.1}/s saturates the detector", cps);
                RateEstimate::INVALID
            }
        }
    }
}
