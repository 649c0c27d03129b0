//! Smoothed round-trip latency.

use std::{collections::VecDeque, time::Duration};

use qos_common::Ewma;

use crate::config::ControllerTuning;

/// EWMA latency estimate over clamped samples, plus a short history of recent samples.
#[derive(Debug, Clone)]
pub struct LatencyEstimator {
    filter: Ewma,
    raw_us: Option<u64>,
    max_us: u64,
    history: VecDeque<u64>,
    capacity: usize,
    clamp_us: (u64, u64),
}

impl LatencyEstimator {
    pub fn new(alpha: f64, capacity: usize, min: Duration, max: Duration) -> Self {
        Self {
            filter: Ewma::new(alpha),
            raw_us: None,
            max_us: 0,
            history: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            clamp_us: (min.as_micros() as u64, max.as_micros() as u64),
        }
    }

    /// An estimator for probes sent every `interval`, with a time constant of
    /// `tuning.ping_time_constant` intervals.
    pub fn for_interval(interval: Duration, tuning: &ControllerTuning) -> Self {
        let interval_ms = interval.as_secs_f64() * 1000.0;
        let filter = Ewma::with_time_constant(interval_ms, interval_ms * tuning.ping_time_constant as f64);

        Self::new(filter.alpha(), tuning.history_size, tuning.min_ping, tuning.max_ping)
    }

    /// Starts the filter from a known latency.
    pub fn seed(&mut self, latency: Duration) {
        let us = self.clamp(latency.as_micros() as u64);
        self.filter = self.filter.seeded(us as f64);
    }

    fn clamp(&self, us: u64) -> u64 {
        us.clamp(self.clamp_us.0, self.clamp_us.1)
    }

    /// Folds a round-trip time into the estimate and returns the clamped sample.
    pub fn observe(&mut self, rtt: Duration) -> u64 {
        let raw = rtt.as_micros() as u64;
        self.raw_us = Some(raw);
        self.max_us = self.max_us.max(raw);

        let sample = self.clamp(raw);
        self.filter.update(sample as f64);

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(sample);

        sample
    }

    /// Replaces the estimate with the last raw sample.
    pub fn snap_to_raw(&mut self) {
        if let Some(raw) = self.raw_us {
            let us = self.clamp(raw);
            self.filter.reset();
            self.filter.update(us as f64);
        }
    }

    pub fn filtered_us(&self) -> Option<u64> {
        self.filter.value().map(|v| v.round() as u64)
    }

    pub fn raw_us(&self) -> Option<u64> {
        self.raw_us
    }

    /// Highest raw sample seen, decayed by [`LatencyEstimator::decay_max`].
    pub fn max_us(&self) -> u64 {
        self.max_us
    }

    pub fn set_max_us(&mut self, us: u64) {
        self.max_us = us;
    }

    /// Lowers the maximum by `step_us` while it is above `floor_us`.
    pub fn decay_max(&mut self, step_us: u64, floor_us: u64) {
        if self.max_us > floor_us {
            self.max_us = self.max_us.saturating_sub(step_us).max(floor_us);
        }
    }

    pub fn history(&self) -> impl Iterator<Item = u64> + '_ {
        self.history.iter().copied()
    }

    pub fn alpha(&self) -> f64 {
        self.filter.alpha()
    }
}
