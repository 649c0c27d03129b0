//! Per-tick usage sampling and the LOW/NORMAL/HIGH classifier.

use qos_common::clamp_ratio;
use qos_tc::TrafficControl;

use crate::{
    class::{TrafficClass, UsageState},
    config::DbaConfig,
};

/// Weight of the previous average in `avg_usage_rate`.
const AVG_DECAY: f64 = 0.9;

/// Usage thresholds in percent of the allocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub high_pct: f64,
    pub low_pct: f64,
}

impl From<&DbaConfig> for Thresholds {
    fn from(config: &DbaConfig) -> Self {
        Self {
            high_pct: config.high_usage_threshold_pct as f64,
            low_pct: config.low_usage_threshold_pct as f64,
        }
    }
}

/// Outcome of classifying one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: UsageState,
    pub changed: bool,
}

/// Classifies a usage ratio and reports whether that leaves `current`.
pub fn transition(current: UsageState, usage_rate: f64, thresholds: &Thresholds) -> Transition {
    let pct = usage_rate * 100.0;
    let state = if pct >= thresholds.high_pct {
        UsageState::High
    } else if pct <= thresholds.low_pct {
        UsageState::Low
    } else {
        UsageState::Normal
    };

    Transition { state, changed: state != current }
}

/// `used / allocation`, clamped to `[0, 1]`. An allocation of zero with traffic is saturated.
pub fn usage_rate(used_kbps: u64, allocation_kbps: u64) -> f64 {
    if allocation_kbps == 0 {
        return if used_kbps > 0 { 1.0 } else { 0.0 };
    }
    clamp_ratio(used_kbps as f64 / allocation_kbps as f64)
}

/// Folds one measurement into a class.
///
/// `allocation_kbps` is the rate the class is shaped to right now; when it could not be read
/// the class's own ledger value is used.
pub fn observe(
    class: &mut TrafficClass,
    used_kbps: u64,
    allocation_kbps: Option<u64>,
    tick_secs: u64,
    thresholds: &Thresholds,
) {
    let allocation = allocation_kbps.unwrap_or(class.current_kbps);

    class.used_kbps = used_kbps;
    class.usage_rate = usage_rate(used_kbps, allocation);
    class.avg_usage_rate = class.avg_usage_rate * AVG_DECAY + class.usage_rate * (1.0 - AVG_DECAY);
    class.peak_usage_kbps = class.peak_usage_kbps.max(used_kbps);

    let next = transition(class.state, class.usage_rate, thresholds);
    if next.changed {
        tracing::debug!(class = %class.name, from = %class.state, to = %next.state, rate = class.usage_rate, "usage state changed");
        class.state = next.state;
        class.durations.reset();
    }
    class.durations.add(class.state, tick_secs);
}

/// Samples every class through `tc`.
///
/// A failed usage read holds the last known value; a failed rate read falls back to the
/// ledger. Neither is fatal.
pub fn sample_all(
    classes: &mut [TrafficClass],
    tc: &dyn TrafficControl,
    config: &DbaConfig,
) {
    let thresholds = Thresholds::from(config);

    for class in classes.iter_mut() {
        let used = match tc.read_used_kbps(&class.target) {
            Ok(kbps) => kbps,
            Err(e) => {
                tracing::warn!(class = %class.name, error = %e, "usage read failed, holding last value");
                class.used_kbps
            }
        };

        let allocation = match tc.read_current_kbps(&class.target) {
            Ok(kbps) => {
                if kbps != class.current_kbps {
                    tracing::debug!(class = %class.name, tc = kbps, ledger = class.current_kbps, "shaped rate differs from allocation");
                }
                Some(kbps)
            }
            Err(e) => {
                tracing::debug!(class = %class.name, error = %e, "rate read failed");
                None
            }
        };

        observe(class, used, allocation, config.tick_interval_sec, &thresholds);
    }
}
