use std::time::Duration;

use qos_tc::{ClassId, ClassTarget};

use crate::{Error, Result};

/// Constants of the capacity controller. The defaults are the router's field-tuned values.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerTuning {
    /// Lowest ceiling, as a fraction of the provisioned bandwidth.
    pub min_bandwidth_ratio: f64,
    /// Highest ceiling, as a fraction of the provisioned bandwidth.
    pub max_bandwidth_ratio: f64,
    /// Ceiling changes at or below this are not written.
    pub min_change_kbps: u64,
    pub idle_threshold: f64,
    pub activate_threshold: f64,
    pub stats_interval: Duration,
    pub control_interval: Duration,
    pub history_size: usize,
    pub min_ping: Duration,
    pub max_ping: Duration,
    pub min_ping_limit: Duration,
    pub max_ping_limit: Duration,
    pub calibration_window: Duration,
    /// Rate the link is unloaded to while the baseline is measured.
    pub calibration_floor_kbps: u64,
    pub safe_start_ratio: f64,
    pub reset_ratio: f64,
    pub growth_gain: f64,
    pub shrink_gain: f64,
    pub shrink_offset: f64,
    /// Largest single decrease, as a fraction of the ceiling.
    pub max_shrink: f64,
    /// The ceiling is not grown while the load stays below this fraction of it.
    pub hold_utilisation: f64,
    /// Weight of a user entitlement in the ACTIVE ping limit.
    pub entitlement_scale: f64,
    pub max_ping_decay: Duration,
    pub load_time_constant: Duration,
    /// Probe filter time constant, in probe intervals.
    pub ping_time_constant: u32,
    pub connectivity_attempts: u32,
    pub connectivity_interval: Duration,
}

impl Default for ControllerTuning {
    fn default() -> Self {
        Self {
            min_bandwidth_ratio: 0.25,
            max_bandwidth_ratio: 0.95,
            min_change_kbps: 50,
            idle_threshold: 0.01,
            activate_threshold: 0.01,
            stats_interval: Duration::from_millis(1000),
            control_interval: Duration::from_millis(2000),
            history_size: 10,
            min_ping: Duration::from_millis(5),
            max_ping: Duration::from_millis(800),
            min_ping_limit: Duration::from_millis(10),
            max_ping_limit: Duration::from_millis(800),
            calibration_window: Duration::from_secs(15),
            calibration_floor_kbps: 10,
            safe_start_ratio: 0.8,
            reset_ratio: 0.9,
            growth_gain: 0.002,
            shrink_gain: 0.004,
            shrink_offset: 0.1,
            max_shrink: 0.15,
            hold_utilisation: 0.85,
            entitlement_scale: 1.35,
            max_ping_decay: Duration::from_micros(100),
            load_time_constant: Duration::from_millis(7500),
            ping_time_constant: 4,
            connectivity_attempts: 10,
            connectivity_interval: Duration::from_secs(1),
        }
    }
}

impl ControllerTuning {
    /// Ceiling bounds for a link of `total_kbps`.
    pub fn bounds(&self, total_kbps: u64) -> (u64, u64) {
        let min = (total_kbps as f64 * self.min_bandwidth_ratio) as u64;
        let max = (total_kbps as f64 * self.max_bandwidth_ratio) as u64;
        (min, max.max(min))
    }
}

/// Everything the monitor needs to run.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub ping_interval: Duration,
    /// Host name or address probed for latency.
    pub target: String,
    /// Provisioned bandwidth of the link.
    pub total_kbps: u64,
    pub interface: String,
    /// Class whose rate is the link ceiling.
    pub classid: ClassId,
    /// User latency entitlement. Replaces calibration unless `auto_entitlement` is set.
    pub ping_limit: Option<Duration>,
    /// Calibrate with the entitlement added and run in the minimum-RTT mode.
    pub auto_entitlement: bool,
    pub skip_calibration: bool,
    /// Filtered ping assumed when calibration is skipped.
    pub seed_ping: Option<Duration>,
    /// Ceiling assumed when calibration is skipped.
    pub seed_limit_kbps: Option<u64>,
    pub max_ping: Option<Duration>,
    pub tuning: ControllerTuning,
}

pub const DEFAULT_CLASSID: ClassId = ClassId::new(1, 1);
pub const DEFAULT_SEED_PING: Duration = Duration::from_millis(20);

const PING_INTERVAL_RANGE: (u64, u64) = (100, 2000);
const MIN_TOTAL_KBPS: u64 = 100;

impl MonitorConfig {
    pub fn new(
        ping_interval: Duration,
        target: impl Into<String>,
        total_kbps: u64,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            ping_interval,
            target: target.into(),
            total_kbps,
            interface: interface.into(),
            classid: DEFAULT_CLASSID,
            ping_limit: None,
            auto_entitlement: false,
            skip_calibration: false,
            seed_ping: None,
            seed_limit_kbps: None,
            max_ping: None,
            tuning: ControllerTuning::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: ControllerTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let ms = self.ping_interval.as_millis() as u64;
        if !(PING_INTERVAL_RANGE.0..=PING_INTERVAL_RANGE.1).contains(&ms) {
            return Err(Error::InvalidArgument(format!(
                "ping interval {ms}ms outside {}..={}ms",
                PING_INTERVAL_RANGE.0, PING_INTERVAL_RANGE.1
            )));
        }
        if self.total_kbps < MIN_TOTAL_KBPS {
            return Err(Error::InvalidArgument(format!(
                "bandwidth {}kbit below {MIN_TOTAL_KBPS}kbit",
                self.total_kbps
            )));
        }
        if self.interface.is_empty() {
            return Err(Error::InvalidArgument("no interface".into()));
        }
        Ok(())
    }

    /// The class the ceiling is written to.
    pub fn link_target(&self) -> ClassTarget {
        ClassTarget::new(&self.interface, self.classid)
    }
}
