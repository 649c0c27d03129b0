//! The capacity controller.
//!
//! ```text
//!  CHECK ──► INIT ──► IDLE ◄──► ACTIVE / REALTIME
//!    └───────────────►  ▲
//!                       └── safe mode entry        any ──► EXIT
//! ```
//!
//! CHECK waits for the target to answer. INIT unloads the link and measures the idle latency
//! to calibrate the ping limit. IDLE stops probing until the link carries traffic; ACTIVE and
//! REALTIME then steer the ceiling so the filtered latency stays at the limit. The ceiling is
//! only written when it moved by more than the change deadband, and never in safe mode.

use std::{fmt, time::Duration, time::Instant};

use serde::{Deserialize, Serialize};

use qos_common::Ewma;
use qos_tc::{ClassTarget, TrafficControl};

use crate::{
    config::{MonitorConfig, DEFAULT_SEED_PING},
    estimator::LatencyEstimator,
    status::MonitorStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControllerState {
    Check,
    Init,
    Active,
    Realtime,
    Idle,
    Exit,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Check => "CHECK",
            Self::Init => "INIT",
            Self::Active => "ACTIVE",
            Self::Realtime => "REALTIME",
            Self::Idle => "IDLE",
            Self::Exit => "EXIT",
        })
    }
}

/// Live state of the managed link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkState {
    pub total_kbps: u64,
    /// The ceiling the controller wants. Always within the tuning's ratio bounds.
    pub current_limit_kbps: u64,
    /// The ceiling last written to the link class.
    pub committed_kbps: Option<u64>,
    pub filtered_load_kbps: u64,
    pub raw_ping_us: Option<u64>,
    pub filtered_ping_us: Option<u64>,
    /// Latency budget. `None` until calibrated.
    pub ping_limit_us: Option<u64>,
    pub max_ping_us: u64,
    pub state: ControllerState,
    pub safe_mode: bool,
    pub ping_on: bool,
    pub consecutive_drops: u32,
    pub error_count: u64,
}

fn micros(d: Duration) -> u64 {
    d.as_micros() as u64
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[derive(Debug, Clone)]
pub struct Controller {
    config: MonitorConfig,
    target: ClassTarget,
    link: LinkState,
    ping: LatencyEstimator,
    load: Ewma,
    replies: u32,
    saved_active_kbps: u64,
    saved_realtime_kbps: u64,
    calibration_started: Option<Instant>,
}

impl Controller {
    pub fn new(config: MonitorConfig) -> Self {
        let tuning = &config.tuning;
        let total = config.total_kbps;
        let (min, max) = tuning.bounds(total);

        let mut ping = LatencyEstimator::for_interval(config.ping_interval, tuning);
        ping.set_max_us(config.max_ping.map_or(micros(config.ping_interval), micros));
        let load = Ewma::with_time_constant(millis(tuning.stats_interval), millis(tuning.load_time_constant));

        let mut link = LinkState {
            total_kbps: total,
            current_limit_kbps: ((total as f64 * tuning.safe_start_ratio) as u64).clamp(min, max),
            committed_kbps: None,
            filtered_load_kbps: 0,
            raw_ping_us: None,
            filtered_ping_us: None,
            ping_limit_us: config.ping_limit.map(micros),
            max_ping_us: ping.max_us(),
            state: ControllerState::Check,
            safe_mode: false,
            ping_on: true,
            consecutive_drops: 0,
            error_count: 0,
        };

        if config.skip_calibration {
            ping.seed(config.seed_ping.unwrap_or(DEFAULT_SEED_PING));
            let filtered = ping.filtered_us().unwrap_or_default();
            let factor = if config.auto_entitlement { 1.1 } else { 2.0 };
            let limit = link.ping_limit_us.unwrap_or((filtered as f64 * factor) as u64);

            if config.max_ping.is_none() {
                ping.set_max_us(limit * 2);
            }
            link.ping_limit_us = Some(limit);
            link.filtered_ping_us = Some(filtered);
            link.max_ping_us = ping.max_us();
            link.current_limit_kbps = config
                .seed_limit_kbps
                .unwrap_or((total as f64 * tuning.reset_ratio) as u64)
                .clamp(min, max);
            link.state = ControllerState::Idle;
            link.ping_on = false;
        }

        Self {
            target: config.link_target(),
            saved_active_kbps: link.current_limit_kbps,
            saved_realtime_kbps: link.current_limit_kbps,
            config,
            link,
            ping,
            load,
            replies: 0,
            calibration_started: None,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn link(&self) -> &LinkState {
        &self.link
    }

    pub fn state(&self) -> ControllerState {
        self.link.state
    }

    /// Whether probes should be sent.
    pub fn ping_on(&self) -> bool {
        self.link.ping_on
    }

    pub fn estimator(&self) -> &LatencyEstimator {
        &self.ping
    }

    fn sync_ping(&mut self) {
        self.link.raw_ping_us = self.ping.raw_us();
        self.link.filtered_ping_us = self.ping.filtered_us();
        self.link.max_ping_us = self.ping.max_us();
    }

    /// A reply to the last probe arrived.
    pub fn on_reply(&mut self, rtt: Duration) {
        self.replies = self.replies.saturating_add(1);
        self.link.consecutive_drops = 0;

        if self.link.ping_on {
            self.ping.observe(rtt);
            self.sync_ping();
        }
    }

    /// The last probe went unanswered.
    pub fn on_timeout(&mut self) {
        self.link.consecutive_drops = self.link.consecutive_drops.saturating_add(1);
        tracing::debug!(drops = self.link.consecutive_drops, "probe lost");
    }

    /// Folds one throughput reading of the link class into the load estimate.
    pub fn on_load_sample(&mut self, used_kbps: u64) {
        let filtered = self.load.update(used_kbps as f64);
        self.link.filtered_load_kbps = (filtered.max(0.0) as u64).min(self.link.total_kbps);
    }

    fn utilization(&self) -> f64 {
        self.link.filtered_load_kbps as f64 / self.link.total_kbps.max(1) as f64
    }

    /// Runs one control evaluation, then commits the ceiling if it moved enough.
    pub fn evaluate(&mut self, now: Instant, tc: &dyn TrafficControl) {
        match self.link.state {
            ControllerState::Check => self.check(now, tc),
            ControllerState::Init => self.calibrate(now),
            ControllerState::Idle => self.idle(),
            ControllerState::Active | ControllerState::Realtime => self.steer(),
            ControllerState::Exit => return,
        }
        self.commit(tc);
    }

    fn transition(&mut self, next: ControllerState) {
        if next != self.link.state {
            tracing::info!(from = %self.link.state, to = %next, ceiling = self.link.current_limit_kbps, "controller state changed");
            self.link.state = next;
        }
    }

    fn check(&mut self, now: Instant, tc: &dyn TrafficControl) {
        self.link.ping_on = true;
        if self.replies < 2 {
            return;
        }

        match self.config.ping_limit {
            Some(limit) if !self.config.auto_entitlement => {
                self.ping.snap_to_raw();
                self.sync_ping();
                self.set_ping_limit(micros(limit));
                self.link.ping_on = false;
                self.transition(ControllerState::Idle);
            }
            _ => {
                self.write(tc, self.config.tuning.calibration_floor_kbps);
                self.replies = 0;
                self.calibration_started = Some(now);
                self.transition(ControllerState::Init);
            }
        }
    }

    fn set_ping_limit(&mut self, limit_us: u64) {
        self.link.ping_limit_us = Some(limit_us);
        if self.config.max_ping.is_none() {
            self.ping.set_max_us(limit_us * 2);
            self.link.max_ping_us = self.ping.max_us();
        }
    }

    /// Ping limit derived from an idle latency measurement.
    pub fn calibrated_limit_us(&self, filtered_us: u64) -> u64 {
        let tuning = &self.config.tuning;
        let limit = if self.config.auto_entitlement {
            (filtered_us as f64 * 1.1) as u64 + self.config.ping_limit.map_or(0, micros)
        } else {
            filtered_us * 2
        };
        limit.clamp(micros(tuning.min_ping_limit), micros(tuning.max_ping_limit))
    }

    fn calibrate(&mut self, now: Instant) {
        let started = *self.calibration_started.get_or_insert(now);
        if now.saturating_duration_since(started) < self.config.tuning.calibration_window {
            return;
        }

        let Some(filtered) = self.ping.filtered_us() else {
            tracing::warn!("no latency samples yet, extending calibration");
            return;
        };

        let limit = self.calibrated_limit_us(filtered);
        self.set_ping_limit(limit);
        self.calibration_started = None;
        self.link.ping_on = false;
        tracing::info!(filtered_us = filtered, limit_us = limit, "calibration complete");
        self.transition(ControllerState::Idle);
    }

    fn idle(&mut self) {
        self.link.ping_on = false;
        if self.utilization() <= self.config.tuning.activate_threshold {
            return;
        }

        if self.config.auto_entitlement {
            self.link.current_limit_kbps = self.saved_active_kbps;
            self.transition(ControllerState::Active);
        } else {
            self.link.current_limit_kbps = self.saved_realtime_kbps;
            self.transition(ControllerState::Realtime);
        }
        self.link.ping_on = true;
    }

    /// The latency budget in effect in the current state.
    pub fn effective_ping_limit_us(&self) -> Option<u64> {
        let limit = self.link.ping_limit_us?;
        let limit = match (self.link.state, self.config.ping_limit) {
            (ControllerState::Active, Some(custom)) if self.config.auto_entitlement => {
                (micros(custom) as f64 * self.config.tuning.entitlement_scale) as u64 + limit
            }
            _ => limit,
        };
        Some(if limit == 0 { micros(self.config.tuning.min_ping_limit) } else { limit })
    }

    fn steer(&mut self) {
        let tuning = &self.config.tuning;
        let current = self.link.current_limit_kbps;

        if self.link.state == ControllerState::Active {
            self.saved_active_kbps = current;
        } else {
            self.saved_realtime_kbps = current;
        }

        if self.utilization() < tuning.idle_threshold {
            self.link.ping_on = false;
            self.transition(ControllerState::Idle);
            return;
        }

        let (Some(filtered), Some(limit)) = (self.link.filtered_ping_us, self.effective_ping_limit_us())
        else {
            return;
        };

        let error_ratio = (filtered as f64 - limit as f64) / limit as f64;
        let factor = if error_ratio < 0.0 {
            if (self.link.filtered_load_kbps as f64) < current as f64 * tuning.hold_utilisation {
                return;
            }
            1.0 - tuning.growth_gain * error_ratio
        } else {
            (1.0 - tuning.shrink_gain * (error_ratio + tuning.shrink_offset)).max(1.0 - tuning.max_shrink)
        };

        let (min, max) = tuning.bounds(self.link.total_kbps);
        let next = ((current as f64 * factor) as u64).clamp(min, max);
        if next != current {
            tracing::debug!(from = current, to = next, error_ratio, "ceiling adjusted");
        }
        self.link.current_limit_kbps = next;

        self.ping.decay_max(micros(tuning.max_ping_decay), limit);
        self.link.max_ping_us = self.ping.max_us();
    }

    fn write(&mut self, tc: &dyn TrafficControl, kbps: u64) -> bool {
        if self.link.safe_mode {
            return false;
        }

        match tc.apply_rate(&self.target, kbps) {
            Ok(()) => {
                tracing::info!(kbps, "link ceiling written");
                self.link.committed_kbps = Some(kbps);
                true
            }
            Err(e) => {
                self.link.error_count += 1;
                tracing::warn!(kbps, error = %e, "failed to write link ceiling");
                false
            }
        }
    }

    /// Writes the current ceiling if it differs from the last written one by more than the
    /// change deadband. Returns whether a write happened.
    pub fn commit(&mut self, tc: &dyn TrafficControl) -> bool {
        if !matches!(
            self.link.state,
            ControllerState::Idle | ControllerState::Active | ControllerState::Realtime
        ) {
            return false;
        }

        let kbps = self.link.current_limit_kbps;
        let moved = self
            .link
            .committed_kbps
            .map_or(true, |prev| prev.abs_diff(kbps) > self.config.tuning.min_change_kbps);

        moved && self.write(tc, kbps)
    }

    /// Snaps the ceiling to the reset ratio of the provisioned bandwidth and writes it.
    pub fn reset_ceiling(&mut self, tc: &dyn TrafficControl) {
        let tuning = &self.config.tuning;
        let (min, max) = tuning.bounds(self.link.total_kbps);
        let kbps = ((self.link.total_kbps as f64 * tuning.reset_ratio) as u64).clamp(min, max);

        tracing::info!(kbps, "ceiling reset");
        self.link.current_limit_kbps = kbps;
        if self.link.state != ControllerState::Exit {
            self.write(tc, kbps);
        }
    }

    pub fn set_safe_mode(&mut self, on: bool) {
        if self.link.safe_mode != on {
            tracing::warn!(safe_mode = on, "safe mode changed");
            self.link.safe_mode = on;
        }
    }

    pub fn toggle_safe_mode(&mut self) {
        self.set_safe_mode(!self.link.safe_mode);
    }

    /// Gives up on probing: safe mode, parked in IDLE.
    pub fn enter_safe_mode(&mut self) {
        self.set_safe_mode(true);
        self.link.ping_on = false;
        self.transition(ControllerState::Idle);
    }

    /// Enters EXIT, restoring the full provisioned bandwidth unless in safe mode.
    pub fn shutdown(&mut self, tc: &dyn TrafficControl) {
        self.link.ping_on = false;
        self.transition(ControllerState::Exit);
        let total = self.link.total_kbps;
        self.write(tc, total);
    }

    pub fn snapshot(&self) -> MonitorStatus {
        MonitorStatus::new(&self.config, &self.link)
    }
}
