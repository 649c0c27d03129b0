use std::{fmt, time::Instant};

use serde::{Deserialize, Serialize};

use qos_common::Direction;
use qos_tc::ClassTarget;

use crate::config::ClassSpec;

/// Usage classification of a class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UsageState {
    Low,
    #[default]
    Normal,
    High,
}

impl fmt::Display for UsageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
        })
    }
}

/// Seconds spent in each state since the last state change. Only the current state's counter
/// is ever non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDurations {
    pub low: u64,
    pub normal: u64,
    pub high: u64,
}

impl StateDurations {
    pub const fn get(&self, state: UsageState) -> u64 {
        match state {
            UsageState::Low => self.low,
            UsageState::Normal => self.normal,
            UsageState::High => self.high,
        }
    }

    pub fn add(&mut self, state: UsageState, secs: u64) {
        let counter = match state {
            UsageState::Low => &mut self.low,
            UsageState::Normal => &mut self.normal,
            UsageState::High => &mut self.high,
        };
        *counter = counter.saturating_add(secs);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A traffic class and its live allocation.
#[derive(Debug, Clone)]
pub struct TrafficClass {
    pub name: String,
    pub direction: Direction,
    pub target: ClassTarget,
    /// 0 is the highest priority.
    pub priority: u8,
    pub config_percent: u32,
    pub config_min_kbps: u64,
    pub config_max_kbps: u64,
    pub initial_kbps: u64,
    pub current_kbps: u64,
    pub used_kbps: u64,
    pub usage_rate: f64,
    pub avg_usage_rate: f64,
    pub peak_usage_kbps: u64,
    pub state: UsageState,
    pub durations: StateDurations,
    /// Net bandwidth borrowed from other classes. Negative when this class is a net lender.
    pub borrowed_kbps: i64,
    pub adjust_count: u64,
    pub last_adjust: Option<Instant>,
}

impl TrafficClass {
    pub fn new(direction: Direction, target: ClassTarget, spec: &ClassSpec) -> Self {
        Self {
            name: spec.name.clone(),
            direction,
            target,
            priority: spec.priority,
            config_percent: spec.percent,
            config_min_kbps: spec.min_kbps,
            config_max_kbps: spec.max_kbps,
            initial_kbps: spec.initial_kbps,
            current_kbps: spec.initial_kbps,
            used_kbps: 0,
            usage_rate: 0.0,
            avg_usage_rate: 0.0,
            peak_usage_kbps: 0,
            state: UsageState::default(),
            durations: StateDurations::default(),
            borrowed_kbps: 0,
            adjust_count: 0,
            last_adjust: None,
        }
    }

    /// How long the class has been in its current state, in seconds.
    pub const fn state_duration(&self) -> u64 {
        self.durations.get(self.state)
    }

    /// Whether the class held `state` for at least `secs`.
    pub fn sustained(&self, state: UsageState, secs: u64) -> bool {
        self.state == state && self.durations.get(state) >= secs
    }

    pub fn in_cooldown(&self, now: Instant, cooldown_sec: u64) -> bool {
        self.last_adjust.is_some_and(|at| now.saturating_duration_since(at).as_secs() < cooldown_sec)
    }

    /// Bandwidth this class can give away: unused allocation, but never below its minimum.
    pub fn lendable_kbps(&self) -> u64 {
        self.current_kbps
            .saturating_sub(self.used_kbps)
            .min(self.current_kbps.saturating_sub(self.config_min_kbps))
    }

    /// The highest allocation this class may be given under `ceiling`.
    pub fn effective_max_kbps(&self, ceiling: Option<u64>) -> u64 {
        ceiling.map_or(self.config_max_kbps, |c| c.min(self.config_max_kbps))
    }

    pub(crate) fn stamp(&mut self, now: Instant) {
        self.last_adjust = Some(now);
        self.adjust_count += 1;
    }
}
