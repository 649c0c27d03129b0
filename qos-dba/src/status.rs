//! Snapshots of the rebalancer, as written to the status file and printed by `status`.

use std::fmt;

use serde::{Deserialize, Serialize};

use qos_common::{format_kbps, Direction};

use crate::{class::UsageState, config::DbaConfig, engine::Adjustment};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassStatus {
    pub name: String,
    pub classid: String,
    pub priority: u8,
    pub config_percent: u32,
    pub min_kbps: u64,
    pub max_kbps: u64,
    pub current_kbps: u64,
    pub used_kbps: u64,
    pub usage_rate: f64,
    pub avg_usage_rate: f64,
    pub peak_usage_kbps: u64,
    pub state: UsageState,
    pub state_duration_sec: u64,
    pub borrowed_kbps: i64,
    pub adjust_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub direction: Direction,
    pub interface: String,
    pub total_kbps: u64,
    /// The link ceiling currently permitted by the latency monitor, if it could be read.
    pub ceiling_kbps: Option<u64>,
    pub classes: Vec<ClassStatus>,
}

impl LinkStatus {
    pub fn allocated_kbps(&self) -> u64 {
        self.classes.iter().map(|c| c.current_kbps).sum()
    }

    pub fn ledger_sum(&self) -> i64 {
        self.classes.iter().map(|c| c.borrowed_kbps).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbaStatus {
    /// Seconds since the Unix epoch.
    pub updated_at: u64,
    pub uptime_sec: u64,
    pub ticks: u64,
    pub total_adjustments: u64,
    pub config: DbaConfig,
    pub links: Vec<LinkStatus>,
    /// Adjustments committed during the last tick.
    #[serde(default)]
    pub last_adjustments: Vec<Adjustment>,
}

impl DbaStatus {
    pub fn link(&self, direction: Direction) -> Option<&LinkStatus> {
        self.links.iter().find(|l| l.direction == direction)
    }
}

impl fmt::Display for DbaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.config;
        writeln!(
            f,
            "dba {} | interval {}s | uptime {}s | ticks {} | adjustments {}",
            if c.enabled { "enabled" } else { "disabled" },
            c.tick_interval_sec,
            self.uptime_sec,
            self.ticks,
            self.total_adjustments,
        )?;
        writeln!(
            f,
            "high {}%/{}s | low {}%/{}s | borrow {:.0}% (min {}) | cooldown {}s | return {} {}%/{:.0}%",
            c.high_usage_threshold_pct,
            c.high_usage_duration_sec,
            c.low_usage_threshold_pct,
            c.low_usage_duration_sec,
            c.borrow_ratio * 100.0,
            format_kbps(c.min_borrow_kbps),
            c.cooldown_sec,
            if c.auto_return_enabled { "on" } else { "off" },
            c.return_threshold_pct,
            c.return_speed_ratio * 100.0,
        )?;

        for link in &self.links {
            writeln!(f)?;
            write!(f, "{} on {} | total {}", link.direction, link.interface, format_kbps(link.total_kbps))?;
            if let Some(ceiling) = link.ceiling_kbps {
                write!(f, " | ceiling {}", format_kbps(ceiling))?;
            }
            writeln!(f)?;
            writeln!(
                f,
                "  {:<12} {:>7} {:>5} {:>10} {:>10} {:>10} {:>10} {:>6}  {:<14} {:>9}",
                "class", "id", "cfg%", "min", "max", "current", "used", "use%", "state", "borrowed"
            )?;
            for class in &link.classes {
                let state = format!("{}({}s)", class.state, class.state_duration_sec);
                writeln!(
                    f,
                    "  {:<12} {:>7} {:>5} {:>10} {:>10} {:>10} {:>10} {:>5.1}%  {:<14} {:>+9}",
                    class.name,
                    class.classid,
                    class.config_percent,
                    format_kbps(class.min_kbps),
                    format_kbps(class.max_kbps),
                    format_kbps(class.current_kbps),
                    format_kbps(class.used_kbps),
                    class.usage_rate * 100.0,
                    state,
                    class.borrowed_kbps,
                )?;
            }
        }

        Ok(())
    }
}
