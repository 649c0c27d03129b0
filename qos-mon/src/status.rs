use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use qos_common::format_kbps;

use crate::{
    config::MonitorConfig,
    controller::{ControllerState, LinkState},
};

/// Snapshot of the capacity controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStatus {
    /// Seconds since the Unix epoch.
    pub updated_at: u64,
    pub state: ControllerState,
    pub safe_mode: bool,
    pub interface: String,
    pub target: String,
    pub ceiling_kbps: u64,
    pub total_kbps: u64,
    pub load_kbps: u64,
    pub raw_ping_us: Option<u64>,
    /// `None` while probing is off.
    pub filtered_ping_us: Option<u64>,
    /// `None` while the limit is being measured.
    pub ping_limit_us: Option<u64>,
    pub max_ping_us: u64,
    pub consecutive_drops: u32,
    pub error_count: u64,
}

impl MonitorStatus {
    pub fn new(config: &MonitorConfig, link: &LinkState) -> Self {
        let updated_at =
            SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();

        Self {
            updated_at,
            state: link.state,
            safe_mode: link.safe_mode,
            interface: config.interface.clone(),
            target: config.target.clone(),
            ceiling_kbps: link.current_limit_kbps,
            total_kbps: link.total_kbps,
            load_kbps: link.filtered_load_kbps,
            raw_ping_us: link.raw_ping_us,
            filtered_ping_us: link.filtered_ping_us.filter(|_| link.ping_on),
            ping_limit_us: link.ping_limit_us,
            max_ping_us: link.max_ping_us,
            consecutive_drops: link.consecutive_drops,
            error_count: link.error_count,
        }
    }
}

fn ms(us: u64) -> String {
    format!("{:.1}ms", us as f64 / 1000.0)
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "State: {}", self.state)?;
        writeln!(f, "Safe mode: {}", if self.safe_mode { "ON" } else { "OFF" })?;
        writeln!(f, "Interface: {} (target {})", self.interface, self.target)?;
        writeln!(
            f,
            "Link limit: {} of {}",
            format_kbps(self.ceiling_kbps),
            format_kbps(self.total_kbps)
        )?;
        writeln!(f, "Current load: {}", format_kbps(self.load_kbps))?;
        match (self.raw_ping_us, self.filtered_ping_us) {
            (Some(raw), Some(filtered)) => {
                writeln!(f, "Ping: {} (filtered: {})", ms(raw), ms(filtered))?
            }
            _ => writeln!(f, "Ping: off")?,
        }
        match self.ping_limit_us {
            Some(limit) => writeln!(f, "Ping limit: {}", ms(limit))?,
            None => writeln!(f, "Ping limit: measuring")?,
        }
        writeln!(f, "Max ping: {}", ms(self.max_ping_us))?;
        write!(f, "Drops: {} | Errors: {}", self.consecutive_drops, self.error_count)
    }
}
