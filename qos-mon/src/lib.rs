//! Latency-driven control of a link's rate ceiling.
//!
//! Queuing delay is the first symptom of a saturated uplink. This crate probes a reference host
//! with ICMP echo requests and steers the rate of a link-wide HTB class so the smoothed round
//! trip stays near a latency budget calibrated on the idle link. When probing is impossible it
//! falls back to safe mode and leaves the link alone.
//!
//! The pieces, bottom up:
//!
//! - [`LatencyEstimator`]: clamped samples, EWMA, short history.
//! - [`Prober`] and [`IcmpProber`]: echo requests over a raw socket.
//! - [`Controller`]: the CHECK/INIT/IDLE/ACTIVE/REALTIME/EXIT state machine and the
//!   multiplicative increase/decrease law.
//! - [`Monitor`]: the cooperative loop tying them to a [`qos_tc::TrafficControl`].

use thiserror::Error;

pub mod config;
pub mod controller;
pub mod estimator;
pub mod icmp;
pub mod monitor;
pub mod status;

pub use config::{ControllerTuning, MonitorConfig};
pub use controller::{Controller, ControllerState, LinkState};
pub use estimator::LatencyEstimator;
pub use icmp::{EchoReply, IcmpProber, Prober};
pub use monitor::{ControlFlags, Monitor};
pub use status::MonitorStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("probe socket: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Tc(#[from] qos_tc::Error),
    #[error("status file error: {0}")]
    Status(#[from] qos_common::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
