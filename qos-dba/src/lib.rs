//! Dynamic bandwidth allocation between HTB traffic classes.
//!
//! Every class of a direction starts with a configured share of the link. Once a second the
//! rebalancer reads each class's throughput, classifies it as LOW, NORMAL or HIGH against its
//! allocation, and lends bandwidth from classes that have been idle for a while to classes that
//! have been saturated for a while. Loans are recorded in a per-direction ledger and paid back
//! when the borrower quiets down.
//!
//! ```text
//!        tick ──► tracker ──► engine ──► tc
//!                   │           │
//!                   ▼           ▼
//!               durations     ledger (Σ borrowed = 0)
//! ```
//!
//! The rebalancer never exceeds the ceiling written to the root class by the latency monitor.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use qos_dba::{QosConfig, Supervisor, SupervisorOptions, SystemState};
//! use qos_tc::TcCli;
//!
//! # async fn run() -> Result<(), qos_dba::Error> {
//! let config = QosConfig::load("/etc/config/qos_gargoyle")?;
//! let state = SystemState::new(&config)?;
//!
//! let supervisor = Supervisor::spawn(state, Arc::new(TcCli::new()), SupervisorOptions::default());
//! let status = supervisor.handle().status().await?;
//! println!("{status}");
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod class;
pub mod config;
pub mod engine;
pub mod status;
pub mod supervisor;
pub mod system;
pub mod tracker;
mod uci;

pub use class::{TrafficClass, UsageState};
pub use config::{ConfigError, DbaConfig, QosConfig};
pub use engine::{Adjustment, AdjustmentKind, Engine};
pub use status::DbaStatus;
pub use supervisor::{Supervisor, SupervisorHandle, SupervisorOptions};
pub use system::{Link, SystemState, TickReport};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tc(#[from] qos_tc::Error),
    #[error("status file error: {0}")]
    Status(#[from] qos_common::Error),
    #[error("supervisor is not running")]
    SupervisorClosed,
    #[error("tick task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
