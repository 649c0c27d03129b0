//! # Traffic Control Adapter
//!
//! The control loops never talk to the kernel directly. Everything they need from Linux traffic
//! control goes through the [`TrafficControl`] trait: set the rate of an HTB class, read how
//! much it is sending, and read the rate it is currently shaped to.
//!
//! ## Class Layout
//!
//! Classes are expected to be provisioned already (qdisc selection and packet marking happen
//! elsewhere). The adapter only ever changes `rate` and `ceil` of existing HTB classes, keeping
//! both equal so a class cannot borrow past its allocation on its own.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 HTB root qdisc (1:0)                      │
//! └──────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │        Link class (1:1)  rate = ceil = link ceiling       │
//! │        written by the latency-driven capacity controller  │
//! └──────────────────────────────────────────────────────────┘
//!                              │
//!            ┌─────────────────┼─────────────────┐
//!            ▼                 ▼                 ▼
//!    ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//!    │  Class 1:10  │  │  Class 1:20  │  │  Class 1:30  │
//!    │  realtime    │  │  normal      │  │  bulk        │
//!    └──────────────┘  └──────────────┘  └──────────────┘
//!       rate = ceil = currentKbps, written by the class rebalancer
//! ```
//!
//! ## Implementations
//!
//! - [`TcCli`] shells out to `tc(8)`. Writes use `tc class change`, falling back once to
//!   `tc class replace`. Usage is derived from the `Sent N bytes` counter of
//!   `tc -s class show` by a per-class [`RateMeter`].
//! - [`MemoryTc`] keeps everything in memory. It is used by tests and dry runs.
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use std::{fmt, sync::Arc};

pub mod command;

mod handle;
pub use handle::ClassId;

mod htb;
pub use htb::{ApplyVerb, ClassRateRequest, ClassShowRequest, TcCli, MIN_RATE_KBPS};

mod memory;
pub use memory::{MemoryTc, RateWrite};

mod stats;
pub use stats::{parse_class_show, ClassStats, RateMeter};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("command error: {0}")]
    Command(#[from] command::Error),
    #[error("failed to apply {kbps}kbit to {target}")]
    Apply { target: ClassTarget, kbps: u64, source: command::Error },
    #[error("write to {0} rejected")]
    Rejected(ClassTarget),
    #[error("unexpected tc output: {0}")]
    Parse(String),
    #[error("no such class: {0}")]
    UnknownClass(ClassTarget),
    #[error("invalid class handle: {0:?}")]
    InvalidHandle(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Addresses a single HTB class on an interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassTarget {
    /// The network interface the class lives on.
    pub interface: String,
    /// The parent class, passed through to `tc` when set.
    pub parent: Option<ClassId>,
    /// The class handle.
    pub classid: ClassId,
}

impl ClassTarget {
    pub fn new(interface: impl Into<String>, classid: ClassId) -> Self {
        Self { interface: interface.into(), parent: None, classid }
    }

    /// Set the parent handle.
    pub fn with_parent(mut self, parent: ClassId) -> Self {
        self.parent = Some(parent);
        self
    }
}

impl fmt::Display for ClassTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.interface, self.classid)
    }
}

/// The contract between the control loops and the kernel traffic-control facility.
///
/// All rates are kbit/s. Implementations handle their own retries and report a plain
/// success/failure; callers treat any error as "this single operation did not happen".
pub trait TrafficControl: Send + Sync {
    /// Shapes `target` to `kbps` (rate = ceil). Applying an unchanged value is a no-op.
    fn apply_rate(&self, target: &ClassTarget, kbps: u64) -> Result<()>;

    /// Throughput of `target` since the previous read.
    fn read_used_kbps(&self, target: &ClassTarget) -> Result<u64>;

    /// The rate `target` is currently shaped to.
    fn read_current_kbps(&self, target: &ClassTarget) -> Result<u64>;
}

impl<T: TrafficControl + ?Sized> TrafficControl for Arc<T> {
    fn apply_rate(&self, target: &ClassTarget, kbps: u64) -> Result<()> {
        (**self).apply_rate(target, kbps)
    }

    fn read_used_kbps(&self, target: &ClassTarget) -> Result<u64> {
        (**self).read_used_kbps(target)
    }

    fn read_current_kbps(&self, target: &ClassTarget) -> Result<u64> {
        (**self).read_current_kbps(target)
    }
}

impl<T: TrafficControl + ?Sized> TrafficControl for &T {
    fn apply_rate(&self, target: &ClassTarget, kbps: u64) -> Result<()> {
        (**self).apply_rate(target, kbps)
    }

    fn read_used_kbps(&self, target: &ClassTarget) -> Result<u64> {
        (**self).read_used_kbps(target)
    }

    fn read_current_kbps(&self, target: &ClassTarget) -> Result<u64> {
        (**self).read_current_kbps(target)
    }
}
