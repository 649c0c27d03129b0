//! Shared vocabulary for the qos crates: traffic direction, bandwidth strings, smoothing filters,
//! the on-disk status snapshot and logging bootstrap.
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

mod bandwidth;
pub use bandwidth::{format_kbps, parse_bandwidth_kbps};

mod ewma;
pub use ewma::Ewma;

pub mod logging;
pub mod net;
pub mod status;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid bandwidth value: {0:?}")]
    InvalidBandwidth(String),
    #[error("invalid direction: {0:?}")]
    InvalidDirection(String),
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0:?}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The direction of traffic a class or link shapes, as seen from the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub const ALL: [Self; 2] = [Self::Upload, Self::Download];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }

    /// The HTB major number classes of this direction are generated under when the
    /// configuration does not name one (`1:` for upload, `2:` for download).
    pub const fn default_major(&self) -> u16 {
        match self {
            Self::Upload => 1,
            Self::Download => 2,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upload" | "up" | "egress" => Ok(Self::Upload),
            "download" | "down" | "ingress" => Ok(Self::Download),
            _ => Err(Error::InvalidDirection(s.to_string())),
        }
    }
}

/// Clamps a ratio to `[0, 1]`, mapping NaN to 0.
#[inline]
pub fn clamp_ratio(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parse_and_display() {
        assert_eq!("upload".parse::<Direction>().unwrap(), Direction::Upload);
        assert_eq!(" Download ".parse::<Direction>().unwrap(), Direction::Download);
        assert!("sideways".parse::<Direction>().is_err());
        assert_eq!(Direction::Download.to_string(), "download");
        assert_eq!(Direction::Upload.default_major(), 1);
    }

    #[test]
    fn clamp_ratio_bounds() {
        assert_eq!(clamp_ratio(f64::NAN), 0.0);
        assert_eq!(clamp_ratio(1.7), 1.0);
        assert_eq!(clamp_ratio(-0.2), 0.0);
        assert_eq!(clamp_ratio(0.42), 0.42);
    }
}
