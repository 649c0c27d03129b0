//! Configuration model for the class rebalancer.
//!
//! A [`QosConfig`] is what the operator wrote down: tuning knobs plus, per direction, an
//! interface, a total and a list of classes whose bounds may be absolute or a percentage of the
//! total. [`QosConfig::resolve`] validates it and turns it into [`LinkSpec`]s with every default
//! filled in and every bound in kbit/s.

use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use qos_common::{parse_bandwidth_kbps, Direction};
use qos_tc::ClassId;

use crate::uci;

/// Where the router keeps its QoS configuration.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/config/qos_gargoyle";

/// Total used for a direction that does not state one (100 Mbit/s).
pub const DEFAULT_TOTAL_KBPS: u64 = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("line {line}: {message}")]
    Uci { line: usize, message: String },
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("class {class}: min {min_kbps}kbit exceeds max {max_kbps}kbit")]
    InvalidBounds { class: String, min_kbps: u64, max_kbps: u64 },
    #[error("invalid thresholds: {0}")]
    InvalidThreshold(String),
    #[error("{name} must be in (0, 1], got {value}")]
    InvalidRatio { name: &'static str, value: f64 },
    #[error("{direction}: class minimums add up to {min_sum_kbps}kbit, above the {total_kbps}kbit total")]
    Unreachable { direction: Direction, min_sum_kbps: u64, total_kbps: u64 },
    #[error("{direction}: duplicate class id {classid}")]
    DuplicateClass { direction: Direction, classid: ClassId },
    #[error("no traffic classes configured")]
    NoClasses,
    #[error("{0}: no interface configured")]
    NoInterface(Direction),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidValue { key: key.into(), value: value.into() }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Tuning of the rebalancer. Field names on disk follow the router's UCI option names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbaConfig {
    /// Whether bandwidth is moved at all. Usage is tracked either way.
    pub enabled: bool,
    #[serde(rename = "interval")]
    pub tick_interval_sec: u64,
    #[serde(rename = "high_usage_threshold")]
    pub high_usage_threshold_pct: u32,
    #[serde(rename = "high_usage_duration")]
    pub high_usage_duration_sec: u64,
    #[serde(rename = "low_usage_threshold")]
    pub low_usage_threshold_pct: u32,
    #[serde(rename = "low_usage_duration")]
    pub low_usage_duration_sec: u64,
    /// Fraction of a donor's headroom offered per transfer.
    pub borrow_ratio: f64,
    pub min_borrow_kbps: u64,
    /// Transfers and returns smaller than this are noise and are not applied.
    pub min_change_kbps: u64,
    #[serde(rename = "cooldown_time")]
    pub cooldown_sec: u64,
    #[serde(rename = "auto_return_enable")]
    pub auto_return_enabled: bool,
    #[serde(rename = "return_threshold")]
    pub return_threshold_pct: u32,
    /// Fraction of the outstanding borrowed amount returned per eligible tick.
    #[serde(rename = "return_speed")]
    pub return_speed_ratio: f64,
}

impl Default for DbaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tick_interval_sec: 1,
            high_usage_threshold_pct: 90,
            high_usage_duration_sec: 5,
            low_usage_threshold_pct: 50,
            low_usage_duration_sec: 5,
            borrow_ratio: 0.2,
            min_borrow_kbps: 64,
            min_change_kbps: 64,
            cooldown_sec: 5,
            auto_return_enabled: true,
            return_threshold_pct: 60,
            return_speed_ratio: 0.1,
        }
    }
}

impl DbaConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_sec.max(1))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_sec)
    }

    /// The high-usage threshold as a fraction of the allocation.
    pub fn high_fraction(&self) -> f64 {
        self.high_usage_threshold_pct as f64 / 100.0
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_sec == 0 {
            return Err(ConfigError::invalid("interval", "0"));
        }
        if self.high_usage_threshold_pct == 0 || self.high_usage_threshold_pct > 100 {
            return Err(ConfigError::InvalidThreshold(format!(
                "high usage threshold {}% outside 1..=100",
                self.high_usage_threshold_pct
            )));
        }
        if self.low_usage_threshold_pct >= self.high_usage_threshold_pct {
            return Err(ConfigError::InvalidThreshold(format!(
                "low usage threshold {}% must be below high usage threshold {}%",
                self.low_usage_threshold_pct, self.high_usage_threshold_pct
            )));
        }
        if self.return_threshold_pct > 100 {
            return Err(ConfigError::InvalidThreshold(format!(
                "return threshold {}% above 100",
                self.return_threshold_pct
            )));
        }
        for (name, value) in
            [("borrow_ratio", self.borrow_ratio), ("return_speed", self.return_speed_ratio)]
        {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::InvalidRatio { name, value });
            }
        }
        Ok(())
    }

    /// Sets a tuning option from its UCI name and textual value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "enabled" => self.enabled = parse_bool(key, value)?,
            "interval" => self.tick_interval_sec = parse_num(key, value)?,
            "high_usage_threshold" => self.high_usage_threshold_pct = parse_num(key, value)?,
            "high_usage_duration" => self.high_usage_duration_sec = parse_num(key, value)?,
            "low_usage_threshold" => self.low_usage_threshold_pct = parse_num(key, value)?,
            "low_usage_duration" => self.low_usage_duration_sec = parse_num(key, value)?,
            "borrow_ratio" => self.borrow_ratio = parse_num(key, value)?,
            "min_borrow_kbps" => self.min_borrow_kbps = parse_num(key, value)?,
            "min_change_kbps" => self.min_change_kbps = parse_num(key, value)?,
            "cooldown_time" => self.cooldown_sec = parse_num(key, value)?,
            "auto_return_enable" => self.auto_return_enabled = parse_bool(key, value)?,
            "return_threshold" => self.return_threshold_pct = parse_num(key, value)?,
            "return_speed" => self.return_speed_ratio = parse_num(key, value)?,
            _ => tracing::debug!(key, "ignoring unknown dba option"),
        }
        Ok(())
    }
}

pub(crate) fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| ConfigError::invalid(key, value))
}

pub(crate) fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Ok(true),
        "0" | "false" | "no" | "off" | "disabled" => Ok(false),
        _ => Err(ConfigError::invalid(key, value)),
    }
}

/// A bandwidth bound: absolute, or relative to the direction's total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBandwidth", into = "String")]
pub enum BandwidthSpec {
    Kbps(u64),
    Percent(f64),
}

impl BandwidthSpec {
    pub fn resolve(&self, total_kbps: u64) -> u64 {
        match *self {
            Self::Kbps(kbps) => kbps,
            Self::Percent(pct) => (total_kbps as f64 * pct / 100.0).round() as u64,
        }
    }
}

impl FromStr for BandwidthSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Some(pct) = trimmed.strip_suffix('%') {
            let pct: f64 = parse_num("percentage", pct)?;
            if !(0.0..=100.0).contains(&pct) {
                return Err(ConfigError::invalid("percentage", s));
            }
            return Ok(Self::Percent(pct));
        }
        parse_bandwidth_kbps(trimmed)
            .map(Self::Kbps)
            .map_err(|_| ConfigError::invalid("bandwidth", s))
    }
}

impl fmt::Display for BandwidthSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kbps(kbps) => write!(f, "{kbps}kbit"),
            Self::Percent(pct) => write!(f, "{pct}%"),
        }
    }
}

impl From<BandwidthSpec> for String {
    fn from(spec: BandwidthSpec) -> Self {
        spec.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBandwidth {
    Kbps(u64),
    Text(String),
}

impl TryFrom<RawBandwidth> for BandwidthSpec {
    type Error = ConfigError;

    fn try_from(raw: RawBandwidth) -> Result<Self> {
        match raw {
            RawBandwidth::Kbps(kbps) => Ok(Self::Kbps(kbps)),
            RawBandwidth::Text(text) => text.parse(),
        }
    }
}

/// One traffic class as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassConfig {
    pub name: String,
    pub classid: Option<String>,
    pub priority: Option<u8>,
    pub percent_bandwidth: Option<u32>,
    pub min_bandwidth: Option<BandwidthSpec>,
    pub max_bandwidth: Option<BandwidthSpec>,
}

impl ClassConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            classid: None,
            priority: None,
            percent_bandwidth: None,
            min_bandwidth: None,
            max_bandwidth: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_percent(mut self, percent: u32) -> Self {
        self.percent_bandwidth = Some(percent);
        self
    }

    pub fn with_bounds(mut self, min: BandwidthSpec, max: BandwidthSpec) -> Self {
        self.min_bandwidth = Some(min);
        self.max_bandwidth = Some(max);
        self
    }

    pub fn with_classid(mut self, classid: impl Into<String>) -> Self {
        self.classid = Some(classid.into());
        self
    }
}

/// The classes of one direction and the link they share.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub interface: Option<String>,
    pub total_bandwidth: Option<BandwidthSpec>,
    /// The link-wide class whose rate is the ceiling no class may exceed.
    pub root_class: Option<String>,
    #[serde(rename = "class")]
    pub classes: Vec<ClassConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    pub dba: DbaConfig,
    pub upload: LinkConfig,
    pub download: LinkConfig,
}

impl QosConfig {
    /// Loads a configuration file. Files ending in `.toml` are TOML, anything else is read as
    /// UCI.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;

        let config = if path.extension().is_some_and(|ext| ext == "toml") {
            Self::from_toml_str(&text)?
        } else {
            Self::from_uci_str(&text)?
        };

        tracing::debug!(path = %path.display(), enabled = config.dba.enabled, "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_uci_str(text: &str) -> Result<Self> {
        uci::parse_config(text)
    }

    pub fn link(&self, direction: Direction) -> &LinkConfig {
        match direction {
            Direction::Upload => &self.upload,
            Direction::Download => &self.download,
        }
    }

    pub fn link_mut(&mut self, direction: Direction) -> &mut LinkConfig {
        match direction {
            Direction::Upload => &mut self.upload,
            Direction::Download => &mut self.download,
        }
    }

    /// Overrides the interface of both directions.
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        let interface = interface.into();
        for direction in Direction::ALL {
            self.link_mut(direction).interface = Some(interface.clone());
        }
        self
    }

    /// Sets the interface of directions that do not name one.
    pub fn fill_interface(&mut self, interface: &str) {
        for direction in Direction::ALL {
            let link = self.link_mut(direction);
            if link.interface.is_none() {
                link.interface = Some(interface.to_string());
            }
        }
    }

    pub fn needs_interface(&self) -> bool {
        Direction::ALL.iter().any(|dir| {
            let link = self.link(*dir);
            !link.classes.is_empty() && link.interface.is_none()
        })
    }

    /// Overrides the total bandwidth of both directions.
    pub fn with_total_bandwidth(mut self, kbps: u64) -> Self {
        for direction in Direction::ALL {
            self.link_mut(direction).total_bandwidth = Some(BandwidthSpec::Kbps(kbps));
        }
        self
    }

    /// Validates the configuration and resolves every class to absolute bounds.
    ///
    /// Directions without classes are skipped.
    pub fn resolve(&self) -> Result<Vec<LinkSpec>> {
        self.dba.validate()?;

        let links = Direction::ALL
            .into_iter()
            .filter(|dir| !self.link(*dir).classes.is_empty())
            .map(|dir| LinkSpec::resolve(dir, self.link(dir)))
            .collect::<Result<Vec<_>>>()?;

        if links.is_empty() {
            return Err(ConfigError::NoClasses);
        }
        Ok(links)
    }
}

/// A validated class with all bounds in kbit/s.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassSpec {
    pub name: String,
    pub classid: ClassId,
    pub priority: u8,
    pub percent: u32,
    pub min_kbps: u64,
    pub max_kbps: u64,
    pub initial_kbps: u64,
}

/// A validated direction.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    pub direction: Direction,
    pub interface: String,
    pub total_kbps: u64,
    pub root: Option<ClassId>,
    pub classes: Vec<ClassSpec>,
}

/// Priority implied by the conventional class names.
pub fn priority_for_name(name: &str) -> Option<u8> {
    match name {
        "realtime" => Some(0),
        "normal" => Some(1),
        "bulk" => Some(2),
        _ => None,
    }
}

impl LinkSpec {
    fn resolve(direction: Direction, link: &LinkConfig) -> Result<Self> {
        let total_kbps = match link.total_bandwidth {
            None => DEFAULT_TOTAL_KBPS,
            Some(BandwidthSpec::Kbps(0)) | Some(BandwidthSpec::Percent(_)) => {
                return Err(ConfigError::invalid(
                    format!("{direction}.total_bandwidth"),
                    link.total_bandwidth.map(String::from).unwrap_or_default(),
                ))
            }
            Some(BandwidthSpec::Kbps(kbps)) => kbps,
        };

        let interface = link.interface.clone().ok_or(ConfigError::NoInterface(direction))?;

        let root = link
            .root_class
            .as_deref()
            .map(|id| id.parse().map_err(|_| ConfigError::invalid("root_class", id)))
            .transpose()?;

        let count = link.classes.len() as u64;
        let mut seen = HashSet::new();
        let mut classes = Vec::with_capacity(link.classes.len());

        for (index, class) in link.classes.iter().enumerate() {
            if class.name.trim().is_empty() {
                return Err(ConfigError::invalid(format!("{direction} class {index} name"), ""));
            }

            let classid = match &class.classid {
                Some(id) => id.parse().map_err(|_| ConfigError::invalid("classid", id.as_str()))?,
                None => ClassId::generated(direction.default_major(), index),
            };
            if !seen.insert(classid) {
                return Err(ConfigError::DuplicateClass { direction, classid });
            }

            let priority = class
                .priority
                .or_else(|| priority_for_name(&class.name))
                .unwrap_or(index.min(u8::MAX as usize) as u8);

            let min_kbps = class.min_bandwidth.map(|b| b.resolve(total_kbps)).unwrap_or(0);
            let max_kbps = class.max_bandwidth.map(|b| b.resolve(total_kbps)).unwrap_or(total_kbps);
            if min_kbps > max_kbps {
                return Err(ConfigError::InvalidBounds {
                    class: class.name.clone(),
                    min_kbps,
                    max_kbps,
                });
            }

            let initial_kbps = match class.percent_bandwidth {
                Some(pct) => total_kbps * pct as u64 / 100,
                None => total_kbps / count,
            }
            .clamp(min_kbps, max_kbps);

            classes.push(ClassSpec {
                name: class.name.clone(),
                classid,
                priority,
                percent: class.percent_bandwidth.unwrap_or_default(),
                min_kbps,
                max_kbps,
                initial_kbps,
            });
        }

        let min_sum_kbps: u64 = classes.iter().map(|c| c.min_kbps).sum();
        if min_sum_kbps > total_kbps {
            return Err(ConfigError::Unreachable { direction, min_sum_kbps, total_kbps });
        }

        let initial_sum_kbps: u64 = classes.iter().map(|c| c.initial_kbps).sum();
        if initial_sum_kbps > total_kbps {
            tracing::warn!(%direction, initial_sum_kbps, total_kbps, "class shares exceed the link, scaling them down");
            for class in &mut classes {
                class.initial_kbps = (class.initial_kbps * total_kbps / initial_sum_kbps)
                    .clamp(class.min_kbps, class.max_kbps);
            }
        }

        Ok(Self { direction, interface, total_kbps, root, classes })
    }
}
