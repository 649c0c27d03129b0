use std::time::{Instant, SystemTime, UNIX_EPOCH};

use qos_common::Direction;
use qos_tc::{ClassTarget, TrafficControl};

use crate::{
    class::TrafficClass,
    config::{ConfigError, DbaConfig, LinkSpec, QosConfig},
    engine::{Adjustment, AdjustmentKind, Engine},
    status::{ClassStatus, DbaStatus, LinkStatus},
    tracker,
};

/// The classes of one direction and the link they share.
#[derive(Debug, Clone)]
pub struct Link {
    pub direction: Direction,
    pub interface: String,
    pub total_kbps: u64,
    /// Root class whose rate is the link ceiling.
    pub root: Option<ClassTarget>,
    /// Last ceiling successfully read from the root class.
    pub ceiling_kbps: Option<u64>,
    pub classes: Vec<TrafficClass>,
}

impl Link {
    fn new(spec: &LinkSpec) -> Self {
        let classes = spec
            .classes
            .iter()
            .map(|class| {
                let mut target = ClassTarget::new(&spec.interface, class.classid);
                if let Some(root) = spec.root {
                    target = target.with_parent(root);
                }
                TrafficClass::new(spec.direction, target, class)
            })
            .collect();

        Self {
            direction: spec.direction,
            interface: spec.interface.clone(),
            total_kbps: spec.total_kbps,
            root: spec.root.map(|root| ClassTarget::new(&spec.interface, root)),
            ceiling_kbps: None,
            classes,
        }
    }

    pub fn class(&self, name: &str) -> Option<&TrafficClass> {
        self.classes.iter().find(|c| c.name == name)
    }

    pub fn class_mut(&mut self, name: &str) -> Option<&mut TrafficClass> {
        self.classes.iter_mut().find(|c| c.name == name)
    }

    /// Sum of all borrowed amounts. Zero whenever the ledger is consistent.
    pub fn ledger_sum(&self) -> i64 {
        self.classes.iter().map(|c| c.borrowed_kbps).sum()
    }

    pub fn allocated_kbps(&self) -> u64 {
        self.classes.iter().map(|c| c.current_kbps).sum()
    }

    fn read_ceiling(&mut self, tc: &dyn TrafficControl) {
        let Some(root) = &self.root else { return };

        // a failed read keeps the last known ceiling
        match tc.read_current_kbps(root) {
            Ok(kbps) => self.ceiling_kbps = Some(kbps),
            Err(e) => {
                tracing::warn!(direction = %self.direction, last = ?self.ceiling_kbps, error = %e, "link ceiling unavailable");
            }
        }
    }

    fn apply(&self, tc: &dyn TrafficControl) -> usize {
        let mut failed = 0;
        for class in &self.classes {
            if let Err(e) = tc.apply_rate(&class.target, class.current_kbps) {
                tracing::warn!(class = %class.name, kbps = class.current_kbps, error = %e, "failed to apply allocation");
                failed += 1;
            }
        }
        failed
    }

    fn status(&self) -> LinkStatus {
        LinkStatus {
            direction: self.direction,
            interface: self.interface.clone(),
            total_kbps: self.total_kbps,
            ceiling_kbps: self.ceiling_kbps,
            classes: self
                .classes
                .iter()
                .map(|c| ClassStatus {
                    name: c.name.clone(),
                    classid: c.target.classid.to_string(),
                    priority: c.priority,
                    config_percent: c.config_percent,
                    min_kbps: c.config_min_kbps,
                    max_kbps: c.config_max_kbps,
                    current_kbps: c.current_kbps,
                    used_kbps: c.used_kbps,
                    usage_rate: c.usage_rate,
                    avg_usage_rate: c.avg_usage_rate,
                    peak_usage_kbps: c.peak_usage_kbps,
                    state: c.state,
                    state_duration_sec: c.state_duration(),
                    borrowed_kbps: c.borrowed_kbps,
                    adjust_count: c.adjust_count,
                })
                .collect(),
        }
    }
}

/// Outcome of one tick across all directions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub adjustments: Vec<Adjustment>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.adjustments.is_empty()
    }

    pub fn borrow_count(&self) -> usize {
        self.adjustments.iter().filter(|a| a.kind == AdjustmentKind::Borrow).count()
    }

    pub fn returned_kbps(&self) -> u64 {
        self.adjustments
            .iter()
            .filter(|a| a.kind == AdjustmentKind::Return)
            .map(|a| a.kbps)
            .sum()
    }
}

/// The complete rebalancer state: configuration plus every class of every direction.
#[derive(Debug, Clone)]
pub struct SystemState {
    config: DbaConfig,
    links: Vec<Link>,
    started: Instant,
    ticks: u64,
    total_adjustments: u64,
    last_report: TickReport,
}

impl SystemState {
    /// Builds the class state from a configuration. Every class starts at its initial
    /// allocation with an empty ledger.
    pub fn new(config: &QosConfig) -> Result<Self, ConfigError> {
        let links = config.resolve()?.iter().map(Link::new).collect();

        Ok(Self {
            config: config.dba.clone(),
            links,
            started: Instant::now(),
            ticks: 0,
            total_adjustments: 0,
            last_report: TickReport::default(),
        })
    }

    pub fn config(&self) -> &DbaConfig {
        &self.config
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn link(&self, direction: Direction) -> Option<&Link> {
        self.links.iter().find(|l| l.direction == direction)
    }

    pub fn link_mut(&mut self, direction: Direction) -> Option<&mut Link> {
        self.links.iter_mut().find(|l| l.direction == direction)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Pushes every class's current allocation to `tc`. Returns the number of failed writes.
    pub fn apply_allocations(&self, tc: &dyn TrafficControl) -> usize {
        self.links.iter().map(|link| link.apply(tc)).sum()
    }

    /// Returns every class to its initial allocation, forgets all loans and pushes the result.
    pub fn reset_allocations(&mut self, tc: &dyn TrafficControl) -> usize {
        for class in self.links.iter_mut().flat_map(|l| l.classes.iter_mut()) {
            class.current_kbps = class.initial_kbps;
            class.borrowed_kbps = 0;
            class.last_adjust = None;
        }
        tracing::info!("allocations reset to their initial values");
        self.apply_allocations(tc)
    }

    /// Runs one tick: sample every class, then move bandwidth if enabled.
    pub fn tick(&mut self, tc: &dyn TrafficControl, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        for link in &mut self.links {
            link.read_ceiling(tc);
            tracker::sample_all(&mut link.classes, tc, &self.config);

            if self.config.enabled {
                let engine = Engine::new(&self.config, tc, now).with_ceiling(link.ceiling_kbps);
                report.adjustments.extend(engine.run(&mut link.classes));
            }

            debug_assert_eq!(link.ledger_sum(), 0, "{} ledger out of balance", link.direction);
        }

        self.ticks += 1;
        self.total_adjustments += report.adjustments.len() as u64;
        self.last_report = report.clone();
        report
    }

    /// Replaces the configuration while keeping in-flight allocations.
    ///
    /// Classes are matched by direction and handle. A matched class keeps its allocation
    /// (clamped into its new bounds) and its borrowed amount; a direction whose ledger no
    /// longer balances is reset to an empty ledger. The resulting allocations are pushed to
    /// `tc`. On error the running state is left untouched.
    pub fn reload(&mut self, config: &QosConfig, tc: &dyn TrafficControl) -> Result<(), ConfigError> {
        let mut links: Vec<Link> = config.resolve()?.iter().map(Link::new).collect();

        for link in &mut links {
            let Some(old) = self.link(link.direction) else { continue };
            link.ceiling_kbps = old.ceiling_kbps;

            let mut balanced = true;
            for class in &mut link.classes {
                let Some(prev) =
                    old.classes.iter().find(|c| c.target.classid == class.target.classid)
                else {
                    continue;
                };

                let kept = prev.current_kbps.clamp(class.config_min_kbps, class.config_max_kbps);
                balanced &= kept == prev.current_kbps;

                class.current_kbps = kept;
                class.borrowed_kbps = prev.borrowed_kbps;
                class.used_kbps = prev.used_kbps;
                class.usage_rate = prev.usage_rate;
                class.avg_usage_rate = prev.avg_usage_rate;
                class.peak_usage_kbps = prev.peak_usage_kbps;
                class.state = prev.state;
                class.durations = prev.durations;
                class.adjust_count = prev.adjust_count;
                class.last_adjust = prev.last_adjust;
            }

            if !balanced || link.ledger_sum() != 0 {
                tracing::warn!(direction = %link.direction, "loans no longer balance after reload, clearing ledger");
                for class in &mut link.classes {
                    class.borrowed_kbps = 0;
                }
            }
        }

        self.config = config.dba.clone();
        self.links = links;

        let failed = self.apply_allocations(tc);
        tracing::info!(failed, enabled = self.config.enabled, "configuration reloaded");
        Ok(())
    }

    pub fn snapshot(&self) -> DbaStatus {
        let updated_at =
            SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();

        DbaStatus {
            updated_at,
            uptime_sec: self.started.elapsed().as_secs(),
            ticks: self.ticks,
            total_adjustments: self.total_adjustments,
            config: self.config.clone(),
            links: self.links.iter().map(Link::status).collect(),
            last_adjustments: self.last_report.adjustments.clone(),
        }
    }
}
