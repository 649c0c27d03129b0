use std::time::{Duration, Instant};

use qos_common::Direction;
use qos_dba::{
    config::{BandwidthSpec, ClassConfig, LinkConfig},
    Link, QosConfig, SystemState, TickReport,
};
use qos_tc::{ClassTarget, MemoryTc};

mod invariants;
mod scenarios;
mod supervisor;

/// Two upload classes of 300 kbit/s each, priorities 0 and 1, bounded to 100..=500.
fn two_classes() -> QosConfig {
    let mut config = QosConfig::default();
    config.dba.enabled = true;
    *config.link_mut(Direction::Upload) = LinkConfig {
        interface: Some("eth0".into()),
        total_bandwidth: Some(BandwidthSpec::Kbps(600)),
        root_class: Some("1:1".into()),
        classes: vec![
            ClassConfig::new("realtime")
                .with_percent(50)
                .with_bounds(BandwidthSpec::Kbps(100), BandwidthSpec::Kbps(500)),
            ClassConfig::new("bulk")
                .with_priority(1)
                .with_percent(50)
                .with_bounds(BandwidthSpec::Kbps(100), BandwidthSpec::Kbps(500)),
        ],
    };
    config
}

/// A provisioned system driven by a simulated clock, one second per tick.
struct Harness {
    tc: MemoryTc,
    state: SystemState,
    start: Instant,
    elapsed: u64,
}

impl Harness {
    fn new(config: &QosConfig) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let tc = MemoryTc::new();
        let state = SystemState::new(config).unwrap();
        assert_eq!(state.apply_allocations(&tc), 0);
        tc.clear_writes();

        Self { tc, state, start: Instant::now(), elapsed: 0 }
    }

    fn upload(&self) -> &Link {
        self.state.link(Direction::Upload).unwrap()
    }

    fn target(&self, name: &str) -> ClassTarget {
        self.upload().class(name).unwrap().target.clone()
    }

    fn set_used(&self, name: &str, kbps: u64) {
        self.tc.set_used(&self.target(name), kbps);
    }

    fn current(&self, name: &str) -> u64 {
        self.upload().class(name).unwrap().current_kbps
    }

    fn borrowed(&self, name: &str) -> i64 {
        self.upload().class(name).unwrap().borrowed_kbps
    }

    fn now(&self) -> Instant {
        self.start + Duration::from_secs(self.elapsed)
    }

    fn tick(&mut self) -> TickReport {
        self.elapsed += 1;
        let now = self.now();
        self.state.tick(&self.tc, now)
    }

    fn ticks(&mut self, n: usize) -> Vec<TickReport> {
        (0..n).map(|_| self.tick()).collect()
    }
}
