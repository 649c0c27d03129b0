use std::collections::{HashMap, HashSet};

use qos_common::Direction;
use qos_dba::{
    config::{BandwidthSpec, ClassConfig, LinkConfig},
    AdjustmentKind, QosConfig,
};

use crate::{two_classes, Harness};

fn three_classes() -> QosConfig {
    let mut config = QosConfig::default();
    config.dba.enabled = true;
    config.dba.high_usage_duration_sec = 2;
    config.dba.low_usage_duration_sec = 2;
    config.dba.cooldown_sec = 3;
    *config.link_mut(Direction::Upload) = LinkConfig {
        interface: Some("eth0".into()),
        total_bandwidth: Some(BandwidthSpec::Kbps(3000)),
        root_class: None,
        classes: vec![
            ClassConfig::new("realtime")
                .with_percent(30)
                .with_bounds(BandwidthSpec::Kbps(300), BandwidthSpec::Kbps(2000)),
            ClassConfig::new("normal")
                .with_percent(40)
                .with_bounds(BandwidthSpec::Percent(10.0), BandwidthSpec::Percent(80.0)),
            ClassConfig::new("bulk")
                .with_percent(30)
                .with_bounds(BandwidthSpec::Kbps(200), BandwidthSpec::Kbps(2500)),
        ],
    };
    config
}

/// Deterministic load pattern: phases of saturation and idleness per class.
struct Load(u64);

impl Load {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound.max(1)
    }
}

#[test]
fn ledger_and_bounds_hold_under_churn() {
    let config = three_classes();
    let mut h = Harness::new(&config);
    let mut load = Load(7);
    let names = ["realtime", "normal", "bulk"];
    let total = h.upload().allocated_kbps();
    let cooldown = config.dba.cooldown_sec;
    let mut last_adjust: HashMap<String, u64> = HashMap::new();
    let mut moves = 0;

    for round in 0..400u64 {
        // every 20 ticks a class switches between busy and idle
        if round % 20 == 0 {
            for name in names {
                let current = h.current(name);
                let used = if load.next(2) == 0 { current } else { load.next(current / 4) };
                h.set_used(name, used);
            }
        }

        let report = h.tick();
        let link = h.upload();

        assert_eq!(link.ledger_sum(), 0);
        assert_eq!(link.allocated_kbps(), total);
        for class in &link.classes {
            assert!(class.current_kbps >= class.config_min_kbps, "{} below min", class.name);
            assert!(class.current_kbps <= class.config_max_kbps, "{} above max", class.name);
        }

        let borrowers: HashSet<_> = report
            .adjustments
            .iter()
            .filter(|a| a.kind == AdjustmentKind::Borrow)
            .map(|a| a.to.as_str())
            .collect();
        let donors: HashSet<_> = report
            .adjustments
            .iter()
            .filter(|a| a.kind == AdjustmentKind::Borrow)
            .map(|a| a.from.as_str())
            .collect();
        assert!(borrowers.is_disjoint(&donors), "class borrowed and lent in one tick");

        let mut touched = HashSet::new();
        for adjustment in &report.adjustments {
            assert!(adjustment.kbps > 0);
            touched.insert(adjustment.from.clone());
            touched.insert(adjustment.to.clone());
        }
        for name in touched {
            if let Some(previous) = last_adjust.insert(name.clone(), h.elapsed) {
                assert!(h.elapsed - previous >= cooldown, "{name} adjusted during cooldown");
            }
            moves += 1;
        }
    }

    assert!(moves > 0, "workload never moved bandwidth");
}

#[test]
fn failed_write_leaves_ledger_untouched() {
    let mut h = Harness::new(&two_classes());
    h.set_used("realtime", 294);
    h.set_used("bulk", 15);
    h.ticks(4);

    h.tc.fail_writes(true);
    assert!(h.tick().is_empty());
    assert_eq!(h.current("realtime"), 300);
    assert_eq!(h.current("bulk"), 300);
    assert_eq!(h.borrowed("realtime"), 0);
    assert_eq!(h.tc.write_count(), 0);

    h.tc.fail_writes(false);
    assert_eq!(h.tick().borrow_count(), 1);
    assert_eq!(h.upload().ledger_sum(), 0);
}

#[test]
fn borrower_write_failure_restores_donor() {
    let mut h = Harness::new(&two_classes());
    h.set_used("realtime", 294);
    h.set_used("bulk", 15);
    h.ticks(4);

    let realtime = h.target("realtime");
    h.tc.fail_writes_to(realtime.classid, true);
    assert!(h.tick().is_empty());
    assert_eq!(h.tc.rate(&h.target("bulk")), Some(300));
    assert_eq!(h.borrowed("bulk"), 0);
}

#[test]
fn reload_keeps_loans() {
    let mut h = Harness::new(&two_classes());
    h.set_used("realtime", 294);
    h.set_used("bulk", 15);
    h.ticks(5);
    assert_eq!(h.borrowed("realtime"), 64);

    let mut next = two_classes();
    next.dba.cooldown_sec = 1;
    h.state.reload(&next, &h.tc).unwrap();

    assert_eq!(h.state.config().cooldown_sec, 1);
    assert_eq!(h.current("realtime"), 364);
    assert_eq!(h.current("bulk"), 236);
    assert_eq!(h.borrowed("realtime"), 64);
    assert_eq!(h.borrowed("bulk"), -64);
}

#[test]
fn invalid_reload_keeps_running_state() {
    let mut h = Harness::new(&two_classes());
    let mut broken = two_classes();
    broken.dba.low_usage_threshold_pct = 95;

    assert!(h.state.reload(&broken, &h.tc).is_err());
    assert_eq!(h.state.config().low_usage_threshold_pct, 50);
    assert_eq!(h.current("realtime"), 300);
}
