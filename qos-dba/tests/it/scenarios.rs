use qos_common::Direction;
use qos_dba::{AdjustmentKind, QosConfig, UsageState};

use crate::{two_classes, Harness};

#[test]
fn saturated_class_borrows_after_sustained_high() {
    let mut h = Harness::new(&two_classes());
    h.set_used("realtime", 294);
    h.set_used("bulk", 15);

    let reports = h.ticks(4);
    assert!(reports.iter().all(|r| r.is_empty()));
    assert_eq!(h.upload().class("realtime").unwrap().state, UsageState::High);
    assert_eq!(h.upload().class("bulk").unwrap().state, UsageState::Low);

    let report = h.tick();
    assert_eq!(report.borrow_count(), 1);
    let adjustment = &report.adjustments[0];
    assert_eq!(adjustment.direction, Direction::Upload);
    assert_eq!(adjustment.from, "bulk");
    assert_eq!(adjustment.to, "realtime");
    assert_eq!(adjustment.kbps, 64);

    assert_eq!(h.current("realtime"), 364);
    assert_eq!(h.current("bulk"), 236);
    assert_eq!(h.borrowed("realtime"), 64);
    assert_eq!(h.borrowed("bulk"), -64);
    assert_eq!(h.tc.rate(&h.target("realtime")), Some(364));
    assert_eq!(h.tc.rate(&h.target("bulk")), Some(236));

    // 294 of 364 is no longer saturated
    assert!(h.ticks(10).iter().all(|r| r.is_empty()));
    assert_eq!(h.upload().class("realtime").unwrap().state, UsageState::Normal);
}

#[test]
fn idle_borrower_returns_loan_in_steps() {
    let mut h = Harness::new(&two_classes());
    {
        let link = h.state.link_mut(Direction::Upload).unwrap();
        let realtime = link.class_mut("realtime").unwrap();
        realtime.current_kbps = 500;
        realtime.borrowed_kbps = 200;
        let bulk = link.class_mut("bulk").unwrap();
        bulk.current_kbps = 100;
        bulk.borrowed_kbps = -200;
    }
    h.state.apply_allocations(&h.tc);
    h.set_used("realtime", 10);
    h.set_used("bulk", 0);

    let mut outstanding = vec![h.borrowed("realtime")];
    for _ in 0..25 {
        let report = h.tick();
        assert!(report.adjustments.iter().all(|a| a.kind == AdjustmentKind::Return));
        assert!(h.current("realtime") >= 100);
        assert_eq!(h.upload().ledger_sum(), 0);
        outstanding.push(h.borrowed("realtime"));
    }

    assert!(outstanding.windows(2).all(|w| w[1] <= w[0]), "{outstanding:?}");
    assert_eq!(outstanding.last(), Some(&0));
    assert_eq!(h.current("realtime"), 300);
    assert_eq!(h.current("bulk"), 300);

    let mut steps: Vec<i64> = outstanding.windows(2).map(|w| w[0] - w[1]).filter(|d| *d > 0).collect();
    steps.dedup();
    assert_eq!(steps, vec![64, 8]);
}

#[test]
fn ceiling_limits_borrowing() {
    let mut h = Harness::new(&two_classes());
    let root = qos_tc::ClassTarget::new("eth0", "1:1".parse().unwrap());
    h.tc.provision(&root, 320);
    h.set_used("realtime", 300);
    h.set_used("bulk", 0);

    // only 20 kbit/s of room under the ceiling, below the change deadband
    assert!(h.ticks(10).iter().all(|r| r.is_empty()));
    assert_eq!(h.upload().ceiling_kbps, Some(320));
    assert_eq!(h.current("realtime"), 300);

    h.tc.provision(&root, 600);
    let reports = h.ticks(1);
    assert_eq!(reports[0].borrow_count(), 1);
}

#[test]
fn failed_ceiling_read_keeps_last_known() {
    let mut h = Harness::new(&two_classes());
    let root = qos_tc::ClassTarget::new("eth0", "1:1".parse().unwrap());
    h.tc.provision(&root, 320);
    h.set_used("realtime", 300);
    h.set_used("bulk", 0);

    assert!(h.ticks(10).iter().all(|r| r.is_empty()));
    assert_eq!(h.upload().ceiling_kbps, Some(320));

    h.tc.fail_reads_of(root.classid, true);
    assert!(h.ticks(3).iter().all(|r| r.is_empty()));
    assert_eq!(h.upload().ceiling_kbps, Some(320));
    assert_eq!(h.current("realtime"), 300);

    h.tc.fail_reads_of(root.classid, false);
    h.tc.provision(&root, 600);
    assert_eq!(h.ticks(1)[0].borrow_count(), 1);
    assert_eq!(h.upload().ceiling_kbps, Some(600));
}

#[test]
fn disabled_rebalancer_only_tracks() {
    let mut config = two_classes();
    config.dba.enabled = false;
    let mut h = Harness::new(&config);
    h.set_used("realtime", 300);

    assert!(h.ticks(20).iter().all(|r| r.is_empty()));
    assert_eq!(h.tc.write_count(), 0);

    let status = h.state.snapshot();
    let realtime = &status.link(Direction::Upload).unwrap().classes[0];
    assert_eq!(realtime.state, UsageState::High);
    assert_eq!(realtime.state_duration_sec, 20);
    assert_eq!(realtime.peak_usage_kbps, 300);
}

#[test]
fn uci_configuration_end_to_end() {
    let config = QosConfig::from_uci_str(
        r#"
config dba 'dba'
	option enabled '1'
	option high_usage_duration '2'
	option low_usage_duration '2'

config upload 'upload'
	option interface 'eth0'
	option total_bandwidth '1mbit'

config upload_class 'uclass_1'
	option name 'realtime'
	option percent_bandwidth '50'

config upload_class 'uclass_2'
	option name 'bulk'
	option percent_bandwidth '50'
"#,
    )
    .unwrap();
    let mut h = Harness::new(&config);
    assert_eq!(h.current("realtime"), 500);
    h.set_used("realtime", 500);

    let reports = h.ticks(2);
    assert_eq!(reports[1].borrow_count(), 1);
}
