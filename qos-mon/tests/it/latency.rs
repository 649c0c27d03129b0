use std::time::Instant;

use qos_mon::{Controller, ControllerState, MonitorConfig};
use qos_tc::MemoryTc;

use crate::{link_config, ms};

/// Feeds `kbps` until the load estimate settles on it.
fn settle_load(controller: &mut Controller, kbps: u64) {
    for _ in 0..60 {
        controller.on_load_sample(kbps);
    }
}

fn in_bounds(controller: &Controller) -> bool {
    let limit = controller.link().current_limit_kbps;
    (25_000..=95_000).contains(&limit)
}

#[test]
fn ceiling_tracks_latency_error() {
    let tc = MemoryTc::new();
    let config = MonitorConfig {
        skip_calibration: true,
        seed_ping: Some(ms(60)),
        ping_limit: Some(ms(44)),
        ..link_config()
    };
    let mut controller = Controller::new(config.clone());
    assert_eq!(controller.state(), ControllerState::Idle);

    settle_load(&mut controller, 85_500);
    controller.evaluate(Instant::now(), &tc);
    assert_eq!(controller.state(), ControllerState::Realtime);
    assert_eq!(tc.rate(&config.link_target()), Some(90_000));

    // latency above the limit: the ceiling shrinks every evaluation
    let mut previous = controller.link().current_limit_kbps;
    let mut shrinking = 0;
    loop {
        controller.on_reply(ms(40));
        let ceiling = controller.link().current_limit_kbps;
        controller.on_load_sample(ceiling * 95 / 100);
        controller.evaluate(Instant::now(), &tc);
        assert!(in_bounds(&controller));

        let filtered = controller.link().filtered_ping_us.unwrap();
        let now = controller.link().current_limit_kbps;
        if filtered < 44_000 {
            assert!(now >= previous, "ceiling fell with latency under the limit");
            previous = now;
            break;
        }
        assert!(now < previous, "ceiling did not shrink at {filtered}us");
        previous = now;
        shrinking += 1;
    }
    assert!(shrinking >= 5);

    // under the limit and busy: growth resumes
    for _ in 0..20 {
        controller.on_reply(ms(40));
        let ceiling = controller.link().current_limit_kbps;
        controller.on_load_sample(ceiling * 95 / 100);
        controller.evaluate(Instant::now(), &tc);
        assert!(in_bounds(&controller));
        assert!(controller.link().current_limit_kbps >= previous);
    }
    assert!(controller.link().current_limit_kbps > previous);

    // under the limit but the ceiling is not used: hold
    let held = controller.link().current_limit_kbps;
    settle_load(&mut controller, held * 80 / 100);
    for _ in 0..10 {
        controller.on_reply(ms(40));
        controller.evaluate(Instant::now(), &tc);
    }
    assert_eq!(controller.link().current_limit_kbps, held);

    settle_load(&mut controller, held * 95 / 100);
    controller.on_reply(ms(40));
    controller.evaluate(Instant::now(), &tc);
    assert!(controller.link().current_limit_kbps > held);
}

#[test]
fn committed_ceiling_lags_by_deadband() {
    let tc = MemoryTc::new();
    let config = MonitorConfig {
        skip_calibration: true,
        seed_ping: Some(ms(60)),
        ping_limit: Some(ms(44)),
        ..link_config()
    };
    let target = config.link_target();
    let mut controller = Controller::new(config);

    settle_load(&mut controller, 85_500);
    for _ in 0..30 {
        controller.on_reply(ms(50));
        controller.evaluate(Instant::now(), &tc);

        let link = controller.link();
        let written = tc.rate(&target).unwrap();
        assert_eq!(link.committed_kbps, Some(written));
        assert!(written.abs_diff(link.current_limit_kbps) <= 50);
    }
    assert!(tc.write_count() > 1);
}
