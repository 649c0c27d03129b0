use std::{sync::Arc, thread, time::Duration};

use qos_common::status::StatusFile;
use qos_mon::{
    Controller, ControllerState, ControllerTuning, EchoReply, Monitor, MonitorConfig,
    MonitorStatus, Prober,
};
use qos_tc::{MemoryTc, TrafficControl};

use crate::{link_config, ms};

/// A target that never answers.
struct Unreachable;

impl Prober for Unreachable {
    fn send(&mut self, _sequence: u16) -> std::io::Result<()> {
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> std::io::Result<Option<EchoReply>> {
        thread::sleep(timeout);
        Ok(None)
    }
}

fn quick_tuning() -> ControllerTuning {
    ControllerTuning {
        connectivity_attempts: 3,
        connectivity_interval: ms(10),
        stats_interval: ms(10),
        control_interval: ms(20),
        ..Default::default()
    }
}

#[test]
fn unreachable_target_enters_safe_mode() {
    let path = std::env::temp_dir().join(format!("qosmon-it-{}.json", std::process::id()));
    let file = StatusFile::new(&path);

    let tc = Arc::new(MemoryTc::new());
    let config = link_config().with_tuning(quick_tuning());
    // busy link, so the controller leaves IDLE while in safe mode
    tc.set_used(&config.link_target(), 50_000);

    let monitor = Monitor::new(
        Controller::new(config),
        Unreachable,
        Arc::clone(&tc) as Arc<dyn TrafficControl>,
    )
    .with_status_file(file.clone());
    let flags = monitor.flags();

    let stopper = thread::spawn(move || {
        thread::sleep(ms(300));
        flags.terminate();
    });
    let status = monitor.run();
    stopper.join().unwrap();

    assert!(status.safe_mode);
    assert_eq!(status.state, ControllerState::Exit);
    assert_eq!(tc.write_count(), 0);

    let written: MonitorStatus = file.read().unwrap().unwrap();
    assert!(written.safe_mode);
    assert_eq!(written.ping_limit_us, None);
    file.remove().unwrap();
}

#[test]
fn toggling_safe_mode_keeps_calibration() {
    let tc = MemoryTc::new();
    let config = MonitorConfig { skip_calibration: true, ..link_config() };
    let mut controller = Controller::new(config);
    let limit = controller.link().ping_limit_us;

    controller.toggle_safe_mode();
    controller.on_load_sample(50_000);
    controller.evaluate(std::time::Instant::now(), &tc);
    assert_eq!(tc.write_count(), 0);

    controller.toggle_safe_mode();
    controller.evaluate(std::time::Instant::now(), &tc);
    assert_eq!(controller.link().ping_limit_us, limit);
    assert_eq!(tc.write_count(), 1);
}
