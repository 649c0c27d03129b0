use std::sync::Arc;

use qos_common::{status::StatusFile, Direction};
use qos_dba::{DbaStatus, Error, Supervisor, SupervisorOptions, SystemState};
use qos_tc::{MemoryTc, TrafficControl};

use crate::two_classes;

#[tokio::test]
async fn supervisor_serves_commands() {
    let mut config = two_classes();
    // keep the schedule out of the way, ticks are driven by hand
    config.dba.tick_interval_sec = 3600;

    let path = std::env::temp_dir().join(format!("qos-dba-it-{}.json", std::process::id()));
    let file = StatusFile::new(&path);

    let tc = Arc::new(MemoryTc::new());
    let state = SystemState::new(&config).unwrap();
    state.apply_allocations(&*tc);
    let target = state.link(Direction::Upload).unwrap().classes[0].target.clone();
    tc.set_used(&target, 300);

    let supervisor = Supervisor::spawn(
        state,
        Arc::clone(&tc) as Arc<dyn TrafficControl>,
        SupervisorOptions::default().with_status_file(file.clone()),
    );
    let handle = supervisor.handle();

    for _ in 0..3 {
        handle.run_once().await.unwrap();
    }
    let status = handle.status().await.unwrap();
    assert_eq!(status.ticks, 3);
    assert_eq!(status.link(Direction::Upload).unwrap().classes[0].state_duration_sec, 3600 * 3);

    let mut next = config.clone();
    next.dba.enabled = false;
    handle.reload(next).await.unwrap();
    assert!(!handle.status().await.unwrap().config.enabled);

    let mut broken = config.clone();
    broken.dba.borrow_ratio = 0.0;
    assert!(matches!(handle.reload(broken).await, Err(Error::Config(_))));

    handle.stop().await.unwrap();
    handle.stop().await.unwrap();
    supervisor.join().await.unwrap();
    assert!(matches!(handle.status().await, Err(Error::SupervisorClosed)));

    let written: DbaStatus = file.read().unwrap().unwrap();
    assert_eq!(written.ticks, 3);
    file.remove().unwrap();
}
