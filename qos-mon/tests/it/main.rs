use std::time::Duration;

use qos_mon::MonitorConfig;

mod latency;
mod safe_mode;

fn ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

fn link_config() -> MonitorConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    MonitorConfig::new(ms(200), "192.0.2.1", 100_000, "eth0")
}
