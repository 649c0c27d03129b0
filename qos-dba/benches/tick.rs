use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use qos_common::Direction;
use qos_dba::{
    config::{BandwidthSpec, ClassConfig, LinkConfig},
    QosConfig, SystemState,
};
use qos_tc::MemoryTc;

fn config(classes: usize) -> QosConfig {
    let mut config = QosConfig::default();
    config.dba.enabled = true;
    config.dba.cooldown_sec = 0;

    for direction in Direction::ALL {
        *config.link_mut(direction) = LinkConfig {
            interface: Some(format!("{direction}0")),
            total_bandwidth: Some(BandwidthSpec::Kbps(100_000)),
            root_class: None,
            classes: (0..classes)
                .map(|i| {
                    ClassConfig::new(format!("class{i}"))
                        .with_priority(i as u8)
                        .with_bounds(BandwidthSpec::Percent(1.0), BandwidthSpec::Percent(90.0))
                })
                .collect(),
        };
    }
    config
}

fn tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");

    for classes in [4, 16, 64] {
        let tc = MemoryTc::new();
        let mut state = SystemState::new(&config(classes)).unwrap();
        state.apply_allocations(&tc);

        // alternate saturated and idle classes so every tick moves bandwidth
        for link in state.links() {
            for (i, class) in link.classes.iter().enumerate() {
                let used = if i % 2 == 0 { class.current_kbps * 2 } else { 0 };
                tc.set_used(&class.target, used);
            }
        }

        let start = Instant::now();
        let mut elapsed = 0;

        group.throughput(Throughput::Elements(classes as u64 * 2));
        group.bench_function(BenchmarkId::from_parameter(classes), |b| {
            b.iter(|| {
                elapsed += 1;
                state.tick(&tc, start + Duration::from_secs(elapsed))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, tick);
criterion_main!(benches);
