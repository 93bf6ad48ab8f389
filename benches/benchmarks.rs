use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use vigil::monitor::{FutureMonitor, Heartbeat, MonitorConfig};
use vigil::pool::{JobOutcome, WorkerPool};
use vigil::{BodyId, FutureReply, NodeUrl, Result};

fn monitor() -> FutureMonitor {
    FutureMonitor::new(
        Arc::new(|_: &BodyId| -> std::io::Result<Heartbeat> { Ok(Heartbeat::Alive) }),
        MonitorConfig {
            interval: None,
            fault_tolerance: false,
        },
    )
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("monitor");
    for bodies in [1usize, 64] {
        let ids: Vec<_> = (0..bodies).map(|i| BodyId(format!("body-{i}"))).collect();
        group.bench_function(BenchmarkId::new("monitor_then_reply", bodies), |b| {
            let monitor = monitor();
            let mut i = 0;
            b.iter(|| {
                let f: FutureReply<u64> =
                    FutureReply::new(ids[i % ids.len()].clone(), NodeUrl::default());
                monitor.monitor(&f);
                f.reply(1);
                i += 1;
            });
        });
        group.bench_function(BenchmarkId::new("monitor_then_unmonitor", bodies), |b| {
            let monitor = monitor();
            let mut i = 0;
            b.iter(|| {
                let f: FutureReply<u64> =
                    FutureReply::new(ids[i % ids.len()].clone(), NodeUrl::default());
                monitor.monitor(&f);
                monitor.unmonitor(&f);
                i += 1;
            });
        });
    }
    group.finish();

    let mut group = c.benchmark_group("pool");
    for workers in [1usize, 4] {
        group.bench_function(BenchmarkId::new("submit_with_barrier", workers), |b| {
            let pool = WorkerPool::new(workers);
            for _ in 0..workers {
                pool.grow().unwrap();
            }
            b.iter(|| {
                let barrier = pool
                    .submit_with_barrier(|| -> Result<()> { Ok(()) })
                    .unwrap();
                assert_eq!(barrier.wait(), JobOutcome::Completed);
            });
            pool.shutdown();
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
