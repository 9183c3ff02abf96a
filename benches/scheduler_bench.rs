use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

use qclock::{ClientInfo, ClientType, PullQueue, QueueOptions, ReqParams};

fn bench_options(dir: &tempfile::TempDir) -> QueueOptions {
    QueueOptions {
        system_capacity: 100_000.0,
        win_size: 60.0,
        idle_age: Duration::from_secs(600),
        erase_age: Duration::from_secs(900),
        check_time: Duration::from_secs(360),
        telemetry_path: dir.path().join("scheduling.txt"),
        ..QueueOptions::default()
    }
}

fn info_for(id: &u32) -> ClientInfo {
    match id % 3 {
        0 => ClientInfo::new(100.0, 0.0, 200.0, ClientType::R),
        1 => ClientInfo::new(0.0, 2.0, 0.0, ClientType::B),
        _ => ClientInfo::new(0.0, 1.0, 0.0, ClientType::A),
    }
}

fn bench_add_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_request");

    group.bench_function("single_client", |b| {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue: PullQueue<u32, u64> =
            PullQueue::new(info_for, bench_options(&dir)).expect("queue");
        let mut payload = 0u64;
        b.iter(|| {
            queue.add_request(black_box(payload), 1, ReqParams::default());
            payload += 1;
        });
    });

    group.bench_function("spread_over_64_clients", |b| {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue: PullQueue<u32, u64> =
            PullQueue::new(info_for, bench_options(&dir)).expect("queue");
        let mut payload = 0u64;
        b.iter(|| {
            let client = (payload % 64) as u32;
            queue.add_request(black_box(payload), client, ReqParams::default());
            payload += 1;
        });
    });
}

fn bench_pull_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("pull_request");

    group.bench_function("add_then_pull", |b| {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue: PullQueue<u32, u64> =
            PullQueue::new(info_for, bench_options(&dir)).expect("queue");
        let mut payload = 0u64;
        b.iter(|| {
            let client = (payload % 16) as u32;
            queue.add_request(payload, client, ReqParams::default());
            black_box(queue.pull_request());
            payload += 1;
        });
    });

    group.bench_function("pull_from_backlog", |b| {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue: PullQueue<u32, u64> =
            PullQueue::new(info_for, bench_options(&dir)).expect("queue");
        for payload in 0..10_000u64 {
            let client = (payload % 16) as u32;
            queue.add_request(payload, client, ReqParams::default());
        }
        b.iter(|| {
            if queue.is_empty() {
                for payload in 0..1_000u64 {
                    queue.add_request(payload, (payload % 16) as u32, ReqParams::default());
                }
            }
            black_box(queue.pull_request());
        });
    });
}

criterion_group!(benches, bench_add_request, bench_pull_request);
criterion_main!(benches);
