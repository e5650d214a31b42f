//! Local hub fan-out benchmarks.

use courier_core::hub::{LocalHub, OutboundReceiver};
use courier_core::UserId;
use courier_protocol::{ConnectionId, ServerEvent};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::sync::mpsc;

fn populated_hub(members: usize) -> (LocalHub, Vec<OutboundReceiver>) {
    let hub = LocalHub::new();
    let mut receivers = Vec::with_capacity(members);
    for i in 0..members {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new(format!("conn_{i}"));
        hub.attach(id.clone(), UserId::new(i.to_string()), tx);
        hub.join(&id, "chnl_general_chat").unwrap();
        receivers.push(rx);
    }
    (hub, receivers)
}

fn bench_send_to_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("send_to_group");

    for members in [10, 100, 1000] {
        let (hub, mut receivers) = populated_hub(members);
        let event = Arc::new(ServerEvent::info("benchmark"));

        group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, _| {
            b.iter(|| {
                let n = hub.send_to_group(black_box("chnl_general_chat"), event.clone(), None);
                for rx in &mut receivers {
                    while rx.try_recv().is_ok() {}
                }
                n
            })
        });
    }
    group.finish();
}

fn bench_join_leave(c: &mut Criterion) {
    let (hub, _receivers) = populated_hub(1);
    let id = ConnectionId::from("conn_0");

    c.bench_function("join_leave", |b| {
        b.iter(|| {
            hub.join(&id, black_box("chnl_tech_talk")).unwrap();
            hub.leave(&id, black_box("chnl_tech_talk"))
        })
    });
}

criterion_group!(benches, bench_send_to_group, bench_join_leave);
criterion_main!(benches);
