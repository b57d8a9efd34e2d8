use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tandem_sync::broadcast::{Audience, BroadcastGroup};
use tandem_sync::hub::Hub;
use tandem_sync::oplog::OperationLog;
use tandem_sync::presence::assign_participant;
use tandem_sync::protocol::{ClientMessage, Operation, OperationId, ParticipantId, Point, ServerMessage};

fn stroke(id: usize, points: usize) -> Operation {
    let points = (0..points).map(|i| Point::new(i as f64, (i * 2) as f64)).collect();
    Operation {
        id: OperationId::new(format!("op-{id}")),
        ..Operation::brush("#ff8800", 3.0, points)
    }
}

fn bench_operation_encode(c: &mut Criterion) {
    let msg = ClientMessage::Operation {
        operation: stroke(0, 64),
    };

    c.bench_function("operation_encode_64pts", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_operation_decode(c: &mut Criterion) {
    let encoded = ClientMessage::Operation {
        operation: stroke(0, 64),
    }
    .encode()
    .unwrap();

    c.bench_function("operation_decode_64pts", |b| {
        b.iter(|| {
            black_box(ClientMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_oplog_append_with_eviction(c: &mut Criterion) {
    let ops: Vec<_> = (0..2_000).map(|i| stroke(i, 8)).collect();

    c.bench_function("oplog_append_2k_cap_1k", |b| {
        b.iter(|| {
            let mut log = OperationLog::new(1_000);
            for op in &ops {
                black_box(log.append(op.clone()));
            }
            black_box(log.len());
        })
    });
}

fn bench_oplog_snapshot(c: &mut Criterion) {
    let mut log = OperationLog::new(1_000);
    for i in 0..1_000 {
        log.append(stroke(i, 16));
    }

    c.bench_function("oplog_snapshot_1k", |b| {
        b.iter(|| {
            let snapshot = ServerMessage::Init {
                participant_id: ParticipantId::new("bench"),
                operations: log.snapshot(),
                participants: vec![],
            };
            black_box(snapshot.encode().unwrap());
        })
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let group = BroadcastGroup::new(1_024);
    let mut receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
    let origin = ParticipantId::new("origin");
    let msg = ServerMessage::Operation {
        operation: stroke(0, 16),
        author_id: origin.clone(),
    };

    c.bench_function("broadcast_100_receivers", |b| {
        b.iter(|| {
            group.send(&origin, Audience::Others, &msg).unwrap();
            for rx in &mut receivers {
                black_box(rx.try_recv().unwrap());
            }
        })
    });
}

fn bench_hub_dispatch(c: &mut Criterion) {
    let mut hub = Hub::new(1_000, 1_024);
    let (member, _sub) = hub
        .join("bench", assign_participant(ParticipantId::new("author")))
        .unwrap();
    let mut next = 0usize;

    c.bench_function("hub_dispatch_operation", |b| {
        b.iter(|| {
            next += 1;
            let msg = ClientMessage::Operation {
                operation: stroke(next, 8),
            };
            black_box(hub.dispatch(&member, msg).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_operation_encode,
    bench_operation_decode,
    bench_oplog_append_with_eviction,
    bench_oplog_snapshot,
    bench_broadcast_fan_out,
    bench_hub_dispatch,
);
criterion_main!(benches);
