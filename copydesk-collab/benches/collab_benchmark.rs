use copydesk_collab::oplog::Operation;
use copydesk_collab::transform::{PositionalTransform, Transform};
use copydesk_collab::{
    ClientMessage, CollabConfig, CollabService, EditPayload, EditRequest, OperationKind,
    ServerEvent, StartOptions,
};
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use uuid::Uuid;

fn sample_operation(sequence: u64, kind: OperationKind, payload: EditPayload) -> Operation {
    Operation {
        sequence,
        content_id: "bench".to_string(),
        session_id: Uuid::new_v4(),
        user_id: "U1".to_string(),
        kind,
        payload,
        transformed: None,
        timestamp: 0,
        conflicts: Vec::new(),
    }
}

fn bench_edit_event_encode(c: &mut Criterion) {
    let event = ServerEvent::EditOperation {
        operation: sample_operation(1, OperationKind::Insert, EditPayload::insert(10, "hello world")),
    };

    c.bench_function("edit_event_encode", |b| {
        b.iter(|| {
            black_box(black_box(&event).encode().unwrap());
        })
    });
}

fn bench_edit_event_decode(c: &mut Criterion) {
    let event = ServerEvent::EditOperation {
        operation: sample_operation(1, OperationKind::Insert, EditPayload::insert(10, "hello world")),
    };
    let encoded = event.encode().unwrap();

    c.bench_function("edit_event_decode", |b| {
        b.iter(|| {
            black_box(ServerEvent::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_client_message_parse(c: &mut Criterion) {
    let frame = ClientMessage::EditOperation {
        operation: EditRequest::new(OperationKind::Replace, EditPayload::replace(4, 3, "abc"))
            .with_base(12)
            .with_cursor(7),
    }
    .encode()
    .unwrap();

    c.bench_function("client_message_parse", |b| {
        b.iter(|| {
            black_box(ClientMessage::parse(black_box(&frame)).unwrap());
        })
    });
}

fn bench_positional_transform_100(c: &mut Criterion) {
    let concurrent: Vec<Operation> = (1..=100u64)
        .map(|seq| {
            if seq % 3 == 0 {
                sample_operation(seq, OperationKind::Delete, EditPayload::delete(seq as usize, 2))
            } else {
                sample_operation(seq, OperationKind::Insert, EditPayload::insert(seq as usize, "xy"))
            }
        })
        .collect();
    let refs: Vec<&Operation> = concurrent.iter().collect();
    let payload = EditPayload::insert(500, "tail");

    c.bench_function("positional_transform_100", |b| {
        b.iter(|| {
            black_box(PositionalTransform.transform(
                OperationKind::Insert,
                black_box(&payload),
                black_box(&refs),
            ));
        })
    });
}

fn bench_broadcast_edit_fanout_32(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut config = CollabConfig::for_testing();
    config.history_cap = 1_000;
    config.connection_buffer = 4;
    let service = CollabService::in_memory(config);

    // 32 listeners whose queues fill up quickly, so most deliveries drop.
    let (author, _receivers) = rt.block_on(async {
        let mut receivers = Vec::new();
        for i in 0..32 {
            let (connection, rx) = service.new_connection();
            service
                .start_session("bench", &format!("U{i}"), StartOptions::with_connection(connection))
                .await
                .unwrap();
            receivers.push(rx);
        }
        let author = service
            .start_session("bench", "author", StartOptions::default())
            .await
            .unwrap();
        (author.session.id, receivers)
    });

    c.bench_function("broadcast_edit_fanout_32", |b| {
        b.iter(|| {
            rt.block_on(async {
                let request = EditRequest::new(OperationKind::Insert, EditPayload::insert(0, "a"));
                black_box(service.broadcast_edit(author, request).await.unwrap());
            })
        })
    });
}

fn bench_session_start(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let service = CollabService::in_memory(CollabConfig::for_testing());
    let mut n = 0u64;

    c.bench_function("session_start", |b| {
        b.iter(|| {
            n += 1;
            let content_id = format!("C{}", n % 64);
            let user_id = format!("U{n}");
            rt.block_on(async {
                black_box(
                    service
                        .start_session(&content_id, &user_id, StartOptions::default())
                        .await
                        .unwrap(),
                );
            })
        })
    });
}

criterion_group!(
    benches,
    bench_edit_event_encode,
    bench_edit_event_decode,
    bench_client_message_parse,
    bench_positional_transform_100,
    bench_broadcast_edit_fanout_32,
    bench_session_start,
);
criterion_main!(benches);
