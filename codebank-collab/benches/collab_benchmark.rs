use std::hint::black_box;
use std::net::SocketAddr;

use criterion::{criterion_group, criterion_main, Criterion};
use codebank_collab::broadcast::{ClientHandle, ClientRegistry};
use codebank_collab::handlers::{self, DispatchOptions, Outbound};
use codebank_collab::protocol::Message;
use codebank_collab::session::SessionState;
use codebank_core::{HistoryEntry, NullExecutor, NEW_CODELET};

fn bench_update_encode(c: &mut Criterion) {
    let msg = Message::Update {
        user: 3,
        codelet: 12,
        text: "d1 >> play('x-o-[--]', dur=1/2, amp=0.8)".to_string(),
        order_id: 4_096,
    };

    c.bench_function("update_encode", |b| {
        b.iter(|| black_box(black_box(&msg).encode_frame().unwrap()))
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let msg = Message::Update {
        user: 3,
        codelet: 12,
        text: "d1 >> play('x-o-[--]', dur=1/2, amp=0.8)".to_string(),
        order_id: 4_096,
    };
    let frame = msg.encode_frame().unwrap();
    let payload = &frame[4..];

    c.bench_function("update_decode", |b| {
        b.iter(|| black_box(Message::decode_payload(black_box(payload)).unwrap()))
    });
}

fn bench_history_encode(c: &mut Criterion) {
    // A long-lived codelet: 500 revisions.
    let history: Vec<HistoryEntry> = (0..500)
        .map(|i| HistoryEntry::new(i % 4, format!("p1 >> pluck([{i}, {}, {}])", i + 2, i + 4)))
        .collect();
    let msg = Message::History { codelet: 1, history, order_id: 900, hidden: false };

    c.bench_function("history_encode_500_revisions", |b| {
        b.iter(|| black_box(msg.encode_frame().unwrap()))
    });
}

fn bench_session_push(c: &mut Criterion) {
    c.bench_function("session_push_1k", |b| {
        b.iter(|| {
            let mut session = SessionState::new(0);
            let id = session.push(1, NEW_CODELET, "Clock.bpm = 120").codelet;
            for i in 0..1_000 {
                black_box(session.push(1 + i % 3, id, &format!("Clock.bpm = {}", 120 + i)));
            }
        })
    });
}

fn bench_dispatch_lock_cycle(c: &mut Criterion) {
    let mut session = SessionState::new(0);
    for name in ["a", "b"] {
        let id = session.resolve_identity(name, "127.0.0.1").user_id();
        handlers::join(&mut session, id, name, "127.0.0.1");
    }
    session.push(1, NEW_CODELET, "x");
    let options = DispatchOptions::default();

    c.bench_function("dispatch_request_release", |b| {
        b.iter(|| {
            let granted = handlers::dispatch(&mut session, &NullExecutor, options, 2, Message::Request { user: 2, codelet: 1 });
            let released = handlers::dispatch(&mut session, &NullExecutor, options, 2, Message::Release { user: 2, codelet: 1 });
            black_box((granted, released))
        })
    });
}

fn bench_broadcast_100_clients(c: &mut Criterion) {
    let addr: SocketAddr = "127.0.0.1:57890".parse().unwrap();
    let mut registry = ClientRegistry::new();
    let mut receivers = Vec::new();
    for user in 1..=100 {
        let (handle, rx) = ClientHandle::new(user as u64, addr);
        registry.insert(user, handle);
        receivers.push(rx);
    }
    let out = Outbound::all(Message::Update { user: 1, codelet: 1, text: "x".repeat(256), order_id: 1 });

    c.bench_function("broadcast_update_100_clients", |b| {
        b.iter(|| {
            black_box(registry.route(&out));
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_history_encode,
    bench_session_push,
    bench_dispatch_lock_cycle,
    bench_broadcast_100_clients,
);
criterion_main!(benches);
