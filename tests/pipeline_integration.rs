//! Full pipeline integration test: request_flow -> store worker (`MemStore`) ->
//! response_flow, end to end, without `io_uring` or a real FDB cluster. Plays
//! the role the IO thread would: feeds bytes, drains actions, forwards
//! `BeginRead`/registration by hand, and applies `ConnEffect`s back onto the
//! connection's `ClientState`.

mod common;

use std::sync::Arc;

use seguro::client_state::{Action, ProtoState, WriteOp};
use seguro::request_flow::{self, Connection};
use seguro::response_flow::{responses_to_effects_per_conn, ConnEffect};
use seguro::response_queue::build_response_channel;
use seguro::store::MemStore;
use seguro::store_worker::{new_registry, register, ConnEntry, StoreWorker};

/// Drives one connection's handshake to completion against a live
/// `StoreWorker`, registering it along the way as `maybe_register` would.
fn handshake(conn: &mut Connection, worker: &mut StoreWorker<MemStore>, registry: &seguro::store_worker::ConnRegistry) {
    conn.client.begin_handshake();
    common::feed(&conn.read_buf, &common::handshake_bytes("~zod"));
    request_flow::drain(conn).unwrap();
    assert_eq!(conn.client.proto_state, ProtoState::HsFetchEid);

    let (read_buf, op_queue) = conn.shared_rings();
    register(registry, conn.client.id as u32, ConnEntry { read_buf, op_queue, patp_num: conn.client.patp_num.unwrap() });

    while worker.poll_once() {}
}

fn apply_effects(conn: &mut Connection, effects: Vec<ConnEffect>) -> Vec<u8> {
    let mut wire = Vec::new();
    for effect in effects {
        match effect {
            ConnEffect::Write(bytes) => wire.extend_from_slice(&bytes),
            ConnEffect::CommitAdvance(_) => {}
            ConnEffect::ReadDone => conn.client.finish_read(),
            ConnEffect::FinishHandshake(highest_eid) => {
                if let Action::Send(line) = conn.client.finish_handshake(highest_eid) {
                    wire.extend_from_slice(line.as_bytes());
                    wire.push(b'\n');
                }
            }
            ConnEffect::Terminate(reason) => panic!("unexpected terminate: {reason}"),
        }
    }
    wire
}

#[test]
fn write_then_read_round_trips_through_the_store_worker() {
    let store = Arc::new(MemStore::new(8));
    let registry = new_registry();
    let (producer, consumer) = build_response_channel(64, -1);
    let mut worker = StoreWorker::new(store, registry.clone(), producer);

    let mut conn = Connection::new(1, 4096, 32);
    handshake(&mut conn, &mut worker, &registry);

    let effects = responses_to_effects_per_conn(consumer.drain()).remove(&1).unwrap();
    let wire = apply_effects(&mut conn, effects);
    assert_eq!(wire, b"READY 0\n");
    assert_eq!(conn.client.proto_state, ProtoState::Idle);

    common::feed(&conn.read_buf, &common::write_frame(1, b"hello world"));
    request_flow::drain(&mut conn).unwrap();
    while worker.poll_once() {}

    let effects = responses_to_effects_per_conn(consumer.drain()).remove(&1).unwrap();
    assert_eq!(effects, vec![ConnEffect::CommitAdvance(13)]);

    common::feed(&conn.read_buf, &common::read_frame(1, 1));
    let actions = request_flow::drain(&mut conn).unwrap();
    assert_eq!(actions, vec![Action::BeginRead { start_id: 1, limit: 1 }]);
    conn.op_queue.enqueue(WriteOp::BeginRead { start_id: 1, limit: 1 }).unwrap();
    while worker.poll_once() {}

    let effects = responses_to_effects_per_conn(consumer.drain()).remove(&1).unwrap();
    let wire = apply_effects(&mut conn, effects);
    assert_eq!(wire, b"EVENT 1 11\nhello world\n\n");
    assert_eq!(conn.client.proto_state, ProtoState::Idle);
}

#[test]
fn highest_eid_persists_across_a_fresh_connection_for_the_same_ship() {
    let store = Arc::new(MemStore::new(8));
    let registry = new_registry();
    let (producer, consumer) = build_response_channel(64, -1);
    let mut worker = StoreWorker::new(store, registry.clone(), producer);

    let mut first = Connection::new(1, 4096, 32);
    handshake(&mut first, &mut worker, &registry);
    responses_to_effects_per_conn(consumer.drain())
        .remove(&1)
        .map(|effects| apply_effects(&mut first, effects));

    common::feed(&first.read_buf, &common::write_frame(5, b"abc"));
    request_flow::drain(&mut first).unwrap();
    while worker.poll_once() {}
    consumer.drain();

    let mut second = Connection::new(2, 4096, 32);
    handshake(&mut second, &mut worker, &registry);
    let effects = responses_to_effects_per_conn(consumer.drain()).remove(&2).unwrap();
    let wire = apply_effects(&mut second, effects);
    assert_eq!(wire, b"READY 5\n");
}

#[test]
fn a_read_past_the_highest_committed_event_still_finishes_cleanly() {
    let store = Arc::new(MemStore::new(8));
    let registry = new_registry();
    let (producer, consumer) = build_response_channel(64, -1);
    let mut worker = StoreWorker::new(store, registry.clone(), producer);

    let mut conn = Connection::new(1, 4096, 32);
    handshake(&mut conn, &mut worker, &registry);
    responses_to_effects_per_conn(consumer.drain())
        .remove(&1)
        .map(|effects| apply_effects(&mut conn, effects));

    common::feed(&conn.read_buf, &common::write_frame(1, b"x"));
    request_flow::drain(&mut conn).unwrap();
    while worker.poll_once() {}
    consumer.drain();

    common::feed(&conn.read_buf, &common::read_frame(1, 50));
    request_flow::drain(&mut conn).unwrap();
    conn.op_queue.enqueue(WriteOp::BeginRead { start_id: 1, limit: 50 }).unwrap();
    while worker.poll_once() {}

    let effects = responses_to_effects_per_conn(consumer.drain()).remove(&1).unwrap();
    assert!(matches!(effects.last(), Some(ConnEffect::ReadDone)));
    let writes = effects.iter().filter(|e| matches!(e, ConnEffect::Write(_))).count();
    assert_eq!(writes, 3, "only event 1's header+payload+trailer, nothing past it");
}
