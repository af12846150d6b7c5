//! C3's thread-facing half: pulls ops off each connection's op queue, turns
//! `WriteOp` sequences into whole events committed via `EventStore`, and
//! services `BeginRead` requests by streaming events back through the
//! response queue. The FDB-owning counterpart of the teacher's batch
//! processor thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client_state::WriteOp;
use crate::error::StoreError;
use crate::metrics;
use crate::response_flow::{event_header_line, READ_EVENT_TRAILER};
use crate::response_queue::ResponseProducer;
use crate::ring::RingBuffer;
use crate::ring_types::StoreResponse;
use crate::store::{EventSource, EventStore};

/// What the store worker needs to know about one connection: its shared rings
/// and which ship it identified as (set once, when the handshake completes).
pub struct ConnEntry {
    pub read_buf: Arc<RingBuffer<u8>>,
    pub op_queue: Arc<RingBuffer<WriteOp>>,
    pub patp_num: u128,
}

/// Shared between the IO thread (writer, on handshake/close) and the store
/// worker (reader, every poll). A `Mutex<HashMap<..>>` rather than another
/// lock-free ring since registration is rare compared to data throughput.
pub type ConnRegistry = Arc<Mutex<HashMap<u32, ConnEntry>>>;

pub fn new_registry() -> ConnRegistry {
    Arc::new(Mutex::new(HashMap::new()))
}

pub fn register(registry: &ConnRegistry, conn_id: u32, entry: ConnEntry) {
    registry.lock().unwrap().insert(conn_id, entry);
}

pub fn deregister(registry: &ConnRegistry, conn_id: u32) {
    registry.lock().unwrap().remove(&conn_id);
}

/// Bytes collected so far for one in-flight event, and how much of the read
/// buffer they occupy (so the worker knows how far to `advance_r` on commit).
struct WriteAccumulator {
    id: u64,
    expected: u64,
    bytes: Vec<u8>,
    read_buf_bytes: usize,
}

impl WriteAccumulator {
    fn new(id: u64, expected: u64) -> Self {
        Self { id, expected, bytes: Vec::with_capacity(expected as usize), read_buf_bytes: 0 }
    }
}

/// Drives one IO thread's store-side work: drains every registered
/// connection's op queue, commits finished events, and streams reads back.
pub struct StoreWorker<S: EventStore> {
    store: Arc<S>,
    registry: ConnRegistry,
    responses: ResponseProducer,
    in_progress: HashMap<u32, WriteAccumulator>,
}

impl<S: EventStore> StoreWorker<S> {
    pub fn new(store: Arc<S>, registry: ConnRegistry, responses: ResponseProducer) -> Self {
        Self { store, registry, responses, in_progress: HashMap::new() }
    }

    /// Runs forever, polling every registered connection's op queue. Sleeps
    /// briefly when a full sweep finds nothing to do, so the thread does not
    /// spin a core while idle (mirroring the teacher's batch-processor loop).
    pub fn run(&mut self) {
        loop {
            let did_work = self.poll_once();
            metrics::inc_poll_ops();
            if !did_work {
                metrics::inc_poll_no_ops();
                std::thread::sleep(Duration::from_micros(200));
            }
        }
    }

    /// Drains every connection's op queue once. Returns whether any op was
    /// processed, so `run` can back off when the server is idle.
    pub fn poll_once(&mut self) -> bool {
        let conn_ids: Vec<u32> = self.registry.lock().unwrap().keys().copied().collect();
        let mut did_work = false;
        for conn_id in conn_ids {
            while self.drain_one(conn_id) {
                did_work = true;
            }
        }
        if did_work {
            self.responses.signal();
        }
        did_work
    }

    /// Pops and handles one op for `conn_id`. Returns `false` if its queue was
    /// empty or the connection was deregistered mid-sweep.
    fn drain_one(&mut self, conn_id: u32) -> bool {
        let (op, read_buf, patp_num) = {
            let registry = self.registry.lock().unwrap();
            let Some(entry) = registry.get(&conn_id) else { return false };
            let Some(op) = entry.op_queue.dequeue() else { return false };
            (op, entry.read_buf.clone(), entry.patp_num)
        };

        match op {
            WriteOp::Start { id, length } => {
                self.in_progress.insert(conn_id, WriteAccumulator::new(id, length));
            }
            WriteOp::Data { offset, length } => {
                let bytes = read_buf.copy_out(offset, length);
                if let Some(acc) = self.in_progress.get_mut(&conn_id) {
                    acc.bytes.extend_from_slice(&bytes);
                    acc.read_buf_bytes += length;
                }
            }
            WriteOp::End { id, bracket_len } => {
                if let Some(acc) = self.in_progress.remove(&conn_id) {
                    debug_assert_eq!(acc.id, id);
                    self.commit_event(conn_id, patp_num, &read_buf, acc, bracket_len);
                }
            }
            WriteOp::BeginRead { start_id, limit } => {
                self.stream_read(conn_id, patp_num, start_id, limit);
            }
            WriteOp::FetchEid => match self.store.highest_eid(patp_num) {
                Ok(highest_eid) => self.responses.send(StoreResponse::EidReady { conn_id, highest_eid }),
                Err(e) => self.responses.send(StoreResponse::Terminate { conn_id, reason: store_error_reason(&e) }),
            },
        }
        true
    }

    fn commit_event(
        &mut self,
        conn_id: u32,
        patp_num: u128,
        read_buf: &RingBuffer<u8>,
        acc: WriteAccumulator,
        bracket_len: usize,
    ) {
        match self.store.write_event(patp_num, acc.id, &EventSource::Owned(acc.bytes)) {
            Ok(()) => {
                metrics::inc_tx_committed();
                metrics::inc_events_written();
                // payload bytes plus the trailing bracket: neither is released
                // until the event is actually durable (see request_flow's
                // zero-copy doc).
                let advance = acc.read_buf_bytes + bracket_len;
                read_buf.advance_r(advance);
                self.responses.send(StoreResponse::Committed { conn_id, read_buf_advance: advance });
            }
            Err(e) => {
                self.responses.send(StoreResponse::Terminate { conn_id, reason: store_error_reason(&e) });
            }
        }
    }

    fn stream_read(&mut self, conn_id: u32, patp_num: u128, start_id: u64, limit: u64) {
        for id in start_id..start_id.saturating_add(limit) {
            match self.store.read_event(patp_num, id) {
                Ok(payload) => {
                    self.responses.send(StoreResponse::Control { conn_id, line: event_header_line(id, payload.len() as u64) });
                    self.responses.send(StoreResponse::Data { conn_id, bytes: payload });
                    self.responses.send(StoreResponse::Data { conn_id, bytes: READ_EVENT_TRAILER.to_vec() });
                    metrics::inc_responses_sent();
                }
                Err(StoreError::NotFound(_)) => break,
                Err(e) => {
                    self.responses.send(StoreResponse::Terminate { conn_id, reason: store_error_reason(&e) });
                    return;
                }
            }
        }
        self.responses.send(StoreResponse::ReadDone { conn_id });
    }
}

fn store_error_reason(e: &StoreError) -> String {
    format!("{e}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response_queue::build_response_channel;
    use crate::store::MemStore;

    fn conn_entry() -> (ConnEntry, Arc<RingBuffer<u8>>, Arc<RingBuffer<WriteOp>>) {
        let read_buf = Arc::new(RingBuffer::new(4096));
        let op_queue = Arc::new(RingBuffer::new(16));
        let entry = ConnEntry { read_buf: read_buf.clone(), op_queue: op_queue.clone(), patp_num: 42 };
        (entry, read_buf, op_queue)
    }

    fn feed(read_buf: &RingBuffer<u8>, bytes: &[u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), read_buf.write_ptr(), bytes.len());
        }
        read_buf.advance_w(bytes.len());
    }

    #[test]
    fn a_full_write_sequence_commits_and_releases_its_bytes() {
        let store = Arc::new(MemStore::new(10));
        let registry = new_registry();
        let (entry, read_buf, op_queue) = conn_entry();
        register(&registry, 1, entry);

        let (producer, consumer) = build_response_channel(16, -1);
        let mut worker = StoreWorker::new(store.clone(), registry, producer);

        feed(&read_buf, b"hello\n\n");
        op_queue.enqueue(WriteOp::Start { id: 1, length: 5 }).unwrap();
        op_queue.enqueue(WriteOp::Data { offset: 0, length: 5 }).unwrap();
        op_queue.enqueue(WriteOp::End { id: 1, bracket_len: 2 }).unwrap();

        while worker.poll_once() {}

        assert_eq!(store.read_event(42, 1).unwrap(), b"hello");
        assert_eq!(read_buf.occupied(), 0);
        let responses = consumer.drain();
        assert_eq!(responses, vec![StoreResponse::Committed { conn_id: 1, read_buf_advance: 7 }]);
    }

    #[test]
    fn fetch_eid_reports_the_ships_highest_committed_id() {
        let store = Arc::new(MemStore::new(10));
        store.write_event(42, 9, &EventSource::Owned(b"z".to_vec())).unwrap();

        let registry = new_registry();
        let (entry, _read_buf, op_queue) = conn_entry();
        register(&registry, 3, entry);

        let (producer, consumer) = build_response_channel(16, -1);
        let mut worker = StoreWorker::new(store, registry, producer);

        op_queue.enqueue(WriteOp::FetchEid).unwrap();
        while worker.poll_once() {}

        assert_eq!(consumer.drain(), vec![StoreResponse::EidReady { conn_id: 3, highest_eid: 9 }]);
    }

    #[test]
    fn begin_read_streams_header_payload_trailer_then_done() {
        let store = Arc::new(MemStore::new(10));
        store.write_event(42, 1, &EventSource::Owned(b"abc".to_vec())).unwrap();

        let registry = new_registry();
        let (entry, _read_buf, op_queue) = conn_entry();
        register(&registry, 7, entry);

        let (producer, consumer) = build_response_channel(16, -1);
        let mut worker = StoreWorker::new(store, registry, producer);

        op_queue.enqueue(WriteOp::BeginRead { start_id: 1, limit: 5 }).unwrap();
        while worker.poll_once() {}

        let responses = consumer.drain();
        assert_eq!(
            responses,
            vec![
                StoreResponse::Control { conn_id: 7, line: "EVENT 1 3".into() },
                StoreResponse::Data { conn_id: 7, bytes: b"abc".to_vec() },
                StoreResponse::Data { conn_id: 7, bytes: b"\n\n".to_vec() },
                StoreResponse::ReadDone { conn_id: 7 },
            ]
        );
    }

    #[test]
    fn begin_read_past_highest_eid_stops_early_without_error() {
        let store = Arc::new(MemStore::new(10));
        store.write_event(42, 1, &EventSource::Owned(b"x".to_vec())).unwrap();

        let registry = new_registry();
        let (entry, _read_buf, op_queue) = conn_entry();
        register(&registry, 1, entry);

        let (producer, consumer) = build_response_channel(16, -1);
        let mut worker = StoreWorker::new(store, registry, producer);

        op_queue.enqueue(WriteOp::BeginRead { start_id: 1, limit: 10 }).unwrap();
        while worker.poll_once() {}

        let responses = consumer.drain();
        assert_eq!(responses.last(), Some(&StoreResponse::ReadDone { conn_id: 1 }));
        assert_eq!(responses.iter().filter(|r| matches!(r, StoreResponse::Control { .. })).count(), 1);
    }

    #[test]
    fn deregistered_connection_is_skipped() {
        let store = Arc::new(MemStore::new(10));
        let registry = new_registry();
        let (producer, _consumer) = build_response_channel(16, -1);
        let mut worker = StoreWorker::new(store, registry, producer);
        assert!(!worker.poll_once());
    }
}
