#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    // Stall / backpressure (cumulative counts)
    static OP_QUEUE_FULL: AtomicU64 = AtomicU64::new(0);
    static RESP_RING_FULL: AtomicU64 = AtomicU64::new(0);
    static READ_BUF_FULL: AtomicU64 = AtomicU64::new(0);
    // Throughput (cumulative)
    static EVENTS_WRITTEN: AtomicU64 = AtomicU64::new(0);
    static FRAGMENTS_COMMITTED: AtomicU64 = AtomicU64::new(0);
    static RESPONSES_SENT: AtomicU64 = AtomicU64::new(0);
    // Store worker: poll outcomes (stall = NoOps)
    static POLL_OPS: AtomicU64 = AtomicU64::new(0);
    static POLL_NO_OPS: AtomicU64 = AtomicU64::new(0);
    // FDB transaction outcomes
    static TX_COMMITTED: AtomicU64 = AtomicU64::new(0);
    static TX_RETRIED: AtomicU64 = AtomicU64::new(0);
    // Gauges
    static OP_QUEUE_OCC: AtomicUsize = AtomicUsize::new(0);
    static RESP_OCC: AtomicUsize = AtomicUsize::new(0);
    static OP_QUEUE_MAX_OCC: AtomicUsize = AtomicUsize::new(0);
    static RESP_MAX_OCC: AtomicUsize = AtomicUsize::new(0);

    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub op_queue_full: u64,
        pub resp_ring_full: u64,
        pub read_buf_full: u64,
        pub events_written: u64,
        pub fragments_committed: u64,
        pub responses_sent: u64,
        pub poll_ops: u64,
        pub poll_no_ops: u64,
        pub tx_committed: u64,
        pub tx_retried: u64,
        pub op_queue_occ: usize,
        pub resp_occ: usize,
        pub op_queue_max_occ: usize,
        pub resp_max_occ: usize,
    }

    pub fn inc_op_queue_full() {
        OP_QUEUE_FULL.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resp_ring_full() {
        RESP_RING_FULL.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_read_buf_full() {
        READ_BUF_FULL.fetch_add(1, Ordering::Relaxed);
    }

    fn update_max(target: &AtomicUsize, value: usize) {
        let mut prev = target.load(Ordering::Relaxed);
        while value > prev {
            match target.compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn inc_op_queue_occ() {
        let v = OP_QUEUE_OCC.fetch_add(1, Ordering::Relaxed) + 1;
        update_max(&OP_QUEUE_MAX_OCC, v);
    }

    pub fn dec_op_queue_occ() {
        OP_QUEUE_OCC.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_resp_occ() {
        let v = RESP_OCC.fetch_add(1, Ordering::Relaxed) + 1;
        update_max(&RESP_MAX_OCC, v);
    }

    pub fn dec_resp_occ() {
        RESP_OCC.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_events_written() {
        EVENTS_WRITTEN.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_fragments_committed(n: u64) {
        FRAGMENTS_COMMITTED.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_responses_sent() {
        RESPONSES_SENT.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_poll_ops() {
        POLL_OPS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_poll_no_ops() {
        POLL_NO_OPS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tx_committed() {
        TX_COMMITTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tx_retried() {
        TX_RETRIED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            op_queue_full: OP_QUEUE_FULL.load(Ordering::Relaxed),
            resp_ring_full: RESP_RING_FULL.load(Ordering::Relaxed),
            read_buf_full: READ_BUF_FULL.load(Ordering::Relaxed),
            events_written: EVENTS_WRITTEN.load(Ordering::Relaxed),
            fragments_committed: FRAGMENTS_COMMITTED.load(Ordering::Relaxed),
            responses_sent: RESPONSES_SENT.load(Ordering::Relaxed),
            poll_ops: POLL_OPS.load(Ordering::Relaxed),
            poll_no_ops: POLL_NO_OPS.load(Ordering::Relaxed),
            tx_committed: TX_COMMITTED.load(Ordering::Relaxed),
            tx_retried: TX_RETRIED.load(Ordering::Relaxed),
            op_queue_occ: OP_QUEUE_OCC.load(Ordering::Relaxed),
            resp_occ: RESP_OCC.load(Ordering::Relaxed),
            op_queue_max_occ: OP_QUEUE_MAX_OCC.load(Ordering::Relaxed),
            resp_max_occ: RESP_MAX_OCC.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        std::thread::spawn(|| {
            let mut last_snap = snapshot();
            loop {
                std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                let snap = snapshot();
                let written_d = snap.events_written.saturating_sub(last_snap.events_written);
                let frag_d = snap
                    .fragments_committed
                    .saturating_sub(last_snap.fragments_committed);
                let sent_d = snap.responses_sent.saturating_sub(last_snap.responses_sent);
                let opq_full_d = snap.op_queue_full.saturating_sub(last_snap.op_queue_full);
                let resp_full_d = snap.resp_ring_full.saturating_sub(last_snap.resp_ring_full);
                let readbuf_full_d = snap.read_buf_full.saturating_sub(last_snap.read_buf_full);
                let poll_ops_d = snap.poll_ops.saturating_sub(last_snap.poll_ops);
                let poll_no_d = snap.poll_no_ops.saturating_sub(last_snap.poll_no_ops);
                let total_poll = poll_ops_d + poll_no_d;
                let stall_pct = if total_poll > 0 {
                    100.0 * (poll_no_d as f64 / total_poll as f64)
                } else {
                    0.0
                };
                tracing::info!(
                    events_written = written_d,
                    fragments_committed = frag_d,
                    responses_sent = sent_d,
                    op_queue_full = opq_full_d,
                    resp_ring_full = resp_full_d,
                    read_buf_full = readbuf_full_d,
                    stall_pct,
                    op_queue_occ = snap.op_queue_occ,
                    resp_occ = snap.resp_occ,
                    op_queue_max_occ = snap.op_queue_max_occ,
                    resp_max_occ = snap.resp_max_occ,
                    "metrics delta ({INTERVAL_SECS}s)"
                );
                last_snap = snap;
            }
        });
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub op_queue_full: u64,
        pub resp_ring_full: u64,
        pub read_buf_full: u64,
        pub events_written: u64,
        pub fragments_committed: u64,
        pub responses_sent: u64,
        pub poll_ops: u64,
        pub poll_no_ops: u64,
        pub tx_committed: u64,
        pub tx_retried: u64,
        pub op_queue_occ: usize,
        pub resp_occ: usize,
        pub op_queue_max_occ: usize,
        pub resp_max_occ: usize,
    }

    pub fn inc_op_queue_full() {}
    pub fn inc_resp_ring_full() {}
    pub fn inc_read_buf_full() {}
    pub fn inc_op_queue_occ() {}
    pub fn dec_op_queue_occ() {}
    pub fn inc_resp_occ() {}
    pub fn dec_resp_occ() {}
    pub fn inc_events_written() {}
    pub fn add_fragments_committed(_: u64) {}
    pub fn inc_responses_sent() {}
    pub fn inc_poll_ops() {}
    pub fn inc_poll_no_ops() {}
    pub fn inc_tx_committed() {}
    pub fn inc_tx_retried() {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            op_queue_full: 0,
            resp_ring_full: 0,
            read_buf_full: 0,
            events_written: 0,
            fragments_committed: 0,
            responses_sent: 0,
            poll_ops: 0,
            poll_no_ops: 0,
            tx_committed: 0,
            tx_retried: 0,
            op_queue_occ: 0,
            resp_occ: 0,
            op_queue_max_occ: 0,
            resp_max_occ: 0,
        }
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
