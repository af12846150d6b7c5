//! The global response channel: store worker (producer) -> IO thread (consumer),
//! doorbelled by an eventfd the IO thread's `io_uring` loop polls alongside its
//! sockets. Built on the cross-thread `RingBuffer` (C1) rather than a channel
//! crate, since that ring already provides the lock-free SPSC semantics this
//! needs.

use std::sync::Arc;

use crate::metrics;
use crate::ring::RingBuffer;
use crate::ring_types::StoreResponse;

/// Producer half; lives on the store-worker thread.
pub struct ResponseProducer {
    ring: Arc<RingBuffer<StoreResponse>>,
    pub eventfd: i32,
}

impl ResponseProducer {
    /// Spin-retries until the response ring has room. The ring is sized so this
    /// should be rare in practice; `metrics::inc_resp_ring_full()` tracks it.
    pub fn send(&self, response: StoreResponse) {
        let mut response = Some(response);
        loop {
            match self.ring.enqueue(response.take().expect("response already moved into ring")) {
                Ok(()) => {
                    metrics::inc_resp_occ();
                    break;
                }
                Err(rejected) => {
                    response = Some(rejected);
                    metrics::inc_resp_ring_full();
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Signal the IO thread's `io_uring` via eventfd. Call after sending a batch.
    pub fn signal(&self) {
        let val: u64 = 1;
        let ret = unsafe { libc::write(self.eventfd, &val as *const u64 as *const libc::c_void, 8) };
        if ret != 8 {
            tracing::warn!(error = %std::io::Error::last_os_error(), "eventfd write failed");
        }
    }
}

/// Consumer half; lives on the IO thread.
pub struct ResponseConsumer {
    ring: Arc<RingBuffer<StoreResponse>>,
}

impl ResponseConsumer {
    /// Drains every response currently queued. Call once per eventfd wakeup.
    pub fn drain(&self) -> Vec<StoreResponse> {
        let mut out = Vec::with_capacity(self.ring.occupied());
        while let Some(resp) = self.ring.dequeue() {
            metrics::dec_resp_occ();
            out.push(resp);
        }
        out
    }
}

/// Build a matched producer/consumer pair for one IO thread's response channel.
pub fn build_response_channel(capacity: usize, eventfd: i32) -> (ResponseProducer, ResponseConsumer) {
    let ring = Arc::new(RingBuffer::new(capacity));
    (ResponseProducer { ring: ring.clone(), eventfd }, ResponseConsumer { ring })
}
