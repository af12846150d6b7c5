use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;

use io_uring::{opcode, squeue::Entry, types::Fd};
use slab::Slab;

use crate::client_state::WriteOp;
use crate::config::{Config, OP_QUEUE_CAPACITY, SLAB_CAPACITY};
use crate::metrics;
use crate::request_flow::{self, FlowError};
use crate::response_flow::{responses_to_effects_per_conn, ConnEffect};
use crate::response_queue::ResponseConsumer;
use crate::store_worker::{self, ConnEntry, ConnRegistry};

/// Encode operation type + connection key into io_uring user_data.
const OP_ACCEPT: u64 = 0;
const OP_READ: u64 = 1;
const OP_WRITE: u64 = 2;
const OP_EVENTFD: u64 = 3;

fn encode_user_data(op: u64, key: u32) -> u64 {
    (op << 32) | key as u64
}

fn decode_user_data(user_data: u64) -> (u64, u32) {
    (user_data >> 32, user_data as u32)
}

/// Thin zero-cost wrapper around `IoUring` that centralises submission helpers.
struct IoUring {
    inner: io_uring::IoUring,
}

impl IoUring {
    fn new(entries: u32) -> io::Result<Self> {
        Ok(Self { inner: io_uring::IoUring::new(entries)? })
    }

    fn push(&mut self, sqe: &Entry) {
        loop {
            match unsafe { self.inner.submission().push(sqe) } {
                Ok(()) => return,
                Err(_) => {
                    self.inner.submit().expect("submit failed during SQ flush");
                }
            }
        }
    }

    fn wait(&mut self, n: usize) {
        self.inner.submit_and_wait(n).expect("submit_and_wait failed");
    }

    fn drain_cqes(&mut self) -> Vec<(u64, i32)> {
        self.inner.completion().map(|cqe| (cqe.user_data(), cqe.result())).collect()
    }
}

struct Conn {
    fd: RawFd,
    flow: request_flow::Connection,
    write_buf: Vec<u8>,
    inflight_write: Vec<u8>,
    read_inflight: bool,
    write_inflight: bool,
    read_stopped: bool,
    registered: bool,
}

impl Conn {
    fn new(fd: RawFd, conn_id: u32, config: &Config) -> Self {
        let mut flow = request_flow::Connection::new(conn_id as u64, config.read_buffer_size as usize, OP_QUEUE_CAPACITY);
        flow.client.begin_handshake();
        let mut conn = Self {
            fd,
            flow,
            write_buf: Vec::with_capacity(256),
            inflight_write: Vec::new(),
            read_inflight: false,
            write_inflight: false,
            read_stopped: false,
            registered: false,
        };
        // Greeting precedes the client's HELLO; nothing in `ClientState` models it
        // since it needs no reply and never fails.
        conn.queue_send("SEGURO 0");
        conn
    }

    fn queue_send(&mut self, line: &str) {
        self.write_buf.extend_from_slice(line.as_bytes());
        self.write_buf.push(b'\n');
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        // EINTR still closes the fd on Linux; EIO means flush failed but the fd
        // is already gone. Neither is recoverable or worth panicking over.
        unsafe { libc::close(self.fd); }
    }
}

pub struct IoThread {
    pub listen_fd: RawFd,
    pub eventfd: RawFd,
    pub response_consumer: ResponseConsumer,
    pub registry: ConnRegistry,
    pub config: Config,
}

impl IoThread {
    pub fn run(mut self) {
        let mut ring = IoUring::new(crate::config::IO_URING_ENTRIES).expect("failed to create io_uring");
        let mut conns: Slab<Conn> = Slab::with_capacity(SLAB_CAPACITY);
        let mut eventfd_buf: u64 = 0;

        submit_accept(&mut ring, self.listen_fd);
        submit_eventfd_read(&mut ring, self.eventfd, &mut eventfd_buf);

        loop {
            ring.wait(1);
            for (user_data, result) in ring.drain_cqes() {
                let (op, key) = decode_user_data(user_data);
                match op {
                    OP_ACCEPT => self.handle_accept(&mut ring, &mut conns, result),
                    OP_READ => self.handle_read(&mut ring, &mut conns, key, result),
                    OP_WRITE => self.handle_write(&mut ring, &mut conns, key, result),
                    OP_EVENTFD => self.handle_eventfd(&mut ring, &mut conns, &mut eventfd_buf),
                    _ => {}
                }
            }
        }
    }

    fn handle_accept(&mut self, ring: &mut IoUring, conns: &mut Slab<Conn>, result: i32) {
        if result >= 0 {
            let client_fd = result as RawFd;
            let entry = conns.vacant_entry();
            let key = entry.key() as u32;
            entry.insert(Conn::new(client_fd, key, &self.config));
            submit_write(ring, conns, key);
            submit_read(ring, conns, key);
        }
        submit_accept(ring, self.listen_fd);
    }

    fn handle_read(&mut self, ring: &mut IoUring, conns: &mut Slab<Conn>, key: u32, result: i32) {
        let key_usize = key as usize;
        if result <= 0 {
            self.close_conn(conns, key);
            return;
        }

        let bytes_read = result as usize;
        let conn = &mut conns[key_usize];
        conn.read_inflight = false;
        conn.flow.read_buf.advance_w(bytes_read);

        match request_flow::drain(&mut conn.flow) {
            Ok(actions) => self.apply_actions(conns, key, actions),
            Err(e) => {
                tracing::warn!(conn = key, error = ?e, "protocol error, closing connection");
                self.close_conn(conns, key);
                return;
            }
        }

        let conn = &mut conns[key_usize];
        maybe_register(&self.registry, key, conn);
        if !conn.write_buf.is_empty() && !conn.write_inflight {
            submit_write(ring, conns, key);
        }
        let conn = &mut conns[key_usize];
        if !conn.read_stopped {
            submit_read(ring, conns, key);
        }
    }

    fn apply_actions(&mut self, conns: &mut Slab<Conn>, key: u32, actions: Vec<crate::client_state::Action>) {
        use crate::client_state::Action;
        let conn = &mut conns[key as usize];
        for action in actions {
            match action {
                Action::Send(line) => conn.queue_send(&line),
                Action::Emit(_) => {} // already landed on the op queue by `request_flow::drain`
                Action::BeginRead { start_id, limit } => {
                    if conn.flow.op_queue.enqueue(WriteOp::BeginRead { start_id, limit }).is_err() {
                        metrics::inc_op_queue_full();
                        tracing::warn!(conn = key, "op queue full, dropping READ request");
                    }
                }
            }
        }
    }

    fn handle_write(&mut self, ring: &mut IoUring, conns: &mut Slab<Conn>, key: u32, result: i32) {
        let key_usize = key as usize;
        if result < 0 {
            self.close_conn(conns, key);
            return;
        }

        let conn = &mut conns[key_usize];
        conn.write_inflight = false;
        conn.inflight_write.clear();

        if !conn.write_buf.is_empty() {
            submit_write(ring, conns, key);
        }
    }

    fn handle_eventfd(&mut self, ring: &mut IoUring, conns: &mut Slab<Conn>, eventfd_buf: &mut u64) {
        let responses = self.response_consumer.drain();
        let effects = responses_to_effects_per_conn(responses);

        for (conn_id, conn_effects) in effects {
            let key_usize = conn_id as usize;
            if !conns.contains(key_usize) {
                continue;
            }
            let mut terminate_reason: Option<String> = None;
            {
                let conn = &mut conns[key_usize];
                for effect in conn_effects {
                    match effect {
                        ConnEffect::Write(bytes) => conn.write_buf.extend_from_slice(&bytes),
                        ConnEffect::CommitAdvance(_) => {
                            if conn.read_stopped {
                                conn.read_stopped = false;
                            }
                        }
                        ConnEffect::ReadDone => conn.flow.client.finish_read(),
                        ConnEffect::FinishHandshake(highest_eid) => {
                            if let crate::client_state::Action::Send(line) = conn.flow.client.finish_handshake(highest_eid) {
                                conn.queue_send(&line);
                            }
                        }
                        ConnEffect::Terminate(reason) => terminate_reason = Some(reason),
                    }
                }
                metrics::inc_responses_sent();
            }
            if let Some(reason) = terminate_reason {
                tracing::warn!(conn = conn_id, %reason, "store worker requested termination");
                self.close_conn(conns, conn_id);
                continue;
            }
            let conn = &mut conns[key_usize];
            if !conn.write_buf.is_empty() && !conn.write_inflight {
                submit_write(ring, conns, conn_id);
            }
            if !conn.read_stopped && !conn.read_inflight {
                submit_read(ring, conns, conn_id);
            }
        }

        submit_eventfd_read(ring, self.eventfd, eventfd_buf);
    }

    fn close_conn(&mut self, conns: &mut Slab<Conn>, key: u32) {
        store_worker::deregister(&self.registry, key);
        conns.try_remove(key as usize);
    }
}

/// Registers a connection with the store worker once its handshake has
/// identified which ship it is (`HsFetchEid`), so `FetchEid`/write/read ops
/// enqueued from here on can be resolved against a real `patp_num`.
fn maybe_register(registry: &ConnRegistry, key: u32, conn: &mut Conn) {
    if conn.registered {
        return;
    }
    if conn.flow.client.proto_state != crate::client_state::ProtoState::HsFetchEid {
        return;
    }
    let Some(patp_num) = conn.flow.client.patp_num else { return };
    let (read_buf, op_queue) = conn.flow.shared_rings();
    store_worker::register(registry, key, ConnEntry { read_buf, op_queue, patp_num });
    conn.registered = true;
}

fn submit_accept(ring: &mut IoUring, listen_fd: RawFd) {
    let sqe = opcode::Accept::new(Fd(listen_fd), ptr::null_mut(), ptr::null_mut())
        .build()
        .user_data(encode_user_data(OP_ACCEPT, 0));
    ring.push(&sqe);
}

fn submit_read(ring: &mut IoUring, conns: &mut Slab<Conn>, key: u32) {
    let conn = &mut conns[key as usize];
    if conn.read_inflight || conn.read_stopped {
        return;
    }
    let headroom = conn.flow.read_buf.writable_contiguous_headroom();
    if headroom == 0 {
        // no contiguous space right now; back off until the store worker
        // releases committed bytes (signalled via a future `CommitAdvance`).
        conn.read_stopped = true;
        metrics::inc_read_buf_full();
        return;
    }
    conn.read_inflight = true;
    let buf_ptr = conn.flow.read_buf.write_ptr();
    let sqe = opcode::Read::new(Fd(conn.fd), buf_ptr, headroom as u32)
        .build()
        .user_data(encode_user_data(OP_READ, key));
    ring.push(&sqe);
}

fn submit_write(ring: &mut IoUring, conns: &mut Slab<Conn>, key: u32) {
    let conn = &mut conns[key as usize];
    if conn.write_inflight || conn.write_buf.is_empty() {
        return;
    }
    conn.write_inflight = true;
    conn.inflight_write = std::mem::take(&mut conn.write_buf);

    let sqe = opcode::Write::new(Fd(conn.fd), conn.inflight_write.as_ptr(), conn.inflight_write.len() as u32)
        .build()
        .user_data(encode_user_data(OP_WRITE, key));
    ring.push(&sqe);
}

fn submit_eventfd_read(ring: &mut IoUring, eventfd: RawFd, buf: &mut u64) {
    // eventfd's kernel ABI always writes exactly 8 bytes (a u64 counter value).
    let sqe = opcode::Read::new(Fd(eventfd), buf as *mut u64 as *mut u8, 8)
        .build()
        .user_data(encode_user_data(OP_EVENTFD, 0));
    ring.push(&sqe);
}
