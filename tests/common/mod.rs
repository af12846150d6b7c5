#![allow(dead_code)]

use std::os::unix::io::RawFd;

use seguro::ring::RingBuffer;

pub fn create_eventfd() -> RawFd {
    unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) }
}

/// Copies `bytes` into a connection's read buffer and commits the write cursor,
/// as the IO thread would after an `io_uring` read completion.
pub fn feed(read_buf: &RingBuffer<u8>, bytes: &[u8]) {
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), read_buf.write_ptr(), bytes.len());
    }
    read_buf.advance_w(bytes.len());
}

/// Bytes for a full `HELLO`/`POINT` handshake prologue up to (not including)
/// `finish_handshake`, which the caller still has to drive once the store
/// worker's `FetchEid` reply comes back.
pub fn handshake_bytes(patp: &str) -> Vec<u8> {
    format!("HELLO 0\nPOINT {patp}\n").into_bytes()
}

/// Bytes for one complete `WRITE <id> <len>\n<payload>\n\n` frame.
pub fn write_frame(id: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = format!("WRITE {id} {}\n", payload.len()).into_bytes();
    buf.extend_from_slice(payload);
    buf.extend_from_slice(b"\n\n");
    buf
}

/// Bytes for a `READ <start_id> <limit>` command line.
pub fn read_frame(start_id: u64, limit: u64) -> Vec<u8> {
    format!("READ {start_id} {limit}\n").into_bytes()
}
