//! Response path: turn a drained batch of `StoreResponse` values into, per
//! connection, the wire bytes to write back and the bookkeeping effects the IO
//! thread must apply to its own `Connection` state (advance the read buffer,
//! reset read mode, terminate).
//!
//! Extracted so integration tests can drive the flow without `io_uring`,
//! mirroring the teacher's `response_flow.rs` split.

use std::collections::HashMap;

use crate::ring_types::StoreResponse;

/// Something the IO thread must do for one connection, in the order the
/// store worker produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEffect {
    /// Bytes to write to the socket (a control line, or raw event payload).
    Write(Vec<u8>),
    /// A write has committed; release this many bytes from the read buffer.
    CommitAdvance(usize),
    /// The in-progress `READ` has sent its last event.
    ReadDone,
    /// Finish the handshake locally with this `highest_eid` and write the
    /// resulting `READY <eid>` line (the IO thread owns `ClientState`, so the
    /// transition itself happens there, not in this module).
    FinishHandshake(u64),
    /// Close the connection with this human-readable reason.
    Terminate(String),
}

/// Groups a batch of responses by connection, preserving per-connection order.
/// `Control` and `Data` responses become `Write` effects; a `Control` line gets
/// its trailing `\n` appended here since `StoreResponse::Control::line` carries
/// it bare (mirroring `LineFramer`, which strips it on the way in).
pub fn responses_to_effects_per_conn<I>(responses: I) -> HashMap<u32, Vec<ConnEffect>>
where
    I: IntoIterator<Item = StoreResponse>,
{
    let mut map: HashMap<u32, Vec<ConnEffect>> = HashMap::new();
    for resp in responses {
        match resp {
            StoreResponse::Control { conn_id, line } => {
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                map.entry(conn_id).or_default().push(ConnEffect::Write(bytes));
            }
            StoreResponse::Data { conn_id, bytes } => {
                map.entry(conn_id).or_default().push(ConnEffect::Write(bytes));
            }
            StoreResponse::Committed { conn_id, read_buf_advance } => {
                map.entry(conn_id).or_default().push(ConnEffect::CommitAdvance(read_buf_advance));
            }
            StoreResponse::ReadDone { conn_id } => {
                map.entry(conn_id).or_default().push(ConnEffect::ReadDone);
            }
            StoreResponse::EidReady { conn_id, highest_eid } => {
                map.entry(conn_id).or_default().push(ConnEffect::FinishHandshake(highest_eid));
            }
            StoreResponse::Terminate { conn_id, reason } => {
                map.entry(conn_id).or_default().push(ConnEffect::Terminate(reason));
            }
        }
    }
    map
}

/// The `EVENT <id> <length>` header line the store worker sends ahead of an
/// event's raw payload during a `READ` stream (§6); the trailing `\n` is added
/// by `responses_to_effects_per_conn`, not here.
pub fn event_header_line(id: u64, length: u64) -> String {
    format!("EVENT {id} {length}")
}

/// The two-byte trailer that follows an event's raw payload during a `READ`
/// stream, mirroring the `\n\n` bracket a `WRITE` is terminated with.
pub const READ_EVENT_TRAILER: &[u8; 2] = b"\n\n";
