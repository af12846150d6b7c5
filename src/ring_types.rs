//! Cross-thread message types carried by the op queue (IO thread -> store worker)
//! and the response queue (store worker -> IO thread). Plain data, `Send`, no
//! lifetime tied to either thread's local state.

pub use crate::client_state::WriteOp;

/// Sent from the store worker back to the IO thread once an op has been processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreResponse {
    /// A control line to write back to the client (e.g. the streamed
    /// `EVENT <id> <len>` header during a read).
    Control { conn_id: u32, line: String },
    /// Answers a `FetchEid` op: the IO thread finishes the handshake locally
    /// (it owns the `ClientState`) and writes the resulting `READY <eid>` line.
    EidReady { conn_id: u32, highest_eid: u64 },
    /// Raw event payload bytes to stream back during a `READ`.
    Data { conn_id: u32, bytes: Vec<u8> },
    /// One event has been durably committed; frees its DATA ops' read-buffer bytes.
    Committed { conn_id: u32, read_buf_advance: usize },
    /// The in-progress read has sent its last event.
    ReadDone { conn_id: u32 },
    /// Terminates the connection (protocol or storage error).
    Terminate { conn_id: u32, reason: String },
}
