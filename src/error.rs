//! Crate-wide error enums. Each component that can fail in more than one way gets
//! its own `thiserror::Error` type; `main` wraps these in `anyhow` at the top level.

use thiserror::Error;

/// Errors from parsing a control line or the protocol state machine's transition rules.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ProtocolError {
    #[error("command too long")]
    CommandTooLong,
    #[error("expected HELLO 0")]
    ExpectedHello,
    #[error("expected POINT ~<@p>")]
    ExpectedPoint,
    #[error("invalid @p: {0}")]
    InvalidPatp(String),
    #[error("unexpected command in state {0:?}")]
    UnexpectedCommand(&'static str),
    #[error("invalid WRITE: id {id} <= highest_eid {highest_eid}")]
    StaleWrite { id: u64, highest_eid: u64 },
    #[error("invalid WRITE BATCH: start {start_id} <= highest_eid {highest_eid}, or start >= end {end_id}")]
    InvalidBatchRange {
        start_id: u64,
        end_id: u64,
        highest_eid: u64,
    },
    #[error("invalid EVENT: id {id} <= highest_eid {highest_eid}")]
    StaleEvent { id: u64, highest_eid: u64 },
    #[error("event {id}: bad bracketing")]
    BadBracketing { id: u64 },
    #[error("client is not supposed to talk now, we are streaming to it")]
    TalkingWhileReading,
}

/// Errors from fragment-count header decoding or fragment reassembly.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum FragmentError {
    #[error("header buffer too short")]
    HeaderTruncated,
    #[error("fragment count overflows header encoding (k > 3)")]
    HeaderOverflow,
    #[error("fragment {index} has length {actual}, expected {expected}")]
    WrongFragmentLength {
        index: u32,
        expected: usize,
        actual: usize,
    },
    #[error("short read: expected {expected} fragments, observed {observed}")]
    ShortRead { expected: u32, observed: u32 },
    #[error("malformed fragment key")]
    MalformedKey,
}

/// Errors from the FDB batcher (C3).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("fdb transaction error: {0}")]
    Transaction(String),
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    #[error("event {0} not found")]
    NotFound(u64),
}

/// Errors validating CLI-provided configuration knobs.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("chunk size cannot be zero")]
    ZeroChunkSize,
    #[error("tx size ({tx_size}) must be >= chunk size ({chunk_size})")]
    TxSmallerThanChunk { tx_size: u64, chunk_size: u64 },
    #[error("tx_buffering cannot be zero")]
    ZeroTxBuffering,
}
