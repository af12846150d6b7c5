//! Server sizing and operational configuration.
//!
//! Hardcoded values that are not wire-level protocol constants live here.
//! Protocol constants (e.g. `PATP_MAX`) live in `constants`.

use crate::error::ConfigError;

/// Max concurrent connections the IO thread will track. Must fit in u32 (conn_id).
pub const SLAB_CAPACITY: usize = 4096;

/// Max range clears batched into a single FDB transaction.
pub const CLEAR_BATCH_SIZE: usize = 75_000;

/// Capacity of a connection's op queue (write-ops plus `BeginRead`/`FetchEid`
/// requests). Implemented as the fixed-capacity cross-thread `RingBuffer`
/// rather than `ring::GrowableRingBuffer`: growth there is `&mut self`-gated
/// by design (see `ring`'s doc comments), which a concurrent IO-thread
/// producer and store-worker consumer can't satisfy without an exclusive
/// lock. A full queue instead backpressures like the read buffer does.
pub const OP_QUEUE_CAPACITY: usize = 256;

/// Capacity of the single global response ring (store worker -> IO thread).
pub const RESPONSE_QUEUE_CAPACITY: usize = 4096;

/// `io_uring` submission/completion queue depth.
pub const IO_URING_ENTRIES: u32 = 4096;

const _: () = assert!(
    SLAB_CAPACITY <= u32::MAX as usize,
    "SLAB_CAPACITY must fit in u32 (conn_id)"
);

/// Resolved, validated server configuration. Built from CLI flags (or defaults)
/// by `Config::from_knobs`; every other component reads knobs from here rather
/// than re-deriving them.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Max bytes committed per FDB transaction.
    pub tx_size: u64,
    /// Fragment size `F`: the fixed length of all non-final fragments.
    pub chunk_size: u64,
    /// How many tx_size-sized buckets fit in a connection's read buffer.
    pub tx_buffering: u64,
    /// `tx_size * tx_buffering`, the per-connection read buffer size in bytes.
    pub read_buffer_size: u64,
    /// TCP port to listen on.
    pub port: u16,
    /// Path to the FDB cluster file.
    pub cluster_file: String,
    /// Max set-operations per FDB transaction (B in the spec); defaults to 1.
    pub max_set_ops_per_tx: usize,
}

pub const DEFAULT_TX_SIZE: u64 = 1_000_000;
pub const DEFAULT_CHUNK_SIZE: u64 = 10_000;
pub const DEFAULT_TX_BUFFERING: u64 = 2;
pub const DEFAULT_PORT: u16 = 7000;
pub const DEFAULT_CLUSTER_FILE: &str = "/etc/foundationdb/fdb.cluster";
pub const DEFAULT_MAX_SET_OPS_PER_TX: usize = 1;

impl Config {
    /// Validate and resolve a set of knobs, mirroring the original CLI's checks
    /// (`chunk size cannot be negative`, `tx size cannot be negative`, `tx_size >= chunk_size`,
    /// `cannot buffer up a negative number of txs`) — `clap`'s unsigned integer
    /// parsing already rejects negative inputs, so only the relational checks remain.
    pub fn from_knobs(
        tx_size: u64,
        chunk_size: u64,
        tx_buffering: u64,
        port: u16,
        cluster_file: String,
        max_set_ops_per_tx: usize,
    ) -> Result<Self, ConfigError> {
        if chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if tx_buffering == 0 {
            return Err(ConfigError::ZeroTxBuffering);
        }
        let tx_size = tx_size.max(chunk_size);
        if tx_size < chunk_size {
            return Err(ConfigError::TxSmallerThanChunk { tx_size, chunk_size });
        }
        Ok(Self {
            tx_size,
            chunk_size,
            tx_buffering,
            read_buffer_size: tx_size * tx_buffering,
            port,
            cluster_file,
            max_set_ops_per_tx,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_knobs(
            DEFAULT_TX_SIZE,
            DEFAULT_CHUNK_SIZE,
            DEFAULT_TX_BUFFERING,
            DEFAULT_PORT,
            DEFAULT_CLUSTER_FILE.to_string(),
            DEFAULT_MAX_SET_OPS_PER_TX,
        )
        .expect("default knobs are always valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_cli() {
        let cfg = Config::default();
        assert_eq!(cfg.tx_size, 1_000_000);
        assert_eq!(cfg.chunk_size, 10_000);
        assert_eq!(cfg.tx_buffering, 2);
        assert_eq!(cfg.read_buffer_size, 2_000_000);
        assert_eq!(cfg.port, 7000);
    }

    #[test]
    fn tx_size_is_raised_to_chunk_size() {
        let cfg = Config::from_knobs(100, 10_000, 2, 7000, DEFAULT_CLUSTER_FILE.into(), 1).unwrap();
        assert_eq!(cfg.tx_size, 10_000);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        assert_eq!(
            Config::from_knobs(1000, 0, 2, 7000, DEFAULT_CLUSTER_FILE.into(), 1).unwrap_err(),
            ConfigError::ZeroChunkSize
        );
    }

    #[test]
    fn zero_tx_buffering_rejected() {
        assert_eq!(
            Config::from_knobs(1000, 100, 0, 7000, DEFAULT_CLUSTER_FILE.into(), 1).unwrap_err(),
            ConfigError::ZeroTxBuffering
        );
    }
}
