//! Protocol-level constants shared across modules.
//!
//! Sizing/operational knobs that are not wire-level constants live in `config`.

/// Maximum length of a `@p` string, including the leading `~`.
pub const PATP_MAX: usize = 57;

/// Fixed size of the per-connection control-line scratch buffer.
pub const CTL_BUF_SIZE: usize = 128;

/// Fixed size of the per-connection outbound control-write scratch buffer.
pub const WRITE_BUF_SIZE: usize = 16 * 1024;

/// Byte length of a fragment key's fixed prefix: `0x00 || be64(id) || be32(index)`.
pub const FRAGMENT_KEY_LEN: usize = 1 + 8 + 4;

/// One-byte prefix marking fragment keys, chosen to stay out of FDB's system key-space.
pub const FRAGMENT_KEY_PREFIX: u8 = 0x00;

/// One-byte prefix marking the per-ship `highest_eid` bookkeeping key.
pub const EID_KEY_PREFIX: u8 = 0x01;

/// High bit set on the first header byte when the header extends past one byte.
pub const EXTENDED_HEADER: u8 = 0x80;

/// Maximum size, in bytes, of a fragment-count header.
pub const MAX_HEADER_SIZE: usize = 4;

/// The two-byte bracket terminator following a DATA block.
pub const BRACKET: [u8; 2] = [b'\n', b'\n'];

const _: () = assert!(PATP_MAX < CTL_BUF_SIZE, "patp must fit in a control line");
