//! C5: the line/length-framed parser over a streaming byte source. Pure byte-slicing
//! logic; it has no notion of sockets or threads, only "here is a chunk of newly
//! arrived bytes, tell me what full lines (or data windows) are now available."

use crate::constants::CTL_BUF_SIZE;
use crate::error::ProtocolError;

/// Accumulates a control line byte-by-byte into a fixed-capacity scratch buffer,
/// mirroring the C original's 128-byte `ctl_buf`. A single newline `\n` terminates a
/// line (§6: CR is not special-cased, matching the distilled spec's resolved answer).
#[derive(Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(CTL_BUF_SIZE) }
    }

    /// Feeds one byte. Returns `Ok(Some(line))` when `\n` completes a line (the
    /// scratch buffer is cleared for the next one), `Ok(None)` if more bytes are
    /// needed, or `CommandTooLong` if the line would exceed `CTL_BUF_SIZE - 1` bytes
    /// (leaving room for the terminator, as the distilled spec's 127-byte limit
    /// including the newline implies).
    pub fn push_byte(&mut self, byte: u8) -> Result<Option<String>, ProtocolError> {
        if byte == b'\n' {
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            return Ok(Some(line));
        }
        if self.buf.len() + 1 >= CTL_BUF_SIZE {
            return Err(ProtocolError::CommandTooLong);
        }
        self.buf.push(byte);
        Ok(None)
    }

    /// Feeds a chunk of bytes, returning every complete line found in order. Stops
    /// (returning the error) at the first malformed line; bytes after the error are
    /// not consumed since the connection is about to be terminated.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<Vec<String>, ProtocolError> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if let Some(line) = self.push_byte(byte)? {
                lines.push(line);
            }
        }
        Ok(lines)
    }
}

/// The two-byte bracket terminator expected after a `DATA` block's payload bytes.
#[derive(Default)]
pub struct BracketFramer {
    buf: [u8; 2],
    filled: usize,
}

impl BracketFramer {
    pub fn new() -> Self {
        Self { buf: [0; 2], filled: 0 }
    }

    /// Feeds one byte of the expected two-byte trailer. Returns `Some(bytes)` once
    /// both have arrived (caller resets by constructing a fresh framer for the next
    /// event).
    pub fn push_byte(&mut self, byte: u8) -> Option<[u8; 2]> {
        self.buf[self.filled] = byte;
        self.filled += 1;
        if self.filled == 2 {
            Some(self.buf)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_is_emitted_on_newline() {
        let mut framer = LineFramer::new();
        for &b in b"HELLO 0" {
            assert_eq!(framer.push_byte(b).unwrap(), None);
        }
        assert_eq!(framer.push_byte(b'\n').unwrap(), Some("HELLO 0".to_string()));
    }

    #[test]
    fn multiple_lines_in_one_chunk() {
        let mut framer = LineFramer::new();
        let lines = framer.push_bytes(b"HELLO 0\nPOINT ~zod\n").unwrap();
        assert_eq!(lines, vec!["HELLO 0".to_string(), "POINT ~zod".to_string()]);
    }

    #[test]
    fn over_length_line_errors() {
        let mut framer = LineFramer::new();
        let long = vec![b'x'; CTL_BUF_SIZE];
        assert_eq!(framer.push_bytes(&long).unwrap_err(), ProtocolError::CommandTooLong);
    }

    #[test]
    fn bracket_framer_completes_after_two_bytes() {
        let mut framer = BracketFramer::new();
        assert_eq!(framer.push_byte(b'\n'), None);
        assert_eq!(framer.push_byte(b'\n'), Some(*b"\n\n"));
    }
}
