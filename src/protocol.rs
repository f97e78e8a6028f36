//! Newline-delimited chat protocol.
//!
//! There is no handshake, length prefix or control frame:
//! - Inbound: arbitrary bytes, a message ends at `\n`. A `\r` before the
//!   `\n` is kept as part of the message text.
//! - Outbound: `{peer}: {line}\n`, sent identically to every connected peer,
//!   the originator included.
//!
//! Line bytes are decoded as UTF-8 with invalid sequences replaced by
//! U+FFFD, so decoding never fails.

use crate::runtime::GrowableBuffer;
use bytes::{BufMut, Bytes, BytesMut};

/// Message delimiter.
pub const NEWLINE: u8 = b'\n';

/// Framing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// An unterminated line grew past the configured limit.
    LineTooLong { limit: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::LineTooLong { limit } => {
                write!(f, "line exceeds {} bytes without a newline", limit)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Splits a byte stream into lines.
///
/// Bytes of the current line accumulate in a [`GrowableBuffer`] which is
/// cleared, not released, after each completed line.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: GrowableBuffer<u8>,
    max_line_length: Option<usize>,
}

impl LineFramer {
    /// Create a framer with no line-length limit.
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a framer that rejects lines longer than `max_line_length` bytes.
    ///
    /// `None` keeps the unbounded behavior.
    pub fn with_limit(max_line_length: Option<usize>) -> Self {
        Self {
            pending: GrowableBuffer::new(),
            max_line_length,
        }
    }

    /// Consume `input` in order, pushing every completed line onto `lines`.
    ///
    /// Lines completed before a limit violation are still pushed.
    pub fn feed(&mut self, input: &[u8], lines: &mut Vec<String>) -> Result<(), FrameError> {
        for &byte in input {
            if byte == NEWLINE {
                lines.push(String::from_utf8_lossy(self.pending.snapshot()).into_owned());
                self.pending.clear();
                continue;
            }

            if let Some(limit) = self.max_line_length {
                if self.pending.len() >= limit {
                    return Err(FrameError::LineTooLong { limit });
                }
            }
            self.pending.append(byte);
        }
        Ok(())
    }

    /// Bytes of the current unterminated line.
    #[cfg(test)]
    pub fn pending(&self) -> &[u8] {
        self.pending.snapshot()
    }

    /// Allocated size of the accumulation buffer.
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.pending.capacity()
    }
}

/// Build the outbound frame for a line received from `peer`.
pub fn format_frame(peer: &str, line: &str) -> Bytes {
    let mut frame = BytesMut::with_capacity(peer.len() + line.len() + 3);
    frame.put_slice(peer.as_bytes());
    frame.put_slice(b": ");
    frame.put_slice(line.as_bytes());
    frame.put_u8(NEWLINE);
    frame.freeze()
}
