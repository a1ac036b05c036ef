//! Line framing for continuous feeds.
//!
//! A continuous feed is a sequence of JSON records, one per line. Blank
//! lines are heartbeats the server sends to keep an idle connection open.
//! Chunks from the transport arrive with arbitrary boundaries, so bytes are
//! buffered until a full line is available.

use bytes::{Bytes, BytesMut};

use crate::Error;

/// Maximum size of a single unterminated line (4 MB).
pub const MAX_LINE_SIZE: usize = 4 * 1024 * 1024;

/// One line taken from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// A non-blank line, without its terminator.
    Record(Bytes),
    /// A blank keep-alive line.
    Heartbeat,
}

/// Splits a byte stream into newline-terminated lines.
#[derive(Debug)]
pub struct LineFramer {
    buf: BytesMut,
    max_line_size: usize,
}

impl LineFramer {
    /// Create a framer with the default line limit.
    pub fn new() -> Self {
        Self::with_max_line_size(MAX_LINE_SIZE)
    }

    /// Create a framer with a custom line limit.
    pub fn with_max_line_size(max_line_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_line_size,
        }
    }

    /// Append a chunk from the transport.
    ///
    /// Fails if the unterminated tail grows past the line limit; the buffer
    /// is cleared in that case so the framer can be reused after a reconnect.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.buf.extend_from_slice(chunk);

        let tail = match self.buf.iter().rposition(|&b| b == b'\n') {
            Some(pos) => self.buf.len() - pos - 1,
            None => self.buf.len(),
        };
        if tail > self.max_line_size {
            self.buf.clear();
            return Err(Error::FrameTooLarge {
                size: tail,
                max: self.max_line_size,
            });
        }
        Ok(())
    }

    /// Take the next complete line, if one is buffered.
    pub fn next_line(&mut self) -> Option<Line> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line = self.buf.split_to(pos + 1).freeze();

        let mut end = line.len() - 1;
        if end > 0 && line[end - 1] == b'\r' {
            end -= 1;
        }
        line.truncate(end);

        if line.iter().all(|b| b.is_ascii_whitespace()) {
            Some(Line::Heartbeat)
        } else {
            Some(Line::Record(line))
        }
    }

    /// Take every complete record line still buffered, skipping heartbeats.
    pub fn drain_records(&mut self) -> Vec<Bytes> {
        let mut records = Vec::new();
        while let Some(line) = self.next_line() {
            if let Line::Record(bytes) = line {
                records.push(bytes);
            }
        }
        records
    }

    /// True if an unterminated, non-blank line is buffered.
    pub fn has_partial(&self) -> bool {
        let start = self
            .buf
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);
        self.buf[start..].iter().any(|b| !b.is_ascii_whitespace())
    }

    /// Number of buffered bytes.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}
