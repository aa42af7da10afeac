//! End-of-DATA detection.
//!
//! Message content is fed one byte at a time; everything except the final
//! `CRLF . CRLF` is copied into a chunk buffer that the caller drains and
//! recycles. Bytes that might belong to the terminator are held back in the
//! state itself and replayed once the sequence is broken.
//!
//! The CRLF ending the DATA command counts as the start of the first line,
//! so an empty message (`.` CRLF right away) terminates too. Whatever byte
//! breaks a partial terminator is re-dispatched as if seen in `Data`, which
//! keeps `CRLF CRLF . CRLF` (blank last line) detectable.
//!
//! Leading dots are not unstuffed: `CRLF ..x` is delivered as `CRLF ..x`.

use crate::buffer::ByteBuffer;

/// Size of the decoded chunk handed to delivery.
pub const CHUNK_SIZE: usize = 2048;

/// Most bytes a single input byte can release (`"\r\n.\r"` plus itself).
const MAX_EXPANSION: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataState {
    Data,
    Cr,
    CrLf,
    CrLfDot,
    CrLfDotCr,
    Done,
}

impl DataState {
    pub fn is_done(self) -> bool {
        self == DataState::Done
    }

    /// Bytes swallowed by this state that were not yet written out.
    fn held_back(self) -> &'static [u8] {
        match self {
            DataState::Cr => b"\r",
            DataState::CrLf => b"\r\n",
            DataState::CrLfDot => b"\r\n.",
            DataState::CrLfDotCr => b"\r\n.\r",
            DataState::Data | DataState::Done => b"",
        }
    }
}

#[derive(Debug)]
pub struct DataParser {
    state: DataState,
    /// Still on the implicit line start; its CRLF is not content.
    at_start: bool,
    chunk: ByteBuffer,
}

impl DataParser {
    pub fn new() -> Self {
        Self::with_chunk_size(CHUNK_SIZE)
    }

    pub fn with_chunk_size(size: usize) -> Self {
        Self {
            state: DataState::CrLf,
            at_start: true,
            chunk: ByteBuffer::new(size.max(MAX_EXPANSION)),
        }
    }

    pub fn reset(&mut self) {
        self.state = DataState::CrLf;
        self.at_start = true;
        self.chunk.reset();
    }

    pub fn state(&self) -> DataState {
        self.state
    }

    /// Decoded content accumulated since the last [`DataParser::recycle`].
    pub fn chunk(&self) -> &[u8] {
        self.chunk.read_slice()
    }

    pub fn recycle(&mut self) {
        self.chunk.reset();
    }

    /// Line break ending the last content line, once the terminator is seen.
    /// Empty when the message itself is empty.
    pub fn closing_line_break(&self) -> &'static [u8] {
        if self.state.is_done() && !self.at_start {
            b"\r\n"
        } else {
            b""
        }
    }

    /// Whether the chunk can take the output of one more byte.
    fn has_room(&self) -> bool {
        self.chunk.writable() >= MAX_EXPANSION
    }

    pub fn feed(&mut self, c: u8) -> DataState {
        use DataState::*;

        let next = match (self.state, c) {
            (Done, _) => Done,
            (Data, b'\r') => Cr,
            (Cr, b'\n') => CrLf,
            (CrLf, b'.') => CrLfDot,
            (CrLfDot, b'\r') => CrLfDotCr,
            (CrLfDotCr, b'\n') => Done,
            (Data, c) => {
                self.chunk.write_byte(c);
                Data
            }
            (state, c) => {
                let held = state.held_back();
                if self.at_start {
                    self.chunk.write_bytes(held.strip_prefix(b"\r\n").unwrap_or(held));
                    self.at_start = false;
                } else {
                    self.chunk.write_bytes(held);
                }
                if c == b'\r' {
                    Cr
                } else {
                    self.chunk.write_byte(c);
                    Data
                }
            }
        };
        self.state = next;
        next
    }

    /// Feeds buffered bytes until the terminator is found, the input runs
    /// dry or the chunk is full. The caller drains [`DataParser::chunk`]
    /// and calls again while input remains.
    pub fn consume(&mut self, buffer: &mut ByteBuffer) -> DataState {
        while !self.state.is_done() && self.has_room() {
            match buffer.read_byte() {
                Some(c) => {
                    self.feed(c);
                }
                None => break,
            }
        }
        self.state
    }
}

impl Default for DataParser {
    fn default() -> Self {
        Self::new()
    }
}
