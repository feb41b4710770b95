//! A fixed-capacity read buffer with explicit compaction, shared by the scan loops.
//!
//! The demuxers parse borrowed slices of the window returned by [`ByteCursor::window()`].  When
//! a parse step needs bytes beyond the window, the caller invokes [`ByteCursor::refill()`],
//! which moves the unconsumed tail to the front of the buffer and reads more data after it, so
//! no byte is ever dropped or seen twice across a refill boundary.

use std::io;
use std::io::Read;

/// Smallest permitted buffer capacity: a bounded PES packet (6 byte prefix plus 16-bit
/// packet_length) must always fit after compaction.
pub const MIN_CAPACITY: usize = 6 + 0xffff;

const DEFAULT_CAPACITY: usize = 256 * 1024;

/// Fixed-capacity byte buffer over a [`Read`] source, tracking a read cursor and the end of
/// valid data.
///
/// Invariant: `read_pos <= valid_end <= capacity`.
pub struct ByteCursor {
    buf: Box<[u8]>,
    read_pos: usize,
    valid_end: usize,
    base_offset: u64,
}

impl Default for ByteCursor {
    fn default() -> ByteCursor {
        ByteCursor::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ByteCursor {
    /// Create a cursor with the default 256 KiB capacity.
    pub fn new() -> ByteCursor {
        Self::default()
    }

    /// Create a cursor with the given capacity.
    ///
    /// Panics if `capacity` is smaller than [`MIN_CAPACITY`].
    pub fn with_capacity(capacity: usize) -> ByteCursor {
        assert!(capacity >= MIN_CAPACITY);
        ByteCursor {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            valid_end: 0,
            base_offset: 0,
        }
    }

    /// The valid, unconsumed bytes.
    #[inline]
    pub fn window(&self) -> &[u8] {
        &self.buf[self.read_pos..self.valid_end]
    }

    /// Consume `count` bytes from the front of the window.
    ///
    /// Panics if `count` exceeds the window length.
    #[inline]
    pub fn advance(&mut self, count: usize) {
        assert!(count <= self.valid_end - self.read_pos);
        self.read_pos += count;
    }

    /// Absolute source offset of the first window byte, for diagnostics.
    #[inline]
    pub fn position(&self) -> u64 {
        self.base_offset + self.read_pos as u64
    }

    /// Move the unconsumed tail to the front of the buffer, making room for a refill.
    pub fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        self.buf.copy_within(self.read_pos..self.valid_end, 0);
        self.base_offset += self.read_pos as u64;
        self.valid_end -= self.read_pos;
        self.read_pos = 0;
    }

    /// Compact, then perform one read from `src` into the free tail.
    ///
    /// Returns the number of bytes gained; `0` means end of input (or that the window already
    /// fills the whole buffer, which cannot happen for well-formed packet lengths given
    /// [`MIN_CAPACITY`]).
    pub fn refill<R: Read>(&mut self, src: &mut R) -> io::Result<usize> {
        self.compact();
        if self.valid_end == self.buf.len() {
            return Ok(0);
        }
        loop {
            match src.read(&mut self.buf[self.valid_end..]) {
                Ok(n) => {
                    self.valid_end += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
