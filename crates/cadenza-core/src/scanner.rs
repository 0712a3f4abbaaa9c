// src/scanner.rs
//! Fixed-capacity read buffer and the `\r\n` line scanner that walks it.
//!
//! The buffer tracks two cursors over one allocation:
//!
//! ```text
//! 0 ........ cursor ........ filled ........ capacity
//! | scanned  | unscanned     | free tail     |
//! ```
//!
//! `cursor` only moves forward when a full line has been found, so a scan
//! that runs out of bytes can simply be repeated after more data arrives.

/// Result of one scan attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A `\r\n`-terminated line ends just before the new cursor.
    Complete,
    /// The buffered bytes do not contain a whole line yet.
    Incomplete,
    /// A stray `\r` or `\n` makes the line unusable.
    Malformed,
}

pub struct ReadBuf {
    data: Box<[u8]>,
    cursor: usize,
    filled: usize,
}

impl ReadBuf {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            cursor: 0,
            filled: 0,
        }
    }

    /// Scan for the next line starting at the cursor.
    ///
    /// On `Complete` both terminator bytes are overwritten with NUL and the
    /// cursor moves past them. On any other status the cursor is untouched.
    /// Nothing at or beyond `filled` is ever inspected.
    pub fn scan_line(&mut self) -> LineStatus {
        let window = &self.data[self.cursor..self.filled];
        let Some(rel) = memchr::memchr2(b'\r', b'\n', window) else {
            return LineStatus::Incomplete;
        };
        let at = self.cursor + rel;

        if self.data[at] == b'\n' {
            // A `\r\n` pair is always consumed at its `\r`, so any `\n` seen
            // here has no `\r` in front of it, whatever its offset.
            return LineStatus::Malformed;
        }

        if at + 1 == self.filled {
            return LineStatus::Incomplete;
        }
        if self.data[at + 1] != b'\n' {
            return LineStatus::Malformed;
        }

        self.data[at] = 0;
        self.data[at + 1] = 0;
        self.cursor = at + 2;
        LineStatus::Complete
    }

    /// Writable region after the received bytes.
    #[inline(always)]
    pub fn free_tail(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Record `n` bytes written into `free_tail`.
    #[inline(always)]
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.data.len());
        self.filled = (self.filled + n).min(self.data.len());
    }

    /// Append bytes, truncating at capacity. Returns how many were taken.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
        let tail = self.free_tail();
        let n = bytes.len().min(tail.len());
        tail[..n].copy_from_slice(&bytes[..n]);
        self.commit(n);
        n
    }

    #[inline(always)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline(always)]
    pub fn filled(&self) -> usize {
        self.filled
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    /// All bytes received so far, including already-scanned lines.
    #[inline(always)]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    pub fn clear(&mut self) {
        self.data[..self.filled].fill(0);
        self.cursor = 0;
        self.filled = 0;
    }
}
