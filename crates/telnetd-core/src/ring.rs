//! Fixed-capacity circular byte buffer for the per-session duplex relay.
//!
//! Each session owns two of these: one carrying socket bytes toward the
//! pty, one carrying pty bytes back to the socket. Cursors and occupancy
//! are explicit so the event loop can hand contiguous spans straight to
//! read(2)/write(2) without copying.

use crate::error::{TelnetdError, TelnetdResult};

/// A circular buffer with an explicit consumer cursor, producer cursor,
/// and occupancy count.
///
/// Invariants: `len <= capacity`, both cursors `< capacity`, and both
/// cursors are reset to zero whenever occupancy returns to zero (see
/// [`Ring::reset_if_empty`]).
#[derive(Debug)]
pub struct Ring {
    buf: Box<[u8]>,
    /// Next byte to consume.
    head: usize,
    /// Next free byte to fill.
    tail: usize,
    len: usize,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Free space remaining.
    pub fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    /// The contiguous occupied span starting at the consumer cursor.
    ///
    /// When the occupied region wraps the physical end of the buffer this
    /// is only its first part; the rest becomes visible after the span is
    /// consumed.
    pub fn readable(&self) -> &[u8] {
        let n = self.len.min(self.buf.len() - self.head);
        &self.buf[self.head..self.head + n]
    }

    /// Mutable view of the same span, for in-place filtering.
    pub fn readable_mut(&mut self) -> &mut [u8] {
        let n = self.len.min(self.buf.len() - self.head);
        &mut self.buf[self.head..self.head + n]
    }

    /// The contiguous free span starting at the producer cursor.
    pub fn writable(&mut self) -> &mut [u8] {
        let n = (self.buf.len() - self.len).min(self.buf.len() - self.tail);
        &mut self.buf[self.tail..self.tail + n]
    }

    /// Advance the consumer cursor after `n` bytes were taken from
    /// [`Ring::readable`].
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.head = (self.head + n) % self.buf.len();
        self.len -= n;
    }

    /// Advance the producer cursor after `n` bytes were written into
    /// [`Ring::writable`].
    pub fn produce(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len() - self.len);
        self.tail = (self.tail + n) % self.buf.len();
        self.len += n;
    }

    /// Rewind both cursors once the buffer has drained. Keeping drained
    /// buffers anchored at offset zero makes wrapped spans rare, which is
    /// what the telnet filter's scan-window limitation relies on.
    pub fn reset_if_empty(&mut self) {
        if self.len == 0 {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Rotate the contents so the occupied region starts at offset zero
    /// and becomes fully contiguous.
    pub fn make_contiguous(&mut self) {
        if self.head == 0 {
            return;
        }
        self.buf.rotate_left(self.head);
        self.head = 0;
        self.tail = self.len % self.buf.len();
    }

    /// Append bytes, wrapping past the physical end if needed. Fails when
    /// the buffer cannot hold them; the caller decides how fatal that is.
    pub fn extend(&mut self, bytes: &[u8]) -> TelnetdResult<()> {
        if bytes.len() > self.free() {
            return Err(TelnetdError::BufferFull {
                needed: bytes.len(),
                free: self.free(),
            });
        }
        let first = bytes.len().min(self.buf.len() - self.tail);
        self.buf[self.tail..self.tail + first].copy_from_slice(&bytes[..first]);
        self.buf[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        self.tail = (self.tail + bytes.len()) % self.buf.len();
        self.len += bytes.len();
        Ok(())
    }

    /// Extract one line, delimited by the earliest CR or LF in the
    /// occupied region. The terminator is consumed but not returned; an
    /// LF terminator is treated as CR (clients in line mode send either).
    ///
    /// Compacts first when the occupied region straddles the physical
    /// end, so the returned line is never split.
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        if self.head + self.len > self.buf.len() {
            self.make_contiguous();
        }
        let occupied = &self.buf[self.head..self.head + self.len];
        let pos = occupied.iter().position(|&b| b == b'\r' || b == b'\n')?;
        let line = occupied[..pos].to_vec();
        self.consume(pos + 1);
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produce_consume_round() {
        let mut r = Ring::new(8);
        let w = r.writable();
        w[..5].copy_from_slice(b"hello");
        r.produce(5);
        assert_eq!(r.readable(), b"hello");
        r.consume(5);
        assert!(r.is_empty());
        r.reset_if_empty();
        assert_eq!(r.writable().len(), 8);
    }

    #[test]
    fn occupancy_stays_bounded_across_wrap() {
        let mut r = Ring::new(4);
        r.extend(b"abcd").unwrap();
        assert!(r.is_full());
        r.consume(2);
        r.extend(b"ef").unwrap();
        assert_eq!(r.len(), 4);
        assert_eq!(r.readable(), b"cd");
        r.consume(2);
        assert_eq!(r.readable(), b"ef");
    }

    #[test]
    fn extend_rejects_overflow() {
        let mut r = Ring::new(4);
        r.extend(b"abc").unwrap();
        assert!(matches!(
            r.extend(b"de"),
            Err(TelnetdError::BufferFull { needed: 2, free: 1 })
        ));
        // A failed extend leaves the contents untouched.
        assert_eq!(r.readable(), b"abc");
    }

    #[test]
    fn cursors_reset_only_at_zero_occupancy() {
        let mut r = Ring::new(8);
        r.extend(b"xy").unwrap();
        r.consume(1);
        r.reset_if_empty();
        assert_eq!(r.readable(), b"y");
        r.consume(1);
        r.reset_if_empty();
        assert!(r.is_empty());
        r.extend(b"z").unwrap();
        assert_eq!(r.readable(), b"z");
    }

    #[test]
    fn take_line_strips_terminator() {
        let mut r = Ring::new(32);
        r.extend(b"hello\rworld\r").unwrap();
        assert_eq!(r.take_line().unwrap(), b"hello");
        assert_eq!(r.take_line().unwrap(), b"world");
        assert!(r.take_line().is_none());
    }

    #[test]
    fn take_line_accepts_lf_terminator() {
        let mut r = Ring::new(32);
        r.extend(b"name\nrest").unwrap();
        assert_eq!(r.take_line().unwrap(), b"name");
        // No terminator yet for the remainder.
        assert!(r.take_line().is_none());
        assert_eq!(r.readable(), b"rest");
    }

    #[test]
    fn take_line_compacts_wrapped_content() {
        let mut r = Ring::new(8);
        r.extend(b"abcdef").unwrap();
        r.consume(6);
        // Line wraps the physical end: two bytes at the top, then the rest.
        r.extend(b"login\r").unwrap();
        assert!(r.head + r.len() > r.capacity());
        assert_eq!(r.take_line().unwrap(), b"login");
        assert!(r.is_empty());
    }

    #[test]
    fn empty_line_is_distinct_from_no_line() {
        let mut r = Ring::new(8);
        r.extend(b"\r").unwrap();
        assert_eq!(r.take_line().unwrap(), b"");
        assert!(r.take_line().is_none());
    }
}
