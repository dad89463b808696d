//! Telnet control-sequence filtering for the socket→pty direction.
//!
//! The server never negotiates beyond a fixed offer sent at session
//! creation; incoming IAC sequences are stripped so they cannot reach the
//! terminal. The scrubber works in place over one contiguous scan span of
//! the inbound ring, compacting surviving data bytes toward the end of
//! the processed region so the span in front of them can be released.

/// Interpret-As-Command marker byte.
pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
/// Subnegotiation begin/end.
pub const SB: u8 = 250;
pub const SE: u8 = 240;
/// Keepalive no-op (putty and friends send these).
pub const NOP: u8 = 241;

pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_NAWS: u8 = 31;
pub const OPT_LFLOW: u8 = 33;

/// The fixed per-session offer, preloaded into the outbound buffer at
/// creation: we echo, we suppress go-ahead, and we want window size and
/// flow control reports from the client.
pub const NEGOTIATION_OFFER: [u8; 15] = [
    IAC, DO, OPT_ECHO,
    IAC, DO, OPT_NAWS,
    IAC, DO, OPT_LFLOW,
    IAC, WILL, OPT_ECHO,
    IAC, WILL, OPT_SGA,
];

/// Window size decoded from a NAWS subnegotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

/// Result of one scrub pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scrub {
    /// Bytes of the span that were fully processed. Anything past this
    /// offset is an incomplete control sequence, left for the next pass.
    pub processed: usize,
    /// Data bytes that survived, compacted to the end of the processed
    /// region: they sit at `span[removed()..processed]` after the call.
    pub kept: usize,
    /// Last window size seen in the span, if any.
    pub window: Option<WindowSize>,
}

impl Scrub {
    /// Control bytes dropped by this pass.
    pub fn removed(&self) -> usize {
        self.processed - self.kept
    }
}

/// Strip control sequences from one contiguous scan span.
///
/// Recognized and removed: `IAC IAC` (kept as a single literal 0xFF data
/// byte), `IAC NOP`, and a NAWS subnegotiation (nine bytes, consumed
/// without checking the trailing `IAC SE` pair); any other `IAC x y` is
/// dropped unseen. A CR immediately followed by LF or NUL collapses to a
/// bare CR. A sequence cut off at the end of the span is left unconsumed.
///
/// Known limitation, preserved deliberately: the span never crosses the
/// ring's physical end, so a sequence that is both incomplete here and
/// wraps that boundary can be misread on the next pass. Cursor rewinds on
/// empty buffers make such wraps rare in practice.
pub fn scrub(span: &mut [u8]) -> Scrub {
    let mut rd = 0;
    let mut wr = 0;
    let mut window = None;

    while rd < span.len() {
        let b = span[rd];
        if b != IAC {
            span[wr] = b;
            wr += 1;
            rd += 1;
            // Line-mode clients send CR LF (or CR NUL) for the return key.
            if b == b'\r' && rd < span.len() && (span[rd] == b'\n' || span[rd] == 0) {
                rd += 1;
            }
            continue;
        }

        if rd + 1 >= span.len() {
            break;
        }
        match span[rd + 1] {
            NOP => {
                rd += 2;
            }
            IAC => {
                // Escaped literal 0xFF.
                span[wr] = IAC;
                wr += 1;
                rd += 2;
            }
            _ => {
                if rd + 2 >= span.len() {
                    break;
                }
                if span[rd + 1] == SB && span[rd + 2] == OPT_NAWS {
                    if rd + 8 >= span.len() {
                        break;
                    }
                    window = Some(WindowSize {
                        cols: u16::from_be_bytes([span[rd + 3], span[rd + 4]]),
                        rows: u16::from_be_bytes([span[rd + 5], span[rd + 6]]),
                    });
                    rd += 9;
                } else {
                    rd += 3;
                }
            }
        }
    }

    let removed = rd - wr;
    if removed > 0 {
        span.copy_within(0..wr, removed);
    }
    Scrub {
        processed: rd,
        kept: wr,
        window,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &[u8]) -> (Vec<u8>, Scrub) {
        let mut buf = input.to_vec();
        let s = scrub(&mut buf);
        (buf[s.removed()..s.processed].to_vec(), s)
    }

    #[test]
    fn plain_data_passes_through() {
        let (kept, s) = run(b"hello");
        assert_eq!(kept, b"hello");
        assert_eq!(s.processed, 5);
        assert_eq!(s.removed(), 0);
    }

    #[test]
    fn cr_lf_and_cr_nul_collapse_to_cr() {
        let (kept, _) = run(b"a\r\nb\r\0c");
        assert_eq!(kept, b"a\rb\rc");
    }

    #[test]
    fn cr_at_span_end_does_not_eat_next_pass() {
        let (kept, s) = run(b"ok\r");
        assert_eq!(kept, b"ok\r");
        assert_eq!(s.processed, 3);
    }

    #[test]
    fn literal_iac_escape_yields_one_data_byte() {
        let (kept, _) = run(&[b'x', IAC, IAC, b'y']);
        assert_eq!(kept, [b'x', IAC, b'y']);
    }

    #[test]
    fn nop_is_dropped() {
        let (kept, _) = run(&[b'a', IAC, NOP, b'b']);
        assert_eq!(kept, b"ab");
    }

    #[test]
    fn unknown_three_byte_sequences_are_dropped() {
        let (kept, _) = run(&[IAC, WILL, OPT_ECHO, b'z', IAC, DONT, OPT_SGA]);
        assert_eq!(kept, b"z");
    }

    #[test]
    fn naws_is_consumed_and_decoded() {
        let (kept, s) = run(&[b'a', IAC, SB, OPT_NAWS, 0, 80, 0, 24, IAC, SE, b'b']);
        assert_eq!(kept, b"ab");
        assert_eq!(s.window, Some(WindowSize { cols: 80, rows: 24 }));
    }

    #[test]
    fn incomplete_sequence_is_left_for_next_pass() {
        let (kept, s) = run(&[b'a', IAC, SB]);
        assert_eq!(kept, b"a");
        assert_eq!(s.processed, 1);

        let (kept, s) = run(&[b'a', IAC]);
        assert_eq!(kept, b"a");
        assert_eq!(s.processed, 1);

        let (kept, s) = run(&[IAC, SB, OPT_NAWS, 0, 80]);
        assert_eq!(kept, b"");
        assert_eq!(s.processed, 0);
    }

    #[test]
    fn kept_bytes_end_at_processed_offset() {
        // Two data bytes survive a five-byte prefix of control noise.
        let mut buf = vec![IAC, NOP, b'h', b'i', IAC, WILL, OPT_ECHO, IAC];
        let s = scrub(&mut buf);
        assert_eq!(s.processed, 7);
        assert_eq!(s.kept, 2);
        assert_eq!(&buf[s.removed()..s.processed], b"hi");
    }
}
