//! TTY-mode byte transcoding.
//!
//! Output from a process on a pseudo-terminal is rewritten before it enters
//! a stream, and terminal input from the client is rewritten back before it
//! reaches the process. The concrete rule sits behind [`Transcoder`] so it
//! can be swapped; the default escapes ESC as `^[` and a literal caret as
//! `^^`:
//!
//! ```text
//! guest → host   1b 5b 33 32 6d  ("\x1b[32m")  →  5e 5b 5b 33 32 6d  ("^[[32m")
//! host → guest   5e 5e            ("^^")         →  5e                ("^")
//! ```
//!
//! The decoder holds a trailing `^` until the next chunk arrives, so an
//! escape pair split across two reads is reassembled exactly.
//!
//! `decode(encode(x)) == x` holds for every byte sequence. The reverse
//! composition only holds for sequences the encoder can produce: a `^`
//! followed by anything other than `[` or `^` decodes to itself, so
//! `encode(decode(b"^x"))` is `b"^^x"`. A replacement rule has the same
//! obligation, round-tripping arbitrary process output.

/// Caret introducing a two-byte escape.
const CARET: u8 = b'^';

/// Escape control byte.
const ESC: u8 = 0x1b;

/// One direction of a byte rewrite applied chunk by chunk.
pub trait Transcoder: Send {
    /// Rewrites `input`, appending the result to `out`.
    fn transcode(&mut self, input: &[u8], out: &mut Vec<u8>);

    /// Emits any bytes held back at end-of-stream.
    fn flush(&mut self, out: &mut Vec<u8>);
}

/// Guest → host rewrite.
#[derive(Debug, Default, Clone, Copy)]
pub struct EscapeEncoder;

impl Transcoder for EscapeEncoder {
    fn transcode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.reserve(input.len());
        for &byte in input {
            match byte {
                ESC => out.extend_from_slice(b"^["),
                CARET => out.extend_from_slice(b"^^"),
                other => out.push(other),
            }
        }
    }

    fn flush(&mut self, _out: &mut Vec<u8>) {}
}

/// Host → guest rewrite.
#[derive(Debug, Default, Clone, Copy)]
pub struct EscapeDecoder {
    pending_caret: bool,
}

impl Transcoder for EscapeDecoder {
    fn transcode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.reserve(input.len());
        for &byte in input {
            if self.pending_caret {
                self.pending_caret = false;
                match byte {
                    b'[' => out.push(ESC),
                    CARET => out.push(CARET),
                    // Not produced by the encoder; keep it verbatim.
                    other => out.extend_from_slice(&[CARET, other]),
                }
            } else if byte == CARET {
                self.pending_caret = true;
            } else {
                out.push(byte);
            }
        }
    }

    fn flush(&mut self, out: &mut Vec<u8>) {
        if std::mem::take(&mut self.pending_caret) {
            out.push(CARET);
        }
    }
}

/// Identity rewrite for sessions without a terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Transcoder for Passthrough {
    fn transcode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(input);
    }

    fn flush(&mut self, _out: &mut Vec<u8>) {}
}

/// The guest → host transcoder for a session.
pub fn output_transcoder(tty: bool) -> Box<dyn Transcoder> {
    if tty {
        Box::new(EscapeEncoder)
    } else {
        Box::new(Passthrough)
    }
}

/// The host → guest transcoder for a session.
pub fn input_transcoder(tty: bool) -> Box<dyn Transcoder> {
    if tty {
        Box::new(EscapeDecoder::default())
    } else {
        Box::new(Passthrough)
    }
}

/// Encodes a complete buffer.
pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    EscapeEncoder.transcode(input, &mut out);
    out
}

/// Decodes a complete buffer.
pub fn decode(input: &[u8]) -> Vec<u8> {
    let mut decoder = EscapeDecoder::default();
    let mut out = Vec::with_capacity(input.len());
    decoder.transcode(input, &mut out);
    decoder.flush(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_color_sequence_sample() {
        assert_eq!(encode(b"\x1b[32mgreen\x1b[0m"), b"^[[32mgreen^[[0m".to_vec());
        assert_eq!(decode(b"^[[32mgreen^[[0m"), b"\x1b[32mgreen\x1b[0m".to_vec());
    }

    #[test]
    fn test_caret_is_escaped() {
        assert_eq!(encode(b"a^b"), b"a^^b".to_vec());
        assert_eq!(decode(b"a^^b"), b"a^b".to_vec());
    }

    #[test]
    fn test_unknown_escape_passes_through() {
        assert_eq!(decode(b"^x"), b"^x".to_vec());
    }

    #[test]
    fn test_trailing_caret_flushed() {
        assert_eq!(decode(b"end^"), b"end^".to_vec());
    }

    #[test]
    fn test_roundtrip_every_byte_value() {
        let all: Vec<u8> = (0..=255u8).collect();
        assert_eq!(decode(&encode(&all)), all);
    }

    #[test]
    fn test_roundtrip_split_at_every_offset() {
        let input = b"^^\x1b[1;31m^[^\x1b\x1b^".to_vec();
        let encoded = encode(&input);

        for split in 0..=encoded.len() {
            let mut decoder = EscapeDecoder::default();
            let mut out = Vec::new();
            decoder.transcode(&encoded[..split], &mut out);
            decoder.transcode(&encoded[split..], &mut out);
            decoder.flush(&mut out);
            assert_eq!(out, input, "split at {}", split);
        }
    }

    #[test]
    fn test_roundtrip_random_chunks() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let len = rng.gen_range(0..512);
            let input: Vec<u8> = (0..len)
                .map(|_| match rng.gen_range(0..4) {
                    0 => ESC,
                    1 => CARET,
                    2 => b'[',
                    _ => rng.gen(),
                })
                .collect();

            let mut encoder = EscapeEncoder;
            let mut decoder = EscapeDecoder::default();
            let mut wire = Vec::new();
            let mut out = Vec::new();

            for chunk in input.chunks(rng.gen_range(1..32)) {
                wire.clear();
                encoder.transcode(chunk, &mut wire);
                let cut = rng.gen_range(0..=wire.len());
                decoder.transcode(&wire[..cut], &mut out);
                decoder.transcode(&wire[cut..], &mut out);
            }
            decoder.flush(&mut out);
            assert_eq!(out, input);
        }
    }

    #[test]
    fn test_encode_of_decode_is_identity_on_encoded_input() {
        let encoded = encode(b"\x1b]0;title\x07^C");
        assert_eq!(encode(&decode(&encoded)), encoded);
    }

    #[test]
    fn test_encode_of_decode_differs_on_bare_caret() {
        // Not encoder output: the lone caret is passed through, then escaped.
        assert_eq!(decode(b"^x"), b"^x".to_vec());
        assert_eq!(encode(&decode(b"^x")), b"^^x".to_vec());
    }

    #[test]
    fn test_passthrough_for_non_tty() {
        let mut out = Vec::new();
        output_transcoder(false).transcode(b"\x1b^", &mut out);
        assert_eq!(out, b"\x1b^".to_vec());
    }
}
