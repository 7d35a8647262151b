//! Chunk-framing codec for the streaming endpoints.
//!
//! The message server delivers a byte stream composed of consecutive frames:
//!
//! ```text
//! [varint header][body: header bytes]
//! ```
//!
//! The header is a variable-length unsigned integer in little-endian 7-bit
//! groups; bit 7 of each header byte signals that another header byte
//! follows. The body is exactly that many bytes and is handed to the record
//! codec ([`crate::protocol::FrameCodec`]) untouched.
//!
//! [`ChunkDecoder`] is an incremental, resumable parser: bytes arrive in
//! arbitrary slices via [`ChunkDecoder::push`], and [`ChunkDecoder::read`]
//! extracts every frame that is complete so far, leaving a trailing partial
//! frame buffered for the next call. The frame sequence is independent of
//! how the byte stream was split across `push` calls. A header that cannot
//! describe a valid length is a [`FrameError`]; the caller abandons the
//! stream.

use std::fmt;

use bytes::Bytes;

/// The byte stream carried a frame header that cannot describe a valid
/// body length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError(pub String);

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed frame: {}", self.0)
    }
}

impl std::error::Error for FrameError {}

/// Incremental chunk decoder that handles partial reads.
///
/// Feed bytes via [`ChunkDecoder::push`] and extract complete frame bodies
/// with [`ChunkDecoder::read`]. Handles TCP-style byte stream reassembly.
///
/// The decoder does not bound buffered size: a frame whose body never
/// arrives keeps its prefix buffered indefinitely. The polling reader
/// creates a fresh decoder per HTTP request, so a stalled body lives at
/// most as long as its request.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    buf: Vec<u8>,
    cursor: usize,
}

impl ChunkDecoder {
    /// Create a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the internal buffer without decoding.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract all complete frame bodies currently available, in stream order.
    ///
    /// A frame whose header or body is not yet fully buffered leaves the
    /// read position at the frame's start so the same bytes are retried once
    /// more data is pushed. A zero-length body is valid and yields an empty
    /// frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] if a header runs past the length a `usize`
    /// can represent. The decoder cannot resynchronize after that; discard
    /// it along with the stream it was fed from.
    pub fn read(&mut self) -> Result<Vec<Bytes>, FrameError> {
        let mut frames = Vec::new();

        'frames: while self.cursor < self.buf.len() {
            let header_start = self.cursor;

            // Varint header: low 7 bits carry length (LSB group first),
            // bit 7 means another header byte follows.
            let mut body_size: usize = 0;
            let mut shift = 0u32;
            loop {
                let Some(&byte) = self.buf.get(self.cursor) else {
                    // Header truncated mid-sequence, wait for more data.
                    self.cursor = header_start;
                    break 'frames;
                };
                if shift >= usize::BITS {
                    return Err(FrameError(format!(
                        "header exceeds {} bytes",
                        usize::BITS.div_ceil(7)
                    )));
                }
                self.cursor += 1;
                body_size |= usize::from(byte & 0x7f) << shift;
                shift += 7;
                if byte & 0x80 == 0 {
                    break;
                }
            }

            let body_start = self.cursor;
            let Some(body_end) = body_start.checked_add(body_size) else {
                return Err(FrameError("body length overflows usize".into()));
            };
            if body_end > self.buf.len() {
                // Incomplete body, wait for more data.
                self.cursor = header_start;
                break;
            }

            frames.push(Bytes::copy_from_slice(&self.buf[body_start..body_end]));
            self.cursor = body_end;
        }

        // Compact consumed bytes so the buffer only holds the partial frame.
        if self.cursor > 0 {
            self.buf.drain(..self.cursor);
            self.cursor = 0;
        }

        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// Encode a frame body into wire format: `[varint header][body]`.
pub fn encode_chunk(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 2);
    let mut remaining = body.len();
    loop {
        let group = (remaining & 0x7f) as u8;
        remaining >>= 7;
        if remaining == 0 {
            out.push(group);
            break;
        }
        out.push(group | 0x80);
    }
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_frames_single_push() {
        // Header 0x02 -> body "AB", header 0x03 -> body "CDE".
        let mut decoder = ChunkDecoder::new();
        decoder.push(&[0x02, 0x41, 0x42, 0x03, 0x43, 0x44, 0x45]);
        let frames = decoder.read().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], b"AB");
        assert_eq!(&frames[1][..], b"CDE");
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_round_trip() {
        let mut decoder = ChunkDecoder::new();
        decoder.push(&encode_chunk(b"hello"));
        decoder.push(&encode_chunk(b""));
        decoder.push(&encode_chunk(b"world"));
        let frames = decoder.read().unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"hello");
        assert_eq!(&frames[1][..], b"");
        assert_eq!(&frames[2][..], b"world");
    }

    #[test]
    fn test_zero_length_body() {
        let mut decoder = ChunkDecoder::new();
        decoder.push(&[0x00]);
        let frames = decoder.read().unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_empty());
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_multibyte_headers() {
        // N header bytes whose value needs exactly N*7 bits, N in 1..=4.
        for n in 1u32..=4 {
            let size = (1usize << (n * 7)) - 1;
            let encoded = encode_chunk(&vec![0xaa; size]);
            assert_eq!(encoded.len(), n as usize + size);

            let mut decoder = ChunkDecoder::new();
            decoder.push(&encoded);
            let frames = decoder.read().unwrap();
            assert_eq!(frames.len(), 1, "n = {n}");
            assert_eq!(frames[0].len(), size, "n = {n}");
        }
    }

    #[test]
    fn test_overlong_header_rejected() {
        // Twelve continuation bytes push the accumulated shift past what a
        // usize length can hold; the decoder reports a malformed frame
        // instead of panicking.
        let mut decoder = ChunkDecoder::new();
        decoder.push(&[0x80; 12]);
        decoder.push(&[0x01]);
        assert!(decoder.read().is_err());
    }

    #[test]
    fn test_maximal_header_is_incomplete_not_malformed() {
        // Ten header bytes still describe a representable length; the body
        // just has not arrived yet.
        let mut decoder = ChunkDecoder::new();
        decoder.push(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x01]);
        assert!(decoder.read().unwrap().is_empty());
        assert!(decoder.has_partial());
    }

    #[test]
    fn test_partial_body_leaves_cursor_unchanged() {
        let mut decoder = ChunkDecoder::new();
        decoder.push(&[0x03, 0x41]);
        assert!(decoder.read().unwrap().is_empty());
        assert!(decoder.has_partial());

        // Completing the body yields the full frame, nothing dropped.
        decoder.push(&[0x42, 0x43]);
        let frames = decoder.read().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"ABC");
    }

    #[test]
    fn test_partial_multibyte_header() {
        // 0x80 says "more header bytes follow" but none are buffered yet.
        let mut decoder = ChunkDecoder::new();
        decoder.push(&[0x80]);
        assert!(decoder.read().unwrap().is_empty());
        assert!(decoder.has_partial());

        // 0x80 0x01 = 128-byte body.
        decoder.push(&[0x01]);
        assert!(decoder.read().unwrap().is_empty());
        decoder.push(&[0x55; 128]);
        let frames = decoder.read().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 128);
    }

    #[test]
    fn test_chunk_boundary_independence() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_chunk(b"first"));
        wire.extend_from_slice(&encode_chunk(b""));
        wire.extend_from_slice(&encode_chunk(&[0x00, 0xff, 0x7f]));
        wire.extend_from_slice(&encode_chunk(&vec![0x42; 200]));

        let mut reference = ChunkDecoder::new();
        reference.push(&wire);
        let expected = reference.read().unwrap();
        assert_eq!(expected.len(), 4);

        // Splitting the stream at every position must produce the same frames.
        for split in 0..=wire.len() {
            let mut decoder = ChunkDecoder::new();
            let mut frames = Vec::new();
            decoder.push(&wire[..split]);
            frames.extend(decoder.read().unwrap());
            decoder.push(&wire[split..]);
            frames.extend(decoder.read().unwrap());
            assert_eq!(frames, expected, "split at {split}");
            assert!(!decoder.has_partial());
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let wire = encode_chunk(b"streamed");
        let mut decoder = ChunkDecoder::new();
        for (i, byte) in wire.iter().enumerate() {
            let frames = decoder.read_after_push(&[*byte]);
            if i < wire.len() - 1 {
                assert!(frames.is_empty());
            } else {
                assert_eq!(frames.len(), 1);
                assert_eq!(&frames[0][..], b"streamed");
            }
        }
    }

    #[test]
    fn test_consumed_prefix_is_compacted() {
        let mut decoder = ChunkDecoder::new();
        decoder.push(&encode_chunk(b"done"));
        decoder.push(&[0x05, 0x61]);
        let frames = decoder.read().unwrap();
        assert_eq!(frames.len(), 1);
        // Only the partial frame remains buffered.
        assert!(decoder.has_partial());
        assert_eq!(decoder.buf.len(), 2);
    }

    impl ChunkDecoder {
        fn read_after_push(&mut self, bytes: &[u8]) -> Vec<Bytes> {
            self.push(bytes);
            self.read().unwrap()
        }
    }
}
