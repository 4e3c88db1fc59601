//! Frame codec for length-prefixed framing with optional LZ4 compression.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: magic bytes "ATCH"
//! - 4 bytes: payload length (big-endian, includes flags byte)
//! - 1 byte: flags (bit 0 = compressed)
//! - N bytes: payload (possibly LZ4 compressed)
//!
//! A frame always fits inside a single Noise transport message, so the
//! maximum frame size is bounded by [`MAX_NOISE_MESSAGE_SIZE`] minus the
//! AEAD tag.
//!
//! # Compression
//!
//! Payloads larger than 1KB are compressed with LZ4 when that makes them
//! smaller. Terminal output is highly repetitive, so most large stdout
//! chunks shrink substantially.

use crate::error::{ProtocolError, Result};
use crate::noise::{MAX_NOISE_MESSAGE_SIZE, NOISE_OVERHEAD};

/// Magic bytes identifying an attach frame.
pub const FRAME_MAGIC: [u8; 4] = *b"ATCH";

/// Compression threshold in bytes. Payloads larger than this are compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Maximum encoded frame size.
pub const MAX_FRAME_SIZE: usize = MAX_NOISE_MESSAGE_SIZE - NOISE_OVERHEAD;

/// Frame header size: 4 (magic) + 4 (length) + 1 (flags) = 9 bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Flags indicating frame properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Flag indicating the payload is LZ4 compressed.
    pub const COMPRESSED: u8 = 0b0000_0001;

    /// Create a new empty flags set.
    #[inline]
    pub fn new() -> Self {
        Self(0)
    }

    /// Create flags from a raw byte value.
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value of the flags.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if the compressed flag is set.
    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Return a new flags with compressed set or cleared.
    #[inline]
    pub fn with_compressed(mut self, compressed: bool) -> Self {
        if compressed {
            self.0 |= Self::COMPRESSED;
        } else {
            self.0 &= !Self::COMPRESSED;
        }
        self
    }
}

/// Encoder and decoder for frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    compression_enabled: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with compression enabled.
    pub fn new() -> Self {
        Self {
            compression_enabled: true,
        }
    }

    /// Create a new frame codec with compression disabled.
    pub fn without_compression() -> Self {
        Self {
            compression_enabled: false,
        }
    }

    /// Largest payload that can be encoded uncompressed.
    pub const fn max_payload() -> usize {
        MAX_FRAME_SIZE - FRAME_HEADER_SIZE
    }

    /// Encode a payload into a frame.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let should_compress = self.compression_enabled && payload.len() > COMPRESSION_THRESHOLD;

        let compressed = if should_compress {
            let compressed = lz4_flex::compress_prepend_size(payload);
            (compressed.len() < payload.len()).then_some(compressed)
        } else {
            None
        };

        let (body, flags): (&[u8], FrameFlags) = match &compressed {
            Some(c) => (c, FrameFlags::new().with_compressed(true)),
            None => (payload, FrameFlags::new()),
        };

        let total_size = FRAME_HEADER_SIZE + body.len();
        if total_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total_size,
                max: MAX_FRAME_SIZE,
            });
        }

        let content_len = 1 + body.len();
        let mut output = Vec::with_capacity(total_size);
        output.extend_from_slice(&FRAME_MAGIC);
        output.extend_from_slice(&(content_len as u32).to_be_bytes());
        output.push(flags.as_byte());
        output.extend_from_slice(body);

        Ok(output)
    }

    /// Decode exactly one frame, returning its decompressed payload.
    ///
    /// Trailing bytes after the frame are rejected: every Noise message
    /// carries one frame.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame header: need {} bytes, have {}",
                FRAME_HEADER_SIZE,
                data.len()
            )));
        }

        let magic = [data[0], data[1], data[2], data[3]];
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::InvalidFrameMagic {
                expected: u32::from_be_bytes(FRAME_MAGIC),
                got: u32::from_be_bytes(magic),
            });
        }

        let content_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if content_len < 1 {
            return Err(ProtocolError::Deserialization(
                "invalid frame: content length must be at least 1 for flags byte".to_string(),
            ));
        }

        let total_frame_size = 8 + content_len;
        if total_frame_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total_frame_size,
                max: MAX_FRAME_SIZE,
            });
        }
        if data.len() != total_frame_size {
            return Err(ProtocolError::Deserialization(format!(
                "frame length mismatch: header says {} bytes, have {}",
                total_frame_size,
                data.len()
            )));
        }

        let flags = FrameFlags::from_byte(data[8]);
        let body = &data[FRAME_HEADER_SIZE..];

        if flags.is_compressed() {
            lz4_flex::decompress_size_prepended(body).map_err(|e| {
                ProtocolError::Deserialization(format!("failed to decompress payload: {}", e))
            })
        } else {
            Ok(body.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_flags() {
        let flags = FrameFlags::new();
        assert!(!flags.is_compressed());
        let flags = flags.with_compressed(true);
        assert!(flags.is_compressed());
        assert_eq!(flags.as_byte(), 0b0000_0001);
        assert!(!FrameFlags::from_byte(0b1111_1110).is_compressed());
    }

    #[test]
    fn test_encode_decode_small() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(&encoded[..4], b"ATCH");
        assert_eq!(encoded[8], 0, "small payloads are never compressed");
        assert_eq!(codec.decode(&encoded).unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_encode_decode_empty() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&[]).unwrap();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE);
        assert!(codec.decode(&encoded).unwrap().is_empty());
    }

    #[test]
    fn test_large_repetitive_payload_is_compressed() {
        let codec = FrameCodec::new();
        let payload: Vec<u8> = b"\x1b[32mok\x1b[0m\r\n".repeat(400);
        let encoded = codec.encode(&payload).unwrap();
        assert_eq!(encoded[8] & 0x01, 0x01, "compression flag should be set");
        assert!(encoded.len() < payload.len());
        assert_eq!(codec.decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn test_without_compression() {
        let codec = FrameCodec::without_compression();
        let payload = vec![0u8; 4096];
        let encoded = codec.encode(&payload).unwrap();
        assert_eq!(encoded[8], 0);
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + payload.len());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let codec = FrameCodec::without_compression();
        let payload = vec![7u8; FrameCodec::max_payload() + 1];
        let err = codec.encode(&payload).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_max_payload_fits() {
        let codec = FrameCodec::without_compression();
        let payload = vec![7u8; FrameCodec::max_payload()];
        let encoded = codec.encode(&payload).unwrap();
        assert_eq!(encoded.len(), MAX_FRAME_SIZE);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let codec = FrameCodec::new();
        let mut encoded = codec.encode(b"hello").unwrap();
        encoded[0] = b'X';
        let err = codec.decode(&encoded).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrameMagic { .. }));
    }

    #[test]
    fn test_truncated_and_trailing_rejected() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(b"hello").unwrap();
        assert!(codec.decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(codec.decode(&encoded[..4]).is_err());

        let mut trailing = encoded.clone();
        trailing.push(0);
        assert!(codec.decode(&trailing).is_err());
    }
}
