//! Length-prefixed frame codec used by the session output journal.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: magic bytes "SMUX"
//! - 4 bytes: content length (big-endian, includes flags byte)
//! - 1 byte: flags (bit 0 = compressed)
//! - N bytes: payload (possibly LZ4 compressed)
//!
//! Journal files are a plain concatenation of frames. A process that dies
//! mid-append leaves at most one incomplete frame at the tail, which
//! [`FrameCodec::replay`] reports as truncated rather than as corruption.

use crate::error::{ProtocolError, Result};

/// Magic bytes identifying a ShellMux frame.
pub const FRAME_MAGIC: [u8; 4] = *b"SMUX";

/// Compression threshold in bytes. Payloads larger than this are compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Maximum frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size: 4 (magic) + 4 (length) + 1 (flags) = 9 bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Flags indicating frame properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Flag indicating the payload is LZ4 compressed.
    pub const COMPRESSED: u8 = 0b0000_0001;

    #[inline]
    pub fn new() -> Self {
        Self(0)
    }

    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Return a copy with the compressed bit set or cleared.
    #[inline]
    pub fn with_compressed(self, compressed: bool) -> Self {
        if compressed {
            Self(self.0 | Self::COMPRESSED)
        } else {
            Self(self.0 & !Self::COMPRESSED)
        }
    }
}

/// Result of replaying a byte buffer made of concatenated frames.
#[derive(Debug, Default)]
pub struct Replay {
    /// Decoded payloads in file order.
    pub payloads: Vec<Vec<u8>>,
    /// Bytes of input covered by the decoded payloads.
    pub consumed: usize,
    /// The input ended inside a frame.
    pub truncated: bool,
    /// Decoding stopped at a malformed frame.
    pub error: Option<ProtocolError>,
}

impl Replay {
    /// Concatenates all payloads.
    pub fn into_bytes(self) -> Vec<u8> {
        self.payloads.concat()
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

    /// Encode a payload into a single frame.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_FRAME_SIZE - FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() + FRAME_HEADER_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut flags = FrameFlags::new();
        let mut compressed = None;
        if self.compression_enabled && payload.len() > COMPRESSION_THRESHOLD {
            let candidate = lz4_flex::compress_prepend_size(payload);
            // Only keep compression when it actually saves space
            if candidate.len() < payload.len() {
                flags = flags.with_compressed(true);
                compressed = Some(candidate);
            }
        }
        let body = compressed.as_deref().unwrap_or(payload);

        let content_len = 1 + body.len();
        let mut output = Vec::with_capacity(8 + content_len);
        output.extend_from_slice(&FRAME_MAGIC);
        output.extend_from_slice(&(content_len as u32).to_be_bytes());
        output.push(flags.as_byte());
        output.extend_from_slice(body);

        Ok(output)
    }

    /// Decode one frame from the start of `data`.
    ///
    /// Returns `Ok(None)` when `data` holds only part of a frame, otherwise
    /// the payload and the number of bytes consumed.
    pub fn decode(&self, data: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [data[0], data[1], data[2], data[3]];
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::InvalidFrameMagic {
                expected: u32::from_be_bytes(FRAME_MAGIC),
                got: u32::from_be_bytes(magic),
            });
        }

        let content_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if 8 + content_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: 8 + content_len,
                max: MAX_FRAME_SIZE,
            });
        }
        if content_len < 1 {
            return Err(ProtocolError::Deserialization(
                "frame content length must cover the flags byte".to_string(),
            ));
        }
        if data.len() < 8 + content_len {
            return Ok(None);
        }

        let flags = FrameFlags::from_byte(data[8]);
        let body = &data[FRAME_HEADER_SIZE..8 + content_len];
        let payload = if flags.is_compressed() {
            lz4_flex::decompress_size_prepended(body)?
        } else {
            body.to_vec()
        };

        Ok(Some((payload, 8 + content_len)))
    }

    /// Decode every complete frame in `data`.
    ///
    /// Never fails: a malformed frame ends the replay and is reported in
    /// [`Replay::error`], a partial trailing frame sets [`Replay::truncated`].
    pub fn replay(&self, data: &[u8]) -> Replay {
        let mut replay = Replay::default();

        while replay.consumed < data.len() {
            match self.decode(&data[replay.consumed..]) {
                Ok(Some((payload, used))) => {
                    replay.payloads.push(payload);
                    replay.consumed += used;
                }
                Ok(None) => {
                    replay.truncated = true;
                    break;
                }
                Err(e) => {
                    replay.error = Some(e);
                    break;
                }
            }
        }

        replay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_flags_default() {
        let flags = FrameFlags::new();
        assert_eq!(flags.as_byte(), 0);
        assert!(!flags.is_compressed());
    }

    #[test]
    fn test_frame_flags_toggle() {
        let flags = FrameFlags::new().with_compressed(true);
        assert!(flags.is_compressed());
        assert_eq!(flags.as_byte(), 0b0000_0001);
        assert!(!flags.with_compressed(false).is_compressed());
        assert!(!FrameFlags::from_byte(0b1111_1110).is_compressed());
    }

    #[test]
    fn test_encode_layout() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(b"hi").unwrap();

        assert_eq!(&encoded[0..4], b"SMUX");
        assert_eq!(&encoded[4..8], &3u32.to_be_bytes());
        assert_eq!(encoded[8], 0);
        assert_eq!(&encoded[9..], b"hi");
    }

    #[test]
    fn test_large_repetitive_payload_is_compressed() {
        let codec = FrameCodec::new();
        let payload = b"$ ls -la\n".repeat(1000);

        let encoded = codec.encode(&payload).unwrap();
        assert!(encoded.len() < payload.len());
        assert!(FrameFlags::from_byte(encoded[8]).is_compressed());

        let (decoded, used) = codec.decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(used, encoded.len());
    }

    #[test]
    fn test_without_compression_keeps_raw_payload() {
        let codec = FrameCodec::without_compression();
        let payload = vec![b'x'; 4096];

        let encoded = codec.encode(&payload).unwrap();
        assert!(!FrameFlags::from_byte(encoded[8]).is_compressed());
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + payload.len());
    }

    #[test]
    fn test_decode_partial_header_returns_none() {
        let codec = FrameCodec::new();
        assert!(codec.decode(b"SMU").unwrap().is_none());
    }

    #[test]
    fn test_decode_bad_magic() {
        let codec = FrameCodec::new();
        let mut encoded = codec.encode(b"data").unwrap();
        encoded[0] = b'X';

        let result = codec.decode(&encoded);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidFrameMagic { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let codec = FrameCodec::new();
        let mut data = FRAME_MAGIC.to_vec();
        data.extend_from_slice(&(MAX_FRAME_SIZE as u32).to_be_bytes());
        data.push(0);

        assert!(matches!(
            codec.decode(&data),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_replay_concatenated_frames() {
        let codec = FrameCodec::new();
        let mut journal = Vec::new();
        journal.extend(codec.encode(b"first ").unwrap());
        journal.extend(codec.encode(b"second ").unwrap());
        journal.extend(codec.encode(&b"third".repeat(500)).unwrap());

        let replay = codec.replay(&journal);
        assert_eq!(replay.payloads.len(), 3);
        assert_eq!(replay.consumed, journal.len());
        assert!(!replay.truncated);
        assert!(replay.error.is_none());

        let mut expected = b"first second ".to_vec();
        expected.extend(b"third".repeat(500));
        assert_eq!(replay.into_bytes(), expected);
    }

    #[test]
    fn test_replay_tolerates_truncated_tail() {
        let codec = FrameCodec::new();
        let mut journal = codec.encode(b"complete").unwrap();
        let complete_len = journal.len();
        let partial = codec.encode(b"interrupted write").unwrap();
        journal.extend_from_slice(&partial[..partial.len() - 4]);

        let replay = codec.replay(&journal);
        assert!(replay.truncated);
        assert!(replay.error.is_none());
        assert_eq!(replay.consumed, complete_len);
        assert_eq!(replay.into_bytes(), b"complete");
    }

    #[test]
    fn test_replay_stops_at_garbage() {
        let codec = FrameCodec::new();
        let mut journal = codec.encode(b"good").unwrap();
        journal.extend_from_slice(b"garbage that is not a frame");

        let replay = codec.replay(&journal);
        assert_eq!(replay.payloads, vec![b"good".to_vec()]);
        assert!(replay.error.is_some());
    }

    #[test]
    fn test_replay_empty_input() {
        let replay = FrameCodec::new().replay(&[]);
        assert!(replay.payloads.is_empty());
        assert!(!replay.truncated);
        assert!(replay.error.is_none());
    }
}
