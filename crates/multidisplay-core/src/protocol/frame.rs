//! Frame encoding/decoding
//!
//! Frame format:
//! - 1 byte: start delimiter (0xAA)
//! - 2 bytes: payload length (big-endian)
//! - N bytes: payload (first byte is the record opcode)
//! - 4 bytes: CRC32 of the payload only (big-endian)
//! - 1 byte: end delimiter (0x55)
//!
//! The receive side is incremental: bytes may arrive in chunks of any size,
//! frames may span several reads, and noise between frames is skipped.

use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;
use serde::Serialize;
use tracing::{trace, warn};

use super::{
    Command, FrameError, ProtocolError, DEFAULT_RECEIVE_BUFFER_LIMIT, END_BYTE, FRAME_OVERHEAD,
    MAX_PAYLOAD_SIZE, START_BYTE,
};

/// A validated frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame payload (opcode + body)
    pub payload: Vec<u8>,
    /// CRC32 received with the payload
    pub crc: u32,
}

impl Frame {
    /// Record opcode (first payload byte)
    pub fn opcode(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Payload length as declared on the wire
    pub fn declared_len(&self) -> usize {
        self.payload.len()
    }

    /// Total encoded size including framing
    pub fn encoded_size(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }
}

/// Framing diagnostics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FramingStats {
    /// Frames emitted
    pub frames: u64,
    /// Frames dropped because of a CRC mismatch
    pub crc_errors: u64,
    /// Start delimiters followed by an implausible length
    pub length_errors: u64,
    /// Frames without a valid end delimiter
    pub delimiter_errors: u64,
    /// Bytes thrown away while scanning for a start delimiter
    pub discarded_bytes: u64,
}

impl FramingStats {
    /// Total number of recoverable framing errors
    pub fn errors(&self) -> u64 {
        self.crc_errors + self.length_errors + self.delimiter_errors
    }
}

/// Encode a payload into a complete frame
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.is_empty() || payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }

    let mut bytes = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    bytes.push(START_BYTE);

    let mut len_bytes = [0u8; 2];
    BigEndian::write_u16(&mut len_bytes, payload.len() as u16);
    bytes.extend_from_slice(&len_bytes);

    bytes.extend_from_slice(payload);

    let mut crc_bytes = [0u8; 4];
    BigEndian::write_u32(&mut crc_bytes, crc32(payload));
    bytes.extend_from_slice(&crc_bytes);

    bytes.push(END_BYTE);
    Ok(bytes)
}

/// Validate a command and encode it into a complete frame
pub fn encode_command(command: &Command) -> Result<Vec<u8>, ProtocolError> {
    command.validate()?;
    encode_frame(&command.payload())
}

fn crc32(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

enum Parse {
    /// Not enough bytes buffered yet
    Incomplete,
    /// A valid frame and the number of bytes it occupied
    Complete(Frame, usize),
    /// The start delimiter at this position does not begin a valid frame
    Invalid(FrameError),
}

/// Incremental frame decoder with a single growable receive buffer
pub struct FrameCodec {
    buffer: Vec<u8>,
    limit: usize,
    stats: FramingStats,
}

impl FrameCodec {
    /// Create a codec with the default receive buffer limit
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_RECEIVE_BUFFER_LIMIT)
    }

    /// Create a codec that refuses to buffer more than `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            stats: FramingStats::default(),
        }
    }

    /// Framing diagnostics since creation or the last [`reset`](Self::reset)
    pub fn stats(&self) -> FramingStats {
        self.stats
    }

    /// Number of bytes held back waiting for the rest of a frame
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame and clear diagnostics
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.stats = FramingStats::default();
    }

    /// Consume a chunk of received bytes and return every complete frame.
    ///
    /// Partial trailing bytes are kept for the next call. Malformed frames are
    /// dropped and counted; the only error is running out of buffer space.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        let buffered = self.buffer.len() + data.len();
        if buffered > self.limit {
            return Err(ProtocolError::BufferExhausted {
                buffered,
                limit: self.limit,
            });
        }
        self.buffer
            .try_reserve(data.len())
            .map_err(|_| ProtocolError::BufferExhausted {
                buffered,
                limit: self.limit,
            })?;
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        let mut pos = 0;

        loop {
            let Some(start) = self.find_start(pos) else {
                pos = self.buffer.len();
                break;
            };
            pos = start;

            match self.parse_at(pos) {
                Parse::Incomplete => break,
                Parse::Complete(frame, consumed) => {
                    self.stats.frames += 1;
                    frames.push(frame);
                    pos += consumed;
                }
                Parse::Invalid(err) => {
                    self.record_error(&err);
                    pos += 1;
                }
            }
        }

        self.buffer.drain(..pos);
        Ok(frames)
    }

    /// Flush at end of stream.
    ///
    /// A start delimiter that never got the rest of its frame is skipped so
    /// frames behind a bogus length are still recovered. Returns the recovered
    /// frames and how many trailing bytes had to be thrown away.
    pub fn finish(&mut self) -> (Vec<Frame>, usize) {
        let mut frames = Vec::new();
        let mut discarded = 0;
        let mut pos = 0;

        loop {
            let Some(start) = self.find_start(pos) else {
                discarded += self.buffer.len() - pos;
                break;
            };
            discarded += start - pos;
            pos = start;

            match self.parse_at(pos) {
                Parse::Complete(frame, consumed) => {
                    self.stats.frames += 1;
                    frames.push(frame);
                    pos += consumed;
                }
                Parse::Invalid(err) => {
                    self.record_error(&err);
                    discarded += 1;
                    pos += 1;
                }
                Parse::Incomplete => {
                    discarded += 1;
                    pos += 1;
                }
            }
        }

        self.buffer.clear();
        (frames, discarded)
    }

    /// Position of the next start delimiter at or after `from`
    fn find_start(&mut self, from: usize) -> Option<usize> {
        match self.buffer[from..].iter().position(|&b| b == START_BYTE) {
            Some(skip) => {
                if skip > 0 {
                    trace!(skipped = skip, "Skipping noise before start delimiter");
                    self.stats.discarded_bytes += skip as u64;
                }
                Some(from + skip)
            }
            None => {
                self.stats.discarded_bytes += (self.buffer.len() - from) as u64;
                None
            }
        }
    }

    fn parse_at(&self, pos: usize) -> Parse {
        let available = self.buffer.len() - pos;
        if available < 3 {
            return Parse::Incomplete;
        }

        let length = BigEndian::read_u16(&self.buffer[pos + 1..pos + 3]) as usize;
        if length == 0 || length > MAX_PAYLOAD_SIZE {
            return Parse::Invalid(FrameError::BadLength(length));
        }

        let total = FRAME_OVERHEAD + length;
        if available < total {
            return Parse::Incomplete;
        }

        let payload = &self.buffer[pos + 3..pos + 3 + length];
        let received_crc = BigEndian::read_u32(&self.buffer[pos + 3 + length..pos + 7 + length]);
        let end = self.buffer[pos + total - 1];

        let expected_crc = crc32(payload);
        if received_crc != expected_crc {
            return Parse::Invalid(FrameError::CrcMismatch {
                expected: expected_crc,
                actual: received_crc,
            });
        }

        if end != END_BYTE {
            return Parse::Invalid(FrameError::BadEndDelimiter(end));
        }

        Parse::Complete(
            Frame {
                payload: payload.to_vec(),
                crc: received_crc,
            },
            total,
        )
    }

    fn record_error(&mut self, err: &FrameError) {
        match err {
            FrameError::CrcMismatch { .. } => self.stats.crc_errors += 1,
            FrameError::BadLength(_) => self.stats.length_errors += 1,
            FrameError::BadEndDelimiter(_) => self.stats.delimiter_errors += 1,
        }
        warn!("Framing error, resynchronizing: {}", err);
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let encoded = encode_frame(&[0x02, 0x21]).unwrap();
        assert_eq!(encoded.len(), FRAME_OVERHEAD + 2);
        assert_eq!(encoded[0], START_BYTE);
        assert_eq!(*encoded.last().unwrap(), END_BYTE);

        let mut codec = FrameCodec::new();
        let frames = codec.feed(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, vec![0x02, 0x21]);
        assert_eq!(codec.pending_len(), 0);
    }

    #[test]
    fn test_split_read() {
        let encoded = encode_frame(&[0x02, 0x21, 0x22]).unwrap();
        let mut codec = FrameCodec::new();

        assert!(codec.feed(&encoded[..4]).unwrap().is_empty());
        assert_eq!(codec.pending_len(), 4);
        let frames = codec.feed(&encoded[4..]).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_leading_noise_is_skipped() {
        let mut stream = vec![0x00, 0x13, 0x37];
        stream.extend(encode_frame(&[0x02, 0x10]).unwrap());

        let mut codec = FrameCodec::new();
        let frames = codec.feed(&stream).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(codec.stats().discarded_bytes, 3);
        assert_eq!(codec.stats().errors(), 0);
    }

    #[test]
    fn test_crc_mismatch_resyncs() {
        let mut bad = encode_frame(&[0x02, 0x10]).unwrap();
        bad[4] ^= 0xFF; // corrupt the payload body
        let good = encode_frame(&[0x02, 0x11]).unwrap();

        let mut stream = bad;
        stream.extend(&good);

        let mut codec = FrameCodec::new();
        let frames = codec.feed(&stream).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, vec![0x02, 0x11]);
        assert_eq!(codec.stats().crc_errors, 1);
    }

    #[test]
    fn test_oversized_length_resyncs() {
        let mut stream = vec![START_BYTE, 0xFF, 0xFF];
        stream.extend(encode_frame(&[0x02, 0x12]).unwrap());

        let mut codec = FrameCodec::new();
        let frames = codec.feed(&stream).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(codec.stats().length_errors, 1);
    }

    #[test]
    fn test_buffer_limit_is_fatal() {
        let mut codec = FrameCodec::with_limit(16);
        let result = codec.feed(&[0u8; 32]);
        assert!(matches!(
            result,
            Err(ProtocolError::BufferExhausted { buffered: 32, limit: 16 })
        ));
    }

    #[test]
    fn test_finish_recovers_frame_behind_bogus_length() {
        // A stray start delimiter declaring 0x0100 bytes swallows the real frame
        let mut stream = vec![START_BYTE, 0x01, 0x00];
        stream.extend(encode_frame(&[0x02, 0x13]).unwrap());

        let mut codec = FrameCodec::new();
        assert!(codec.feed(&stream).unwrap().is_empty());

        let (frames, discarded) = codec.finish();
        assert_eq!(frames.len(), 1);
        assert_eq!(discarded, 3);
        assert_eq!(codec.pending_len(), 0);
    }

    #[test]
    fn test_encode_command() {
        let encoded = encode_command(&Command::RequestSettings { channel: 2 }).unwrap();
        assert_eq!(&encoded[..5], &[START_BYTE, 0x00, 0x02, 0x24, 0x02]);
        assert_eq!(encoded.len(), FRAME_OVERHEAD + 2);
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(encode_frame(&[]).is_err());
        assert!(encode_frame(&vec![0u8; MAX_PAYLOAD_SIZE + 1]).is_err());
    }
}
