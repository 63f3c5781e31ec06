//! gRPC message framing.
//!
//! gRPC messages are length-prefixed with the following format:
//! - 1 byte: compressed flag (0 = uncompressed, 1 = compressed)
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: message payload

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the gRPC message header (1 byte flag + 4 bytes length).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Encode a payload into gRPC wire format with the given compression flag.
pub fn encode_frame(payload: &[u8], compressed: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u8(if compressed { 1 } else { 0 });
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// A complete length-prefixed message extracted from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    /// Compression flag from the frame header.
    pub compressed: bool,
    /// Message payload (may be empty).
    pub payload: Bytes,
}

impl FramedMessage {
    /// Declared length of the message body.
    pub fn message_length(&self) -> usize {
        self.payload.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for the compression-flag byte of the next frame.
    NoData,
    /// Accumulating the 4-byte big-endian length.
    ReadingSize,
    /// Accumulating the message body.
    ReadingMessage,
}

/// Incremental decoder turning arbitrary byte chunks into framed messages.
///
/// Partial headers and partial payloads are buffered across chunk
/// boundaries. No size limit is applied here; callers compare each frame's
/// declared length against their receive limit before accepting it.
#[derive(Debug)]
pub struct StreamDecoder {
    state: DecodeState,
    compressed: bool,
    size_bytes: [u8; 4],
    size_filled: usize,
    message_length: usize,
    partial: BytesMut,
}

impl StreamDecoder {
    /// Create a new decoder.
    pub fn new() -> Self {
        Self {
            state: DecodeState::NoData,
            compressed: false,
            size_bytes: [0; 4],
            size_filled: 0,
            message_length: 0,
            partial: BytesMut::new(),
        }
    }

    /// Feed a chunk and collect every complete frame it liberates, in order.
    pub fn write(&mut self, chunk: &[u8]) -> Vec<FramedMessage> {
        let mut messages = Vec::new();
        let mut offset = 0;

        while offset < chunk.len() {
            match self.state {
                DecodeState::NoData => {
                    self.compressed = chunk[offset] != 0;
                    offset += 1;
                    self.size_filled = 0;
                    self.state = DecodeState::ReadingSize;
                }
                DecodeState::ReadingSize => {
                    let take = (4 - self.size_filled).min(chunk.len() - offset);
                    self.size_bytes[self.size_filled..self.size_filled + take]
                        .copy_from_slice(&chunk[offset..offset + take]);
                    self.size_filled += take;
                    offset += take;

                    if self.size_filled == 4 {
                        self.message_length = u32::from_be_bytes(self.size_bytes) as usize;
                        if self.message_length == 0 {
                            messages.push(FramedMessage {
                                compressed: self.compressed,
                                payload: Bytes::new(),
                            });
                            self.state = DecodeState::NoData;
                        } else {
                            self.partial = BytesMut::with_capacity(self.message_length);
                            self.state = DecodeState::ReadingMessage;
                        }
                    }
                }
                DecodeState::ReadingMessage => {
                    let need = self.message_length - self.partial.len();
                    let take = need.min(chunk.len() - offset);
                    self.partial.extend_from_slice(&chunk[offset..offset + take]);
                    offset += take;

                    if self.partial.len() == self.message_length {
                        messages.push(FramedMessage {
                            compressed: self.compressed,
                            payload: self.partial.split().freeze(),
                        });
                        self.state = DecodeState::NoData;
                    }
                }
            }
        }

        messages
    }

    /// Check if the decoder is mid-frame.
    pub fn has_partial_frame(&self) -> bool {
        self.state != DecodeState::NoData
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_empty_frame() {
        let encoded = encode_frame(&[], false);
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE);
        assert_eq!(encoded[0], 0);
        assert_eq!(&encoded[1..5], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_frame() {
        let data = b"hello world";
        let encoded = encode_frame(data, false);

        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + data.len());
        assert_eq!(encoded[0], 0);
        assert_eq!(
            u32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]),
            data.len() as u32
        );
        assert_eq!(&encoded[FRAME_HEADER_SIZE..], data);
    }

    #[test]
    fn test_encode_compressed_flag() {
        let encoded = encode_frame(b"test", true);
        assert_eq!(encoded[0], 1);
    }

    #[test]
    fn test_decode_complete_frame() {
        let mut decoder = StreamDecoder::new();
        let messages = decoder.write(&encode_frame(b"hello", false));

        assert_eq!(messages.len(), 1);
        assert!(!messages[0].compressed);
        assert_eq!(&messages[0].payload[..], b"hello");
        assert!(!decoder.has_partial_frame());
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let mut decoder = StreamDecoder::new();
        let encoded = encode_frame(b"fragmented", true);

        let mut messages = Vec::new();
        for byte in &encoded[..] {
            messages.extend(decoder.write(&[*byte]));
        }

        assert_eq!(messages.len(), 1);
        assert!(messages[0].compressed);
        assert_eq!(&messages[0].payload[..], b"fragmented");
    }

    #[test]
    fn test_decode_split_inside_length_prefix() {
        let mut decoder = StreamDecoder::new();
        let encoded = encode_frame(b"abc", false);

        assert!(decoder.write(&encoded[..3]).is_empty());
        assert!(decoder.has_partial_frame());
        let messages = decoder.write(&encoded[3..]);
        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0].payload[..], b"abc");
    }

    #[test]
    fn test_decode_multiple_frames_one_chunk() {
        let mut chunk = BytesMut::new();
        chunk.extend_from_slice(&encode_frame(b"first", false));
        chunk.extend_from_slice(&encode_frame(b"second", false));
        chunk.extend_from_slice(&encode_frame(b"third", false));

        let mut decoder = StreamDecoder::new();
        let messages = decoder.write(&chunk);

        assert_eq!(messages.len(), 3);
        assert_eq!(&messages[0].payload[..], b"first");
        assert_eq!(&messages[1].payload[..], b"second");
        assert_eq!(&messages[2].payload[..], b"third");
    }

    #[test]
    fn test_decode_zero_length_message() {
        let mut decoder = StreamDecoder::new();
        let messages = decoder.write(&encode_frame(&[], false));

        assert_eq!(messages.len(), 1);
        assert!(messages[0].payload.is_empty());
        assert!(!decoder.has_partial_frame());
    }

    #[test]
    fn test_decode_zero_length_then_more() {
        let mut chunk = BytesMut::new();
        chunk.extend_from_slice(&encode_frame(&[], false));
        chunk.extend_from_slice(&encode_frame(b"after", false));

        let mut decoder = StreamDecoder::new();
        let messages = decoder.write(&chunk);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].payload.is_empty());
        assert_eq!(&messages[1].payload[..], b"after");
    }

    #[test]
    fn test_decode_frame_split_across_three_chunks() {
        let payload = vec![0xabu8; 100];
        let encoded = encode_frame(&payload, false);

        let mut decoder = StreamDecoder::new();
        assert!(decoder.write(&encoded[..2]).is_empty());
        assert!(decoder.write(&encoded[2..50]).is_empty());
        let messages = decoder.write(&encoded[50..]);

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_length(), 100);
        assert_eq!(&messages[0].payload[..], &payload[..]);
    }

    #[test]
    fn test_decoder_reusable_across_frames() {
        let mut decoder = StreamDecoder::new();
        for i in 0..10u8 {
            let payload = vec![i; i as usize + 1];
            let messages = decoder.write(&encode_frame(&payload, i % 2 == 1));
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].compressed, i % 2 == 1);
            assert_eq!(&messages[0].payload[..], &payload[..]);
        }
    }

    #[test]
    fn test_empty_chunk_is_noop() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.write(&[]).is_empty());
        assert!(!decoder.has_partial_frame());
    }
}
