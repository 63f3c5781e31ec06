//! Per-call message compression.
//!
//! Each call carries a send-direction encoder, a receive-direction decoder,
//! and the accept list advertised to the peer. Supported encodings are
//! `identity`, `gzip`, and `deflate` (zlib).

use crate::frame::{FramedMessage, encode_frame};
use crate::metadata::Metadata;
use crate::status::Status;
use bytes::Bytes;
use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use std::io::{Read, Write};

pub(crate) const GRPC_ENCODING_HEADER: &str = "grpc-encoding";
pub(crate) const GRPC_ACCEPT_ENCODING_HEADER: &str = "grpc-accept-encoding";

/// A message encoding negotiated over `grpc-encoding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
}

impl Encoding {
    /// The wire name of this encoding.
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }

    /// Look up an encoding by wire name.
    pub fn from_name(name: &str) -> Result<Self, Status> {
        match name {
            "identity" => Ok(Encoding::Identity),
            "gzip" => Ok(Encoding::Gzip),
            "deflate" => Ok(Encoding::Deflate),
            _ => Err(Status::unimplemented(format!(
                "Compression method not supported: {}",
                name
            ))),
        }
    }

    fn compress(self, data: &[u8]) -> Result<Vec<u8>, Status> {
        match self {
            Encoding::Identity => Err(Status::internal(
                "Identity encoding does not support compression",
            )),
            Encoding::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(data)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| Status::internal(format!("Compression failed: {}", e)))
            }
            Encoding::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(data)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| Status::internal(format!("Compression failed: {}", e)))
            }
        }
    }

    fn decompress(self, data: &[u8]) -> Result<Vec<u8>, Status> {
        let mut out = Vec::new();
        match self {
            Encoding::Identity => {
                return Err(Status::internal(
                    "Identity encoding does not support compression",
                ));
            }
            Encoding::Gzip => {
                GzDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| Status::internal(format!("Decompression failed: {}", e)))?;
            }
            Encoding::Deflate => {
                ZlibDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| Status::internal(format!("Decompression failed: {}", e)))?;
            }
        }
        Ok(out)
    }
}

/// Send/receive encoding state for one call.
#[derive(Debug, Clone)]
pub struct CompressionFilter {
    send: Encoding,
    receive: Encoding,
    accepted: Vec<Encoding>,
}

impl Default for CompressionFilter {
    fn default() -> Self {
        Self {
            send: Encoding::Identity,
            receive: Encoding::Identity,
            accepted: vec![Encoding::Identity, Encoding::Deflate, Encoding::Gzip],
        }
    }
}

impl CompressionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The encoding applied to outbound messages.
    pub fn send_encoding(&self) -> Encoding {
        self.send
    }

    /// The encoding expected on inbound messages.
    pub fn receive_encoding(&self) -> Encoding {
        self.receive
    }

    /// The accept list advertised in `grpc-accept-encoding`.
    pub fn accept_list(&self) -> String {
        let names: Vec<&str> = self.accepted.iter().map(|e| e.name()).collect();
        names.join(",")
    }

    /// Apply the compression headers of an incoming request: install the
    /// named inbound decoder, adopt the peer's accept list, align the send
    /// encoding to the inbound one when the peer accepts it (identity
    /// otherwise), and strip both headers from the metadata.
    pub fn receive_metadata(&mut self, metadata: &mut Metadata) -> Result<(), Status> {
        if let Some(name) = metadata.get_text(GRPC_ENCODING_HEADER) {
            if name != self.receive.name() {
                self.receive = Encoding::from_name(name)?;
            }
        }
        if let Some(list) = metadata.get_text(GRPC_ACCEPT_ENCODING_HEADER) {
            self.accepted = list
                .split(',')
                .filter_map(|name| Encoding::from_name(name.trim()).ok())
                .collect();
        }
        self.send = if self.accepted.contains(&self.receive) {
            self.receive
        } else {
            Encoding::Identity
        };
        metadata.remove(GRPC_ENCODING_HEADER);
        metadata.remove(GRPC_ACCEPT_ENCODING_HEADER);
        Ok(())
    }

    /// Encode an outbound message and prepend the 5-byte frame header. The
    /// flag byte is 1 only when a non-identity encoder actually ran.
    pub fn write_message(&self, payload: &[u8], compress: bool) -> Result<Bytes, Status> {
        if compress && self.send != Encoding::Identity {
            let compressed = self.send.compress(payload)?;
            Ok(encode_frame(&compressed, true))
        } else {
            Ok(encode_frame(payload, false))
        }
    }

    /// Recover the message bytes from an inbound frame, decompressing when
    /// the flag byte is set. Identity with the flag set is a protocol error.
    pub fn read_message(&self, frame: &FramedMessage) -> Result<Bytes, Status> {
        if frame.compressed {
            let decompressed = self.receive.decompress(&frame.payload)?;
            Ok(Bytes::from(decompressed))
        } else {
            Ok(frame.payload.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::StreamDecoder;
    use crate::status::Code;

    fn filter_with(send: Encoding, receive: Encoding) -> CompressionFilter {
        CompressionFilter {
            send,
            receive,
            ..CompressionFilter::default()
        }
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!(Encoding::Identity.name(), "identity");
        assert_eq!(Encoding::Gzip.name(), "gzip");
        assert_eq!(Encoding::Deflate.name(), "deflate");
    }

    #[test]
    fn test_encoding_from_name() {
        assert_eq!(Encoding::from_name("gzip").unwrap(), Encoding::Gzip);
        assert_eq!(Encoding::from_name("deflate").unwrap(), Encoding::Deflate);
        assert_eq!(Encoding::from_name("identity").unwrap(), Encoding::Identity);
    }

    #[test]
    fn test_encoding_unknown_name() {
        let err = Encoding::from_name("br").unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[test]
    fn test_identity_write_flag_always_zero() {
        let filter = CompressionFilter::new();
        let framed = filter.write_message(b"payload", true).unwrap();
        assert_eq!(framed[0], 0);
    }

    #[test]
    fn test_identity_read_with_flag_is_error() {
        let filter = CompressionFilter::new();
        let frame = FramedMessage {
            compressed: true,
            payload: Bytes::from_static(b"data"),
        };
        let err = filter.read_message(&frame).unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(err.details(), "Identity encoding does not support compression");
    }

    #[test]
    fn test_roundtrip_all_encodings() {
        let message = b"a message that should survive the round trip".as_slice();
        for encoding in [Encoding::Identity, Encoding::Gzip, Encoding::Deflate] {
            let filter = filter_with(encoding, encoding);

            let framed = filter.write_message(message, true).unwrap();
            let expected_flag = u8::from(encoding != Encoding::Identity);
            assert_eq!(framed[0], expected_flag, "flag for {}", encoding.name());

            let mut decoder = StreamDecoder::new();
            let frames = decoder.write(&framed);
            assert_eq!(frames.len(), 1);
            assert_eq!(&filter.read_message(&frames[0]).unwrap()[..], message);
        }
    }

    #[test]
    fn test_roundtrip_uncompressed_flag_zero() {
        for encoding in [Encoding::Identity, Encoding::Gzip, Encoding::Deflate] {
            let filter = filter_with(encoding, encoding);
            let framed = filter.write_message(b"plain", false).unwrap();
            assert_eq!(framed[0], 0);

            let mut decoder = StreamDecoder::new();
            let frames = decoder.write(&framed);
            assert_eq!(&filter.read_message(&frames[0]).unwrap()[..], b"plain");
        }
    }

    #[test]
    fn test_gzip_actually_compresses() {
        let filter = filter_with(Encoding::Gzip, Encoding::Identity);
        let payload = vec![b'a'; 4096];
        let framed = filter.write_message(&payload, true).unwrap();
        assert!(framed.len() < payload.len());
    }

    #[test]
    fn test_receive_metadata_installs_decoder() {
        let mut filter = CompressionFilter::new();
        let mut md = Metadata::new();
        md.add(GRPC_ENCODING_HEADER, "gzip").unwrap();

        filter.receive_metadata(&mut md).unwrap();
        assert_eq!(filter.receive_encoding(), Encoding::Gzip);
        assert!(!md.contains_key(GRPC_ENCODING_HEADER));
    }

    #[test]
    fn test_receive_metadata_aligns_send_to_inbound() {
        let mut filter = CompressionFilter::new();
        let mut md = Metadata::new();
        md.add(GRPC_ENCODING_HEADER, "deflate").unwrap();

        filter.receive_metadata(&mut md).unwrap();
        assert_eq!(filter.send_encoding(), Encoding::Deflate);
    }

    #[test]
    fn test_receive_metadata_peer_rejects_inbound_encoding() {
        let mut filter = CompressionFilter::new();
        let mut md = Metadata::new();
        md.add(GRPC_ENCODING_HEADER, "gzip").unwrap();
        md.add(GRPC_ACCEPT_ENCODING_HEADER, "identity,deflate").unwrap();

        filter.receive_metadata(&mut md).unwrap();
        assert_eq!(filter.receive_encoding(), Encoding::Gzip);
        assert_eq!(filter.send_encoding(), Encoding::Identity);
        assert!(!md.contains_key(GRPC_ACCEPT_ENCODING_HEADER));
    }

    #[test]
    fn test_receive_metadata_unknown_encoding() {
        let mut filter = CompressionFilter::new();
        let mut md = Metadata::new();
        md.add(GRPC_ENCODING_HEADER, "snappy").unwrap();

        let err = filter.receive_metadata(&mut md).unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[test]
    fn test_accept_list_default() {
        let filter = CompressionFilter::new();
        assert_eq!(filter.accept_list(), "identity,deflate,gzip");
    }

    #[test]
    fn test_corrupt_compressed_payload() {
        let filter = filter_with(Encoding::Gzip, Encoding::Gzip);
        let frame = FramedMessage {
            compressed: true,
            payload: Bytes::from_static(b"not gzip data"),
        };
        let err = filter.read_message(&frame).unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }
}
