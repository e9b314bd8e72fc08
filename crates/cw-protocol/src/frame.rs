//! Length-prefixed frame encoding/decoding
//!
//! The wire format is a 4-byte big-endian unsigned length prefix followed by
//! exactly that many payload bytes. The transport layer assumes no internal
//! structure for the payload. Every stream-like transport (TCP, WebSocket,
//! reliable-UDP) reuses this codec to recover message boundaries from raw
//! reads; a zero-length frame is the orderly-closure signal between peers.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame size (64 MiB)
///
/// Declared lengths above this are rejected before any payload is buffered,
/// which bounds memory against a malicious or corrupt peer.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Codec for encoding/decoding length-prefixed frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Length parsed from a prefix whose payload has not fully arrived yet
    pending_len: Option<usize>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self { pending_len: None }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Parse the length prefix if we don't have one yet
        let len = match self.pending_len.take() {
            Some(len) => len,
            None => {
                if src.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None); // Need more data
                }
                let declared = src.get_u32() as usize;
                if declared > MAX_FRAME_SIZE {
                    return Err(ProtocolError::FrameTooLarge {
                        size: declared,
                        max: MAX_FRAME_SIZE,
                    });
                }
                declared
            }
        };

        // Check if the full payload has arrived
        if src.len() < len {
            src.reserve(len - src.len());
            self.pending_len = Some(len);
            return Ok(None);
        }

        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + frame.len());
        dst.put_u32(frame.len() as u32);
        dst.extend_from_slice(&frame);

        Ok(())
    }
}

/// Stateful reassembler that turns raw byte reads into discrete frames
///
/// Transports whose underlying medium does not preserve message boundaries
/// append raw reads to the internal accumulator and then drain complete
/// frames with [`FrameAssembler::next_frame`]. The logic is identical
/// regardless of the medium beneath it.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    codec: FrameCodec,
    buf: BytesMut,
}

impl FrameAssembler {
    /// Create a new assembler with an empty accumulator
    pub fn new() -> Self {
        Self {
            codec: FrameCodec::new(),
            buf: BytesMut::with_capacity(8192),
        }
    }

    /// Append raw bytes to the accumulator
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Direct access to the accumulator, for zero-copy reads into it
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Drain the next complete frame, if one has fully arrived
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        self.codec.decode(&mut self.buf)
    }

    /// Whether no partial frame is buffered
    ///
    /// Used by transports to distinguish an orderly end-of-stream from a
    /// connection dropped mid-frame.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.codec.pending_len.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new()
            .encode(Bytes::copy_from_slice(payload), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn test_codec_roundtrip() {
        let mut codec = FrameCodec::new();

        let mut buf = encode_frame(b"hello, frame");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.as_ref(), b"hello, frame");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_empty_frame() {
        let mut codec = FrameCodec::new();

        let mut buf = encode_frame(b"");
        assert_eq!(buf.len(), LENGTH_PREFIX_SIZE);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();

        let full = encode_frame(b"partial delivery");

        // Deliver all but the last byte
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Deliver the rest
        partial.extend_from_slice(&full[full.len() - 1..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.as_ref(), b"partial delivery");
    }

    #[test]
    fn test_oversized_frame_rejected_before_buffering() {
        let mut codec = FrameCodec::new();

        // A prefix declaring 64 MiB + 1 with no payload behind it must fail
        // immediately instead of waiting for (or allocating) the payload.
        let declared = (MAX_FRAME_SIZE + 1) as u32;
        let mut buf = BytesMut::from(&declared.to_be_bytes()[..]);

        let result = codec.decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { size, .. }) if size == MAX_FRAME_SIZE + 1
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut codec = FrameCodec::new();
        let payload = Bytes::from(vec![0u8; MAX_FRAME_SIZE + 1]);

        let mut buf = BytesMut::new();
        let result = codec.encode(payload, &mut buf);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_frame_of_exactly_max_size_roundtrips() {
        let mut codec = FrameCodec::new();
        let payload = Bytes::from(vec![0xA5u8; MAX_FRAME_SIZE]);

        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.len(), MAX_FRAME_SIZE);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_assembler_every_split_boundary() {
        // Feeding the same byte stream split at every possible boundary must
        // yield the identical sequence of frames as feeding it whole.
        let frames: &[&[u8]] = &[b"alpha", b"", b"a longer third frame payload", b"x"];

        let mut stream = BytesMut::new();
        for frame in frames {
            stream.extend_from_slice(&encode_frame(frame));
        }
        let stream = stream.freeze();

        for split in 0..=stream.len() {
            let mut assembler = FrameAssembler::new();
            let mut decoded: Vec<Bytes> = Vec::new();

            for chunk in [&stream[..split], &stream[split..]] {
                assembler.extend(chunk);
                while let Some(frame) = assembler.next_frame().unwrap() {
                    decoded.push(frame);
                }
            }

            assert_eq!(decoded.len(), frames.len(), "split at {split}");
            for (got, want) in decoded.iter().zip(frames) {
                assert_eq!(got.as_ref(), *want, "split at {split}");
            }
            assert!(assembler.is_empty());
        }
    }

    #[test]
    fn test_assembler_tracks_partial_state() {
        let mut assembler = FrameAssembler::new();
        let full = encode_frame(b"mid-frame");

        assembler.extend(&full[..3]);
        assert!(assembler.next_frame().unwrap().is_none());
        assert!(!assembler.is_empty());

        assembler.extend(&full[3..]);
        let frame = assembler.next_frame().unwrap().unwrap();
        assert_eq!(frame.as_ref(), b"mid-frame");
        assert!(assembler.is_empty());
    }
}
