use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::{DEFAULT_MAX_FRAME_LENGTH, HEADER_LEN, LENGTH_FIELD_LEN, MESSAGE_TYPE};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid frame length {0} (minimum is 5)")]
    InvalidLength(u32),
    #[error("Frame length {length} exceeds limit of {limit} bytes")]
    TooLarge { length: usize, limit: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One unit on the wire: `[u32 length][u8 type][payload]`, where `length`
/// counts the whole frame including the 5-byte header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Frame carrying application data.
    pub fn message(payload: impl Into<Bytes>) -> Self {
        Self::new(MESSAGE_TYPE, payload)
    }

    /// Total encoded size, header included.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        encode(self.frame_type, &self.payload, buf)
    }

    /// Encodes into a freshly allocated buffer that can be shared between writers.
    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

pub fn encode(frame_type: u8, payload: &[u8], buf: &mut BytesMut) -> Result<(), FrameError> {
    let length = HEADER_LEN + payload.len();
    let wire_length = u32::try_from(length).map_err(|_| FrameError::TooLarge {
        length,
        limit: u32::MAX as usize,
    })?;

    buf.reserve(length);
    buf.put_u32(wire_length);
    buf.put_u8(frame_type);
    buf.put_slice(payload);
    Ok(())
}

/// Takes one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched while the header or the body
/// is still incomplete. A declared length below the header size, or above
/// `max_frame_length`, is a protocol violation.
pub fn decode(buf: &mut BytesMut, max_frame_length: usize) -> Result<Option<Frame>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let mut length_bytes = [0u8; LENGTH_FIELD_LEN];
    length_bytes.copy_from_slice(&buf[..LENGTH_FIELD_LEN]);
    let declared = u32::from_be_bytes(length_bytes);

    if (declared as usize) < HEADER_LEN {
        return Err(FrameError::InvalidLength(declared));
    }

    let length = declared as usize;
    if length > max_frame_length {
        return Err(FrameError::TooLarge {
            length,
            limit: max_frame_length,
        });
    }

    if buf.len() < length {
        // Make room for the rest of this frame in one allocation
        buf.reserve(length - buf.len());
        return Ok(None);
    }

    let mut frame = buf.split_to(length);
    frame.advance(LENGTH_FIELD_LEN);
    let frame_type = frame.get_u8();

    Ok(Some(Frame {
        frame_type,
        payload: frame.freeze(),
    }))
}

/// `tokio_util` codec wrapper used by the per-connection reader.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        decode(src, self.max_frame_length)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        item.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(buf: &mut BytesMut) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = decode(buf, DEFAULT_MAX_FRAME_LENGTH).unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn decode_in_chunks(stream: &[u8], chunk: usize) -> Vec<Frame> {
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for piece in stream.chunks(chunk) {
            buf.extend_from_slice(piece);
            frames.extend(decode_all(&mut buf));
        }
        assert!(buf.is_empty());
        frames
    }

    #[test]
    fn test_decode_independent_of_chunk_size() {
        let mut stream = BytesMut::new();
        for (frame_type, size) in [0usize, 5, 65536].into_iter().enumerate() {
            let payload: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
            encode(frame_type as u8, &payload, &mut stream).unwrap();
        }
        let whole = decode_all(&mut stream.clone());
        assert_eq!(whole.len(), 3);

        let chunk_sizes = (1..=64).chain((7..=17).map(|shift| 1usize << shift));
        for chunk in chunk_sizes {
            assert_eq!(decode_in_chunks(&stream, chunk), whole, "chunk size {chunk}");
        }
    }

    #[test]
    fn test_decode_at_every_split_point() {
        let mut stream = BytesMut::new();
        for size in [0usize, 5, 300] {
            encode(MESSAGE_TYPE, &vec![0x5A; size], &mut stream).unwrap();
        }
        let whole = decode_all(&mut stream.clone());

        for split in 0..=stream.len() {
            let mut buf = BytesMut::from(&stream[..split]);
            let mut frames = decode_all(&mut buf);
            buf.extend_from_slice(&stream[split..]);
            frames.extend(decode_all(&mut buf));
            assert_eq!(frames, whole, "split at {split}");
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_encode_layout() {
        let mut buf = BytesMut::new();
        encode(MESSAGE_TYPE, b"hello", &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 10, 1, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_decode_waits_for_header() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 10][..]);
        assert!(decode(&mut buf, DEFAULT_MAX_FRAME_LENGTH).unwrap().is_none());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_decode_incomplete_body_is_not_consumed() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, 1, b'h', b'e'][..]);
        assert!(decode(&mut buf, DEFAULT_MAX_FRAME_LENGTH).unwrap().is_none());
        assert_eq!(&buf[..], &[0, 0, 0, 10, 1, b'h', b'e']);

        buf.extend_from_slice(b"llo");
        let frame = decode(&mut buf, DEFAULT_MAX_FRAME_LENGTH).unwrap().unwrap();
        assert_eq!(frame, Frame::message(&b"hello"[..]));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_empty_payload() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 5, 7][..]);
        let frame = decode(&mut buf, DEFAULT_MAX_FRAME_LENGTH).unwrap().unwrap();
        assert_eq!(frame.frame_type, 7);
        assert!(frame.is_empty());
        assert_eq!(frame.encoded_len(), HEADER_LEN);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_short_length() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 3, 1, 0xAA][..]);
        let err = decode(&mut buf, DEFAULT_MAX_FRAME_LENGTH).unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength(3)));
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut buf = BytesMut::from(&[0u8, 0, 1, 0, 1][..]);
        let err = decode(&mut buf, 128).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { length: 256, limit: 128 }));
    }

    #[test]
    fn test_decode_multiple_frames_from_one_buffer() {
        let mut buf = BytesMut::new();
        encode(MESSAGE_TYPE, b"a", &mut buf).unwrap();
        encode(MESSAGE_TYPE, b"", &mut buf).unwrap();
        encode(2, b"ccc", &mut buf).unwrap();
        buf.extend_from_slice(&[0, 0]);

        let frames = decode_all(&mut buf);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload, Bytes::from_static(b"a"));
        assert!(frames[1].payload.is_empty());
        assert_eq!(frames[2].frame_type, 2);
        // Trailing partial header stays buffered
        assert_eq!(&buf[..], &[0, 0]);
    }

    #[test]
    fn test_codec_round_trip_boundary_payloads() {
        let mut codec = FrameCodec::default();
        for size in [0usize, 1, 65536] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let mut buf = BytesMut::new();
            codec
                .encode(Frame::message(payload.clone()), &mut buf)
                .unwrap();
            assert_eq!(buf.len(), size + HEADER_LEN);

            let frame = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.frame_type, MESSAGE_TYPE);
            assert_eq!(&frame.payload[..], &payload[..]);
            assert!(buf.is_empty());
        }
    }

    #[tokio::test]
    async fn test_framed_read_across_fragmented_reads() {
        use futures::StreamExt;
        use tokio_util::codec::FramedRead;

        let mock = tokio_test::io::Builder::new()
            .read(&[0, 0])
            .read(&[0, 10, 1, b'h'])
            .read(b"ell")
            .read(&[b'o', 0, 0, 0, 6, 2])
            .read(b"!")
            .build();
        let mut frames = FramedRead::new(mock, FrameCodec::default());

        assert_eq!(
            frames.next().await.unwrap().unwrap(),
            Frame::message(&b"hello"[..])
        );
        assert_eq!(frames.next().await.unwrap().unwrap(), Frame::new(2, &b"!"[..]));
        assert!(frames.next().await.is_none());
    }
}
