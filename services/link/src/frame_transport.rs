//! Length-prefixed frame stream for compressed images.
//!
//! One frame on the wire (all integers big-endian):
//!
//! ```text
//! +--------+----------+---------+------------+-------------+
//! | "IMG1" | name_len | img_len | name bytes | image bytes |
//! | 4      | u16      | u32     | name_len   | img_len     |
//! +--------+----------+---------+------------+-------------+
//! ```
//!
//! Frames repeat on one TCP connection until the sender closes it. After
//! storing a frame the receiver answers with the 2-byte [`ACK`]; senders read
//! it best-effort and never fail a frame because it is missing.

use crate::net::is_transient;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

/// Frame preamble.
pub const MAGIC: &[u8; 4] = b"IMG1";

/// Magic plus both length fields.
pub const HEADER_LEN: usize = 4 + 2 + 4;

/// Acknowledgment written by the receiver after each stored frame.
pub const ACK: &[u8; 2] = b"OK";

/// Largest image accepted by default (64 MiB).
pub const DEFAULT_MAX_IMAGE_LEN: usize = 64 * 1024 * 1024;

/// Framing errors. Any of them ends the connection it occurred on.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Bad frame magic: {found:?}")]
    BadMagic { found: Bytes },

    #[error("Connection closed mid-frame: received {received} of {expected} bytes")]
    Truncated { expected: usize, received: usize },

    #[error("Image of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Frame name is not valid UTF-8")]
    InvalidName(#[source] std::string::FromUtf8Error),

    #[error("Frame name of {0} bytes does not fit the u16 length field")]
    NameTooLong(usize),

    #[error("Image of {0} bytes does not fit the u32 length field")]
    ImageTooLong(usize),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One named image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMessage {
    pub name: String,
    pub image: Bytes,
}

impl FrameMessage {
    pub fn new(name: impl Into<String>, image: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
        }
    }

    /// Size of this frame on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.name.len() + self.image.len()
    }

    /// Append the wire form of this frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let name_len =
            u16::try_from(self.name.len()).map_err(|_| FrameError::NameTooLong(self.name.len()))?;
        let img_len = u32::try_from(self.image.len())
            .map_err(|_| FrameError::ImageTooLong(self.image.len()))?;

        dst.reserve(self.encoded_len());
        dst.put_slice(MAGIC);
        dst.put_u16(name_len);
        dst.put_u32(img_len);
        dst.put_slice(self.name.as_bytes());
        dst.put_slice(&self.image);
        Ok(())
    }
}

/// `tokio_util` codec for [`FrameMessage`]s.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_image_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_image_len(DEFAULT_MAX_IMAGE_LEN)
    }

    pub fn with_max_image_len(max_image_len: usize) -> Self {
        Self { max_image_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// `(name_len, img_len)` from a complete header.
fn payload_lens(header: &[u8]) -> (usize, usize) {
    let name_len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let img_len = u32::from_be_bytes([header[6], header[7], header[8], header[9]]) as usize;
    (name_len, img_len)
}

impl Decoder for FrameCodec {
    type Item = FrameMessage;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FrameMessage>, FrameError> {
        // Reject a corrupt preamble as soon as its bytes arrive.
        let seen = src.len().min(MAGIC.len());
        if src[..seen] != MAGIC[..seen] {
            return Err(FrameError::BadMagic {
                found: Bytes::copy_from_slice(&src[..seen]),
            });
        }

        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let (name_len, img_len) = payload_lens(&src[..]);
        if img_len > self.max_image_len {
            return Err(FrameError::FrameTooLarge {
                len: img_len,
                max: self.max_image_len,
            });
        }

        let total = HEADER_LEN + name_len + img_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let name = src.split_to(name_len);
        let image = src.split_to(img_len).freeze();
        let name = String::from_utf8(name.to_vec()).map_err(FrameError::InvalidName)?;

        trace!(name = %name, bytes = image.len(), "Decoded frame");
        Ok(Some(FrameMessage { name, image }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<FrameMessage>, FrameError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        if src.is_empty() {
            return Ok(None);
        }

        if src.len() < HEADER_LEN {
            // Peer closed before a full header: end of stream.
            debug!(discarded = src.len(), "Stream closed inside frame header");
            src.clear();
            return Ok(None);
        }

        let (name_len, img_len) = payload_lens(&src[..]);
        Err(FrameError::Truncated {
            expected: HEADER_LEN + name_len + img_len,
            received: src.len(),
        })
    }
}

impl Encoder<FrameMessage> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: FrameMessage, dst: &mut BytesMut) -> Result<(), FrameError> {
        frame.encode_into(dst)
    }
}

/// Name a frame carries on the wire: the capture name plus its index.
pub fn indexed_name(name: &str, index: u32) -> String {
    format!("{}_{:04}", name, index)
}

/// Split a trailing `_<digits>` index off a frame name.
pub fn split_indexed_name(name: &str) -> (&str, Option<u32>) {
    if let Some((base, suffix)) = name.rsplit_once('_') {
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = suffix.parse() {
                return (base, Some(index));
            }
        }
    }
    (name, None)
}

/// Write the acknowledgment for one stored frame.
pub async fn write_ack<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    writer.write_all(ACK).await
}

/// Best-effort read of one acknowledgment.
///
/// Returns `Ok(false)` when none arrived in time or the read failed
/// transiently; other I/O errors are returned.
pub async fn read_ack<R: AsyncRead + Unpin>(reader: &mut R, wait: Duration) -> io::Result<bool> {
    let mut ack = [0u8; ACK.len()];
    match tokio::time::timeout(wait, reader.read_exact(&mut ack)).await {
        Err(_) => {
            trace!(wait_ms = wait.as_millis() as u64, "No frame ack in time");
            Ok(false)
        }
        Ok(Ok(_)) => Ok(true),
        Ok(Err(e)) if is_transient(&e) => {
            trace!(error = %e, "Transient ack read failure");
            Ok(false)
        }
        Ok(Err(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn encode_all(frames: &[FrameMessage]) -> BytesMut {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        for frame in frames {
            codec.encode(frame.clone(), &mut buf).unwrap();
        }
        buf
    }

    async fn decode_all(bytes: &[u8], codec: FrameCodec) -> Vec<Result<FrameMessage, FrameError>> {
        FramedRead::new(bytes, codec).collect().await
    }

    #[tokio::test]
    async fn test_decode_then_encode_reproduces_stream() {
        let stream = encode_all(&[
            FrameMessage::new("t_0000", vec![0xff, 0xd8, 0x01, 0x02]),
            FrameMessage::new("", Vec::new()),
            FrameMessage::new("caméra_0002", vec![7u8; 4096]),
        ]);

        let decoded = decode_all(&stream, FrameCodec::new()).await;
        assert_eq!(decoded.len(), 3);

        let frames: Vec<_> = decoded.into_iter().map(Result::unwrap).collect();
        assert_eq!(encode_all(&frames), stream);
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let stream = encode_all(&[FrameMessage::new("ab", vec![1, 2, 3])]);
        assert_eq!(&stream[..4], b"IMG1");
        assert_eq!(&stream[4..6], &[0, 2]);
        assert_eq!(&stream[6..10], &[0, 0, 0, 3]);
        assert_eq!(&stream[10..], b"ab\x01\x02\x03");
    }

    #[tokio::test]
    async fn test_close_mid_header_is_end_of_stream() {
        let mut stream = encode_all(&[FrameMessage::new("a", vec![1])]);
        stream.extend_from_slice(&b"IMG1\x00\x01"[..]);

        let decoded = decode_all(&stream, FrameCodec::new()).await;
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_magic_mid_stream_is_fatal() {
        let mut stream = encode_all(&[FrameMessage::new("a", vec![1])]);
        stream.extend_from_slice(b"JUNK\x00\x01\x00\x00\x00\x01a\x01");
        stream.extend_from_slice(&encode_all(&[FrameMessage::new("b", vec![2])]));

        let decoded = decode_all(&stream, FrameCodec::new()).await;
        assert_eq!(decoded.len(), 2);
        assert!(decoded[0].is_ok());
        assert!(matches!(decoded[1], Err(FrameError::BadMagic { .. })));
    }

    #[tokio::test]
    async fn test_close_mid_payload_is_truncated() {
        let stream = encode_all(&[FrameMessage::new("a", vec![9u8; 100])]);
        let cut = &stream[..stream.len() - 40];

        let decoded = decode_all(cut, FrameCodec::new()).await;
        assert_eq!(decoded.len(), 1);
        match &decoded[0] {
            Err(FrameError::Truncated { expected, received }) => {
                assert_eq!(*expected, HEADER_LEN + 1 + 100);
                assert_eq!(*received, HEADER_LEN + 1 + 60);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_image_rejected_from_header() {
        let mut codec = FrameCodec::with_max_image_len(16);
        let mut buf = BytesMut::from(&b"IMG1\x00\x00\x00\x00\x00\x11"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::FrameTooLarge { len: 17, max: 16 })
        ));
    }

    #[test]
    fn test_partial_magic_checked_early() {
        let mut codec = FrameCodec::new();
        let mut good = BytesMut::from(&b"IM"[..]);
        assert!(codec.decode(&mut good).unwrap().is_none());

        let mut bad = BytesMut::from(&b"IX"[..]);
        assert!(matches!(codec.decode(&mut bad), Err(FrameError::BadMagic { .. })));
    }

    #[test]
    fn test_invalid_utf8_name_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"IMG1\x00\x02\x00\x00\x00\x00\xff\xfe"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::InvalidName(_))));
    }

    #[test]
    fn test_indexed_names() {
        assert_eq!(indexed_name("t", 2), "t_0002");
        assert_eq!(split_indexed_name("t_0002"), ("t", Some(2)));
        assert_eq!(split_indexed_name("front_door_0011"), ("front_door", Some(11)));
        assert_eq!(split_indexed_name("front_door"), ("front_door", None));
        assert_eq!(split_indexed_name("plain"), ("plain", None));
    }

    #[tokio::test]
    async fn test_ack_read_is_best_effort() {
        let (mut sender, mut receiver) = tokio::io::duplex(64);
        assert!(!read_ack(&mut sender, Duration::from_millis(20)).await.unwrap());

        write_ack(&mut receiver).await.unwrap();
        assert!(read_ack(&mut sender, Duration::from_millis(500)).await.unwrap());
    }
}
