//! Raw frame compression.

use crate::camera::RawFrame;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ExtendedColorType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Frame of {width}x{height} needs {expected} RGB bytes, got {actual}")]
    BadDimensions {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// Turns a raw frame into compressed bytes.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &RawFrame) -> Result<Bytes, EncodeError>;
}

/// RGB8 to baseline JPEG.
#[derive(Debug, Clone)]
pub struct JpegEncoder {
    quality: u8,
}

impl JpegEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for JpegEncoder {
    fn default() -> Self {
        Self::new(90)
    }
}

impl FrameEncoder for JpegEncoder {
    fn encode(&self, frame: &RawFrame) -> Result<Bytes, EncodeError> {
        let expected = frame.width as usize * frame.height as usize * 3;
        if frame.width == 0 || frame.height == 0 || frame.data.len() != expected {
            return Err(EncodeError::BadDimensions {
                width: frame.width,
                height: frame.height,
                expected,
                actual: frame.data.len(),
            });
        }

        let mut out = Vec::with_capacity(expected / 8);
        ImageJpegEncoder::new_with_quality(&mut out, self.quality).encode(
            &frame.data,
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn frame(width: u32, height: u32, len: usize) -> RawFrame {
        RawFrame {
            data: vec![128; len],
            width,
            height,
            sequence: 0,
            captured_at: Instant::now(),
        }
    }

    #[test]
    fn test_encodes_jpeg() {
        let jpeg = JpegEncoder::new(90).encode(&frame(16, 8, 16 * 8 * 3)).unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xff, 0xd9]);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let err = JpegEncoder::default().encode(&frame(16, 8, 10)).unwrap_err();
        assert!(matches!(err, EncodeError::BadDimensions { expected: 384, actual: 10, .. }));
    }
}
