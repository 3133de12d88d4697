//! JPEG encode session.
//!
//! The capture pipeline talks to the encoder through [`EncodeUnit`]: a
//! session configured once for fixed dimensions and quality that turns one
//! NV12 frame into one JPEG bytestream per call. [`SoftJpegUnit`] encodes in
//! software; a hardware JPEG unit that accepts NV12 plugs in behind the same
//! trait through `CapturePipeline::with_parts`.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use log::debug;

use super::transform::{nv12_to_rgb, Nv12Frame};
use crate::error::{Error, Result};

pub trait EncodeUnit: Send {
    /// Encode a single frame. Frames that do not match the session
    /// configuration are rejected.
    fn encode(&mut self, frame: &Nv12Frame) -> Result<Vec<u8>>;

    /// (width, height) the session was opened for.
    fn dims(&self) -> (u32, u32);
}

/// Single-shot JPEG session backed by the `image` crate's baseline encoder.
pub struct SoftJpegUnit {
    width: u32,
    height: u32,
    quality: u8,
    rgb: Vec<u8>,
}

impl SoftJpegUnit {
    pub fn open(width: u32, height: u32, quality: u8) -> Result<Self> {
        if width == 0 || height == 0 || width > u16::MAX as u32 || height > u16::MAX as u32 {
            return Err(Error::Encode(format!(
                "unsupported JPEG dimensions {}x{}",
                width, height
            )));
        }
        if !(1..=100).contains(&quality) {
            return Err(Error::Encode(format!("JPEG quality {} out of range", quality)));
        }

        debug!(
            "JPEG session opened: {}x{}, quality {}",
            width, height, quality
        );
        Ok(Self {
            width,
            height,
            quality,
            rgb: Vec::with_capacity((width * height * 3) as usize),
        })
    }
}

impl EncodeUnit for SoftJpegUnit {
    fn encode(&mut self, frame: &Nv12Frame) -> Result<Vec<u8>> {
        if (frame.width, frame.height) != (self.width, self.height) {
            return Err(Error::Encode(format!(
                "frame {}x{} does not match session {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }

        nv12_to_rgb(frame, &mut self.rgb);

        let mut jpeg = Vec::with_capacity(self.rgb.len() / 8);
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode(&self.rgb, self.width, self.height, ExtendedColorType::Rgb8)
            .map_err(|e| Error::Encode(format!("JPEG encode failed: {}", e)))?;

        Ok(jpeg)
    }

    fn dims(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::transform::bgrx_to_nv12;
    use crate::display::JPEG_QUALITY;
    use image::codecs::jpeg::JpegDecoder;
    use image::ImageDecoder;
    use std::io::Cursor;

    #[test]
    fn test_encodes_decodable_jpeg() {
        let (w, h) = (16u32, 8u32);
        let pixels: Vec<u32> = (0..w * h).map(|i| i * 0x0001_0203).collect();
        let mut frame = Nv12Frame::new(w, h).unwrap();
        bgrx_to_nv12(&pixels, w, h, &mut frame).unwrap();

        let mut unit = SoftJpegUnit::open(w, h, JPEG_QUALITY).unwrap();
        let jpeg = unit.encode(&frame).unwrap();

        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xff, 0xd9]);

        let decoder = JpegDecoder::new(Cursor::new(&jpeg)).unwrap();
        assert_eq!(decoder.dimensions(), (w, h));
    }

    #[test]
    fn test_rejects_mismatched_frame() {
        let mut unit = SoftJpegUnit::open(8, 8, JPEG_QUALITY).unwrap();
        let frame = Nv12Frame::new(8, 4).unwrap();
        assert!(matches!(unit.encode(&frame), Err(Error::Encode(_))));
    }

    #[test]
    fn test_open_validates_settings() {
        assert!(SoftJpegUnit::open(0, 8, 80).is_err());
        assert!(SoftJpegUnit::open(8, 8, 0).is_err());
        assert!(SoftJpegUnit::open(8, 8, 101).is_err());
        assert_eq!(SoftJpegUnit::open(480, 800, 80).unwrap().dims(), (480, 800));
    }
}
