//! Sensor buffer to RGB conversion.

use capture::{Frame, FrameFormat};
use image::RgbImage;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("frame buffer holds {actual} bytes, {expected} needed for {width}x{height} {format:?}")]
    ShortBuffer {
        width: u32,
        height: u32,
        format: FrameFormat,
        expected: usize,
        actual: usize,
    },
    #[error("cannot convert an empty frame")]
    Empty,
}

/// Writes a decoded frame into a caller-owned RGB buffer.
///
/// The destination is reused across frames; implementations resize it only
/// when the frame dimensions change.
pub trait FrameConverter: Send {
    fn convert(&mut self, frame: &Frame, out: &mut RgbImage) -> Result<(), ConvertError>;
}

/// Converter for tightly packed 8-bit frames.
#[derive(Debug, Default)]
pub struct PackedConverter;

impl FrameConverter for PackedConverter {
    fn convert(&mut self, frame: &Frame, out: &mut RgbImage) -> Result<(), ConvertError> {
        let (resolution, format) = (frame.resolution, frame.format);
        if resolution.is_empty() {
            return Err(ConvertError::Empty);
        }
        let bpp = format.bytes_per_pixel();
        let expected = resolution.area() as usize * bpp;
        if frame.data.len() < expected {
            return Err(ConvertError::ShortBuffer {
                width: resolution.width,
                height: resolution.height,
                format,
                expected,
                actual: frame.data.len(),
            });
        }

        if out.dimensions() != (resolution.width, resolution.height) {
            *out = RgbImage::new(resolution.width, resolution.height);
        }

        let src = &frame.data[..expected];
        let dst: &mut [u8] = &mut *out;
        match format {
            FrameFormat::Rgb8 => dst.copy_from_slice(src),
            FrameFormat::Bgr8 | FrameFormat::Rgba8 => {
                let swap = format == FrameFormat::Bgr8;
                for (px, rgb) in src.chunks_exact(bpp).zip(dst.chunks_exact_mut(3)) {
                    if swap {
                        rgb.copy_from_slice(&[px[2], px[1], px[0]]);
                    } else {
                        rgb.copy_from_slice(&px[..3]);
                    }
                }
            }
        }
        Ok(())
    }
}
