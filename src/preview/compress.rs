use bytes::Bytes;
use thiserror::Error;

use crate::camera::types::{PixelFormat, RawFrame};
use crate::preview::convert;

/// Default JPEG quality for frames sent over the network.
pub const DEFAULT_QUALITY: u8 = 85;

pub const JPEG_MIME: &str = "image/jpeg";

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("{format:?} buffer does not match {width}x{height}")]
    InvalidBuffer {
        format: PixelFormat,
        width: u32,
        height: u32,
    },

    #[error("JPEG compression failed: {0}")]
    Compression(String),
}

/// A compressed frame ready for transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub mime_type: &'static str,
}

/// Compress raw RGB pixel data to JPEG at the given quality (1-100).
pub fn compress_jpeg(
    rgb: &[u8],
    width: u32,
    height: u32,
    quality: u8,
) -> Result<Vec<u8>, EncodeError> {
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 || rgb.len() < w * h * 3 {
        return Err(EncodeError::InvalidBuffer {
            format: PixelFormat::Rgb24,
            width,
            height,
        });
    }

    let image = turbojpeg::Image {
        pixels: &rgb[..w * h * 3],
        width: w,
        pitch: w * 3,
        height: h,
        format: turbojpeg::PixelFormat::RGB,
    };
    let jpeg = turbojpeg::compress(
        image,
        i32::from(quality.clamp(1, 100)),
        turbojpeg::Subsamp::Sub2x2,
    )
    .map_err(|e| EncodeError::Compression(e.to_string()))?;
    Ok(jpeg.to_vec())
}

/// Converts raw camera frames into JPEG for the realtime session.
///
/// Stateless apart from the quality setting; safe to share across threads.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    quality: u8,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_QUALITY)
    }
}

impl FrameEncoder {
    /// Quality is clamped to 1..=100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode(&self, frame: &RawFrame) -> Result<EncodedFrame, EncodeError> {
        let (w, h) = (frame.width as usize, frame.height as usize);
        let invalid = || EncodeError::InvalidBuffer {
            format: frame.format,
            width: frame.width,
            height: frame.height,
        };

        let rgb = match frame.format {
            PixelFormat::Jpeg => {
                let plane = frame.planes.first().ok_or_else(invalid)?;
                if plane.data.is_empty() {
                    return Err(invalid());
                }
                return Ok(EncodedFrame {
                    data: Bytes::copy_from_slice(&plane.data),
                    mime_type: JPEG_MIME,
                });
            }
            PixelFormat::Raw16 => return Err(EncodeError::UnsupportedFormat(frame.format)),
            PixelFormat::Yuv420 => {
                let nv21 = convert::yuv420_planes_to_nv21(&frame.planes, w, h);
                convert::convert_nv21_to_rgb(&nv21, w, h)
            }
            PixelFormat::Nv21 => {
                let plane = frame.planes.first().ok_or_else(invalid)?;
                convert::convert_nv21_to_rgb(&plane.data, w, h)
            }
            PixelFormat::Nv12 => {
                let plane = frame.planes.first().ok_or_else(invalid)?;
                convert::convert_nv12_to_rgb(&plane.data, w, h)
            }
            PixelFormat::Yuy2 => {
                let plane = frame.planes.first().ok_or_else(invalid)?;
                convert::convert_yuy2_to_rgb(&plane.data, w, h)
            }
            PixelFormat::Rgb24 => {
                let plane = frame.planes.first().ok_or_else(invalid)?;
                convert::pack_rgb(plane, w, h)
            }
        };

        if rgb.is_empty() {
            return Err(invalid());
        }

        let jpeg = compress_jpeg(&rgb, frame.width, frame.height, self.quality)?;
        Ok(EncodedFrame {
            data: Bytes::from(jpeg),
            mime_type: JPEG_MIME,
        })
    }
}
