//! Frame type and pixel conversions (YUYV/MJPEG to RGB, mirroring, luma).

use std::fmt;
use std::time::Instant;

/// A captured RGB camera frame.
///
/// Frames are immutable once produced; the acquisition loop publishes each
/// one behind an `Arc` and never writes into a frame a consumer can see.
#[derive(Clone)]
pub struct Frame {
    /// Row-major packed RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
    pub sequence: u32,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Frame {
    /// Build a frame from a packed RGB buffer, checking its length.
    pub fn from_rgb(
        data: Vec<u8>,
        width: u32,
        height: u32,
        sequence: u32,
    ) -> Result<Self, FrameError> {
        let expected = rgb_len(width, height);
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
            sequence,
        })
    }

    /// Mean over every RGB byte (0.0–255.0).
    pub fn mean_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.data.iter().map(|&b| b as u64).sum();
        sum as f32 / self.data.len() as f32
    }

    /// BT.601 luma, one byte per pixel.
    pub fn to_grayscale(&self) -> Vec<u8> {
        self.data
            .chunks_exact(3)
            .map(|px| {
                let y = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                y.round().clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Horizontally flipped copy (selfie view).
    pub fn mirrored(&self) -> Frame {
        let row_bytes = self.width as usize * 3;
        let mut data = Vec::with_capacity(self.data.len());
        for row in self.data.chunks_exact(row_bytes.max(1)) {
            for px in row.chunks_exact(3).rev() {
                data.extend_from_slice(px);
            }
        }
        Frame {
            data,
            width: self.width,
            height: self.height,
            captured_at: self.captured_at,
            sequence: self.sequence,
        }
    }

    /// Copy into an `image` buffer for encoding to disk.
    pub fn to_rgb_image(&self) -> Option<image::RgbImage> {
        image::RgbImage::from_raw(self.width, self.height, self.data.clone())
    }
}

fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// Every 4 bytes `[Y0, U, Y1, V]` carry two pixels sharing one chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(rgb_len(width, height));
    for quad in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let y = y as f32;
    let cb = cb as f32 - 128.0;
    let cr = cr as f32 - 128.0;
    let r = y + 1.402 * cr;
    let g = y - 0.344_136 * cb - 0.714_136 * cr;
    let b = y + 1.772 * cb;
    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}

/// Decode a motion-JPEG buffer to RGB, returning `(data, width, height)`.
pub fn mjpeg_to_rgb(jpeg: &[u8]) -> Result<(Vec<u8>, u32, u32), FrameError> {
    let decoded = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| FrameError::Decode(e.to_string()))?
        .to_rgb8();
    let (width, height) = decoded.dimensions();
    Ok((decoded.into_raw(), width, height))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
}
