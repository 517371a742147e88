//! Decoded 3-channel color image handed to the engine.

use image::RgbImage;
use std::path::Path;

/// Byte order of the three interleaved color channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    /// OpenCV-style capture buffers.
    Bgr,
}

/// A decoded color frame (width * height * 3 bytes, row-major, interleaved).
#[derive(Debug, Clone)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    order: ChannelOrder,
}

impl Frame {
    /// Wrap a raw interleaved pixel buffer, checking its length.
    pub fn new(data: Vec<u8>, width: u32, height: u32, order: ChannelOrder) -> Result<Self, FrameError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(3));
        if expected != Some(data.len()) {
            return Err(FrameError::InvalidLength {
                expected: expected.unwrap_or(usize::MAX),
                actual: data.len(),
            });
        }
        Ok(Self { data, width, height, order })
    }

    /// Decode an encoded image (JPEG, PNG, ...) from memory.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }
        let image = image::load_from_memory(bytes)?;
        Ok(Self::from_rgb_image(image.to_rgb8()))
    }

    /// Read and decode an image file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FrameError> {
        let image = image::open(path)?;
        Ok(Self::from_rgb_image(image.to_rgb8()))
    }

    pub fn from_rgb_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            order: ChannelOrder::Rgb,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn order(&self) -> ChannelOrder {
        self.order
    }

    /// True for zero-size frames, which no component will process.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    /// Pixel at (x, y) in RGB order regardless of the stored channel order.
    ///
    /// Callers must keep `x < width` and `y < height`.
    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        let px = [self.data[idx], self.data[idx + 1], self.data[idx + 2]];
        match self.order {
            ChannelOrder::Rgb => px,
            ChannelOrder::Bgr => [px[2], px[1], px[0]],
        }
    }

    /// Convert to an `image` buffer in RGB order.
    pub fn to_rgb_image(&self) -> Result<RgbImage, FrameError> {
        let mut data = self.data.clone();
        if self.order == ChannelOrder::Bgr {
            for px in data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
        }
        let expected = data.len();
        RgbImage::from_raw(self.width, self.height, data).ok_or(FrameError::InvalidLength {
            expected: self.width as usize * self.height as usize * 3,
            actual: expected,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty image data")]
    Empty,
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
}
