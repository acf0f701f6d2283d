//! Image and depth buffers retrieved from the camera

use image::{GrayImage, Luma, RgbImage};

/// Which view of the stereo pair to retrieve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Left,
    Right,
}

/// BGRA image retrieved from one eye of the camera
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    /// BGRA pixel data (width * height * 4)
    pub data: Vec<u8>,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Capture timestamp (nanoseconds)
    pub timestamp_ns: u64,
}

impl ImageBuffer {
    /// Create a new image from raw BGRA data
    pub fn new(data: Vec<u8>, width: u32, height: u32, timestamp_ns: u64) -> Self {
        Self {
            data,
            width,
            height,
            timestamp_ns,
        }
    }

    /// Drop the alpha channel and swap to RGB for encoding
    pub fn to_rgb(&self) -> Option<RgbImage> {
        let mut rgb = Vec::with_capacity((self.width * self.height * 3) as usize);
        for pixel in self.data.chunks_exact(4) {
            rgb.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
        }
        RgbImage::from_raw(self.width, self.height, rgb)
    }
}

/// Per-pixel depth measurement in meters
#[derive(Debug, Clone)]
pub struct DepthMap {
    /// Row-major depth values (NaN / inf = no measurement)
    pub values: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

impl DepthMap {
    pub fn new(values: Vec<f32>, width: u32, height: u32) -> Self {
        Self {
            values,
            width,
            height,
        }
    }

    /// Render to 8-bit grayscale: near = bright, invalid or beyond range = black
    pub fn to_visualization(&self, max_range_m: f32) -> GrayImage {
        let mut img = GrayImage::new(self.width, self.height);
        if self.width == 0 || self.height == 0 {
            return img;
        }
        for (i, value) in self.values.iter().enumerate() {
            let x = i as u32 % self.width;
            let y = i as u32 / self.width;
            if y >= self.height {
                break;
            }
            let level = if value.is_finite() && *value > 0.0 && *value <= max_range_m {
                (255.0 * (1.0 - value / max_range_m)).round() as u8
            } else {
                0
            };
            img.put_pixel(x, y, Luma([level]));
        }
        img
    }
}
