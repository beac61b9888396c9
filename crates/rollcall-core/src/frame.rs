//! Grayscale frame type, bilinear resampling and box annotation.

use crate::types::BoundingBox;
use chrono::{DateTime, Local};
use image::GrayImage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame buffer length {actual} does not match {width}x{height}")]
    InvalidLength {
        width: u32,
        height: u32,
        actual: usize,
    },
    #[error("frame has zero area")]
    Empty,
}

/// A captured grayscale frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes, row-major).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Source-assigned sequence number.
    pub sequence: u32,
    /// Wall-clock capture time; attendance events are stamped with it.
    pub captured_at: DateTime<Local>,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty);
        }
        if data.len() != width as usize * height as usize {
            return Err(FrameError::InvalidLength {
                width,
                height,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            sequence: 0,
            captured_at: Local::now(),
        })
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_timestamp(mut self, captured_at: DateTime<Local>) -> Self {
        self.captured_at = captured_at;
        self
    }

    /// Build a frame from a decoded grayscale image.
    pub fn from_luma(image: GrayImage) -> Result<Self, FrameError> {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height)
    }

    /// Copy the pixels into an `image` buffer (for encoding snapshots).
    pub fn to_luma(&self) -> Option<GrayImage> {
        GrayImage::from_raw(self.width, self.height, self.data.clone())
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Shrink the frame by `factor` in (0, 1] using bilinear interpolation.
    ///
    /// A factor of 1.0 (or above) returns an unmodified copy. The result keeps
    /// the sequence number and capture time of the source.
    pub fn downsample(&self, factor: f32) -> Frame {
        if factor >= 1.0 || factor <= 0.0 || !factor.is_finite() {
            return self.clone();
        }
        let new_w = ((self.width as f32 * factor).round() as u32).max(1);
        let new_h = ((self.height as f32 * factor).round() as u32).max(1);
        let data = resize_bilinear(
            &self.data,
            self.width as usize,
            self.height as usize,
            new_w as usize,
            new_h as usize,
        );
        Frame {
            data,
            width: new_w,
            height: new_h,
            sequence: self.sequence,
            captured_at: self.captured_at,
        }
    }

    /// Draw the outline of `region`, `thickness` pixels wide, clipped to the frame.
    pub fn draw_box(&mut self, region: &BoundingBox, thickness: u32, value: u8) {
        let Some((x0, y0, x1, y1)) = self.clip(region) else {
            return;
        };
        let t = thickness.max(1);
        for y in y0..y1 {
            for x in x0..x1 {
                let on_edge = x < x0 + t || x + t >= x1 || y < y0 + t || y + t >= y1;
                if on_edge {
                    self.data[(y * self.width + x) as usize] = value;
                }
            }
        }
    }

    /// Fill `region` with a solid value, clipped to the frame.
    pub fn fill_box(&mut self, region: &BoundingBox, value: u8) {
        let Some((x0, y0, x1, y1)) = self.clip(region) else {
            return;
        };
        for y in y0..y1 {
            let row = (y * self.width) as usize;
            self.data[row + x0 as usize..row + x1 as usize].fill(value);
        }
    }

    /// Clip a region to integer pixel bounds `[x0, x1) × [y0, y1)`.
    fn clip(&self, region: &BoundingBox) -> Option<(u32, u32, u32, u32)> {
        let x0 = region.x.max(0.0).floor();
        let y0 = region.y.max(0.0).floor();
        let x1 = region.right().min(self.width as f32).ceil();
        let y1 = region.bottom().min(self.height as f32).ceil();
        if !(x1 > x0 && y1 > y0) {
            return None;
        }
        Some((x0 as u32, y0 as u32, x1 as u32, y1 as u32))
    }
}

/// Resize a grayscale buffer with bilinear interpolation (pixel-center aligned).
pub fn resize_bilinear(
    src: &[u8],
    width: usize,
    height: usize,
    new_w: usize,
    new_h: usize,
) -> Vec<u8> {
    let mut resized = vec![0u8; new_w * new_h];
    if width == 0 || height == 0 || src.len() < width * height {
        return resized;
    }

    let scale_x = width as f32 / new_w as f32;
    let scale_y = height as f32 / new_h as f32;

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * width + x0] as f32;
            let tr = src[y0 * width + x1] as f32;
            let bl = src[y1 * width + x0] as f32;
            let br = src[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    resized
}
