// This is free and unencumbered software released into the public domain.

use crate::shared::SessionError;
use bytes::Bytes;
use image::{DynamicImage, ImageBuffer, Rgb, Rgba};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn transposed(&self) -> Self {
        Self::new(self.height, self.width)
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            0.0
        } else {
            self.width as f64 / self.height as f64
        }
    }
}

impl core::fmt::Display for Size {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    #[default]
    Nv21,
    Yv12,
    Rgb8,
    Rgba8,
    Bgra8,
    Jpeg,
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixel_format: PixelFormat,
    pub timestamp_ns: u64,
}

impl Frame {
    pub fn new(data: Bytes, width: u32, height: u32, stride: u32, pixel_format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            stride,
            pixel_format,
            timestamp_ns: 0,
        }
    }

    pub fn new_rgb8(data: Bytes, width: u32, height: u32, stride: u32) -> Self {
        Self::new(data, width, height, stride, PixelFormat::Rgb8)
    }

    pub fn new_nv21(data: Bytes, width: u32, height: u32) -> Self {
        Self::new(data, width, height, width, PixelFormat::Nv21)
    }

    pub fn new_jpeg(data: Bytes, width: u32, height: u32) -> Self {
        Self::new(data, width, height, 0, PixelFormat::Jpeg)
    }

    pub fn with_timestamp_ns(mut self, ts: u64) -> Self {
        self.timestamp_ns = ts;
        self
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Decodes the frame into an owned image, whatever its native layout.
    pub fn to_image(&self) -> Result<DynamicImage, SessionError> {
        let (w, h) = (self.width, self.height);
        match self.pixel_format {
            PixelFormat::Jpeg => image::load_from_memory(&self.data)
                .map_err(|e| SessionError::format(format!("cannot decode JPEG: {e}"))),
            PixelFormat::Rgb8 => {
                let raw = pack_rows(&self.data, w as usize * 3, self.stride as usize, h as usize);
                ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, raw)
                    .map(DynamicImage::ImageRgb8)
                    .ok_or_else(|| truncated(self))
            },
            PixelFormat::Rgba8 => {
                let raw = pack_rows(&self.data, w as usize * 4, self.stride as usize, h as usize);
                ImageBuffer::<Rgba<u8>, _>::from_raw(w, h, raw)
                    .map(DynamicImage::ImageRgba8)
                    .ok_or_else(|| truncated(self))
            },
            PixelFormat::Bgra8 => {
                let mut raw =
                    pack_rows(&self.data, w as usize * 4, self.stride as usize, h as usize);
                for px in raw.chunks_exact_mut(4) {
                    px.swap(0, 2);
                }
                ImageBuffer::<Rgba<u8>, _>::from_raw(w, h, raw)
                    .map(DynamicImage::ImageRgba8)
                    .ok_or_else(|| truncated(self))
            },
            PixelFormat::Nv21 | PixelFormat::Yv12 => {
                let rgb = yuv420_to_rgb(&self.data, w, h, self.pixel_format)
                    .ok_or_else(|| truncated(self))?;
                ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, rgb)
                    .map(DynamicImage::ImageRgb8)
                    .ok_or_else(|| truncated(self))
            },
        }
    }

    pub fn from_image(img: &DynamicImage) -> Self {
        let rgb = img.to_rgb8();
        let (w, h) = rgb.dimensions();
        Self::new_rgb8(Bytes::from(rgb.into_raw()), w, h, w * 3)
    }
}

fn truncated(frame: &Frame) -> SessionError {
    SessionError::format(format!(
        "{:?} frame of {} bytes is too short for {}",
        frame.pixel_format,
        frame.data.len(),
        frame.size()
    ))
}

fn pack_rows(data: &[u8], row_len: usize, stride: usize, rows: usize) -> Vec<u8> {
    if stride <= row_len {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(row_len * rows);
    for row in data.chunks(stride).take(rows) {
        out.extend_from_slice(&row[..row_len.min(row.len())]);
    }
    out
}

/// Converts NV21 (Y plane, interleaved VU) or YV12 (Y, V, U planes) to packed RGB.
///
/// Uses BT.601 coefficients. Returns `None` when the buffer is too short.
pub fn yuv420_to_rgb(data: &[u8], width: u32, height: u32, format: PixelFormat) -> Option<Vec<u8>> {
    let (w, h) = (width as usize, height as usize);
    let luma = w * h;
    let chroma_w = w.div_ceil(2);
    let chroma_h = h.div_ceil(2);
    if data.len() < luma + 2 * chroma_w * chroma_h {
        return None;
    }

    let mut rgb = Vec::with_capacity(luma * 3);
    for row in 0..h {
        for col in 0..w {
            let y = data[row * w + col] as f32;
            let (u, v) = match format {
                PixelFormat::Nv21 => {
                    let i = luma + (row / 2) * chroma_w * 2 + (col / 2) * 2;
                    (data[i + 1] as f32 - 128.0, data[i] as f32 - 128.0)
                },
                _ => {
                    let i = (row / 2) * chroma_w + col / 2;
                    let v_plane = luma;
                    let u_plane = luma + chroma_w * chroma_h;
                    (data[u_plane + i] as f32 - 128.0, data[v_plane + i] as f32 - 128.0)
                },
            };
            rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
        }
    }
    Some(rgb)
}
