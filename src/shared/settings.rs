// This is free and unencumbered software released into the public domain.

use crate::shared::{DeviceCapabilities, SessionError, Size};
use image::ImageFormat;

const ASPECT_RATIO_TOLERANCE: f64 = 0.01;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageQuality {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

impl ImageQuality {
    pub fn jpeg_quality(self) -> u8 {
        match self {
            Self::VeryLow => 20,
            Self::Low => 40,
            Self::Normal => 60,
            Self::High => 80,
            Self::VeryHigh => 100,
        }
    }
}

/// Encoding requested for captured stills.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSettings {
    pub format: ImageFormat,
    /// `None` means the device's largest picture size.
    pub resolution: Option<Size>,
    pub quality: ImageQuality,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            format: ImageFormat::Jpeg,
            resolution: None,
            quality: ImageQuality::default(),
        }
    }
}

impl ImageSettings {
    pub fn with_resolution(mut self, size: Size) -> Self {
        self.resolution = Some(size);
        self
    }

    pub fn with_quality(mut self, quality: ImageQuality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.format != ImageFormat::Jpeg {
            return Err(SessionError::format(format!(
                "{:?} output is not supported, only JPEG",
                self.format
            )));
        }
        Ok(())
    }

    /// The picture size to configure on a device with `capabilities`.
    pub fn picture_size(&self, capabilities: &DeviceCapabilities) -> Option<Size> {
        match self.resolution.filter(Size::is_valid) {
            Some(requested) => closest_picture_size(&capabilities.picture_sizes, requested),
            None => capabilities.largest_picture_size(),
        }
    }
}

/// The supported size whose pixel count is nearest to `requested`.
pub fn closest_picture_size(supported: &[Size], requested: Size) -> Option<Size> {
    if supported.contains(&requested) {
        return Some(requested);
    }
    let target = requested.pixel_count() as i64;
    supported
        .iter()
        .copied()
        .min_by_key(|s| (s.pixel_count() as i64 - target).abs())
}

/// Picks a preview size to accompany stills of size `capture`.
///
/// Falls back to the largest preview size without a valid capture size and
/// returns `None` when the device reports no preview sizes.
pub fn preview_size_for(capabilities: &DeviceCapabilities, capture: Option<Size>) -> Option<Size> {
    let Some(capture) = capture.filter(Size::is_valid) else {
        return capabilities.largest_preview_size();
    };

    if capabilities.preferred_preview_size_for_video.is_none() {
        return Some(capture);
    }

    let mut candidates = capabilities.preview_sizes.clone();
    candidates.sort_by_key(|s| std::cmp::Reverse(s.pixel_count()));

    let ratio = capture.aspect_ratio();
    candidates
        .iter()
        .copied()
        .find(|s| (s.aspect_ratio() - ratio).abs() < ASPECT_RATIO_TOLERANCE)
        .or_else(|| {
            candidates.iter().copied().min_by(|a, b| {
                let da = (a.aspect_ratio() - ratio).abs();
                let db = (b.aspect_ratio() - ratio).abs();
                da.total_cmp(&db)
            })
        })
}
