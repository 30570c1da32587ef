// This is free and unencumbered software released into the public domain.

use crate::shared::{DeviceError, DeviceEvents, Frame, PixelFormat, Size};
use dogma::Named;
use std::{any::Any, fmt, sync::Arc};

pub type DeviceResult<T> = Result<T, DeviceError>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CameraFacing {
    #[default]
    Back,
    Front,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraInfo {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub facing: CameraFacing,
    /// Clockwise rotation of the sensor relative to the device's natural orientation.
    pub orientation: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FpsRange {
    pub min: u32,
    pub max: u32,
}

/// What a device can do; fixed for the lifetime of an open handle.
#[derive(Clone, Debug, Default)]
pub struct DeviceCapabilities {
    /// Ascending by pixel count.
    pub preview_sizes: Vec<Size>,
    /// Ascending by pixel count.
    pub picture_sizes: Vec<Size>,
    pub preferred_preview_size_for_video: Option<Size>,
    pub preview_formats: Vec<PixelFormat>,
    pub fps_ranges: Vec<FpsRange>,
}

impl DeviceCapabilities {
    pub fn largest_preview_size(&self) -> Option<Size> {
        self.preview_sizes.iter().copied().max_by_key(Size::pixel_count)
    }

    pub fn largest_picture_size(&self) -> Option<Size> {
        self.picture_sizes.iter().copied().max_by_key(Size::pixel_count)
    }
}

/// The mutable configuration of an open device.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceParameters {
    pub preview_size: Size,
    pub preview_format: PixelFormat,
    pub preview_fps: Option<FpsRange>,
    pub picture_size: Size,
    pub jpeg_quality: u8,
    /// Rotation the device writes into captured stills.
    pub rotation: u32,
    pub display_orientation: u32,
}

/// An opaque, shareable reference to a native object.
#[derive(Clone)]
pub struct NativeHandle(Arc<dyn Any + Send + Sync>);

impl NativeHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NativeHandle(..)")
    }
}

/// Where the device renders its preview.
#[derive(Clone, Debug, Default)]
pub enum PreviewTarget {
    #[default]
    Detached,
    Surface(NativeHandle),
}

/// One open camera. Not `Send`: it lives and dies on the thread that opened it.
///
/// Asynchronous outcomes (exposure, captured bytes, preview frames) are raised
/// through the [`DeviceEvents`] handle given to [`CameraDriver::open`].
pub trait NativeCameraDevice {
    fn info(&self) -> &CameraInfo;
    fn capabilities(&self) -> &DeviceCapabilities;
    fn parameters(&self) -> DeviceParameters;
    fn set_parameters(&mut self, params: &DeviceParameters) -> DeviceResult<()>;
    fn set_preview_target(&mut self, target: PreviewTarget) -> DeviceResult<()>;
    fn start_preview(&mut self) -> DeviceResult<()>;
    fn stop_preview(&mut self);

    /// Starts a still capture; completion is reported through events.
    fn take_picture(&mut self) -> DeviceResult<()>;

    fn last_preview_frame(&mut self) -> Option<Frame>;

    /// Whether the device should bother producing per-frame callbacks.
    fn notify_new_frames(&mut self, enabled: bool);

    fn lock(&mut self) -> DeviceResult<()>;
    fn unlock(&mut self) -> DeviceResult<()>;
    fn reconnect(&mut self) -> DeviceResult<()>;

    /// Reference handed to a recorder while the device is unlocked.
    fn recorder_handle(&self) -> NativeHandle;

    fn release(&mut self);
}

pub trait CameraDriver: Named + Send + Sync {
    fn cameras(&self) -> DeviceResult<Vec<CameraInfo>>;

    /// Always invoked on the camera's owner thread.
    fn open(&self, index: usize, events: DeviceEvents) -> DeviceResult<Box<dyn NativeCameraDevice>>;
}

impl fmt::Debug for dyn CameraDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CameraDriver").field(&self.name()).finish()
    }
}
