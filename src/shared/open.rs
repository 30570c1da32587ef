// This is free and unencumbered software released into the public domain.

use super::{CameraConfig, CameraDriver, DeviceError, DeviceResult, drivers};
use std::sync::Arc;

/// Names accepted by [`open_driver`].
pub const DRIVER_NAMES: &[&str] = &[
    #[cfg(feature = "ffmpeg")]
    "ffmpeg",
    "synthetic",
];

/// The driver used when none is named.
pub fn default_driver(config: CameraConfig) -> Arc<dyn CameraDriver> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "ffmpeg")] {
            Arc::new(drivers::ffmpeg::FfmpegCameraDriver::new(config))
        } else {
            let _ = config;
            Arc::new(drivers::synthetic::SyntheticCameraDriver::new())
        }
    }
}

pub fn open_driver(name: Option<&str>, config: CameraConfig) -> DeviceResult<Arc<dyn CameraDriver>> {
    match name.map(str::trim) {
        None | Some("") => Ok(default_driver(config)),
        Some("synthetic") => Ok(Arc::new(drivers::synthetic::SyntheticCameraDriver::new())),
        #[cfg(feature = "ffmpeg")]
        Some("ffmpeg") => Ok(Arc::new(drivers::ffmpeg::FfmpegCameraDriver::new(config))),
        Some(other) => Err(DeviceError::unsupported(format!(
            "unknown camera driver '{other}' (available: {})",
            DRIVER_NAMES.join(", ")
        ))),
    }
}
