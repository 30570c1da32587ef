// This is free and unencumbered software released into the public domain.

use crate::shared::ImageSettings;
use std::{env, time::Duration};
use tracing::warn;

/// Upper bound applied to every blocking call into the camera's owner thread.
pub const DEFAULT_BLOCKING_TIMEOUT: Duration = Duration::from_secs(5);

/// Behaviour of one [`CameraSession`](crate::shared::CameraSession).
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub camera_index: usize,
    pub blocking_timeout: Duration,
    /// Keep the camera open while the hosting application is suspended.
    pub keep_alive: bool,
    /// Follow device rotation changes while the preview runs.
    pub track_rotation: bool,
    pub image_settings: ImageSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            blocking_timeout: DEFAULT_BLOCKING_TIMEOUT,
            keep_alive: false,
            track_rotation: true,
            image_settings: ImageSettings::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(camera_index: usize) -> Self {
        Self {
            camera_index,
            ..Default::default()
        }
    }

    /// Defaults overlaid with `ASIMOV_CAMERA_INDEX` and `ASIMOV_CAMERA_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(index) = env_number("ASIMOV_CAMERA_INDEX") {
            config.camera_index = index as usize;
        }
        if let Some(ms) = env_number("ASIMOV_CAMERA_TIMEOUT_MS") {
            config = config.with_blocking_timeout(Duration::from_millis(ms));
        }
        config
    }

    pub fn with_camera_index(mut self, index: usize) -> Self {
        self.camera_index = index;
        self
    }

    pub fn with_blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    pub fn with_rotation_tracking(mut self, enabled: bool) -> Self {
        self.track_rotation = enabled;
        self
    }

    pub fn with_image_settings(mut self, settings: ImageSettings) -> Self {
        self.image_settings = settings;
        self
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(target: "asimov_camera_session", key, value = %raw, "ignoring malformed environment override");
            None
        },
    }
}

/// Capture format requested from a process-backed camera.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub diagnostics: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: None,
            width: 640,
            height: 480,
            fps: 30.0,
            diagnostics: false,
        }
    }
}

impl CameraConfig {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            width,
            height,
            fps,
            ..Default::default()
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }
}
