// This is free and unencumbered software released into the public domain.

use crate::shared::{CameraDriver, CameraInfo, DeviceResult};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// The list of cameras a driver can open, enumerated lazily.
///
/// Owned by whoever composes sessions; call [`invalidate`](Self::invalidate)
/// on hot-plug so the next [`get`](Self::get) re-enumerates.
#[derive(Debug)]
pub struct DeviceListCache {
    driver: Arc<dyn CameraDriver>,
    cameras: Mutex<Option<Arc<[CameraInfo]>>>,
}

impl DeviceListCache {
    pub fn new(driver: Arc<dyn CameraDriver>) -> Self {
        Self {
            driver,
            cameras: Mutex::new(None),
        }
    }

    pub fn driver(&self) -> &Arc<dyn CameraDriver> {
        &self.driver
    }

    pub fn get(&self) -> DeviceResult<Arc<[CameraInfo]>> {
        let mut cached = self.cameras.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(list) = cached.as_ref() {
            return Ok(Arc::clone(list));
        }
        let list = self.enumerate()?;
        *cached = Some(Arc::clone(&list));
        Ok(list)
    }

    pub fn refresh(&self) -> DeviceResult<Arc<[CameraInfo]>> {
        let list = self.enumerate()?;
        *self.cameras.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::clone(&list));
        Ok(list)
    }

    pub fn invalidate(&self) {
        *self.cameras.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn find(&self, index: usize) -> DeviceResult<Option<CameraInfo>> {
        Ok(self.get()?.iter().find(|c| c.index == index).cloned())
    }

    fn enumerate(&self) -> DeviceResult<Arc<[CameraInfo]>> {
        let mut cameras = self.driver.cameras()?;
        cameras.retain(|c| !c.name.is_empty());
        debug!(target: "asimov_camera_session", count = cameras.len(), "enumerated cameras");
        Ok(cameras.into())
    }
}
