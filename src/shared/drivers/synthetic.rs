// This is free and unencumbered software released into the public domain.

//! A camera that renders a moving test pattern.
//!
//! Needs no hardware, so it backs headless runs and tests. Faults can be
//! injected at runtime through [`SyntheticFaults`].

use crate::shared::{
    CameraDriver, CameraFacing, CameraInfo, DeviceCapabilities, DeviceError, DeviceEvents,
    DeviceParameters, DeviceResult, FpsRange, Frame, NativeCameraDevice, NativeHandle,
    PixelFormat, PreviewTarget, Size,
};
use alloc::borrow::Cow;
use bytes::Bytes;
use dogma::Named;
use image::{ExtendedColorType, codecs::jpeg::JpegEncoder};
use std::{
    collections::BTreeSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, warn};

/// Switches that make the next matching native call fail.
#[derive(Debug, Default)]
pub struct SyntheticFaults {
    open: AtomicBool,
    preview: AtomicBool,
    capture: AtomicBool,
    reconnect: AtomicBool,
}

impl SyntheticFaults {
    pub fn fail_open(&self, enabled: bool) {
        self.open.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_preview(&self, enabled: bool) {
        self.preview.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_capture(&self, enabled: bool) {
        self.capture.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_reconnect(&self, enabled: bool) {
        self.reconnect.store(enabled, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, what: &str) -> DeviceResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(DeviceError::other(format!("injected {what} failure")));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SyntheticCameraDriver {
    cameras: Vec<CameraInfo>,
    faults: Arc<SyntheticFaults>,
    open: Arc<Mutex<BTreeSet<usize>>>,
}

impl Default for SyntheticCameraDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticCameraDriver {
    /// One back-facing camera whose sensor is mounted at 90 degrees.
    pub fn new() -> Self {
        Self::with_cameras(vec![CameraInfo {
            index: 0,
            id: "synthetic:0".into(),
            name: "Synthetic Camera".into(),
            facing: CameraFacing::Back,
            orientation: 90,
        }])
    }

    pub fn with_cameras(cameras: Vec<CameraInfo>) -> Self {
        Self {
            cameras,
            faults: Arc::new(SyntheticFaults::default()),
            open: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn faults(&self) -> &SyntheticFaults {
        &self.faults
    }

    pub fn capabilities() -> DeviceCapabilities {
        DeviceCapabilities {
            preview_sizes: vec![Size::new(320, 240), Size::new(640, 480), Size::new(1280, 720)],
            picture_sizes: vec![
                Size::new(640, 480),
                Size::new(1280, 720),
                Size::new(1600, 1200),
                Size::new(1920, 1080),
            ],
            preferred_preview_size_for_video: Some(Size::new(1280, 720)),
            preview_formats: vec![PixelFormat::Rgb8, PixelFormat::Nv21],
            fps_ranges: vec![FpsRange { min: 15, max: 30 }],
        }
    }
}

impl Named for SyntheticCameraDriver {
    fn name(&self) -> Cow<'_, str> {
        "synthetic".into()
    }
}

impl CameraDriver for SyntheticCameraDriver {
    fn cameras(&self) -> DeviceResult<Vec<CameraInfo>> {
        Ok(self.cameras.clone())
    }

    fn open(&self, index: usize, events: DeviceEvents) -> DeviceResult<Box<dyn NativeCameraDevice>> {
        SyntheticFaults::check(&self.faults.open, "open")?;
        let info = self
            .cameras
            .iter()
            .find(|c| c.index == index)
            .cloned()
            .ok_or(DeviceError::NoCamera)?;

        let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
        if !open.insert(index) {
            return Err(DeviceError::Busy(index));
        }
        drop(open);

        let capabilities = Self::capabilities();
        let parameters = DeviceParameters {
            preview_size: Size::new(640, 480),
            preview_format: PixelFormat::Rgb8,
            preview_fps: capabilities.fps_ranges.first().copied(),
            picture_size: Size::new(1280, 720),
            jpeg_quality: 80,
            rotation: 0,
            display_orientation: 0,
        };
        debug!(target: "asimov_camera_session", index, "synthetic camera opened");

        Ok(Box::new(SyntheticCameraDevice {
            info,
            capabilities,
            parameters,
            events,
            faults: Arc::clone(&self.faults),
            open: Arc::clone(&self.open),
            previewing: false,
            notify: false,
            locked: true,
            tick: Arc::new(AtomicU64::new(0)),
            last_frame: Arc::new(Mutex::new(None)),
            pump: None,
        }))
    }
}

/// Payload of the handle lent to a recorder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticRecorderHandle {
    pub camera_id: String,
    pub size: Size,
}

struct FramePump {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

struct SyntheticCameraDevice {
    info: CameraInfo,
    capabilities: DeviceCapabilities,
    parameters: DeviceParameters,
    events: DeviceEvents,
    faults: Arc<SyntheticFaults>,
    open: Arc<Mutex<BTreeSet<usize>>>,
    previewing: bool,
    notify: bool,
    locked: bool,
    tick: Arc<AtomicU64>,
    last_frame: Arc<Mutex<Option<Frame>>>,
    pump: Option<FramePump>,
}

impl SyntheticCameraDevice {
    fn frame_interval(&self) -> Duration {
        let fps = self.parameters.preview_fps.map(|r| r.max).unwrap_or(30).max(1);
        Duration::from_millis(1000 / fps as u64)
    }

    /// Runs the frame pump only while previewing with frame callbacks wanted.
    fn sync_pump(&mut self) {
        let wanted = self.previewing && self.notify;
        match (wanted, self.pump.is_some()) {
            (true, false) => self.start_pump(),
            (false, true) => self.stop_pump(),
            _ => {},
        }
    }

    fn start_pump(&mut self) {
        let stop = Arc::new(AtomicBool::new(false));
        let size = self.parameters.preview_size;
        let format = self.parameters.preview_format;
        let interval = self.frame_interval();
        let events = self.events.clone();
        let tick = Arc::clone(&self.tick);
        let last_frame = Arc::clone(&self.last_frame);

        let spawned = thread::Builder::new().name("synthetic-preview".into()).spawn({
            let stop = Arc::clone(&stop);
            move || {
                while !stop.load(Ordering::Relaxed) {
                    let frame = render_preview(size, format, tick.fetch_add(1, Ordering::Relaxed));
                    events.new_preview_frame(&frame);
                    *last_frame.lock().unwrap_or_else(|p| p.into_inner()) = Some(frame);
                    thread::sleep(interval);
                }
            }
        });
        match spawned {
            Ok(join) => self.pump = Some(FramePump { stop, join }),
            Err(err) => self.events.error(DeviceError::native("spawning preview pump", err)),
        }
    }

    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.stop.store(true, Ordering::Relaxed);
            let _ = pump.join.join();
        }
    }

    fn restart_pump(&mut self) {
        self.stop_pump();
        self.sync_pump();
    }
}

impl NativeCameraDevice for SyntheticCameraDevice {
    fn info(&self) -> &CameraInfo {
        &self.info
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn parameters(&self) -> DeviceParameters {
        self.parameters.clone()
    }

    fn set_parameters(&mut self, params: &DeviceParameters) -> DeviceResult<()> {
        if params.preview_size.is_valid() && !self.capabilities.preview_sizes.contains(&params.preview_size) {
            return Err(DeviceError::unsupported(format!(
                "preview size {}",
                params.preview_size
            )));
        }
        if !self.capabilities.preview_formats.contains(&params.preview_format) {
            return Err(DeviceError::unsupported(format!(
                "preview format {:?}",
                params.preview_format
            )));
        }
        let restart = self.pump.is_some()
            && (params.preview_size != self.parameters.preview_size
                || params.preview_format != self.parameters.preview_format);
        self.parameters = params.clone();
        if restart {
            self.restart_pump();
        }
        Ok(())
    }

    fn set_preview_target(&mut self, _target: PreviewTarget) -> DeviceResult<()> {
        Ok(())
    }

    fn start_preview(&mut self) -> DeviceResult<()> {
        SyntheticFaults::check(&self.faults.preview, "preview")?;
        if !self.locked {
            return Err(DeviceError::other("camera is unlocked"));
        }
        if !self.parameters.preview_size.is_valid() {
            self.parameters.preview_size = Size::new(640, 480);
        }
        self.previewing = true;
        self.sync_pump();
        Ok(())
    }

    fn stop_preview(&mut self) {
        self.previewing = false;
        self.sync_pump();
    }

    fn take_picture(&mut self) -> DeviceResult<()> {
        SyntheticFaults::check(&self.faults.capture, "capture")?;
        if !self.previewing {
            return Err(DeviceError::other("preview is not running"));
        }
        self.stop_preview();

        let size = self.parameters.picture_size;
        let quality = self.parameters.jpeg_quality.clamp(1, 100);
        let tick = self.tick.load(Ordering::Relaxed);
        let events = self.events.clone();

        thread::Builder::new()
            .name("synthetic-shutter".into())
            .spawn(move || {
                events.picture_exposed();
                match encode_still(size, tick, quality) {
                    Ok(jpeg) => events.picture_captured(jpeg),
                    Err(err) => events.take_picture_failed(err),
                }
            })
            .map_err(|e| DeviceError::native("spawning shutter", e))?;
        Ok(())
    }

    fn last_preview_frame(&mut self) -> Option<Frame> {
        let cached = self.last_frame.lock().unwrap_or_else(|p| p.into_inner()).clone();
        cached.or_else(|| {
            let size = self.parameters.preview_size;
            size.is_valid().then(|| {
                render_preview(size, self.parameters.preview_format, self.tick.load(Ordering::Relaxed))
            })
        })
    }

    fn notify_new_frames(&mut self, enabled: bool) {
        self.notify = enabled;
        self.sync_pump();
    }

    fn lock(&mut self) -> DeviceResult<()> {
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> DeviceResult<()> {
        self.stop_preview();
        self.locked = false;
        Ok(())
    }

    fn reconnect(&mut self) -> DeviceResult<()> {
        SyntheticFaults::check(&self.faults.reconnect, "reconnect")
    }

    fn recorder_handle(&self) -> NativeHandle {
        NativeHandle::new(SyntheticRecorderHandle {
            camera_id: self.info.id.clone(),
            size: self
                .capabilities
                .preferred_preview_size_for_video
                .unwrap_or(self.parameters.preview_size),
        })
    }

    fn release(&mut self) {
        self.previewing = false;
        self.stop_pump();
        self.open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.info.index);
        debug!(target: "asimov_camera_session", index = self.info.index, "synthetic camera released");
    }
}

impl Drop for SyntheticCameraDevice {
    fn drop(&mut self) {
        if self.pump.is_some() {
            warn!(target: "asimov_camera_session", "synthetic camera dropped without release");
            self.release();
        }
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn pattern_rgb(size: Size, tick: u64) -> Vec<u8> {
    let shift = (tick % 256) as u32;
    let mut rgb = Vec::with_capacity(size.pixel_count() as usize * 3);
    for y in 0..size.height {
        for x in 0..size.width {
            rgb.push(((x + shift) % 256) as u8);
            rgb.push(((y + shift / 2) % 256) as u8);
            rgb.push(if (x / 32 + y / 32) % 2 == 0 { 200 } else { 56 });
        }
    }
    rgb
}

/// A diagonal gradient in the preview's pixel format.
pub fn render_preview(size: Size, format: PixelFormat, tick: u64) -> Frame {
    let (w, h) = (size.width, size.height);
    let frame = match format {
        PixelFormat::Nv21 | PixelFormat::Yv12 => {
            let luma = (w * h) as usize;
            let mut data = Vec::with_capacity(luma + luma / 2);
            for y in 0..h {
                for x in 0..w {
                    data.push(((x + y + tick as u32) % 256) as u8);
                }
            }
            data.resize(luma + luma / 2, 128);
            if format == PixelFormat::Nv21 {
                Frame::new_nv21(Bytes::from(data), w, h)
            } else {
                Frame::new(Bytes::from(data), w, h, w, PixelFormat::Yv12)
            }
        },
        _ => Frame::new_rgb8(Bytes::from(pattern_rgb(size, tick)), w, h, w * 3),
    };
    frame.with_timestamp_ns(now_ns())
}

fn encode_still(size: Size, tick: u64, quality: u8) -> DeviceResult<Bytes> {
    let rgb = pattern_rgb(size, tick);
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality)
        .encode(&rgb, size.width, size.height, ExtendedColorType::Rgb8)
        .map_err(|e| DeviceError::native("encoding still", e))?;
    Ok(Bytes::from(jpeg))
}
