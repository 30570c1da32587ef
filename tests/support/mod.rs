// This is free and unencumbered software released into the public domain.

//! Scripted camera used by the session tests.
//!
//! The fake device never completes a capture on its own: tests drive exposure
//! and delivery through [`FakeCamera::expose`] and [`FakeCamera::deliver`].

#![allow(dead_code)]

use asimov_camera_session::shared::{
    CameraDriver, CameraFacing, CameraInfo, CameraSession, DeviceCapabilities, DeviceError,
    DeviceEvents, DeviceParameters, DeviceResult, DirectoryStorage, FpsRange, Frame,
    NativeCameraDevice, NativeHandle, PixelFormat, PreviewTarget, ReadyNotifier, SessionConfig,
    SessionEvent, Size, VideoOutput,
};
use bytes::Bytes;
use std::{
    borrow::Cow,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::RecvTimeoutError,
    },
    time::{Duration, Instant},
};

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct FakeCamera {
    calls: Mutex<Vec<String>>,
    events: Mutex<Option<DeviceEvents>>,
    pub fail_open: AtomicBool,
    pub fail_preview: AtomicBool,
    pub fail_take_picture: AtomicBool,
    pub fail_reconnect: AtomicBool,
    /// Milliseconds `take_picture` blocks before returning.
    pub take_picture_delay_ms: AtomicU64,
    parameters: Mutex<Option<DeviceParameters>>,
}

impl FakeCamera {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn position(&self, call: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    /// Calls recorded after the last occurrence of `call`.
    pub fn calls_after(&self, call: &str) -> Vec<String> {
        let calls = self.calls();
        match calls.iter().rposition(|c| c == call) {
            Some(at) => calls[at + 1..].to_vec(),
            None => panic!("{call} never happened; saw {calls:?}"),
        }
    }

    pub fn events(&self) -> DeviceEvents {
        self.events.lock().unwrap().clone().expect("camera was never opened")
    }

    pub fn parameters(&self) -> Option<DeviceParameters> {
        self.parameters.lock().unwrap().clone()
    }

    pub fn expose(&self) {
        self.events().picture_exposed();
    }

    pub fn deliver(&self) {
        self.events().picture_captured(small_jpeg());
    }

    pub fn info() -> CameraInfo {
        CameraInfo {
            index: 0,
            id: "fake:0".into(),
            name: "Fake Camera".into(),
            facing: CameraFacing::Back,
            orientation: 90,
        }
    }

    pub fn capabilities() -> DeviceCapabilities {
        DeviceCapabilities {
            preview_sizes: vec![Size::new(320, 240), Size::new(640, 480), Size::new(1280, 720)],
            picture_sizes: vec![Size::new(640, 480), Size::new(1280, 720), Size::new(1920, 1080)],
            preferred_preview_size_for_video: Some(Size::new(1280, 720)),
            preview_formats: vec![PixelFormat::Nv21, PixelFormat::Rgb8],
            fps_ranges: vec![FpsRange { min: 15, max: 30 }],
        }
    }
}

pub struct FakeDriver(pub Arc<FakeCamera>);

impl dogma::Named for FakeDriver {
    fn name(&self) -> Cow<'_, str> {
        "fake".into()
    }
}

impl CameraDriver for FakeDriver {
    fn cameras(&self) -> DeviceResult<Vec<CameraInfo>> {
        Ok(vec![FakeCamera::info()])
    }

    fn open(&self, index: usize, events: DeviceEvents) -> DeviceResult<Box<dyn NativeCameraDevice>> {
        self.0.record("open");
        if self.0.fail_open.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied);
        }
        if index != 0 {
            return Err(DeviceError::NoCamera);
        }
        *self.0.events.lock().unwrap() = Some(events);
        Ok(Box::new(FakeDevice {
            camera: Arc::clone(&self.0),
            info: FakeCamera::info(),
            capabilities: FakeCamera::capabilities(),
            parameters: DeviceParameters {
                preview_size: Size::new(640, 480),
                preview_format: PixelFormat::Rgb8,
                preview_fps: Some(FpsRange { min: 15, max: 30 }),
                picture_size: Size::new(640, 480),
                jpeg_quality: 90,
                rotation: 0,
                display_orientation: 0,
            },
        }))
    }
}

struct FakeDevice {
    camera: Arc<FakeCamera>,
    info: CameraInfo,
    capabilities: DeviceCapabilities,
    parameters: DeviceParameters,
}

impl NativeCameraDevice for FakeDevice {
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
        self.camera.record("set_parameters");
        self.parameters = params.clone();
        *self.camera.parameters.lock().unwrap() = Some(params.clone());
        Ok(())
    }

    fn set_preview_target(&mut self, target: PreviewTarget) -> DeviceResult<()> {
        match target {
            PreviewTarget::Detached => self.camera.record("detach_preview_target"),
            PreviewTarget::Surface(_) => self.camera.record("set_preview_target"),
        }
        Ok(())
    }

    fn start_preview(&mut self) -> DeviceResult<()> {
        self.camera.record("start_preview");
        if self.camera.fail_preview.load(Ordering::SeqCst) {
            return Err(DeviceError::other("preview refused"));
        }
        Ok(())
    }

    fn stop_preview(&mut self) {
        self.camera.record("stop_preview");
    }

    fn take_picture(&mut self) -> DeviceResult<()> {
        self.camera.record("take_picture");
        let delay = self.camera.take_picture_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.camera.fail_take_picture.load(Ordering::SeqCst) {
            return Err(DeviceError::other("shutter jammed"));
        }
        Ok(())
    }

    fn last_preview_frame(&mut self) -> Option<Frame> {
        self.camera.record("last_preview_frame");
        Some(Frame::new_rgb8(Bytes::from(vec![128u8; 4 * 2 * 3]), 4, 2, 12))
    }

    fn notify_new_frames(&mut self, enabled: bool) {
        self.camera.record(format!("notify_new_frames({enabled})"));
    }

    fn lock(&mut self) -> DeviceResult<()> {
        self.camera.record("lock");
        Ok(())
    }

    fn unlock(&mut self) -> DeviceResult<()> {
        self.camera.record("unlock");
        Ok(())
    }

    fn reconnect(&mut self) -> DeviceResult<()> {
        self.camera.record("reconnect");
        if self.camera.fail_reconnect.load(Ordering::SeqCst) {
            return Err(DeviceError::other("camera taken by another process"));
        }
        Ok(())
    }

    fn recorder_handle(&self) -> NativeHandle {
        NativeHandle::new(String::from("fake-recorder"))
    }

    fn release(&mut self) {
        self.camera.record("release");
    }
}

/// A video output whose readiness the test controls.
#[derive(Default)]
pub struct FakeVideoOutput {
    ready: AtomicBool,
    running: AtomicBool,
    size: Mutex<Option<Size>>,
    notifier: Mutex<Option<ReadyNotifier>>,
}

impl FakeVideoOutput {
    pub fn new(ready: bool) -> Arc<Self> {
        let output = Self::default();
        output.ready.store(ready, Ordering::SeqCst);
        Arc::new(output)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
        if let Some(notifier) = self.notifier.lock().unwrap().as_ref() {
            notifier.notify(ready);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl VideoOutput for FakeVideoOutput {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn preview_target(&self) -> PreviewTarget {
        PreviewTarget::Surface(NativeHandle::new(7u32))
    }

    fn video_size(&self) -> Option<Size> {
        *self.size.lock().unwrap()
    }

    fn set_video_size(&self, size: Size) {
        *self.size.lock().unwrap() = Some(size);
    }

    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn reset(&self) {
        *self.size.lock().unwrap() = None;
    }

    fn subscribe_ready(&self, notifier: ReadyNotifier) {
        *self.notifier.lock().unwrap() = Some(notifier);
    }
}

pub struct Harness {
    pub camera: Arc<FakeCamera>,
    pub session: CameraSession,
    pub dir: PathBuf,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let camera = FakeCamera::new();
        let dir = scratch_dir();
        let session = CameraSession::new(
            Arc::new(FakeDriver(Arc::clone(&camera))),
            config,
            Arc::new(DirectoryStorage::new(&dir)),
        )
        .unwrap();
        Self {
            camera,
            session,
            dir,
        }
    }

    /// Binds a ready output and waits until the preview runs.
    pub fn activate(&self) -> Arc<FakeVideoOutput> {
        let output = FakeVideoOutput::new(true);
        let dyn_output: Arc<dyn VideoOutput> = output.clone();
        self.session.bind_video_output(&dyn_output);
        self.session.set_state(asimov_camera_session::shared::CameraState::Active);
        self.wait_for(|e| matches!(e, SessionEvent::ReadyForCaptureChanged(true)));
        output
    }

    /// Consumes events until one matches, returning it together with everything before it.
    pub fn wait_for(&self, mut pred: impl FnMut(&SessionEvent) -> bool) -> (SessionEvent, Vec<SessionEvent>) {
        let deadline = Instant::now() + WAIT;
        let mut seen = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.session.events().recv_timeout(left) {
                Ok(event) if pred(&event) => return (event, seen),
                Ok(event) => seen.push(event),
                Err(RecvTimeoutError::Timeout) => panic!("timed out; saw {seen:?}"),
                Err(RecvTimeoutError::Disconnected) => panic!("session gone; saw {seen:?}"),
            }
        }
    }

    /// Collects whatever arrives within `window`.
    pub fn drain(&self, window: Duration) -> Vec<SessionEvent> {
        let deadline = Instant::now() + window;
        let mut seen = Vec::new();
        while let Ok(event) = self
            .session
            .events()
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
        {
            seen.push(event);
        }
        seen
    }

    /// Polls `cond` until it holds.
    pub fn until(&self, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition never held");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn scratch_dir() -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    std::env::temp_dir().join(format!(
        "asimov-camera-session-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::SeqCst)
    ))
}

pub fn small_jpeg() -> Bytes {
    let mut jpeg = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 80)
        .encode(&[200u8; 8 * 6 * 3], 8, 6, image::ExtendedColorType::Rgb8)
        .unwrap();
    Bytes::from(jpeg)
}
