// This is free and unencumbered software released into the public domain.

use crate::shared::{
    CameraDriver, CameraInfo, CameraState, CaptureController, CaptureId, CaptureOptions,
    CaptureStatus, CapturedOutcome, Dependency, DeviceCapabilities, DeviceError, DeviceParameters,
    ErrorCode, FailureOutcome, Frame, FrameProbes, FrameSink, ImageSettings, NativeHandle,
    PendingOperationStore, PixelFormat, PreviewTarget, ProbeId, ReadyNotifier, SessionConfig,
    SessionError, SessionEvent, SessionState, Size, Storage, TargetState, VideoOutput,
    actor::{ActorRequest, CameraActor},
    camera_rotation, capture_error,
    events::{DeviceEvent, Inbound},
    normalize_rotation, preview_size_for, process_captured_image, process_preview_image,
    recorder_orientation_hint, spawn_post_processing,
};
use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicBool, AtomicU8, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, trace, warn};

/// Exclusive device access lent to a recorder by [`CameraSession::begin_recorder_handoff`].
#[derive(Clone, Debug)]
pub struct RecorderHandoff {
    pub handle: NativeHandle,
    /// Rotation the recorder should tag its output with.
    pub orientation_hint: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum PendingOp {
    StartPreview,
    ApplyImageSettings,
    AdjustPreviewSize(Size),
}

/// What the session knows about the open device.
#[derive(Debug)]
struct OpenDevice {
    info: CameraInfo,
    capabilities: DeviceCapabilities,
    parameters: DeviceParameters,
}

struct SessionCore {
    config: SessionConfig,
    driver: Arc<dyn CameraDriver>,
    storage: Arc<dyn Storage>,
    status: Arc<AtomicU8>,
    events: Sender<SessionEvent>,
    inbound: Sender<Inbound>,
    probes: FrameProbes,

    target: TargetState,
    actor: Option<CameraActor>,
    generation: u64,
    device: Option<OpenDevice>,

    video_output: Option<Weak<dyn VideoOutput>>,
    binding: u64,

    preview_started: bool,
    ready_for_capture: bool,
    tracking_rotation: bool,
    device_rotation: u32,

    image_settings: ImageSettings,
    settings_dirty: bool,
    preview_hint: Option<Size>,

    pending: PendingOperationStore<PendingOp>,
    capture: CaptureController,
    handoff_active: bool,
    /// The preview was stopped while a recorder held the device.
    detach_on_reconnect: bool,

    suspended: bool,
    saved_target: Option<TargetState>,
}

/// The caller-facing camera session.
///
/// Owns at most one camera at a time. All native work runs on the camera's
/// owner thread; native events are folded back in by a dispatcher thread and
/// surface as [`SessionEvent`]s on [`events`](Self::events).
///
/// `VideoOutput` and `Storage` implementations are called while the session
/// is locked and must not call back into the session, except for
/// [`state`](Self::state).
pub struct CameraSession {
    core: Arc<Mutex<SessionCore>>,
    status: Arc<AtomicU8>,
    events_rx: Receiver<SessionEvent>,
    inbound: Sender<Inbound>,
    stop: Arc<AtomicBool>,
    dispatcher: Option<JoinHandle<()>>,
}

impl fmt::Debug for CameraSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraSession")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CameraSession {
    pub fn new(
        driver: Arc<dyn CameraDriver>,
        config: SessionConfig,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, SessionError> {
        let (events_tx, events_rx) = mpsc::channel();
        let (inbound_tx, inbound_rx) = mpsc::channel();
        let status = Arc::new(AtomicU8::new(SessionState::Closed as u8));

        let core = Arc::new(Mutex::new(SessionCore {
            image_settings: config.image_settings.clone(),
            config,
            driver,
            storage,
            status: Arc::clone(&status),
            events: events_tx,
            inbound: inbound_tx.clone(),
            probes: FrameProbes::default(),
            target: TargetState::Unloaded,
            actor: None,
            generation: 0,
            device: None,
            video_output: None,
            binding: 0,
            preview_started: false,
            ready_for_capture: false,
            tracking_rotation: false,
            device_rotation: 0,
            settings_dirty: true,
            preview_hint: None,
            pending: PendingOperationStore::new(),
            capture: CaptureController::new(),
            handoff_active: false,
            detach_on_reconnect: false,
            suspended: false,
            saved_target: None,
        }));

        let stop = Arc::new(AtomicBool::new(false));
        let dispatcher = {
            let core = Arc::clone(&core);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("camera-session-events".into())
                .spawn(move || dispatch_loop(core, inbound_rx, stop))
                .map_err(|e| SessionError::resource(format!("cannot spawn dispatcher: {e}")))?
        };

        Ok(Self {
            core,
            status,
            events_rx,
            inbound: inbound_tx,
            stop,
            dispatcher: Some(dispatcher),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The outward event stream.
    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events_rx
    }

    /// Current status; never blocks.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn camera_state(&self) -> CameraState {
        self.state().camera_state()
    }

    pub fn target_state(&self) -> TargetState {
        self.lock().target
    }

    /// Opens the camera without starting the preview.
    pub fn open(&self) {
        let mut core = self.lock();
        if core.target == TargetState::Unloaded {
            core.set_state(TargetState::Loaded);
        }
    }

    pub fn close(&self) {
        self.lock().set_state(TargetState::Unloaded);
    }

    pub fn set_state(&self, target: TargetState) {
        self.lock().set_state(target);
    }

    pub fn bind_video_output(&self, output: &Arc<dyn VideoOutput>) {
        self.lock().bind_video_output(output);
    }

    pub fn unbind_video_output(&self) {
        self.lock().unbind_video_output();
    }

    /// Re-selects the preview size to suit stills of `capture_size`.
    pub fn adjust_preview_size(&self, capture_size: Size) {
        self.lock().adjust_preview_size(capture_size);
    }

    /// Starts a still capture and returns its id.
    ///
    /// Refusals still consume an id and are reported as `ImageCaptureError`.
    pub fn capture(&self, options: CaptureOptions) -> CaptureId {
        self.lock().capture(options)
    }

    /// Cancels the in-flight capture if it has not been exposed yet.
    pub fn cancel_capture(&self) -> bool {
        self.lock().capture.cancel()
    }

    pub fn capture_status(&self, id: CaptureId) -> Option<CaptureStatus> {
        self.lock()
            .capture
            .current()
            .filter(|r| r.id == id)
            .map(|r| r.status)
    }

    pub fn apply_image_settings(&self, settings: ImageSettings) -> Result<(), SessionError> {
        self.lock().apply_image_settings(settings)
    }

    pub fn image_settings(&self) -> ImageSettings {
        self.lock().image_settings.clone()
    }

    pub fn begin_recorder_handoff(&self) -> Result<RecorderHandoff, SessionError> {
        self.lock().begin_recorder_handoff()
    }

    pub fn end_recorder_handoff(&self) -> Result<(), SessionError> {
        self.lock().end_recorder_handoff()
    }

    pub fn is_recorder_handoff_active(&self) -> bool {
        self.lock().handoff_active
    }

    /// Reports the physical device rotation in degrees.
    pub fn set_device_rotation(&self, degrees: i32) {
        self.lock().set_device_rotation(degrees);
    }

    /// Rotation applied to camera output for the current device rotation.
    pub fn camera_rotation(&self) -> Option<u32> {
        let core = self.lock();
        core.device.as_ref().map(|_| core.camera_rotation())
    }

    pub fn application_suspended(&self) {
        self.lock().application_suspended();
    }

    pub fn application_resumed(&self) {
        self.lock().application_resumed();
    }

    pub fn set_keep_alive(&self, enabled: bool) {
        self.lock().config.keep_alive = enabled;
    }

    pub fn add_frame_probe(&self, sink: FrameSink) -> ProbeId {
        let core = self.lock();
        core.probes.add(sink, |wanted| {
            if let Some(actor) = core.actor.as_ref().filter(|_| !core.handoff_active) {
                actor.post(ActorRequest::NotifyNewFrames(wanted));
            }
        })
    }

    pub fn remove_frame_probe(&self, id: ProbeId) -> bool {
        let core = self.lock();
        core.probes.remove(id, |wanted| {
            if let Some(actor) = core.actor.as_ref().filter(|_| !core.handoff_active) {
                actor.post(ActorRequest::NotifyNewFrames(wanted));
            }
        })
    }

    pub fn is_ready_for_capture(&self) -> bool {
        self.lock().is_ready_for_capture()
    }

    pub fn camera_info(&self) -> Option<CameraInfo> {
        self.lock().device.as_ref().map(|d| d.info.clone())
    }

    pub fn parameters(&self) -> Option<DeviceParameters> {
        self.lock().device.as_ref().map(|d| d.parameters.clone())
    }

    pub fn driver_name(&self) -> String {
        self.lock().driver.name().into_owned()
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.lock().set_state(TargetState::Unloaded);
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.inbound.send(Inbound::Stop);
        if let Some(join) = self.dispatcher.take() {
            let _ = join.join();
        }
    }
}

fn dispatch_loop(core: Arc<Mutex<SessionCore>>, rx: Receiver<Inbound>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(Inbound::Stop) => break,
            Ok(item) => core.lock().unwrap_or_else(|p| p.into_inner()).apply(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

impl SessionCore {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn error(&self, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        warn!(target: "asimov_camera_session", %code, %message, "session error");
        self.emit(SessionEvent::Error { code, message });
    }

    fn status(&self) -> SessionState {
        SessionState::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&mut self, status: SessionState) {
        let old = self.status();
        if old == status {
            return;
        }
        self.status.store(status as u8, Ordering::Release);
        debug!(target: "asimov_camera_session", from = %old, to = %status, "status changed");
        self.emit(SessionEvent::StatusChanged(status));
        if old.camera_state() != status.camera_state() {
            self.emit(SessionEvent::StateChanged(status.camera_state()));
        }
    }

    fn set_ready(&mut self, ready: bool) {
        if self.ready_for_capture == ready {
            return;
        }
        self.ready_for_capture = ready;
        self.emit(SessionEvent::ReadyForCaptureChanged(ready));
    }

    fn is_ready_for_capture(&self) -> bool {
        self.status() == SessionState::Active && self.ready_for_capture
    }

    fn video_output(&self) -> Option<Arc<dyn VideoOutput>> {
        self.video_output.as_ref().and_then(Weak::upgrade)
    }

    fn camera_rotation(&self) -> u32 {
        match self.device.as_ref() {
            Some(dev) => camera_rotation(dev.info.orientation, self.device_rotation, dev.info.facing),
            None => 0,
        }
    }

    fn post(&self, request: ActorRequest) {
        if let Some(actor) = self.actor.as_ref() {
            actor.post(request);
        }
    }

    /// Pushes `parameters` to the device if they differ from the current ones.
    fn push_parameters(&mut self, parameters: DeviceParameters, restart_preview: bool) {
        let Some(dev) = self.device.as_mut() else {
            return;
        };
        if dev.parameters == parameters {
            return;
        }
        dev.parameters = parameters.clone();
        self.post(ActorRequest::Configure {
            parameters,
            restart_preview,
        });
    }

    // State machine

    fn set_state(&mut self, target: TargetState) {
        if self.suspended {
            debug!(target: "asimov_camera_session", ?target, "suspended, recording requested state");
            self.saved_target = Some(target);
            return;
        }
        if self.target == target {
            return;
        }

        info!(target: "asimov_camera_session", from = %self.target, to = %target, "state requested");
        match target {
            TargetState::Unloaded => {
                self.target = target;
                self.close_device();
            },
            TargetState::Loaded | TargetState::Active => {
                if self.actor.is_none() && !self.open_device() {
                    return;
                }
                self.target = target;
                if target == TargetState::Active {
                    self.start_preview();
                } else {
                    self.stop_preview();
                }
            },
        }
    }

    fn open_device(&mut self) -> bool {
        self.generation += 1;
        self.set_status(SessionState::Loading);
        match CameraActor::spawn(
            Arc::clone(&self.driver),
            self.config.camera_index,
            self.generation,
            self.inbound.clone(),
            self.probes.clone(),
            self.config.blocking_timeout,
        ) {
            Ok(actor) => {
                self.actor = Some(actor);
                true
            },
            Err(err) => {
                warn!(target: "asimov_camera_session", %err, "cannot start camera thread");
                self.set_status(SessionState::Closed);
                self.error(ErrorCode::Camera, "Failed to open camera");
                false
            },
        }
    }

    fn close_device(&mut self) {
        if self.actor.is_none() {
            return;
        }

        self.stop_preview();

        if let Some(id) = self.capture.abort() {
            self.emit(capture_error(id, ErrorCode::Resource, "Camera closed during capture"));
        }
        self.pending.clear();
        self.set_ready(false);
        self.settings_dirty = true;
        self.handoff_active = false;
        self.detach_on_reconnect = false;
        self.device = None;

        if let Some(mut actor) = self.actor.take() {
            actor.shutdown();
        }
        self.set_status(SessionState::Closed);
    }

    fn start_preview(&mut self) {
        if self.target != TargetState::Active || self.preview_started {
            return;
        }

        let Some(output) = self.video_output().filter(|o| o.is_ready()) else {
            debug!(target: "asimov_camera_session", "preview waits for a ready video output");
            self.pending.defer_once(PendingOp::StartPreview, Dependency::VideoOutputReady);
            return;
        };
        if self.device.is_none() {
            self.pending.defer_once(PendingOp::StartPreview, Dependency::MediaBound);
            return;
        }
        if self.handoff_active {
            self.pending.defer_once(PendingOp::StartPreview, Dependency::RecorderReady);
            return;
        }

        self.post(ActorRequest::SetPreviewTarget(output.preview_target()));
        self.set_status(SessionState::Starting);

        self.apply_image_settings_now();
        let capture_size = self.capture_size();
        self.adjust_preview_size_now(capture_size, false);

        let rotation = self.camera_rotation();
        if let Some(mut params) = self.device.as_ref().map(|d| d.parameters.clone()) {
            params.display_orientation = rotation;
            self.push_parameters(params, false);
        }

        self.tracking_rotation = self.config.track_rotation;
        self.post(ActorRequest::StartPreview);
        self.preview_started = true;
    }

    fn stop_preview(&mut self) {
        if self.device.is_none() || !self.preview_started {
            return;
        }

        self.set_status(SessionState::Stopping);
        self.tracking_rotation = false;
        if !self.handoff_active {
            self.post(ActorRequest::StopPreview);
        }
        self.detach_preview();
        self.set_ready(false);
        self.set_status(SessionState::Loaded);
    }

    /// Forgets the preview surface and size so the next start reconfigures both.
    fn detach_preview(&mut self) {
        if self.handoff_active {
            // The recorder owns the device until it is reconnected.
            self.detach_on_reconnect = true;
        } else {
            if let Some(mut params) = self.device.as_ref().map(|d| d.parameters.clone()) {
                params.preview_size = Size::default();
                self.push_parameters(params, false);
            }
            self.post(ActorRequest::SetPreviewTarget(PreviewTarget::Detached));
        }
        self.release_output();
    }

    fn release_output(&mut self) {
        if let Some(output) = self.video_output() {
            output.stop();
            output.reset();
        }
        self.preview_started = false;
    }

    fn application_suspended(&mut self) {
        if self.suspended || self.config.keep_alive {
            return;
        }
        info!(target: "asimov_camera_session", "application suspended, releasing camera");
        self.saved_target = Some(self.target);
        self.target = TargetState::Unloaded;
        self.close_device();
        self.suspended = true;
    }

    fn application_resumed(&mut self) {
        if !self.suspended {
            return;
        }
        self.suspended = false;
        if let Some(target) = self.saved_target.take() {
            info!(target: "asimov_camera_session", %target, "application resumed, restoring state");
            self.set_state(target);
        }
    }

    // Video output

    fn bind_video_output(&mut self, output: &Arc<dyn VideoOutput>) {
        if let Some(current) = self.video_output() {
            if Arc::ptr_eq(&current, output) {
                return;
            }
        }
        self.release_video_output();

        self.binding += 1;
        self.video_output = Some(Arc::downgrade(output));
        output.subscribe_ready(ReadyNotifier::new(self.binding, self.inbound.clone()));
        if output.is_ready() {
            self.on_video_output_ready(true);
        }
    }

    fn unbind_video_output(&mut self) {
        self.release_video_output();
        self.video_output = None;
        self.binding += 1;
    }

    fn release_video_output(&mut self) {
        if self.preview_started {
            self.stop_preview();
            self.pending.defer_once(PendingOp::StartPreview, Dependency::VideoOutputReady);
        }
        if let Some(old) = self.video_output() {
            old.stop();
            old.reset();
        }
    }

    fn on_video_output_ready(&mut self, ready: bool) {
        debug!(target: "asimov_camera_session", ready, "video output readiness");
        if ready {
            self.resolve(Dependency::VideoOutputReady);
        }
    }

    // Pending operations

    fn resolve(&mut self, dependency: Dependency) {
        for op in self.pending.resolve(dependency) {
            trace!(target: "asimov_camera_session", %dependency, ?op, "replaying");
            self.replay(op);
        }
    }

    fn replay(&mut self, op: PendingOp) {
        match op {
            PendingOp::StartPreview => self.start_preview(),
            PendingOp::ApplyImageSettings => self.reapply_image_settings(),
            PendingOp::AdjustPreviewSize(size) => self.adjust_preview_size(size),
        }
    }

    // Image settings and preview size

    fn capture_size(&self) -> Option<Size> {
        self.preview_hint
            .or_else(|| self.device.as_ref().map(|d| d.parameters.picture_size))
            .filter(Size::is_valid)
    }

    fn apply_image_settings(&mut self, settings: ImageSettings) -> Result<(), SessionError> {
        settings.validate()?;
        if self.image_settings != settings {
            if self.image_settings.resolution != settings.resolution {
                self.preview_hint = None;
            }
            self.image_settings = settings;
            self.settings_dirty = true;
        }

        if self.device.is_none() {
            return Ok(());
        }
        if self.handoff_active {
            self.pending
                .defer_once(PendingOp::ApplyImageSettings, Dependency::RecorderReady);
            return Ok(());
        }
        self.reapply_image_settings();
        Ok(())
    }

    fn reapply_image_settings(&mut self) {
        self.apply_image_settings_now();
        if self.ready_for_capture {
            let capture_size = self.capture_size();
            self.adjust_preview_size_now(capture_size, true);
        }
    }

    fn apply_image_settings_now(&mut self) {
        if !self.settings_dirty {
            return;
        }
        let Some(dev) = self.device.as_ref() else {
            return;
        };

        let mut params = dev.parameters.clone();
        if let Some(size) = self.image_settings.picture_size(&dev.capabilities) {
            params.picture_size = size;
        }
        params.jpeg_quality = self.image_settings.quality.jpeg_quality();
        self.push_parameters(params, false);
        self.settings_dirty = false;
    }

    fn adjust_preview_size(&mut self, capture_size: Size) {
        self.preview_hint = Some(capture_size).filter(Size::is_valid);
        match self.status() {
            SessionState::Closed => {},
            SessionState::Loading => {
                self.pending
                    .defer(PendingOp::AdjustPreviewSize(capture_size), Dependency::MediaBound);
            },
            _ if self.handoff_active => {
                self.pending
                    .defer(PendingOp::AdjustPreviewSize(capture_size), Dependency::RecorderReady);
            },
            _ => self.adjust_preview_size_now(self.preview_hint, true),
        }
    }

    fn adjust_preview_size_now(&mut self, capture_size: Option<Size>, restart_preview: bool) {
        let Some(dev) = self.device.as_ref() else {
            return;
        };

        let Some(mut preview) = preview_size_for(&dev.capabilities, capture_size) else {
            warn!(target: "asimov_camera_session", ?capture_size, "no preview size suits the capture size");
            return;
        };

        let mut output_size = preview;
        if matches!(self.camera_rotation(), 90 | 270) {
            output_size = preview.transposed();
            if dev.capabilities.preview_sizes.contains(&output_size) {
                preview = output_size;
            }
        }

        let mut params = dev.parameters.clone();
        params.preview_size = preview;
        if params.preview_format != PixelFormat::Nv21
            && dev.capabilities.preview_formats.contains(&PixelFormat::Nv21)
        {
            params.preview_format = PixelFormat::Nv21;
        }
        let unchanged = params == dev.parameters;

        if let Some(output) = self.video_output() {
            if output.video_size() != Some(output_size) {
                output.set_video_size(output_size);
            }
        }
        if unchanged {
            return;
        }

        debug!(target: "asimov_camera_session", %preview, %output_size, "adjusting preview size");
        let restart = restart_preview && self.preview_started;
        self.push_parameters(params, restart);
    }

    fn set_device_rotation(&mut self, degrees: i32) {
        let rotation = normalize_rotation(degrees);
        if rotation == self.device_rotation {
            return;
        }
        self.device_rotation = rotation;
        if !self.tracking_rotation || !self.preview_started || self.handoff_active {
            return;
        }

        let camera_rotation = self.camera_rotation();
        if let Some(mut params) = self.device.as_ref().map(|d| d.parameters.clone()) {
            params.display_orientation = camera_rotation;
            self.push_parameters(params, false);
        }
        let capture_size = self.capture_size();
        self.adjust_preview_size_now(capture_size, true);
    }

    // Capture

    fn capture(&mut self, options: CaptureOptions) -> CaptureId {
        let id = self.capture.next_id();

        if self.handoff_active {
            self.emit(capture_error(id, ErrorCode::Resource, "Camera is in use by a recorder"));
            return id;
        }
        if !self.is_ready_for_capture() {
            self.emit(capture_error(id, ErrorCode::NotReady, "Camera not ready"));
            return id;
        }
        if let Err(err) = self.capture.begin(id, options) {
            self.emit(capture_error(id, err.code(), err.to_string()));
            return id;
        }

        debug!(target: "asimov_camera_session", %id, "capturing");
        self.set_ready(false);

        self.apply_image_settings_now();
        let capture_size = self.capture_size();
        self.adjust_preview_size_now(capture_size, true);

        let rotation = self.camera_rotation();
        if let Some(mut params) = self.device.as_ref().map(|d| d.parameters.clone()) {
            params.rotation = rotation;
            self.push_parameters(params, false);
        }

        let result = match self.actor.as_ref() {
            Some(actor) => actor.call(ActorRequest::TakePicture),
            None => Err(SessionError::Closed),
        };
        if let Err(err) = result {
            warn!(target: "asimov_camera_session", %id, %err, "take picture failed");
            if matches!(err, SessionError::Timeout(_)) {
                // The owner thread is still busy; queue the restart behind it.
                self.post(ActorRequest::RestartPreview);
            }
            self.on_take_picture_failed();
        }
        id
    }

    fn on_take_picture_failed(&mut self) {
        match self.capture.on_failed() {
            FailureOutcome::Report(id) => {
                self.emit(capture_error(id, ErrorCode::Resource, "Failed to capture image"));
            },
            FailureOutcome::Silent(id) => {
                debug!(target: "asimov_camera_session", %id, "canceled capture failed");
            },
            FailureOutcome::Stray => {},
        }
    }

    fn on_picture_exposed(&mut self) {
        if let Some(id) = self.capture.on_exposed() {
            self.emit(SessionEvent::ImageExposed(id));
            self.post(ActorRequest::FetchLastPreviewFrame(id));
        }
    }

    fn on_picture_captured(&mut self, jpeg: bytes::Bytes) {
        match self.capture.on_captured() {
            CapturedOutcome::Deliver { id, options } => {
                let storage = Arc::clone(&self.storage);
                spawn_post_processing(id, &self.events, move |tx| {
                    process_captured_image(id, jpeg, &options, &storage, tx)
                });
            },
            CapturedOutcome::Discard(id) => {
                debug!(target: "asimov_camera_session", %id, "discarding canceled capture");
            },
            CapturedOutcome::Stray => {
                warn!(target: "asimov_camera_session", "picture captured with no capture in flight");
            },
        }
    }

    fn on_last_preview_frame(&mut self, id: CaptureId, frame: Option<Frame>) {
        if !self.capture.wants_preview_frame(id) {
            return;
        }
        let (Some(frame), Some(dev)) = (frame, self.device.as_ref()) else {
            debug!(target: "asimov_camera_session", %id, "no preview frame to deliver");
            return;
        };
        let rotation = dev.parameters.rotation;
        let facing = dev.info.facing;
        spawn_post_processing(id, &self.events, move |tx| {
            process_preview_image(id, frame, rotation, facing, tx)
        });
    }

    // Recorder hand-off

    fn begin_recorder_handoff(&mut self) -> Result<RecorderHandoff, SessionError> {
        if self.handoff_active {
            return Err(SessionError::resource("Camera is already handed off to a recorder"));
        }
        let (Some(actor), Some(dev)) = (self.actor.as_ref(), self.device.as_ref()) else {
            return Err(SessionError::not_ready("Camera is not open"));
        };
        if self.capture.is_busy() {
            return Err(SessionError::resource("A still capture is in progress"));
        }

        let handle = actor.call(ActorRequest::Unlock)?;
        let rotation = camera_rotation(dev.info.orientation, self.device_rotation, dev.info.facing);
        let orientation_hint = recorder_orientation_hint(rotation, dev.info.facing);

        self.handoff_active = true;
        self.tracking_rotation = false;
        self.set_ready(false);
        info!(target: "asimov_camera_session", orientation_hint, "camera handed off to recorder");

        Ok(RecorderHandoff {
            handle,
            orientation_hint,
        })
    }

    fn end_recorder_handoff(&mut self) -> Result<(), SessionError> {
        if !self.handoff_active {
            return Ok(());
        }
        self.handoff_active = false;

        let result = match self.actor.as_ref() {
            Some(actor) => actor.call(ActorRequest::Reconnect),
            None => Err(SessionError::Closed),
        };

        if let Err(err) = result {
            self.error(ErrorCode::Camera, format!("Could not reconnect to camera: {err}"));
            // The device did not come back; nothing more is sent to it.
            self.release_output();
            self.detach_on_reconnect = false;
            self.tracking_rotation = false;
            self.target = TargetState::Loaded;
            self.set_status(SessionState::Loaded);
            self.set_ready(false);
            let dropped = self.pending.resolve(Dependency::RecorderReady);
            debug!(target: "asimov_camera_session", dropped = dropped.len(), "dropping work queued for the recorder");
            return Err(err);
        }

        info!(target: "asimov_camera_session", "camera reclaimed from recorder");
        if self.preview_started {
            self.post(ActorRequest::StopPreview);
            let target = self
                .video_output()
                .map(|o| o.preview_target())
                .unwrap_or_default();
            self.post(ActorRequest::SetPreviewTarget(target));
            self.post(ActorRequest::StartPreview);
            self.tracking_rotation = self.config.track_rotation;
        } else if self.detach_on_reconnect {
            self.detach_on_reconnect = false;
            self.detach_preview();
        }
        self.post(ActorRequest::NotifyNewFrames(self.probes.wants_frames()));
        self.resolve(Dependency::RecorderReady);
        Ok(())
    }

    // Device events

    fn apply(&mut self, item: Inbound) {
        match item {
            Inbound::Device { generation, event } => {
                if self.actor.as_ref().map(CameraActor::generation) != Some(generation) {
                    trace!(target: "asimov_camera_session", generation, "dropping stale device event");
                    return;
                }
                self.on_device_event(event);
            },
            Inbound::VideoOutputReady { binding, ready } => {
                if binding == self.binding {
                    self.on_video_output_ready(ready);
                }
            },
            Inbound::Stop => {},
        }
    }

    fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Opened {
                info,
                capabilities,
                parameters,
            } => self.on_opened(info, capabilities, parameters),
            DeviceEvent::OpenFailed(err) => self.on_open_failed(err),
            DeviceEvent::PreviewStarted => self.on_preview_started(),
            DeviceEvent::PreviewFailedToStart(err) => self.on_preview_failed(err),
            DeviceEvent::PreviewStopped => {
                if self.status() == SessionState::Stopping {
                    self.set_status(SessionState::Loaded);
                }
                self.set_ready(false);
            },
            DeviceEvent::PictureExposed => self.on_picture_exposed(),
            DeviceEvent::PictureCaptured(jpeg) => self.on_picture_captured(jpeg),
            DeviceEvent::TakePictureFailed(err) => {
                warn!(target: "asimov_camera_session", %err, "native capture failed");
                self.on_take_picture_failed();
            },
            DeviceEvent::LastPreviewFrameFetched { id, frame } => self.on_last_preview_frame(id, frame),
            DeviceEvent::Failed(err) => self.error(err.code(), err.to_string()),
        }
    }

    fn on_opened(&mut self, info: CameraInfo, capabilities: DeviceCapabilities, parameters: DeviceParameters) {
        if self.status() != SessionState::Loading {
            return;
        }
        info!(target: "asimov_camera_session", camera = %info.name, facing = ?info.facing, "camera loaded");

        let mut wanted = parameters.clone();
        if capabilities.preview_formats.contains(&PixelFormat::Nv21) {
            wanted.preview_format = PixelFormat::Nv21;
        }
        self.device = Some(OpenDevice {
            info,
            capabilities,
            parameters,
        });
        self.push_parameters(wanted, false);
        self.post(ActorRequest::NotifyNewFrames(self.probes.wants_frames()));
        self.settings_dirty = true;
        self.apply_image_settings_now();

        self.set_status(SessionState::Loaded);
        self.resolve(Dependency::MediaBound);
    }

    fn on_open_failed(&mut self, err: DeviceError) {
        if self.status() != SessionState::Loading {
            return;
        }
        warn!(target: "asimov_camera_session", %err, "open failed");
        if let Some(mut actor) = self.actor.take() {
            actor.shutdown();
        }
        self.pending.clear();
        self.target = TargetState::Unloaded;
        self.set_status(SessionState::Closed);
        self.error(ErrorCode::Camera, "Failed to open camera");
    }

    fn on_preview_started(&mut self) {
        if self.status() == SessionState::Starting {
            self.set_status(SessionState::Active);
            if let Some(output) = self.video_output() {
                output.start();
            }
        }
        if self.status() == SessionState::Active && !self.handoff_active && !self.capture.is_busy() {
            self.set_ready(true);
        }
    }

    fn on_preview_failed(&mut self, err: DeviceError) {
        if !matches!(self.status(), SessionState::Starting | SessionState::Active) {
            return;
        }
        warn!(target: "asimov_camera_session", %err, "preview failed to start");
        self.error(ErrorCode::Camera, "Camera preview failed to start.");
        self.tracking_rotation = false;
        self.detach_preview();
        self.target = TargetState::Loaded;
        self.set_status(SessionState::Loaded);
        self.set_ready(false);
    }
}
