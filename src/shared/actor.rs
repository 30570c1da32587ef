// This is free and unencumbered software released into the public domain.

//! The owner thread of one native camera device.
//!
//! Every native call happens here, one request at a time, in the order the
//! requests were queued.

use crate::shared::{
    CameraDriver, CaptureId, DeviceEvents, DeviceParameters, FrameProbes,
    NativeCameraDevice, NativeHandle, PreviewTarget, SessionError,
    events::{DeviceEvent, Inbound},
};
use std::{
    fmt,
    sync::{
        Arc,
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, trace, warn};

pub(crate) type Reply<T> = Sender<Result<T, SessionError>>;

pub(crate) enum ActorRequest {
    Open { index: usize },
    Configure { parameters: DeviceParameters, restart_preview: bool },
    SetPreviewTarget(PreviewTarget),
    StartPreview,
    /// Brings the preview back after a still, unless it was stopped meanwhile.
    RestartPreview,
    StopPreview,
    NotifyNewFrames(bool),
    FetchLastPreviewFrame(CaptureId),
    TakePicture(Reply<()>),
    Unlock(Reply<NativeHandle>),
    Reconnect(Reply<()>),
    Shutdown,
}

impl fmt::Debug for ActorRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open { .. } => "Open",
            Self::Configure { .. } => "Configure",
            Self::SetPreviewTarget(_) => "SetPreviewTarget",
            Self::StartPreview => "StartPreview",
            Self::RestartPreview => "RestartPreview",
            Self::StopPreview => "StopPreview",
            Self::NotifyNewFrames(_) => "NotifyNewFrames",
            Self::FetchLastPreviewFrame(_) => "FetchLastPreviewFrame",
            Self::TakePicture(_) => "TakePicture",
            Self::Unlock(_) => "Unlock",
            Self::Reconnect(_) => "Reconnect",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl ActorRequest {
    /// Unblocks the caller of a request that will never run.
    fn reject(self) {
        match self {
            Self::TakePicture(reply) | Self::Reconnect(reply) => {
                let _ = reply.send(Err(SessionError::Closed));
            },
            Self::Unlock(reply) => {
                let _ = reply.send(Err(SessionError::Closed));
            },
            _ => {},
        }
    }
}

/// Caller-side handle of the owner thread.
pub(crate) struct CameraActor {
    tx: Sender<ActorRequest>,
    generation: u64,
    timeout: Duration,
    join: Option<JoinHandle<()>>,
}

impl fmt::Debug for CameraActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraActor")
            .field("generation", &self.generation)
            .field("running", &self.join.is_some())
            .finish()
    }
}

impl CameraActor {
    /// Spawns the owner thread and queues the device open.
    pub fn spawn(
        driver: Arc<dyn CameraDriver>,
        index: usize,
        generation: u64,
        inbound: Sender<Inbound>,
        probes: FrameProbes,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let (tx, rx) = mpsc::channel::<ActorRequest>();
        let events = DeviceEvents::new(generation, inbound, tx.clone(), probes);

        let join = thread::Builder::new()
            .name(format!("camera-owner-{generation}"))
            .spawn(move || OwnerLoop::new(driver, events).run(rx))
            .map_err(|e| SessionError::resource(format!("cannot spawn camera thread: {e}")))?;

        let actor = Self {
            tx,
            generation,
            timeout,
            join: Some(join),
        };
        actor.post(ActorRequest::Open { index });
        Ok(actor)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queues a request whose outcome is observed through events.
    pub fn post(&self, request: ActorRequest) {
        trace!(target: "asimov_camera_session", generation = self.generation, ?request, "post");
        if let Err(mpsc::SendError(request)) = self.tx.send(request) {
            warn!(target: "asimov_camera_session", ?request, "camera thread is gone");
        }
    }

    /// Queues a request and waits, at most the configured timeout, for its result.
    pub fn call<T>(&self, request: impl FnOnce(Reply<T>) -> ActorRequest) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(request(reply_tx))
            .map_err(|_| SessionError::Closed)?;
        match reply_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(target: "asimov_camera_session", generation = self.generation, timeout = ?self.timeout, "camera call timed out");
                Err(SessionError::Timeout(self.timeout))
            },
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::Closed),
        }
    }

    /// Drains the queue, releases the device and joins the owner thread.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(ActorRequest::Shutdown);
        if let Some(join) = self.join.take() {
            if join.thread().id() == thread::current().id() {
                return;
            }
            if join.join().is_err() {
                warn!(target: "asimov_camera_session", generation = self.generation, "camera thread panicked");
            }
        }
    }
}

impl Drop for CameraActor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct OwnerLoop {
    driver: Arc<dyn CameraDriver>,
    events: DeviceEvents,
    device: Option<Box<dyn NativeCameraDevice>>,
    preview: PreviewState,
}

/// `running` mirrors the device; `wanted` is what the session last asked for.
#[derive(Debug, Default)]
struct PreviewState {
    running: bool,
    wanted: bool,
}

impl OwnerLoop {
    fn new(driver: Arc<dyn CameraDriver>, events: DeviceEvents) -> Self {
        Self {
            driver,
            events,
            device: None,
            preview: PreviewState::default(),
        }
    }

    fn run(self, rx: Receiver<ActorRequest>) {
        // The device is released on every exit path, including a panicking request.
        let mut owner = scopeguard::guard(self, |mut owner| owner.release());

        while let Ok(request) = rx.recv() {
            if matches!(request, ActorRequest::Shutdown) {
                break;
            }
            owner.handle(request);
        }

        while let Ok(request) = rx.try_recv() {
            request.reject();
        }
    }

    fn handle(&mut self, request: ActorRequest) {
        match request {
            ActorRequest::Open { index } => self.open(index),
            ActorRequest::Shutdown => {},
            request => {
                let Some(device) = self.device.as_deref_mut() else {
                    request.reject();
                    return;
                };
                Self::dispatch(device, &self.events, &mut self.preview, request);
            },
        }
    }

    fn open(&mut self, index: usize) {
        if self.device.is_some() {
            return;
        }
        match self.driver.open(index, self.events.clone()) {
            Ok(device) => {
                debug!(target: "asimov_camera_session", index, camera = %device.info().name, "camera opened");
                self.events.post(DeviceEvent::Opened {
                    info: device.info().clone(),
                    capabilities: device.capabilities().clone(),
                    parameters: device.parameters(),
                });
                self.device = Some(device);
            },
            Err(err) => {
                warn!(target: "asimov_camera_session", index, %err, "failed to open camera");
                self.events.post(DeviceEvent::OpenFailed(err));
            },
        }
    }

    fn dispatch(
        device: &mut dyn NativeCameraDevice,
        events: &DeviceEvents,
        preview: &mut PreviewState,
        request: ActorRequest,
    ) {
        match request {
            ActorRequest::Configure {
                parameters,
                restart_preview,
            } => {
                let restart = restart_preview && preview.running;
                if restart {
                    device.stop_preview();
                }
                if let Err(err) = device.set_parameters(&parameters) {
                    events.post(DeviceEvent::Failed(err));
                }
                if restart {
                    start_preview(device, events, preview);
                }
            },
            ActorRequest::SetPreviewTarget(target) => {
                if let Err(err) = device.set_preview_target(target) {
                    events.post(DeviceEvent::Failed(err));
                }
            },
            ActorRequest::StartPreview => {
                preview.wanted = true;
                start_preview(device, events, preview);
            },
            ActorRequest::RestartPreview => {
                if preview.wanted {
                    start_preview(device, events, preview);
                } else {
                    trace!(target: "asimov_camera_session", "preview was stopped, not restarting");
                }
            },
            ActorRequest::StopPreview => {
                preview.wanted = false;
                if preview.running {
                    device.stop_preview();
                    preview.running = false;
                    events.post(DeviceEvent::PreviewStopped);
                }
            },
            ActorRequest::NotifyNewFrames(enabled) => device.notify_new_frames(enabled),
            ActorRequest::FetchLastPreviewFrame(id) => {
                let frame = device.last_preview_frame();
                events.post(DeviceEvent::LastPreviewFrameFetched { id, frame });
            },
            ActorRequest::TakePicture(reply) => {
                let result = device.take_picture();
                if result.is_err() && preview.wanted {
                    // The native layer will not deliver a picture; bring the preview back now.
                    start_preview(device, events, preview);
                }
                let _ = reply.send(result.map_err(SessionError::from));
            },
            ActorRequest::Unlock(reply) => {
                preview.wanted = false;
                if preview.running {
                    device.stop_preview();
                    preview.running = false;
                }
                let result = device.unlock().map(|()| device.recorder_handle());
                let _ = reply.send(result.map_err(SessionError::from));
            },
            ActorRequest::Reconnect(reply) => {
                let result = device.reconnect().and_then(|()| device.lock());
                let _ = reply.send(result.map_err(SessionError::from));
            },
            ActorRequest::Open { .. } | ActorRequest::Shutdown => {},
        }
    }

    fn release(&mut self) {
        if let Some(mut device) = self.device.take() {
            if self.preview.running {
                device.stop_preview();
                self.preview.running = false;
            }
            device.release();
            debug!(target: "asimov_camera_session", "camera released");
        }
    }
}

fn start_preview(device: &mut dyn NativeCameraDevice, events: &DeviceEvents, preview: &mut PreviewState) {
    match device.start_preview() {
        Ok(()) => {
            preview.running = true;
            events.post(DeviceEvent::PreviewStarted);
        },
        Err(err) => {
            preview.running = false;
            events.post(DeviceEvent::PreviewFailedToStart(err));
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::drivers::synthetic::{SyntheticCameraDriver, SyntheticRecorderHandle};

    const WAIT: Duration = Duration::from_secs(5);

    fn spawn(driver: Arc<SyntheticCameraDriver>) -> (CameraActor, Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel();
        let actor = CameraActor::spawn(driver, 0, 3, tx, FrameProbes::default(), WAIT).unwrap();
        (actor, rx)
    }

    fn next_device_event(rx: &Receiver<Inbound>) -> DeviceEvent {
        match rx.recv_timeout(WAIT).unwrap() {
            Inbound::Device { generation, event } => {
                assert_eq!(generation, 3);
                event
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn requests_run_in_queue_order() {
        let (actor, rx) = spawn(Arc::new(SyntheticCameraDriver::new()));
        assert!(matches!(next_device_event(&rx), DeviceEvent::Opened { .. }));

        actor.post(ActorRequest::StartPreview);
        actor.post(ActorRequest::StopPreview);
        assert!(matches!(next_device_event(&rx), DeviceEvent::PreviewStarted));
        assert!(matches!(next_device_event(&rx), DeviceEvent::PreviewStopped));
    }

    #[test]
    fn restart_after_stop_is_skipped() {
        let (actor, rx) = spawn(Arc::new(SyntheticCameraDriver::new()));
        assert!(matches!(next_device_event(&rx), DeviceEvent::Opened { .. }));

        actor.post(ActorRequest::StartPreview);
        actor.post(ActorRequest::StopPreview);
        actor.post(ActorRequest::RestartPreview);
        actor.post(ActorRequest::StartPreview);
        actor.post(ActorRequest::RestartPreview);
        assert!(matches!(next_device_event(&rx), DeviceEvent::PreviewStarted));
        assert!(matches!(next_device_event(&rx), DeviceEvent::PreviewStopped));
        assert!(matches!(next_device_event(&rx), DeviceEvent::PreviewStarted));
        assert!(matches!(next_device_event(&rx), DeviceEvent::PreviewStarted));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn blocking_call_returns_the_device_result() {
        let (actor, rx) = spawn(Arc::new(SyntheticCameraDriver::new()));
        assert!(matches!(next_device_event(&rx), DeviceEvent::Opened { .. }));

        let handle = actor.call(ActorRequest::Unlock).unwrap();
        let handle = handle.downcast_ref::<SyntheticRecorderHandle>().unwrap();
        assert_eq!(handle.camera_id, "synthetic:0");

        // The synthetic shutter refuses without a running preview.
        assert!(actor.call(ActorRequest::TakePicture).is_err());
    }

    #[test]
    fn calls_without_a_device_are_rejected() {
        let driver = Arc::new(SyntheticCameraDriver::new());
        driver.faults().fail_open(true);
        let (actor, rx) = spawn(driver);
        assert!(matches!(next_device_event(&rx), DeviceEvent::OpenFailed(_)));

        assert!(matches!(
            actor.call(ActorRequest::Reconnect),
            Err(SessionError::Closed)
        ));
    }

    #[test]
    fn shutdown_releases_the_device() {
        let driver = Arc::new(SyntheticCameraDriver::new());
        let (mut actor, rx) = spawn(Arc::clone(&driver));
        assert!(matches!(next_device_event(&rx), DeviceEvent::Opened { .. }));

        actor.shutdown();
        assert!(matches!(
            actor.call(ActorRequest::TakePicture),
            Err(SessionError::Closed)
        ));

        // The index is free again once the owner thread has released it.
        let (_again, rx) = spawn(driver);
        assert!(matches!(next_device_event(&rx), DeviceEvent::Opened { .. }));
    }
}
