// This is free and unencumbered software released into the public domain.

use crate::shared::{
    CameraInfo, CaptureId, DeviceCapabilities, DeviceError, DeviceParameters, ErrorCode, Frame,
    FrameProbes, actor::ActorRequest,
};
use bytes::Bytes;
use derive_more::Display;
use std::{path::PathBuf, sync::mpsc::Sender};

/// Fine-grained session status.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    #[default]
    Closed = 0,
    Loading = 1,
    Loaded = 2,
    Starting = 3,
    Active = 4,
    Stopping = 5,
}

impl SessionState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Loading,
            2 => Self::Loaded,
            3 => Self::Starting,
            4 => Self::Active,
            5 => Self::Stopping,
            _ => Self::Closed,
        }
    }

    /// The coarse state this status belongs to.
    pub fn camera_state(self) -> CameraState {
        match self {
            Self::Closed | Self::Loading => CameraState::Unloaded,
            Self::Loaded | Self::Starting | Self::Stopping => CameraState::Loaded,
            Self::Active => CameraState::Active,
        }
    }
}

/// Coarse camera state, as reported by `StateChanged`.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash)]
pub enum CameraState {
    #[default]
    Unloaded,
    Loaded,
    Active,
}

/// A state the caller asks the session to reach.
pub type TargetState = CameraState;

/// Signals raised outward by a [`CameraSession`](crate::shared::CameraSession).
#[derive(Clone, Debug)]
pub enum SessionEvent {
    StateChanged(CameraState),
    StatusChanged(SessionState),
    Error { code: ErrorCode, message: String },
    ReadyForCaptureChanged(bool),
    ImageExposed(CaptureId),
    /// The orientation-corrected preview frame grabbed at exposure time.
    ImageCaptured { id: CaptureId, frame: Frame },
    /// The encoded still itself.
    ImageAvailable { id: CaptureId, frame: Frame },
    ImageSaved { id: CaptureId, path: PathBuf },
    ImageCaptureError {
        id: CaptureId,
        code: ErrorCode,
        message: String,
    },
}

/// Outcomes reported by the owner thread or the native layer.
#[derive(Debug)]
pub(crate) enum DeviceEvent {
    Opened {
        info: CameraInfo,
        capabilities: DeviceCapabilities,
        parameters: DeviceParameters,
    },
    OpenFailed(DeviceError),
    PreviewStarted,
    PreviewFailedToStart(DeviceError),
    PreviewStopped,
    PictureExposed,
    PictureCaptured(Bytes),
    TakePictureFailed(DeviceError),
    LastPreviewFrameFetched {
        id: CaptureId,
        frame: Option<Frame>,
    },
    Failed(DeviceError),
}

/// Items consumed by the session's dispatcher thread, in arrival order.
#[derive(Debug)]
pub(crate) enum Inbound {
    Device { generation: u64, event: DeviceEvent },
    VideoOutputReady { binding: u64, ready: bool },
    Stop,
}

/// Callback surface handed to a native device when it is opened.
///
/// Cloneable and usable from any thread; native frameworks typically invoke
/// these from their own callback threads.
#[derive(Clone, Debug)]
pub struct DeviceEvents {
    generation: u64,
    inbound: Sender<Inbound>,
    actor: Sender<ActorRequest>,
    probes: FrameProbes,
}

impl DeviceEvents {
    pub(crate) fn new(
        generation: u64,
        inbound: Sender<Inbound>,
        actor: Sender<ActorRequest>,
        probes: FrameProbes,
    ) -> Self {
        Self {
            generation,
            inbound,
            actor,
            probes,
        }
    }

    pub(crate) fn post(&self, event: DeviceEvent) {
        let _ = self.inbound.send(Inbound::Device {
            generation: self.generation,
            event,
        });
    }

    pub fn picture_exposed(&self) {
        self.post(DeviceEvent::PictureExposed);
    }

    /// Delivers the encoded still and has the owner thread restart the preview
    /// straight away, ahead of any post-processing.
    pub fn picture_captured(&self, jpeg: Bytes) {
        self.post(DeviceEvent::PictureCaptured(jpeg));
        let _ = self.actor.send(ActorRequest::RestartPreview);
    }

    pub fn take_picture_failed(&self, error: DeviceError) {
        self.post(DeviceEvent::TakePictureFailed(error));
        let _ = self.actor.send(ActorRequest::RestartPreview);
    }

    /// Fans a live preview frame out to the registered probes.
    pub fn new_preview_frame(&self, frame: &Frame) {
        self.probes.dispatch(frame);
    }

    pub fn error(&self, error: DeviceError) {
        self.post(DeviceEvent::Failed(error));
    }
}
