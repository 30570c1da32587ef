// This is free and unencumbered software released into the public domain.

use crate::shared::{
    CameraFacing, ErrorCode, Frame, SessionError, SessionEvent, Size, Storage,
    orient_preview_image,
};
use bytes::Bytes;
use derive_more::Display;
use std::{
    io::Cursor,
    sync::{Arc, mpsc::Sender},
    thread,
};
use tracing::{debug, warn};

/// Identifier of one capture attempt; strictly increasing within a session.
#[derive(Clone, Copy, Debug, Display, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CaptureId(pub u64);

/// Where a capture should be delivered. Both destinations may be requested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureOptions {
    pub file_name: Option<String>,
    pub to_file: bool,
    pub to_buffer: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            file_name: None,
            to_file: true,
            to_buffer: false,
        }
    }
}

impl CaptureOptions {
    pub fn to_file(file_name: impl Into<String>) -> Self {
        Self {
            file_name: Some(file_name.into()),
            ..Default::default()
        }
    }

    pub fn to_buffer() -> Self {
        Self {
            file_name: None,
            to_file: false,
            to_buffer: true,
        }
    }

    pub fn with_buffer(mut self, enabled: bool) -> Self {
        self.to_buffer = enabled;
        self
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum CaptureStatus {
    Pending,
    Exposed,
    Captured,
    Canceled,
    Failed,
}

impl CaptureStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Captured | Self::Canceled | Self::Failed)
    }
}

#[derive(Clone, Debug)]
pub struct CaptureRequest {
    pub id: CaptureId,
    pub status: CaptureStatus,
    pub options: CaptureOptions,
    cancel_requested: bool,
}

impl CaptureRequest {
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }
}

/// What to do with a native "captured" event.
#[derive(Debug, PartialEq)]
pub enum CapturedOutcome {
    Deliver { id: CaptureId, options: CaptureOptions },
    Discard(CaptureId),
    Stray,
}

/// What to do with a capture failure.
#[derive(Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    Report(CaptureId),
    Silent(CaptureId),
    Stray,
}

/// Bookkeeping for still captures: id allocation and the single in-flight request.
#[derive(Debug, Default)]
pub struct CaptureController {
    last_id: u64,
    current: Option<CaptureRequest>,
}

impl CaptureController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next id. Refused captures consume one too.
    pub fn next_id(&mut self) -> CaptureId {
        self.last_id += 1;
        CaptureId(self.last_id)
    }

    pub fn last_id(&self) -> CaptureId {
        CaptureId(self.last_id)
    }

    pub fn current(&self) -> Option<&CaptureRequest> {
        self.current.as_ref()
    }

    pub fn in_flight(&self) -> Option<&CaptureRequest> {
        self.current.as_ref().filter(|r| !r.status.is_terminal())
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight().is_some()
    }

    /// Makes `id` the in-flight request. Fails if another one is still in flight.
    pub fn begin(&mut self, id: CaptureId, options: CaptureOptions) -> Result<(), SessionError> {
        if let Some(busy) = self.in_flight() {
            return Err(SessionError::not_ready(format!(
                "capture {} is still in progress",
                busy.id
            )));
        }
        self.current = Some(CaptureRequest {
            id,
            status: CaptureStatus::Pending,
            options,
            cancel_requested: false,
        });
        Ok(())
    }

    /// Flags the in-flight request for cancellation. Only a Pending request can be canceled.
    pub fn cancel(&mut self) -> bool {
        match self.current.as_mut() {
            Some(req) if req.status == CaptureStatus::Pending => {
                req.cancel_requested = true;
                true
            },
            _ => false,
        }
    }

    /// Returns the id to announce as exposed, unless the request was canceled.
    pub fn on_exposed(&mut self) -> Option<CaptureId> {
        let req = self.current.as_mut()?;
        if req.status != CaptureStatus::Pending || req.cancel_requested {
            return None;
        }
        req.status = CaptureStatus::Exposed;
        Some(req.id)
    }

    pub fn on_captured(&mut self) -> CapturedOutcome {
        let Some(req) = self.current.as_mut().filter(|r| !r.status.is_terminal()) else {
            return CapturedOutcome::Stray;
        };
        if req.cancel_requested {
            req.status = CaptureStatus::Canceled;
            return CapturedOutcome::Discard(req.id);
        }
        req.status = CaptureStatus::Captured;
        CapturedOutcome::Deliver {
            id: req.id,
            options: req.options.clone(),
        }
    }

    pub fn on_failed(&mut self) -> FailureOutcome {
        let Some(req) = self.current.as_mut().filter(|r| !r.status.is_terminal()) else {
            return FailureOutcome::Stray;
        };
        if req.cancel_requested {
            req.status = CaptureStatus::Canceled;
            FailureOutcome::Silent(req.id)
        } else {
            req.status = CaptureStatus::Failed;
            FailureOutcome::Report(req.id)
        }
    }

    /// Whether the preview frame fetched for `id` should still be delivered.
    pub fn wants_preview_frame(&self, id: CaptureId) -> bool {
        match self.current.as_ref() {
            Some(req) if req.id == id => !req.cancel_requested && req.status != CaptureStatus::Failed,
            _ => false,
        }
    }

    /// Cancels whatever is in flight, returning its id.
    pub fn abort(&mut self) -> Option<CaptureId> {
        let req = self.current.as_mut().filter(|r| !r.status.is_terminal())?;
        req.status = CaptureStatus::Canceled;
        Some(req.id)
    }
}

pub(crate) fn capture_error(id: CaptureId, code: ErrorCode, message: impl Into<String>) -> SessionEvent {
    SessionEvent::ImageCaptureError {
        id,
        code,
        message: message.into(),
    }
}

/// Runs `job` on a short-lived worker so the caller never waits on it.
pub(crate) fn spawn_post_processing(
    id: CaptureId,
    events: &Sender<SessionEvent>,
    job: impl FnOnce(&Sender<SessionEvent>) + Send + 'static,
) {
    let tx = events.clone();
    let spawned = thread::Builder::new()
        .name(format!("camera-capture-{id}"))
        .spawn(move || job(&tx));
    if let Err(err) = spawned {
        warn!(target: "asimov_camera_session", %id, %err, "cannot spawn post-processing thread");
        let _ = events.send(capture_error(id, ErrorCode::Resource, format!("cannot process capture: {err}")));
    }
}

/// Orients the preview frame fetched at exposure time and emits `ImageCaptured`.
pub(crate) fn process_preview_image(
    id: CaptureId,
    frame: Frame,
    rotation: u32,
    facing: CameraFacing,
    events: &Sender<SessionEvent>,
) {
    let event = match frame.to_image() {
        Ok(img) => {
            let oriented = orient_preview_image(img, rotation, facing);
            SessionEvent::ImageCaptured {
                id,
                frame: Frame::from_image(&oriented).with_timestamp_ns(frame.timestamp_ns),
            }
        },
        Err(err) => capture_error(id, err.code(), err.to_string()),
    };
    let _ = events.send(event);
}

/// Delivers the encoded still to storage and/or the caller.
pub(crate) fn process_captured_image(
    id: CaptureId,
    jpeg: Bytes,
    options: &CaptureOptions,
    storage: &Arc<dyn Storage>,
    events: &Sender<SessionEvent>,
) {
    if options.to_file {
        let event = match storage.persist(id, &jpeg, options.file_name.as_deref()) {
            Ok(path) => SessionEvent::ImageSaved { id, path },
            Err(err) => {
                warn!(target: "asimov_camera_session", %id, %err, "failed to save still");
                capture_error(id, err.code(), err.to_string())
            },
        };
        let _ = events.send(event);
    }

    if options.to_buffer {
        let event = match jpeg_dimensions(&jpeg) {
            Ok(size) => SessionEvent::ImageAvailable {
                id,
                frame: Frame::new_jpeg(jpeg.clone(), size.width, size.height),
            },
            Err(err) => capture_error(id, err.code(), err.to_string()),
        };
        let _ = events.send(event);
    }

    debug!(target: "asimov_camera_session", %id, "capture delivered");
}

fn jpeg_dimensions(jpeg: &[u8]) -> Result<Size, SessionError> {
    let reader = image::ImageReader::with_format(Cursor::new(jpeg), image::ImageFormat::Jpeg);
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| SessionError::format(format!("captured data is not a JPEG: {e}")))?;
    Ok(Size::new(width, height))
}
