// This is free and unencumbered software released into the public domain.

use crate::shared::{PreviewTarget, Size, events::Inbound};
use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
    mpsc::Sender,
};

/// The collaborator that presents the preview.
///
/// The session holds only a weak reference; dropping the output unbinds it.
pub trait VideoOutput: Send + Sync {
    fn is_ready(&self) -> bool;
    fn preview_target(&self) -> PreviewTarget;
    fn video_size(&self) -> Option<Size>;
    fn set_video_size(&self, size: Size);
    fn start(&self) {}
    fn stop(&self);
    fn reset(&self);

    /// Registers the channel through which readiness changes are reported.
    /// A later subscription replaces an earlier one.
    fn subscribe_ready(&self, notifier: ReadyNotifier);
}

/// Reports readiness changes of a bound [`VideoOutput`] back to its session.
#[derive(Clone, Debug)]
pub struct ReadyNotifier {
    binding: u64,
    tx: Sender<Inbound>,
}

impl ReadyNotifier {
    pub(crate) fn new(binding: u64, tx: Sender<Inbound>) -> Self {
        Self { binding, tx }
    }

    /// Returns `false` once the session is gone.
    pub fn notify(&self, ready: bool) -> bool {
        self.tx
            .send(Inbound::VideoOutputReady {
                binding: self.binding,
                ready,
            })
            .is_ok()
    }
}

/// An output with no surface: always ready, it only tracks the size it is given.
///
/// Suits sessions that consume frames through probes or stills only.
#[derive(Debug, Default)]
pub struct HeadlessVideoOutput {
    size: Mutex<Option<Size>>,
    running: AtomicBool,
    notifier: Mutex<Option<ReadyNotifier>>,
}

impl HeadlessVideoOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl VideoOutput for HeadlessVideoOutput {
    fn is_ready(&self) -> bool {
        true
    }

    fn preview_target(&self) -> PreviewTarget {
        PreviewTarget::Detached
    }

    fn video_size(&self) -> Option<Size> {
        *self.size.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_video_size(&self, size: Size) {
        *self.size.lock().unwrap_or_else(|p| p.into_inner()) = Some(size);
    }

    fn start(&self) {
        self.running.store(true, Ordering::Relaxed);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    fn reset(&self) {
        *self.size.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    fn subscribe_ready(&self, notifier: ReadyNotifier) {
        *self.notifier.lock().unwrap_or_else(|p| p.into_inner()) = Some(notifier);
    }
}
