// This is free and unencumbered software released into the public domain.

use crate::shared::Frame;
use std::{
    fmt,
    sync::{Arc, Mutex},
};

/// Passive observer of live preview frames.
pub type FrameSink = Arc<dyn Fn(&Frame) + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProbeId(u64);

#[derive(Default)]
struct ProbeSet {
    next_id: u64,
    sinks: Vec<(ProbeId, FrameSink)>,
}

/// The set of frame probes shared between the caller and the frame-delivering thread.
///
/// Mutation and dispatch take the same lock. Whenever the set flips between
/// empty and non-empty, the `on_change` callback runs while that lock is still held.
#[derive(Clone, Default)]
pub struct FrameProbes {
    inner: Arc<Mutex<ProbeSet>>,
}

impl fmt::Debug for FrameProbes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameProbes")
            .field("count", &self.len())
            .finish()
    }
}

impl FrameProbes {
    pub fn add(&self, sink: FrameSink, on_change: impl FnOnce(bool)) -> ProbeId {
        let mut set = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let was_empty = set.sinks.is_empty();
        set.next_id += 1;
        let id = ProbeId(set.next_id);
        set.sinks.push((id, sink));
        if was_empty {
            on_change(true);
        }
        id
    }

    pub fn remove(&self, id: ProbeId, on_change: impl FnOnce(bool)) -> bool {
        let mut set = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let before = set.sinks.len();
        set.sinks.retain(|(probe, _)| *probe != id);
        let removed = set.sinks.len() != before;
        if removed && set.sinks.is_empty() {
            on_change(false);
        }
        removed
    }

    /// Whether the native layer should produce per-frame callbacks at all.
    pub fn wants_frames(&self) -> bool {
        !self.inner.lock().unwrap_or_else(|p| p.into_inner()).sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch(&self, frame: &Frame) {
        let set = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        for (_, sink) in set.sinks.iter() {
            (sink)(frame);
        }
    }
}
