//! Alternate compositor consumers.
//!
//! SteamVR and Oculus frames travel through a fixed sequence of stages,
//! each a FIFO of chain ids. Windows Mixed Reality reports late-stage
//! reprojections instead, see [`mixed_reality`].

pub mod mixed_reality;
pub mod oculus;
pub mod steamvr;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::engine::CompletedQueue;

pub use self::mixed_reality::{
    HolographicFrame, HolographicFrameResult, LateStageReprojection, LsrResult,
    MixedRealityTracker, PresentationSource,
};
pub use self::oculus::OculusTracker;
pub use self::steamvr::SteamVrTracker;

/// Frames waiting on a stage beyond this many abandon the oldest one.
pub const MAX_PENDING_FRAMES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositorKind {
    SteamVr,
    OculusVr,
}

impl CompositorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SteamVr => "steamvr",
            Self::OculusVr => "oculusvr",
        }
    }
}

impl fmt::Display for CompositorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One app frame and the compositor pass that consumed it.
///
/// Timestamps are QPC ticks, zero when not observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompositorFrame {
    pub kind: CompositorKind,
    pub qpc_time: u64,
    pub process_id: u32,
    pub frame_id: u64,

    pub app_render_start: u64,
    pub app_render_end: u64,
    pub reprojection_start: u64,
    pub reprojection_end: u64,
    pub end_spin_wait: u64,
    /// Timestamp of the vsync indicator event.
    pub vsync_indicator: u64,
    pub ms_since_last_vsync: f64,

    pub app_miss: bool,
    pub warp_miss: bool,
    pub app_rendering_completed: bool,
    pub completed: bool,
}

impl CompositorFrame {
    pub fn new(kind: CompositorKind, qpc_time: u64, process_id: u32) -> Self {
        Self {
            kind,
            qpc_time,
            process_id,
            frame_id: 0,
            app_render_start: 0,
            app_render_end: 0,
            reprojection_start: 0,
            reprojection_end: 0,
            end_spin_wait: 0,
            vsync_indicator: 0,
            ms_since_last_vsync: 0.0,
            app_miss: false,
            warp_miss: false,
            app_rendering_completed: false,
            completed: false,
        }
    }
}

/// Chain id of a frame in a [`FrameChains`] store.
pub type ChainId = u64;

/// Owns in-flight compositor frames. Stage queues and the frame-id map
/// hold chain ids; a chain id that no longer resolves is skipped.
pub(crate) struct FrameChains {
    next: ChainId,
    frames: HashMap<ChainId, CompositorFrame>,
    /// App frame id to chain, for pairing with compositor frames.
    pub by_frame_id: BTreeMap<u64, ChainId>,
    output: Arc<CompletedQueue<CompositorFrame>>,
}

impl FrameChains {
    pub fn new(output: Arc<CompletedQueue<CompositorFrame>>) -> Self {
        Self {
            next: 0,
            frames: HashMap::new(),
            by_frame_id: BTreeMap::new(),
            output,
        }
    }

    pub fn insert(&mut self, frame: CompositorFrame) -> ChainId {
        if self.frames.len() >= MAX_PENDING_FRAMES {
            self.abandon_oldest();
        }
        let id = self.next;
        self.next += 1;
        self.frames.insert(id, frame);
        id
    }

    pub fn get(&self, id: ChainId) -> Option<&CompositorFrame> {
        self.frames.get(&id)
    }

    pub fn get_mut(&mut self, id: ChainId) -> Option<&mut CompositorFrame> {
        self.frames.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Take a frame out of the frame-id map.
    pub fn take_frame_id(&mut self, frame_id: u64) -> Option<ChainId> {
        let id = self.by_frame_id.remove(&frame_id)?;
        self.frames.contains_key(&id).then_some(id)
    }

    /// Emit a frame. App frames still waiting under a lower frame id
    /// are emitted first as app misses.
    pub fn complete(&mut self, id: ChainId) {
        let Some(mut frame) = self.frames.remove(&id) else {
            return;
        };

        let stale: Vec<u64> = self
            .by_frame_id
            .range(..frame.frame_id)
            .map(|(k, _)| *k)
            .collect();
        let mut batch = Vec::with_capacity(stale.len() + 1);
        for key in stale {
            let Some(chain) = self.by_frame_id.remove(&key) else {
                continue;
            };
            if chain == id {
                continue;
            }
            if let Some(mut dangling) = self.frames.remove(&chain) {
                dangling.completed = true;
                dangling.app_miss = true;
                batch.push(dangling);
            }
        }
        if self.by_frame_id.get(&frame.frame_id) == Some(&id) {
            self.by_frame_id.remove(&frame.frame_id);
        }

        frame.completed = true;
        batch.push(frame);
        self.output.extend(batch);
    }

    fn abandon_oldest(&mut self) {
        let Some(oldest) = self.frames.keys().min().copied() else {
            return;
        };
        if let Some(frame) = self.frames.remove(&oldest) {
            self.by_frame_id.retain(|_, chain| *chain != oldest);
            debug!(
                kind = %frame.kind,
                frame_id = frame.frame_id,
                "Abandoning compositor frame"
            );
        }
    }
}

/// Pop the first entry whose chain is still in flight.
pub(crate) fn pop_live<T>(
    queue: &mut VecDeque<(T, ChainId)>,
    chains: &FrameChains,
) -> Option<(T, ChainId)> {
    while let Some((tag, id)) = queue.pop_front() {
        if chains.get(id).is_some() {
            return Some((tag, id));
        }
    }
    None
}

/// Append to a stage queue. Finished chains are trimmed from the front and
/// the queue never holds more than [`MAX_PENDING_FRAMES`] entries.
pub(crate) fn push_live<T: Copy>(
    queue: &mut VecDeque<(T, ChainId)>,
    entry: (T, ChainId),
    chains: &FrameChains,
) {
    front_live(queue, chains);
    while queue.len() >= MAX_PENDING_FRAMES {
        queue.pop_front();
    }
    queue.push_back(entry);
}

/// Look at the first entry whose chain is still in flight.
pub(crate) fn front_live<T: Copy>(
    queue: &mut VecDeque<(T, ChainId)>,
    chains: &FrameChains,
) -> Option<(T, ChainId)> {
    while let Some(&(tag, id)) = queue.front() {
        if chains.get(id).is_some() {
            return Some((tag, id));
        }
        queue.pop_front();
    }
    None
}
