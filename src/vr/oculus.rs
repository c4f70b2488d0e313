use std::collections::VecDeque;
use std::sync::Arc;

use super::{pop_live, push_live, ChainId, CompositorFrame, CompositorKind, FrameChains};
use crate::engine::CompletedQueue;
use crate::tracer::event::{oculus, EventRecord, FieldError};

pub const TASK_FUNCTION: &str = "Function";
pub const TASK_PHASE_SYNC: &str = "PhaseSync";
pub const TASK_COMPOSITOR: &str = "Compositor run loop (render thread) events.";
pub const TASK_VIRTUAL_DISPLAY: &str = "VirtualDisplay";

/// Correlates Oculus app frames with compositor passes. Events are
/// dispatched by task name, then event id.
pub struct OculusTracker {
    chains: FrameChains,
    compositor_start: VecDeque<((), ChainId)>,
    spin_wait: VecDeque<((), ChainId)>,
    reprojection: VecDeque<((), ChainId)>,
    /// The frame the compositor is currently working on.
    active: Option<ChainId>,
    /// Process of the most recent BeginFrame.
    last_process: u32,
}

impl OculusTracker {
    pub fn new(output: Arc<CompletedQueue<CompositorFrame>>) -> Self {
        Self {
            chains: FrameChains::new(output),
            compositor_start: VecDeque::new(),
            spin_wait: VecDeque::new(),
            reprojection: VecDeque::new(),
            active: None,
            last_process: 0,
        }
    }

    /// Frames not yet emitted.
    pub fn in_flight(&self) -> usize {
        self.chains.len()
    }

    pub fn handle(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        match ev.task.as_str() {
            TASK_FUNCTION => {
                let frame_id = ev.u64("FrameID")?;
                if ev.id == oculus::FUNCTION_CALL_COMPOSITOR
                    && !self.chains.by_frame_id.contains_key(&frame_id)
                {
                    let mut frame = CompositorFrame::new(CompositorKind::OculusVr, ev.timestamp, ev.pid);
                    frame.frame_id = frame_id;
                    let id = self.chains.insert(frame);
                    self.chains.by_frame_id.insert(frame_id, id);
                }
            }
            TASK_PHASE_SYNC => self.phase_sync(ev)?,
            TASK_COMPOSITOR => self.compositor(ev),
            TASK_VIRTUAL_DISPLAY => {
                if ev.id != oculus::CLIENT_FRAME_MISSED {
                    return Ok(());
                }
                let pid = ev.u64("ProcessID")?;
                if let Some(frame) = self.active.and_then(|id| self.chains.get_mut(id)) {
                    if u64::from(frame.process_id) == pid {
                        frame.app_miss = true;
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn phase_sync(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        let frame_id = ev.u64("Frame")?;
        match ev.id {
            oculus::PHASE_SYNC_BEGIN_FRAME => {
                let Some(&id) = self.chains.by_frame_id.get(&frame_id) else {
                    return Ok(());
                };
                if let Some(frame) = self.chains.get_mut(id) {
                    frame.app_render_start = ev.timestamp;
                    self.last_process = ev.pid;
                }
            }
            oculus::PHASE_SYNC_COMPLETE_FRAME => {
                let Some(id) = self.chains.take_frame_id(frame_id) else {
                    return Ok(());
                };
                if let Some(frame) = self.chains.get_mut(id) {
                    frame.app_render_end = ev.timestamp;
                }
                push_live(&mut self.compositor_start, ((), id), &self.chains);
            }
            _ => {}
        }
        Ok(())
    }

    fn compositor(&mut self, ev: &EventRecord) {
        let ts = ev.timestamp;
        match ev.id {
            oculus::COMPOSITION_BEGIN => {
                let id = match pop_live(&mut self.compositor_start, &self.chains) {
                    Some((_, id)) => id,
                    // No app frame ready: the compositor reprojects the last one.
                    None if self.last_process != 0 => self.chains.insert(CompositorFrame::new(
                        CompositorKind::OculusVr,
                        ts,
                        self.last_process,
                    )),
                    None => return,
                };
                if let Some(frame) = self.chains.get_mut(id) {
                    frame.reprojection_start = ts;
                }
                self.active = Some(id);
                push_live(&mut self.spin_wait, ((), id), &self.chains);
            }
            oculus::COMPOSITION_END_SPIN_WAIT => {
                if let Some((_, id)) = pop_live(&mut self.spin_wait, &self.chains) {
                    if let Some(frame) = self.chains.get_mut(id) {
                        frame.end_spin_wait = ts;
                    }
                    push_live(&mut self.reprojection, ((), id), &self.chains);
                }
            }
            oculus::COMPOSITION_END => {
                if let Some((_, id)) = pop_live(&mut self.reprojection, &self.chains) {
                    if let Some(frame) = self.chains.get_mut(id) {
                        frame.reprojection_end = ts;
                    }
                    self.chains.complete(id);
                }
            }
            oculus::COMPOSITION_MISSED_COMPOSITOR_FRAME => {
                if let Some(frame) = self.active.and_then(|id| self.chains.get_mut(id)) {
                    frame.warp_miss = true;
                }
            }
            _ => {}
        }
    }
}
