//! Windows Mixed Reality late-stage reprojection (LSR) tracking.
//!
//! The holographic display provider reports one LSR pass per vsync. Each
//! pass latches a presentation source, which links back to the app's
//! holographic frame through its present id. Spectrum continuous events
//! supply those holographic frames.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::trace;

use super::MAX_PENDING_FRAMES;
use crate::engine::CompletedQueue;
use crate::tracer::event::{opcode, EventRecord, FieldError, Provider};

pub mod task {
    pub const ACQUIRE_FOR_RENDERING: &str = "AcquireForRendering";
    pub const RELEASE_FROM_RENDERING: &str = "ReleaseFromRendering";
    pub const ACQUIRE_FOR_PRESENTATION: &str = "AcquireForPresentation";
    pub const RELEASE_FROM_PRESENTATION: &str = "ReleaseFromPresentation";
    pub const PRESENTATION_SOURCE: &str = "OasisPresentationSource";
    pub const BEGIN_LSR_PROCESSING: &str = "LsrThread_BeginLsrProcessing";
    pub const LATCHED_INPUT: &str = "LsrThread_LatchedInput";
    pub const UNACCOUNTED_VSYNCS: &str = "LsrThread_UnaccountedForVsyncsBetweenStatGathering";
    pub const MISSED_PRESENTATION: &str = "MissedPresentation";
    pub const ON_TIME_PRESENTATION_TIMING: &str = "OnTimePresentationTiming";
    pub const LATE_PRESENTATION_TIMING: &str = "LatePresentationTiming";
    pub const HOLOGRAPHIC_FRAME: &str = "HolographicFrame";
    pub const GET_NEW_POSE_FOR_REPROJECTION: &str =
        "HolographicFrameMetadata_GetNewPoseForReprojection";
}

/// MissedPresentation reason for a missed present.
const MISSED_REASON_PRESENT: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum HolographicFrameResult {
    #[default]
    Unknown,
    Presented,
    DuplicateFrameId,
    Error,
}

/// An app frame, from CreateNextFrame to PresentUsingCurrentPrediction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HolographicFrame {
    pub frame_id: u32,
    pub present_id: u32,
    pub start_time: u64,
    pub stop_time: u64,
    pub process_id: u32,
    pub final_state: HolographicFrameResult,
    pub completed: bool,
}

impl HolographicFrame {
    fn new(frame_id: u32, start_time: u64, process_id: u32) -> Self {
        Self {
            frame_id,
            present_id: 0,
            start_time,
            stop_time: 0,
            process_id,
            final_state: HolographicFrameResult::Unknown,
            completed: false,
        }
    }

    fn is_ready(&self) -> bool {
        self.present_id != 0 && self.stop_time != 0
    }
}

/// A buffer the app renders into and the LSR thread presents from.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PresentationSource {
    pub ptr: u64,
    pub acquire_for_rendering: u64,
    pub release_from_rendering: u64,
    pub acquire_for_presentation: u64,
    pub release_from_presentation: u64,
    /// The holographic frame last rendered into this source.
    pub holographic_frame: Option<HolographicFrame>,
}

impl PresentationSource {
    fn new(ptr: u64) -> Self {
        Self {
            ptr,
            ..Self::default()
        }
    }

    /// Ticks the app spent rendering into the source.
    pub fn app_cpu_render_time(&self) -> u64 {
        if self.acquire_for_rendering == 0 {
            return 0;
        }
        self.release_from_rendering
            .saturating_sub(self.acquire_for_rendering)
    }

    /// Ticks between the app releasing the source and LSR acquiring it.
    pub fn release_to_acquire_time(&self) -> u64 {
        if self.release_from_rendering == 0 {
            return 0;
        }
        self.acquire_for_presentation
            .saturating_sub(self.release_from_rendering)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum LsrResult {
    #[default]
    Unknown,
    Presented,
    Missed,
    MissedMultiple,
    Error,
}

impl LsrResult {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Presented => "presented",
            Self::Missed => "missed",
            Self::MissedMultiple => "missed_multiple",
            Self::Error => "error",
        }
    }

    pub fn is_missed(self) -> bool {
        matches!(self, Self::Missed | Self::MissedMultiple)
    }
}

impl fmt::Display for LsrResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One late-stage reprojection pass. Stage timings are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LateStageReprojection {
    pub qpc_time: u64,
    pub process_id: u32,
    /// Snapshot of the source as latched by this pass.
    pub source: PresentationSource,
    pub new_source_latched: bool,

    pub thread_wakeup_to_cpu_render_frame_start_ms: f64,
    pub cpu_render_frame_start_to_head_pose_callback_start_ms: f64,
    pub head_pose_callback_start_to_head_pose_callback_stop_ms: f64,
    pub head_pose_callback_stop_to_input_latch_ms: f64,
    pub input_latch_to_gpu_submission_ms: f64,
    pub gpu_submission_to_gpu_start_ms: f64,
    pub gpu_start_to_gpu_stop_ms: f64,
    pub gpu_stop_to_copy_start_ms: f64,
    pub copy_start_to_copy_stop_ms: f64,
    pub copy_stop_to_vsync_ms: f64,

    pub lsr_prediction_latency_ms: f64,
    pub app_prediction_latency_ms: f64,
    pub app_misprediction_ms: f64,
    pub wakeup_error_ms: f64,
    pub time_until_vsync_ms: f64,
    pub time_until_photons_middle_ms: f64,

    pub early_lsr_due_to_invalid_fence: bool,
    pub suspended_thread_before_lsr: bool,

    pub missed_vsync_count: u32,
    pub final_state: LsrResult,
    pub completed: bool,
}

impl LateStageReprojection {
    pub fn new(qpc_time: u64, process_id: u32, source_ptr: u64) -> Self {
        Self {
            qpc_time,
            process_id,
            source: PresentationSource::new(source_ptr),
            new_source_latched: false,
            thread_wakeup_to_cpu_render_frame_start_ms: 0.0,
            cpu_render_frame_start_to_head_pose_callback_start_ms: 0.0,
            head_pose_callback_start_to_head_pose_callback_stop_ms: 0.0,
            head_pose_callback_stop_to_input_latch_ms: 0.0,
            input_latch_to_gpu_submission_ms: 0.0,
            gpu_submission_to_gpu_start_ms: 0.0,
            gpu_start_to_gpu_stop_ms: 0.0,
            gpu_stop_to_copy_start_ms: 0.0,
            copy_start_to_copy_stop_ms: 0.0,
            copy_stop_to_vsync_ms: 0.0,
            lsr_prediction_latency_ms: 0.0,
            app_prediction_latency_ms: 0.0,
            app_misprediction_ms: 0.0,
            wakeup_error_ms: 0.0,
            time_until_vsync_ms: 0.0,
            time_until_photons_middle_ms: 0.0,
            early_lsr_due_to_invalid_fence: false,
            suspended_thread_before_lsr: false,
            missed_vsync_count: 0,
            final_state: LsrResult::Unknown,
            completed: false,
        }
    }

    /// Process of the app whose frame was reprojected, 0 if unknown.
    pub fn app_process_id(&self) -> u32 {
        self.source
            .holographic_frame
            .as_ref()
            .map_or(0, |f| f.process_id)
    }

    /// Input latch to vsync across every GPU and copy stage.
    pub fn input_latch_to_vsync_ms(&self) -> f64 {
        self.input_latch_to_gpu_submission_ms
            + self.gpu_submission_to_gpu_start_ms
            + self.gpu_start_to_gpu_stop_ms
            + self.gpu_stop_to_copy_start_ms
            + self.copy_start_to_copy_stop_ms
            + self.copy_stop_to_vsync_ms
    }

    pub fn cpu_render_ms(&self) -> f64 {
        self.cpu_render_frame_start_to_head_pose_callback_start_ms
            + self.head_pose_callback_start_to_head_pose_callback_stop_ms
            + self.head_pose_callback_stop_to_input_latch_ms
            + self.input_latch_to_gpu_submission_ms
    }
}

/// Producer-side state for the holographic display and spectrum
/// continuous providers.
pub struct MixedRealityTracker {
    simple_mode: bool,
    sources: HashMap<u64, PresentationSource>,
    frames_by_frame_id: BTreeMap<u32, HolographicFrame>,
    /// Stopped frames waiting for an LSR pass to latch them.
    frames_by_present_id: BTreeMap<u32, HolographicFrame>,
    active: Option<LateStageReprojection>,
    output: Arc<CompletedQueue<LateStageReprojection>>,
}

impl MixedRealityTracker {
    pub fn new(simple_mode: bool, output: Arc<CompletedQueue<LateStageReprojection>>) -> Self {
        Self {
            simple_mode,
            sources: HashMap::new(),
            frames_by_frame_id: BTreeMap::new(),
            frames_by_present_id: BTreeMap::new(),
            active: None,
            output,
        }
    }

    /// The pass currently being assembled.
    pub fn active(&self) -> Option<&LateStageReprojection> {
        self.active.as_ref()
    }

    pub fn pending_frames(&self) -> usize {
        self.frames_by_frame_id.len() + self.frames_by_present_id.len()
    }

    pub fn handle(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        match ev.provider {
            Provider::HolographicDisplay => self.handle_display(ev),
            Provider::SpectrumContinuous => self.handle_spectrum(ev),
            _ => Ok(()),
        }
    }

    /// Emit the active pass, if any.
    pub fn flush(&mut self) {
        if let Some(lsr) = self.active.take() {
            self.complete_lsr(lsr);
        }
    }

    fn source(&mut self, ptr: u64) -> &mut PresentationSource {
        self.sources
            .entry(ptr)
            .or_insert_with(|| PresentationSource::new(ptr))
    }

    fn handle_display(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        let ts = ev.timestamp;
        match ev.task.as_str() {
            task::ACQUIRE_FOR_RENDERING => {
                let source = self.source(ev.u64("thisPtr")?);
                source.acquire_for_rendering = ts;
                // The source may be reused.
                source.release_from_rendering = 0;
                source.acquire_for_presentation = 0;
                source.release_from_presentation = 0;
            }
            task::RELEASE_FROM_RENDERING => {
                self.source(ev.u64("thisPtr")?).release_from_rendering = ts;
            }
            task::ACQUIRE_FOR_PRESENTATION => {
                self.source(ev.u64("thisPtr")?).acquire_for_presentation = ts;
            }
            task::RELEASE_FROM_PRESENTATION => {
                self.source(ev.u64("thisPtr")?).release_from_presentation = ts;
            }
            task::PRESENTATION_SOURCE => {
                let kind = ev.str("EventType")?.trim_end_matches('\0');
                if kind == "Destruction" {
                    self.sources.remove(&ev.u64("thisPtr")?);
                }
            }
            task::BEGIN_LSR_PROCESSING => {
                let mut lsr = LateStageReprojection::new(ts, ev.pid, ev.u64("SourcePtr")?);
                lsr.new_source_latched = ev.bool("NewSourceLatched")?;
                lsr.time_until_vsync_ms = ev.f64("TimeUntilVblankMs")?;
                lsr.time_until_photons_middle_ms = ev.f64("TimeUntilPhotonsMiddleMs")?;
                lsr.app_prediction_latency_ms = ev.f64("PredictionSampleTimeToPhotonsVisibleMs")?;
                lsr.app_misprediction_ms = ev.f64("MispredictionMs")?;

                self.flush();
                self.active = Some(lsr);
            }
            task::LATCHED_INPUT => self.latched_input(ev)?,
            task::UNACCOUNTED_VSYNCS => {
                if self.active.is_none() {
                    return Ok(());
                }
                let missed = ev.u32("unaccountedForVsyncsBetweenStatGathering")?;
                if let Some(lsr) = self.active.as_mut() {
                    lsr.missed_vsync_count += missed;
                }
            }
            task::MISSED_PRESENTATION => {
                if self.active.is_none() {
                    return Ok(());
                }
                let reason = ev.u32("reason")?;
                if let Some(lsr) = self.active.as_mut() {
                    if reason == MISSED_REASON_PRESENT {
                        lsr.missed_vsync_count += 1;
                    }
                }
            }
            task::ON_TIME_PRESENTATION_TIMING | task::LATE_PRESENTATION_TIMING => {
                if let Some(lsr) = self.active.as_mut() {
                    apply_timing(lsr, ev)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn latched_input(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        let Some(ptr) = self.active.as_ref().map(|lsr| lsr.source.ptr) else {
            return Ok(());
        };
        let top = ev.f64("TimeUntilTopPhotonsMs")?;
        let bottom = ev.f64("TimeUntilBottomPhotonsMs")?;
        let present_id = if self.simple_mode {
            None
        } else {
            Some(ev.u32("PresentId")?)
        };

        // Link the source to the frame rendered into it.
        let frame = present_id
            .and_then(|id| self.frames_by_present_id.remove(&id))
            .map(|mut frame| {
                frame.completed = true;
                frame
            });
        let source = self.source(ptr);
        if frame.is_some() {
            source.holographic_frame = frame;
        }
        let snapshot = source.clone();

        if let Some(lsr) = self.active.as_mut() {
            lsr.lsr_prediction_latency_ms = (top + bottom) / 2.0;
            lsr.source = snapshot;
        }
        Ok(())
    }

    fn handle_spectrum(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        match ev.task.as_str() {
            task::HOLOGRAPHIC_FRAME => {
                if ev.bool("isRehydration")? {
                    return Ok(());
                }
                match ev.opcode {
                    // CreateNextFrame
                    opcode::START => {
                        let frame_id = ev.u32("holographicFrameID")?;
                        let mut frame = HolographicFrame::new(frame_id, ev.timestamp, ev.pid);
                        if let Some(existing) = self.frames_by_frame_id.get_mut(&frame_id) {
                            existing.final_state = HolographicFrameResult::DuplicateFrameId;
                            frame.final_state = HolographicFrameResult::DuplicateFrameId;
                            trace!(frame_id, "Duplicate holographic frame id");
                        }
                        self.frames_by_frame_id.insert(frame_id, frame);
                        bound(&mut self.frames_by_frame_id);
                    }
                    // PresentUsingCurrentPrediction
                    opcode::STOP => {
                        let frame_id = ev.u32("holographicFrameID")?;
                        if let Some(frame) = self.frames_by_frame_id.get_mut(&frame_id) {
                            frame.stop_time = ev.timestamp;
                            self.try_stop_frame(frame_id);
                        }
                    }
                    _ => {}
                }
            }
            task::GET_NEW_POSE_FOR_REPROJECTION => {
                let frame_id = ev.u32("holographicFrameId")?;
                if !self.frames_by_frame_id.contains_key(&frame_id) {
                    return Ok(());
                }
                let present_id = ev.u32("presentId")?;
                if let Some(frame) = self.frames_by_frame_id.get_mut(&frame_id) {
                    frame.present_id = present_id;
                    self.try_stop_frame(frame_id);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Once a frame has both its present id and its stop time it waits
    /// for LSR under the present id.
    fn try_stop_frame(&mut self, frame_id: u32) {
        if !self
            .frames_by_frame_id
            .get(&frame_id)
            .is_some_and(HolographicFrame::is_ready)
        {
            return;
        }
        let Some(mut frame) = self.frames_by_frame_id.remove(&frame_id) else {
            return;
        };
        if frame.final_state == HolographicFrameResult::Unknown {
            frame.final_state = HolographicFrameResult::Presented;
        }
        self.frames_by_present_id
            .entry(frame.present_id)
            .or_insert(frame);
        bound(&mut self.frames_by_present_id);
    }

    fn complete_lsr(&mut self, mut lsr: LateStageReprojection) {
        // Passes that never reported timing are dropped.
        if lsr.final_state == LsrResult::Unknown {
            return;
        }
        lsr.completed = true;
        self.output.push(lsr);
    }
}

fn apply_timing(lsr: &mut LateStageReprojection, ev: &EventRecord) -> Result<(), FieldError> {
    lsr.thread_wakeup_to_cpu_render_frame_start_ms = ev.f64("threadWakeupToCpuRenderFrameStartInMs")?;
    lsr.cpu_render_frame_start_to_head_pose_callback_start_ms =
        ev.f64("cpuRenderFrameStartToHeadPoseCallbackStartInMs")?;
    lsr.head_pose_callback_start_to_head_pose_callback_stop_ms =
        ev.f64("headPoseCallbackDurationInMs")?;
    lsr.head_pose_callback_stop_to_input_latch_ms = ev.f64("headPoseCallbackEndToInputLatchInMs")?;
    lsr.input_latch_to_gpu_submission_ms = ev.f64("inputLatchToGpuSubmissionInMs")?;
    lsr.gpu_submission_to_gpu_start_ms = ev.f64("gpuSubmissionToGpuStartInMs")?;
    lsr.gpu_start_to_gpu_stop_ms = ev.f64("gpuStartToGpuStopInMs")?;
    lsr.gpu_stop_to_copy_start_ms = ev.f64("gpuStopToCopyStartInMs")?;
    lsr.copy_start_to_copy_stop_ms = ev.f64("copyStartToCopyStopInMs")?;
    lsr.copy_stop_to_vsync_ms = ev.f64("copyStopToVsyncInMs")?;
    lsr.wakeup_error_ms = ev.f64("wakeupErrorInMs")?;
    lsr.early_lsr_due_to_invalid_fence = ev.bool("earlyLSRDueToInvalidFence")?;
    lsr.suspended_thread_before_lsr = ev.bool("suspendedThreadBeforeLSR")?;

    lsr.final_state = if ev.bool("frameSubmittedOnSchedule")? {
        LsrResult::Presented
    } else if lsr.missed_vsync_count > 1 {
        LsrResult::MissedMultiple
    } else {
        LsrResult::Missed
    };
    Ok(())
}

/// Drop the lowest keys once a frame map outgrows its bound.
fn bound(frames: &mut BTreeMap<u32, HolographicFrame>) {
    while frames.len() > MAX_PENDING_FRAMES {
        if let Some((id, _)) = frames.pop_first() {
            trace!(frame_id = id, "Dropping unmatched holographic frame");
        }
    }
}
