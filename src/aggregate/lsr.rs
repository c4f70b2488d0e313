use super::window::{ticks_to_ms, RollingWindow, RuntimeStat, Timed};
use crate::vr::{LateStageReprojection, LsrResult};

pub const LSR_HISTORY_MS: u64 = 3000;
pub const MAX_LSRS_IN_WINDOW: usize = 360;
pub const LSR_STALE_MS: u64 = 10_000;

impl Timed for LateStageReprojection {
    fn qpc_time(&self) -> u64 {
        self.qpc_time
    }
}

/// Summary of the LSR window, see [`LateStageReprojectionData::runtime_stats`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LsrRuntimeStats {
    pub gpu_preemption_ms: RuntimeStat,
    pub gpu_execution_ms: RuntimeStat,
    pub copy_preemption_ms: RuntimeStat,
    pub copy_execution_ms: RuntimeStat,
    pub input_latch_to_vsync_ms: RuntimeStat,

    pub app_source_release_to_lsr_acquire_ms: f64,
    pub app_source_cpu_render_ms: f64,
    pub lsr_cpu_render_ms: f64,
    pub gpu_end_to_vsync_ms: f64,
    pub vsync_to_photons_middle_ms: f64,
    pub lsr_pose_latency_ms: f64,
    pub app_pose_latency_ms: f64,

    pub app_missed_frames: u32,
    pub lsr_missed_frames: u32,
    pub lsr_consecutive_missed_frames: u32,

    pub app_process_id: u32,
    pub lsr_process_id: u32,
}

/// Rolling LSR statistics for the mixed reality compositor.
#[derive(Debug, Clone)]
pub struct LateStageReprojectionData {
    history: RollingWindow<LateStageReprojection>,
    displayed: RollingWindow<LateStageReprojection>,
    /// Passes that latched a new app frame.
    sources: RollingWindow<LateStageReprojection>,
    pub lifetime_app_missed: u64,
    pub lifetime_lsr_missed: u64,
    pub last_update: u64,
}

impl Default for LateStageReprojectionData {
    fn default() -> Self {
        Self::new()
    }
}

impl LateStageReprojectionData {
    pub fn new() -> Self {
        Self {
            history: RollingWindow::new(MAX_LSRS_IN_WINDOW, LSR_HISTORY_MS),
            displayed: RollingWindow::new(MAX_LSRS_IN_WINDOW, LSR_HISTORY_MS),
            sources: RollingWindow::new(MAX_LSRS_IN_WINDOW, LSR_HISTORY_MS),
            lifetime_app_missed: 0,
            lifetime_lsr_missed: 0,
            last_update: 0,
        }
    }

    pub fn add(&mut self, lsr: &LateStageReprojection, frequency: u64) {
        if lsr.final_state == LsrResult::Presented {
            self.displayed.push(lsr.clone());
        } else if lsr.final_state.is_missed() {
            self.lifetime_lsr_missed += u64::from(lsr.missed_vsync_count);
        }

        if lsr.new_source_latched {
            self.sources.push(lsr.clone());
        } else {
            self.lifetime_app_missed += 1;
        }
        self.history.push(lsr.clone());

        self.sources.prune(frequency);
        self.displayed.prune(frequency);
        self.history.prune(frequency);
        self.last_update = lsr.qpc_time;
    }

    /// Passes in the window, 0 below two.
    pub fn history_len(&self) -> usize {
        if self.history.len() < 2 {
            return 0;
        }
        self.history.len()
    }

    pub fn history_secs(&self, frequency: u64) -> f64 {
        self.history.history_secs(frequency)
    }

    pub fn fps(&self, frequency: u64) -> f64 {
        self.history.fps(frequency)
    }

    pub fn source_fps(&self, frequency: u64) -> f64 {
        self.sources.fps(frequency)
    }

    pub fn displayed_fps(&self, frequency: u64) -> f64 {
        self.displayed.fps(frequency)
    }

    pub fn runtime_stats(&self, frequency: u64) -> LsrRuntimeStats {
        let mut stats = LsrRuntimeStats::default();
        let count = self.history.len();
        if count < 2 {
            return stats;
        }

        let mut release_to_acquire = 0u64;
        let mut app_cpu_render = 0u64;
        let mut previous_missed = false;
        for lsr in self.history.iter() {
            stats.gpu_preemption_ms.record(lsr.gpu_submission_to_gpu_start_ms);
            stats.gpu_execution_ms.record(lsr.gpu_start_to_gpu_stop_ms);
            stats.copy_preemption_ms.record(lsr.gpu_stop_to_copy_start_ms);
            stats.copy_execution_ms.record(lsr.copy_start_to_copy_stop_ms);
            stats.input_latch_to_vsync_ms.record(lsr.input_latch_to_vsync_ms());

            release_to_acquire += lsr.source.release_to_acquire_time();
            app_cpu_render += lsr.source.app_cpu_render_time();
            stats.lsr_cpu_render_ms += lsr.cpu_render_ms();
            stats.gpu_end_to_vsync_ms += lsr.copy_stop_to_vsync_ms;
            stats.vsync_to_photons_middle_ms +=
                lsr.time_until_photons_middle_ms - lsr.time_until_vsync_ms;
            stats.lsr_pose_latency_ms += lsr.lsr_prediction_latency_ms;
            stats.app_pose_latency_ms += lsr.app_prediction_latency_ms;

            if !lsr.new_source_latched {
                stats.app_missed_frames += 1;
            }

            let missed = lsr.final_state.is_missed();
            if missed {
                stats.lsr_missed_frames += lsr.missed_vsync_count;
                // Several vsyncs missed within one pass.
                stats.lsr_consecutive_missed_frames += lsr.missed_vsync_count.saturating_sub(1);
                if previous_missed {
                    stats.lsr_consecutive_missed_frames += 1;
                }
            }
            previous_missed = missed;
        }

        if let Some(last) = self.history.back() {
            stats.app_process_id = last.app_process_id();
            stats.lsr_process_id = last.process_id;
        }

        let n = count as f64;
        stats.app_source_release_to_lsr_acquire_ms = ticks_to_ms(release_to_acquire, frequency) / n;
        stats.app_source_cpu_render_ms = ticks_to_ms(app_cpu_render, frequency) / n;
        stats.lsr_cpu_render_ms /= n;
        stats.gpu_end_to_vsync_ms /= n;
        stats.vsync_to_photons_middle_ms /= n;
        stats.lsr_pose_latency_ms /= n;
        stats.app_pose_latency_ms /= n;
        stats
    }

    pub fn is_stale(&self, now: u64, frequency: u64) -> bool {
        ticks_to_ms(now.saturating_sub(self.last_update), frequency) > LSR_STALE_MS as f64
    }

    /// Start over when no pass was seen for [`LSR_STALE_MS`] of trace time.
    /// Lifetime miss counters are kept.
    pub fn reset_if_stale(&mut self, now: u64, frequency: u64) -> bool {
        if self.history.is_empty() || !self.is_stale(now, frequency) {
            return false;
        }
        self.history = RollingWindow::new(MAX_LSRS_IN_WINDOW, LSR_HISTORY_MS);
        self.displayed = RollingWindow::new(MAX_LSRS_IN_WINDOW, LSR_HISTORY_MS);
        self.sources = RollingWindow::new(MAX_LSRS_IN_WINDOW, LSR_HISTORY_MS);
        true
    }
}
