use super::window::{ticks_to_ms, RollingWindow, Timed};
use crate::present::{Present, PresentMode, PresentResult, Runtime};

pub const SWAP_CHAIN_HISTORY_MS: u64 = 2000;
pub const MAX_PRESENTS_IN_WINDOW: usize = 120;
pub const SWAP_CHAIN_STALE_MS: u64 = 10_000;

impl Timed for Present {
    fn qpc_time(&self) -> u64 {
        self.qpc_time
    }
}

/// Rolling statistics for one swap chain.
#[derive(Debug, Clone)]
pub struct SwapChainData {
    history: RollingWindow<Present>,
    displayed: RollingWindow<Present>,

    pub runtime: Runtime,
    pub last_update: u64,
    pub last_sync_interval: i32,
    pub last_flags: u32,
    /// Only updated by presented frames.
    pub last_mode: PresentMode,
    pub last_plane: u32,
    pub batched: bool,
    pub dwm_notified: bool,
}

impl Default for SwapChainData {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapChainData {
    pub fn new() -> Self {
        Self {
            history: RollingWindow::new(MAX_PRESENTS_IN_WINDOW, SWAP_CHAIN_HISTORY_MS),
            displayed: RollingWindow::new(MAX_PRESENTS_IN_WINDOW, SWAP_CHAIN_HISTORY_MS),
            runtime: Runtime::Other,
            last_update: 0,
            last_sync_interval: -1,
            last_flags: 0,
            last_mode: PresentMode::Unknown,
            last_plane: 0,
            batched: false,
            dwm_notified: false,
        }
    }

    /// Creation time of the most recent present.
    pub fn last_present_time(&self) -> Option<u64> {
        self.history.back().map(|p| p.qpc_time)
    }

    /// Screen time of the most recent displayed present.
    pub fn last_screen_time(&self) -> Option<u64> {
        self.displayed.back().map(|p| p.screen_time)
    }

    /// Add a completed present and refresh the windows.
    pub fn add(&mut self, p: &Present, frequency: u64) {
        if p.final_state == PresentResult::Presented {
            self.displayed.push(p.clone());
            self.last_mode = p.mode;
        }
        self.history.push(p.clone());

        self.displayed.prune(frequency);
        self.history.prune(frequency);

        self.last_update = p.qpc_time;
        self.runtime = p.runtime;
        self.last_sync_interval = p.sync_interval;
        self.last_flags = p.present_flags;
        self.last_plane = p.plane_index;
        self.batched = p.was_batched;
        self.dwm_notified = p.dwm_notified;
    }

    pub fn history(&self) -> &RollingWindow<Present> {
        &self.history
    }

    pub fn displayed(&self) -> &RollingWindow<Present> {
        &self.displayed
    }

    pub fn fps(&self, frequency: u64) -> f64 {
        self.history.fps(frequency)
    }

    pub fn displayed_fps(&self, frequency: u64) -> f64 {
        self.displayed.fps(frequency)
    }

    /// Average milliseconds from present call to screen.
    pub fn latency_ms(&self, frequency: u64) -> f64 {
        if self.displayed.len() < 2 {
            return 0.0;
        }
        let total: u64 = self.displayed.intervals().map(latency_ticks).sum();
        ticks_to_ms(total, frequency) / (self.displayed.len() - 1) as f64
    }

    /// Nearest-rank latency percentile in milliseconds, `pct` in 0..=100.
    pub fn latency_percentile_ms(&self, pct: f64, frequency: u64) -> f64 {
        if self.displayed.len() < 2 {
            return 0.0;
        }
        let mut samples: Vec<u64> = self.displayed.intervals().map(latency_ticks).collect();
        samples.sort_unstable();

        let rank = ((pct.clamp(0.0, 100.0) / 100.0) * samples.len() as f64).ceil() as usize;
        let idx = rank.saturating_sub(1).min(samples.len() - 1);
        samples
            .get(idx)
            .map_or(0.0, |&t| ticks_to_ms(t, frequency))
    }

    /// Milliseconds per frame spent outside the present call.
    pub fn cpu_frame_time_ms(&self, frequency: u64) -> f64 {
        if self.history.len() < 2 {
            return 0.0;
        }
        let in_present: u64 = self.history.intervals().map(|p| p.time_taken).sum();
        let outside = self.history.span_ticks().saturating_sub(in_present);
        ticks_to_ms(outside, frequency) / (self.history.len() - 1) as f64
    }

    /// No present within the stale timeout of `now`.
    pub fn is_stale(&self, now: u64, frequency: u64) -> bool {
        ticks_to_ms(now.saturating_sub(self.last_update), frequency) > SWAP_CHAIN_STALE_MS as f64
    }
}

fn latency_ticks(p: &Present) -> u64 {
    p.screen_time.saturating_sub(p.qpc_time)
}
