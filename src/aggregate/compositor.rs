use super::window::{ticks_to_ms, RollingWindow, Timed};
use crate::vr::CompositorFrame;

pub const COMPOSITOR_HISTORY_MS: u64 = 2000;
pub const MAX_FRAMES_IN_WINDOW: usize = 240;

impl Timed for CompositorFrame {
    fn qpc_time(&self) -> u64 {
        self.qpc_time
    }
}

/// Rolling statistics for one VR compositor.
#[derive(Debug, Clone)]
pub struct CompositorData {
    history: RollingWindow<CompositorFrame>,
    pub last_process: u32,
    pub last_update: u64,
}

impl Default for CompositorData {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositorData {
    pub fn new() -> Self {
        Self {
            history: RollingWindow::new(MAX_FRAMES_IN_WINDOW, COMPOSITOR_HISTORY_MS),
            last_process: 0,
            last_update: 0,
        }
    }

    pub fn add(&mut self, frame: &CompositorFrame, frequency: u64) {
        self.history.push(frame.clone());
        self.history.prune(frequency);
        self.last_process = frame.process_id;
        self.last_update = frame.qpc_time;
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn fps(&self, frequency: u64) -> f64 {
        self.history.fps(frequency)
    }

    pub fn app_misses(&self) -> usize {
        self.history.iter().filter(|f| f.app_miss).count()
    }

    pub fn warp_misses(&self) -> usize {
        self.history.iter().filter(|f| f.warp_miss).count()
    }

    /// Average app render time over frames that saw both ends.
    pub fn app_render_ms(&self, frequency: u64) -> f64 {
        average_ms(
            self.history
                .iter()
                .map(|f| (f.app_render_start, f.app_render_end)),
            frequency,
        )
    }

    pub fn reprojection_ms(&self, frequency: u64) -> f64 {
        average_ms(
            self.history
                .iter()
                .map(|f| (f.reprojection_start, f.reprojection_end)),
            frequency,
        )
    }
}

fn average_ms(spans: impl Iterator<Item = (u64, u64)>, frequency: u64) -> f64 {
    let (total, count) = spans
        .filter(|&(start, end)| start != 0 && end >= start)
        .fold((0u64, 0u32), |(total, count), (start, end)| {
            (total + (end - start), count + 1)
        });
    if count == 0 {
        return 0.0;
    }
    ticks_to_ms(total, frequency) / f64::from(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vr::CompositorKind;

    const FREQ: u64 = 1_000;

    fn frame(ms: u64, app_miss: bool, warp_miss: bool) -> CompositorFrame {
        let mut f = CompositorFrame::new(CompositorKind::SteamVr, ms, 9);
        f.app_render_start = ms;
        f.app_render_end = ms + 4;
        f.reprojection_start = ms + 5;
        f.reprojection_end = ms + 7;
        f.app_miss = app_miss;
        f.warp_miss = warp_miss;
        f
    }

    #[test]
    fn test_compositor_stats() {
        let mut d = CompositorData::new();
        assert_eq!(d.fps(FREQ), 0.0);
        assert_eq!(d.app_render_ms(FREQ), 0.0);

        d.add(&frame(0, false, false), FREQ);
        d.add(&frame(11, true, false), FREQ);
        d.add(&frame(22, false, true), FREQ);

        let mut fabricated = CompositorFrame::new(CompositorKind::SteamVr, 33, 9);
        fabricated.reprojection_start = 38;
        fabricated.reprojection_end = 40;
        d.add(&fabricated, FREQ);

        assert_eq!(d.len(), 4);
        assert!((d.fps(FREQ) - 3.0 / 0.033).abs() < 1e-6);
        assert_eq!(d.app_misses(), 1);
        assert_eq!(d.warp_misses(), 1);
        assert_eq!(d.app_render_ms(FREQ), 4.0);
        assert_eq!(d.reprojection_ms(FREQ), 2.0);
        assert_eq!(d.last_process, 9);
    }
}
