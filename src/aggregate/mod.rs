//! Consumer-side aggregation of completed records into rolling windows.

pub mod compositor;
pub mod lsr;
pub mod process;
pub mod swap_chain;
pub mod window;

use std::collections::HashMap;

use tracing::debug;

use crate::engine::{Batch, ProcessEvent};
use crate::present::Present;
use crate::vr::{CompositorFrame, CompositorKind, LateStageReprojection};

pub use self::compositor::CompositorData;
pub use self::lsr::{LateStageReprojectionData, LsrRuntimeStats};
pub use self::process::{PresentContext, ProcessFilter, ProcessInfo, ProcessTable};
pub use self::swap_chain::SwapChainData;
pub use self::window::{RollingWindow, RuntimeStat, Timed};

/// A completed present with the context a report row needs.
#[derive(Debug, Clone)]
pub struct PresentRow {
    pub process_name: String,
    /// Milliseconds since the previous present on the same swap chain.
    pub ms_between_presents: f64,
    /// Milliseconds since the previous displayed present reached the screen,
    /// 0 unless this present was displayed too.
    pub ms_between_display_change: f64,
    /// First present seen on its swap chain.
    pub first_on_chain: bool,
    pub present: Present,
}

/// Records accepted from one batch, in emission order.
#[derive(Debug, Default)]
pub struct Report {
    pub presents: Vec<PresentRow>,
    pub compositor_frames: Vec<CompositorFrame>,
    pub lsrs: Vec<LateStageReprojection>,
    /// Swap chains evicted as stale while applying the batch.
    pub evicted_swap_chains: usize,
}

/// All consumer-side statistics.
#[derive(Debug)]
pub struct Aggregator {
    frequency: u64,
    processes: ProcessTable,
    lsr: LateStageReprojectionData,
    compositors: HashMap<CompositorKind, CompositorData>,
    /// Latest trace time seen.
    now: u64,
}

impl Aggregator {
    pub fn new(frequency: u64, filter: ProcessFilter) -> Self {
        Self {
            frequency,
            processes: ProcessTable::new(filter),
            lsr: LateStageReprojectionData::new(),
            compositors: HashMap::new(),
            now: 0,
        }
    }

    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn lsr(&self) -> &LateStageReprojectionData {
        &self.lsr
    }

    pub fn compositor(&self, kind: CompositorKind) -> Option<&CompositorData> {
        self.compositors.get(&kind)
    }

    /// Apply a drained batch. Process starts apply first and stops last,
    /// so a process's final presents are still attributed to it.
    pub fn apply(&mut self, batch: Batch) -> Report {
        let Batch {
            process_events,
            presents,
            compositor_frames,
            lsrs,
        } = batch;
        let mut report = Report::default();

        for ev in &process_events {
            if let ProcessEvent::Start {
                process_id,
                image_name,
                ..
            } = ev
            {
                self.processes.start(*process_id, image_name);
            }
        }

        report.presents.reserve(presents.len());
        for present in presents {
            self.now = self.now.max(present.qpc_time);
            let Some(ctx) = self.processes.add_present(&present, self.frequency) else {
                continue;
            };
            let ms_between_presents = ctx.previous_present.map_or(0.0, |prev| {
                window::ticks_to_ms(present.qpc_time.saturating_sub(prev), self.frequency)
            });
            let ms_between_display_change = match ctx.previous_screen {
                Some(prev) if present.is_presented() => {
                    window::ticks_to_ms(present.screen_time.saturating_sub(prev), self.frequency)
                }
                _ => 0.0,
            };
            report.presents.push(PresentRow {
                process_name: ctx.image_name,
                ms_between_presents,
                ms_between_display_change,
                first_on_chain: ctx.previous_present.is_none(),
                present,
            });
        }

        for frame in compositor_frames {
            self.now = self.now.max(frame.qpc_time);
            self.compositors
                .entry(frame.kind)
                .or_default()
                .add(&frame, self.frequency);
            report.compositor_frames.push(frame);
        }

        for lsr in lsrs {
            self.now = self.now.max(lsr.qpc_time);
            if self.lsr.reset_if_stale(lsr.qpc_time, self.frequency) {
                debug!(qpc = lsr.qpc_time, "Reset stale reprojection data");
            }
            self.lsr.add(&lsr, self.frequency);
            report.lsrs.push(lsr);
        }

        for ev in &process_events {
            if let ProcessEvent::Stop { process_id, .. } = ev {
                self.processes.stop(*process_id);
            }
        }

        report.evicted_swap_chains = self.processes.evict_stale(self.now, self.frequency);
        if self.lsr.reset_if_stale(self.now, self.frequency) {
            debug!(qpc = self.now, "Reset stale reprojection data");
        }
        report
    }
}
