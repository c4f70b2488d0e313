use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::info;

use super::Sink;
use crate::aggregate::{Aggregator, Report};
use crate::engine::Verbosity;
use crate::vr::CompositorKind;

/// SummarySink periodically logs rolling per-swap-chain statistics.
pub struct SummarySink {
    interval: Duration,
    verbosity: Verbosity,
    last_emit: Option<Instant>,
    presents_since: u64,
}

impl SummarySink {
    pub fn new(interval: Duration, verbosity: Verbosity) -> Self {
        Self {
            interval,
            verbosity,
            last_emit: None,
            presents_since: 0,
        }
    }

    fn due(&self, now: Instant) -> bool {
        self.last_emit
            .map_or(true, |last| now.duration_since(last) >= self.interval)
    }

    fn emit(&self, agg: &Aggregator) {
        let freq = agg.frequency();

        for (pid, process) in agg.processes().iter() {
            if !process.target {
                continue;
            }
            for (address, chain) in &process.swap_chains {
                let address = format!("0x{address:016X}");
                let fps = chain.fps(freq);
                let cpu_ms = chain.cpu_frame_time_ms(freq);

                match self.verbosity {
                    Verbosity::Off | Verbosity::Simple => info!(
                        process = %process.image_name,
                        pid = *pid,
                        swap_chain = %address,
                        runtime = %chain.runtime,
                        fps = round2(fps),
                        cpu_ms = round2(cpu_ms),
                        "Swap chain",
                    ),
                    Verbosity::Normal => info!(
                        process = %process.image_name,
                        pid = *pid,
                        swap_chain = %address,
                        runtime = %chain.runtime,
                        fps = round2(fps),
                        displayed_fps = round2(chain.displayed_fps(freq)),
                        cpu_ms = round2(cpu_ms),
                        latency_ms = round2(chain.latency_ms(freq)),
                        mode = %chain.last_mode,
                        "Swap chain",
                    ),
                    Verbosity::Verbose => info!(
                        process = %process.image_name,
                        pid = *pid,
                        swap_chain = %address,
                        runtime = %chain.runtime,
                        fps = round2(fps),
                        displayed_fps = round2(chain.displayed_fps(freq)),
                        cpu_ms = round2(cpu_ms),
                        latency_ms = round2(chain.latency_ms(freq)),
                        latency_p99_ms =
                            round2(chain.latency_percentile_ms(99.0, freq)),
                        mode = %chain.last_mode,
                        plane = chain.last_plane,
                        sync_interval = chain.last_sync_interval,
                        flags = chain.last_flags,
                        batched = chain.batched,
                        dwm_notified = chain.dwm_notified,
                        "Swap chain",
                    ),
                }
            }
        }

        for kind in [CompositorKind::SteamVr, CompositorKind::OculusVr] {
            let Some(data) = agg.compositor(kind) else {
                continue;
            };
            if data.len() < 2 {
                continue;
            }
            info!(
                compositor = %kind,
                pid = data.last_process,
                fps = round2(data.fps(freq)),
                app_render_ms = round2(data.app_render_ms(freq)),
                reprojection_ms = round2(data.reprojection_ms(freq)),
                app_misses = data.app_misses(),
                warp_misses = data.warp_misses(),
                "Compositor",
            );
        }

        let lsr = agg.lsr();
        if lsr.history_len() > 0 {
            let stats = lsr.runtime_stats(freq);
            info!(
                app_pid = stats.app_process_id,
                lsr_pid = stats.lsr_process_id,
                fps = round2(lsr.fps(freq)),
                app_fps = round2(lsr.source_fps(freq)),
                displayed_fps = round2(lsr.displayed_fps(freq)),
                gpu_ms = round2(stats.gpu_execution_ms.avg()),
                input_latch_to_vsync_ms =
                    round2(stats.input_latch_to_vsync_ms.avg()),
                app_missed = stats.app_missed_frames,
                lsr_missed = stats.lsr_missed_frames,
                lsr_consecutive_missed = stats.lsr_consecutive_missed_frames,
                "Late stage reprojection",
            );
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl Sink for SummarySink {
    fn name(&self) -> &str {
        "summary"
    }

    fn write(&mut self, report: &Report) -> Result<()> {
        self.presents_since += report.presents.len() as u64;
        Ok(())
    }

    fn tick(&mut self, aggregator: &Aggregator) -> Result<()> {
        let now = Instant::now();
        if !self.due(now) {
            return Ok(());
        }
        self.last_emit = Some(now);

        if self.presents_since > 0 || aggregator.lsr().history_len() > 0 {
            info!(
                presents = self.presents_since,
                processes = aggregator.processes().len(),
                swap_chains = aggregator.processes().swap_chain_count(),
                "Summary",
            );
            self.emit(aggregator);
        }
        self.presents_since = 0;

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
