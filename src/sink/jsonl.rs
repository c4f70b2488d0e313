use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use super::Sink;
use crate::aggregate::window::ticks_to_ms;
use crate::aggregate::{PresentRow, Report};
use crate::engine::Verbosity;
use crate::present::{PresentMode, PresentResult};
use crate::vr::{CompositorFrame, LateStageReprojection};

/// One output line.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line<'a> {
    Present(PresentLine<'a>),
    CompositorFrame(&'a CompositorFrame),
    Lsr(&'a LateStageReprojection),
}

/// Per-present columns. Optional columns only appear at the verbosity that
/// enables them.
#[derive(Serialize)]
struct PresentLine<'a> {
    application: &'a str,
    process_id: u32,
    swap_chain_address: String,
    runtime: &'static str,
    sync_interval: i32,
    present_flags: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    allows_tearing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    present_mode: Option<PresentMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    was_batched: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dwm_notified: Option<bool>,
    dropped: &'static str,
    time_in_seconds: f64,
    ms_between_presents: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    ms_between_display_change: Option<f64>,
    ms_in_present_api: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    ms_until_render_complete: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ms_until_displayed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plane_index: Option<u32>,
}

fn dropped_column(result: PresentResult) -> &'static str {
    match result {
        PresentResult::Presented => "0",
        PresentResult::Error => "Error",
        _ => "1",
    }
}

/// JsonlSink writes one JSON object per line for every reported record.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
    frequency: u64,
    verbosity: Verbosity,
    exclude_dropped: bool,
    /// Timestamp that `time_in_seconds` counts from.
    start_qpc: Option<u64>,
    lines: u64,
}

impl JsonlSink {
    pub fn create(
        path: &Path,
        frequency: u64,
        verbosity: Verbosity,
        exclude_dropped: bool,
    ) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("creating report file {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            frequency,
            verbosity,
            exclude_dropped,
            start_qpc: None,
            lines: 0,
        })
    }

    fn present_line<'a>(&self, row: &'a PresentRow, start: u64) -> PresentLine<'a> {
        let p = &row.present;
        let detailed = self.verbosity > Verbosity::Simple;
        let verbose = self.verbosity >= Verbosity::Verbose;
        let ms = |ticks: u64| ticks_to_ms(ticks, self.frequency);

        let ready = if p.ready_time == 0 {
            0.0
        } else {
            ms(p.ready_time.saturating_sub(p.qpc_time))
        };
        let displayed = if p.is_presented() {
            ms(p.screen_time.saturating_sub(p.qpc_time))
        } else {
            0.0
        };

        PresentLine {
            application: &row.process_name,
            process_id: p.process_id,
            swap_chain_address: format!("0x{:016X}", p.swap_chain),
            runtime: p.runtime.as_str(),
            sync_interval: p.sync_interval,
            present_flags: p.present_flags,
            allows_tearing: detailed.then_some(p.supports_tearing),
            present_mode: detailed.then_some(p.mode),
            was_batched: verbose.then_some(p.was_batched),
            dwm_notified: verbose.then_some(p.dwm_notified),
            dropped: dropped_column(p.final_state),
            time_in_seconds: (p.qpc_time as i64 - start as i64) as f64 / self.frequency as f64,
            ms_between_presents: row.ms_between_presents,
            ms_between_display_change: detailed.then_some(row.ms_between_display_change),
            ms_in_present_api: ms(p.time_taken),
            ms_until_render_complete: detailed.then_some(ready),
            ms_until_displayed: detailed.then_some(displayed),
            plane_index: verbose.then_some(p.plane_index),
        }
    }

    fn write_line(&mut self, line: &Line<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.writer, line).context("encoding report line")?;
        self.writer
            .write_all(b"\n")
            .context("writing report line")?;
        self.lines += 1;
        Ok(())
    }

    fn first_timestamp(report: &Report) -> Option<u64> {
        let presents = report.presents.iter().map(|r| r.present.qpc_time);
        let frames = report.compositor_frames.iter().map(|f| f.qpc_time);
        let lsrs = report.lsrs.iter().map(|l| l.qpc_time);
        presents.chain(frames).chain(lsrs).min()
    }
}

impl Sink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn write(&mut self, report: &Report) -> Result<()> {
        if self.start_qpc.is_none() {
            self.start_qpc = Self::first_timestamp(report);
        }
        let start = self.start_qpc.unwrap_or(0);

        for row in &report.presents {
            // Rows need a previous present on the chain for their deltas.
            if row.first_on_chain {
                continue;
            }
            if self.exclude_dropped && !row.present.is_presented() {
                continue;
            }
            let line = Line::Present(self.present_line(row, start));
            self.write_line(&line)?;
        }
        for frame in &report.compositor_frames {
            self.write_line(&Line::CompositorFrame(frame))?;
        }
        for lsr in &report.lsrs {
            if self.exclude_dropped && lsr.final_state.is_missed() {
                continue;
            }
            self.write_line(&Line::Lsr(lsr))?;
        }

        self.writer.flush().context("flushing report file")?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.writer.flush().context("flushing report file")?;
        info!(path = %self.path.display(), lines = self.lines, "Report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::present::{Present, Runtime};
    use crate::vr::CompositorKind;

    const FREQ: u64 = 1_000;

    fn row(qpc: u64, state: PresentResult, first: bool) -> PresentRow {
        let mut p = Present::new(qpc, 42, 1, Runtime::Dxgi);
        p.swap_chain = 0xbeef;
        p.sync_interval = 1;
        p.final_state = state;
        p.mode = PresentMode::HardwareIndependentFlip;
        p.time_taken = 2;
        p.ready_time = qpc + 3;
        p.screen_time = qpc + 10;
        PresentRow {
            process_name: "game.exe".to_string(),
            ms_between_presents: 16.0,
            ms_between_display_change: 16.0,
            first_on_chain: first,
            present: p,
        }
    }

    fn lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_present_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.jsonl");
        let mut sink = JsonlSink::create(&path, FREQ, Verbosity::Normal, false).unwrap();

        let report = Report {
            presents: vec![
                row(1000, PresentResult::Presented, true),
                row(1016, PresentResult::Presented, false),
                row(1032, PresentResult::Discarded, false),
            ],
            ..Report::default()
        };
        sink.write(&report).unwrap();
        sink.close().unwrap();

        let out = lines(&path);
        assert_eq!(out.len(), 2);
        let first = &out[0];
        assert_eq!(first["type"], "present");
        assert_eq!(first["application"], "game.exe");
        assert_eq!(first["swap_chain_address"], "0x000000000000BEEF");
        assert_eq!(first["runtime"], "DXGI");
        assert_eq!(first["present_mode"], "Hardware: Independent Flip");
        assert_eq!(first["dropped"], "0");
        assert_eq!(first["time_in_seconds"], 0.016);
        assert_eq!(first["ms_in_present_api"], 2.0);
        assert_eq!(first["ms_until_render_complete"], 3.0);
        assert_eq!(first["ms_until_displayed"], 10.0);
        // Verbose-only columns are absent.
        assert!(first.get("was_batched").is_none());
        assert!(first.get("plane_index").is_none());

        assert_eq!(out[1]["dropped"], "1");
        assert_eq!(out[1]["ms_until_displayed"], 0.0);
    }

    #[test]
    fn test_simple_columns_and_exclude_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.jsonl");
        let mut sink = JsonlSink::create(&path, FREQ, Verbosity::Simple, true).unwrap();

        let mut frame = CompositorFrame::new(CompositorKind::SteamVr, 1040, 42);
        frame.completed = true;
        let report = Report {
            presents: vec![
                row(1016, PresentResult::Presented, false),
                row(1032, PresentResult::Discarded, false),
            ],
            compositor_frames: vec![frame],
            ..Report::default()
        };
        sink.write(&report).unwrap();
        sink.close().unwrap();

        let out = lines(&path);
        assert_eq!(out.len(), 2);
        assert!(out[0].get("present_mode").is_none());
        assert!(out[0].get("ms_until_displayed").is_none());
        assert_eq!(out[1]["type"], "compositor_frame");
        assert_eq!(out[1]["kind"], "steamvr");
    }
}
