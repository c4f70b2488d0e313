//! Producer-side event dispatch.
//!
//! [`Engine`] owns every correlation tracker and routes each decoded event
//! to the one responsible for its provider. Completed records leave through
//! the [`CompletedQueue`]s in [`Outputs`], which the consumer drains.

pub mod queue;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub use self::queue::CompletedQueue;

use crate::present::{Present, PresentTracker};
use crate::tracer::event::{opcode, EventRecord, FieldError, Provider};
use crate::tracer::stats::{PipelineStats, ProviderStats};
use crate::vr::{
    CompositorFrame, LateStageReprojection, MixedRealityTracker, OculusTracker, SteamVrTracker,
};

/// Tracking detail. Higher levels subscribe to more providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    #[default]
    Off,
    Simple,
    Normal,
    Verbose,
}

impl Verbosity {
    pub fn is_enabled(self) -> bool {
        self != Self::Off
    }
}

/// Which pipelines to track and in how much detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Present tracking. `Simple` disables everything past the runtime call.
    pub presents: Verbosity,
    pub mixed_reality: Verbosity,
    pub steamvr: Verbosity,
    pub oculusvr: Verbosity,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            presents: Verbosity::Normal,
            mixed_reality: Verbosity::Off,
            steamvr: Verbosity::Off,
            oculusvr: Verbosity::Off,
        }
    }
}

impl EngineOptions {
    pub fn simple_mode(&self) -> bool {
        self.presents <= Verbosity::Simple
    }

    /// Providers the event source should enable.
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers = vec![Provider::NtProcess, Provider::Dxgi, Provider::D3d9];

        if !self.simple_mode() {
            providers.extend(Provider::all().iter().copied().filter(|p| p.is_detailed()));
        }
        if self.steamvr.is_enabled() {
            providers.push(Provider::SteamVr);
        }
        if self.oculusvr.is_enabled() {
            providers.push(Provider::OculusVr);
        }
        if self.mixed_reality.is_enabled() {
            providers.push(Provider::HolographicDisplay);
        }
        if self.mixed_reality > Verbosity::Simple {
            providers.push(Provider::SpectrumContinuous);
        }

        providers
    }
}

/// A process appearing or going away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProcessEvent {
    Start {
        process_id: u32,
        image_name: String,
        qpc_time: u64,
    },
    Stop {
        process_id: u32,
        qpc_time: u64,
    },
}

impl ProcessEvent {
    pub fn process_id(&self) -> u32 {
        match self {
            Self::Start { process_id, .. } | Self::Stop { process_id, .. } => *process_id,
        }
    }
}

/// Consumer-facing hand-off queues and counters.
#[derive(Clone, Default)]
pub struct Outputs {
    pub presents: Arc<CompletedQueue<Present>>,
    pub process_events: Arc<CompletedQueue<ProcessEvent>>,
    pub compositor_frames: Arc<CompletedQueue<CompositorFrame>>,
    pub lsrs: Arc<CompletedQueue<LateStageReprojection>>,
    pub stats: Arc<PipelineStats>,
    pub provider_stats: Arc<ProviderStats>,
}

impl Outputs {
    /// Take everything completed since the last drain.
    pub fn drain(&self) -> Batch {
        Batch {
            process_events: self.process_events.try_dequeue_all(),
            presents: self.presents.try_dequeue_all(),
            compositor_frames: self.compositor_frames.try_dequeue_all(),
            lsrs: self.lsrs.try_dequeue_all(),
        }
    }
}

/// One consumer tick's worth of completed records.
#[derive(Debug, Default)]
pub struct Batch {
    pub process_events: Vec<ProcessEvent>,
    pub presents: Vec<Present>,
    pub compositor_frames: Vec<CompositorFrame>,
    pub lsrs: Vec<LateStageReprojection>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.process_events.len()
            + self.presents.len()
            + self.compositor_frames.len()
            + self.lsrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Engine context owned by the producer thread.
pub struct Engine {
    options: EngineOptions,
    presents: PresentTracker,
    steamvr: Option<SteamVrTracker>,
    oculus: Option<OculusTracker>,
    mixed_reality: Option<MixedRealityTracker>,
    outputs: Outputs,
}

impl Engine {
    pub fn new(options: EngineOptions, outputs: Outputs) -> Self {
        let simple = options.simple_mode();
        Self {
            options,
            presents: PresentTracker::new(
                simple,
                Arc::clone(&outputs.presents),
                Arc::clone(&outputs.stats),
            ),
            steamvr: options
                .steamvr
                .is_enabled()
                .then(|| SteamVrTracker::new(Arc::clone(&outputs.compositor_frames))),
            oculus: options
                .oculusvr
                .is_enabled()
                .then(|| OculusTracker::new(Arc::clone(&outputs.compositor_frames))),
            mixed_reality: options.mixed_reality.is_enabled().then(|| {
                MixedRealityTracker::new(
                    options.mixed_reality <= Verbosity::Simple,
                    Arc::clone(&outputs.lsrs),
                )
            }),
            outputs,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn outputs(&self) -> &Outputs {
        &self.outputs
    }

    pub fn presents(&self) -> &PresentTracker {
        &self.presents
    }

    /// Handle one event. Events with unusable payloads are counted and dropped.
    pub fn handle(&mut self, ev: &EventRecord) {
        self.outputs.provider_stats.record(ev.provider);

        if let Err(e) = self.dispatch(ev) {
            self.outputs.stats.event_dropped();
            debug!(error = %e, provider = %ev.provider, id = ev.id, "Dropping event");
        }
    }

    /// Emit anything that only completes when the next event arrives.
    pub fn finish(&mut self) {
        if let Some(mr) = &mut self.mixed_reality {
            mr.flush();
        }
    }

    fn dispatch(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        let simple = self.presents.simple_mode();
        match ev.provider {
            Provider::Dxgi => self.presents.handle_dxgi(ev),
            Provider::D3d9 => self.presents.handle_d3d9(ev),
            Provider::NtProcess => self.handle_process(ev),
            Provider::DxgKrnl if !simple => self.presents.handle_dxgkrnl(ev),
            Provider::Win7DxgkBlt
            | Provider::Win7DxgkFlip
            | Provider::Win7DxgkPresentHistory
            | Provider::Win7DxgkQueuePacket
            | Provider::Win7DxgkVSyncDpc
            | Provider::Win7DxgkMmioFlip
                if !simple =>
            {
                self.presents.handle_legacy_dxgkrnl(ev)
            }
            Provider::Win32k if !simple => self.presents.handle_win32k(ev),
            Provider::Dwm | Provider::Win7Dwm if !simple => self.presents.handle_dwm(ev),
            Provider::SteamVr => match &mut self.steamvr {
                Some(t) => t.handle(ev),
                None => Ok(()),
            },
            Provider::OculusVr => match &mut self.oculus {
                Some(t) => t.handle(ev),
                None => Ok(()),
            },
            Provider::HolographicDisplay | Provider::SpectrumContinuous => {
                match &mut self.mixed_reality {
                    Some(t) => t.handle(ev),
                    None => Ok(()),
                }
            }
            _ => {
                trace!(provider = %ev.provider, id = ev.id, "Ignoring event in simple mode");
                Ok(())
            }
        }
    }

    fn handle_process(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        let event = match ev.opcode {
            opcode::START | opcode::DC_START => ProcessEvent::Start {
                process_id: ev.u32("ProcessId")?,
                image_name: ev.str("ImageFileName")?.trim_end_matches('\0').to_string(),
                qpc_time: ev.timestamp,
            },
            opcode::STOP | opcode::DC_END => ProcessEvent::Stop {
                process_id: ev.u32("ProcessId")?,
                qpc_time: ev.timestamp,
            },
            _ => return Ok(()),
        };
        self.outputs.process_events.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::dxgi;

    fn engine(options: EngineOptions) -> Engine {
        Engine::new(options, Outputs::default())
    }

    #[test]
    fn test_providers_follow_verbosity() {
        let simple = EngineOptions {
            presents: Verbosity::Simple,
            ..EngineOptions::default()
        };
        assert_eq!(
            simple.providers(),
            vec![Provider::NtProcess, Provider::Dxgi, Provider::D3d9]
        );

        let normal = EngineOptions::default().providers();
        assert!(normal.contains(&Provider::DxgKrnl));
        assert!(normal.contains(&Provider::Win7Dwm));
        assert!(!normal.contains(&Provider::SteamVr));

        let vr = EngineOptions {
            mixed_reality: Verbosity::Simple,
            steamvr: Verbosity::Normal,
            ..EngineOptions::default()
        }
        .providers();
        assert!(vr.contains(&Provider::SteamVr));
        assert!(vr.contains(&Provider::HolographicDisplay));
        assert!(!vr.contains(&Provider::SpectrumContinuous));
        assert!(!vr.contains(&Provider::OculusVr));
    }

    #[test]
    fn test_process_events() {
        let mut e = engine(EngineOptions::default());
        e.handle(
            &EventRecord::new(Provider::NtProcess, 1, 4, 4, 10)
                .with_opcode(opcode::DC_START)
                .with_field("ProcessId", 77u32)
                .with_field("ImageFileName", "game.exe\0"),
        );
        e.handle(
            &EventRecord::new(Provider::NtProcess, 2, 4, 4, 20)
                .with_opcode(opcode::STOP)
                .with_field("ProcessId", 77u32),
        );

        let events = e.outputs().process_events.try_dequeue_all();
        assert_eq!(
            events,
            vec![
                ProcessEvent::Start {
                    process_id: 77,
                    image_name: "game.exe".to_string(),
                    qpc_time: 10,
                },
                ProcessEvent::Stop {
                    process_id: 77,
                    qpc_time: 20,
                },
            ]
        );
    }

    #[test]
    fn test_bad_payload_is_counted() {
        let mut e = engine(EngineOptions::default());
        // Missing every field.
        e.handle(&EventRecord::new(Provider::Dxgi, dxgi::PRESENT_START, 1, 1, 10));

        let snap = e.outputs().stats.snapshot();
        assert_eq!(snap.events_dropped, 1);
        assert_eq!(e.outputs().provider_stats.snapshot(), vec![(Provider::Dxgi, 1)]);
    }

    #[test]
    fn test_simple_mode_ignores_kernel_events() {
        let mut e = engine(EngineOptions {
            presents: Verbosity::Simple,
            ..EngineOptions::default()
        });
        e.handle(&EventRecord::new(Provider::DxgKrnl, 178, 1, 1, 10));
        assert_eq!(e.outputs().stats.snapshot().events_dropped, 0);
        assert_eq!(e.presents().in_flight(), 0);
    }

    #[test]
    fn test_disabled_vr_is_ignored() {
        let mut e = engine(EngineOptions::default());
        e.handle(&EventRecord::new(Provider::SteamVr, 0, 1, 1, 10));
        assert_eq!(e.outputs().stats.snapshot().events_dropped, 0);
    }
}
