//! Present tracking: reconstructs one completed [`Present`] per attempted
//! frame from runtime, kernel and compositor events.
//!
//! All state lives in [`PresentTracker`], which is owned by the producer
//! thread. Completed presents leave through a [`CompletedQueue`] in
//! per-swap-chain submission order.
//!
//! [`CompletedQueue`]: crate::engine::CompletedQueue

pub mod arena;
pub mod dwm;
pub mod dxgkrnl;
pub mod index;
pub mod runtime;
pub mod tracker;
pub mod win32k;

use std::fmt;

use serde::Serialize;

pub use self::arena::PresentId;
pub use self::tracker::PresentTracker;

/// DXGI_PRESENT_* flags carried in `Present::present_flags`.
pub mod flags {
    pub const TEST: u32 = 0x1;
    pub const DO_NOT_SEQUENCE: u32 = 0x2;
    pub const RESTART: u32 = 0x4;
    pub const DO_NOT_WAIT: u32 = 0x8;
}

/// The API family that issued a present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Runtime {
    #[serde(rename = "DXGI")]
    Dxgi,
    #[serde(rename = "D3D9")]
    D3d9,
    Other,
}

impl Runtime {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dxgi => "DXGI",
            Self::D3d9 => "D3D9",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a present reached the screen. Refined as events arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PresentMode {
    #[default]
    Unknown,
    HardwareLegacyFlip,
    HardwareLegacyCopyToFrontBuffer,
    HardwareDirectFlip,
    HardwareIndependentFlip,
    ComposedFlip,
    ComposedCopyGpuGdi,
    ComposedCopyCpuGdi,
    ComposedCompositionAtlas,
    HardwareComposedIndependentFlip,
}

impl PresentMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Other",
            Self::HardwareLegacyFlip => "Hardware: Legacy Flip",
            Self::HardwareLegacyCopyToFrontBuffer => "Hardware: Legacy Copy to front buffer",
            Self::HardwareDirectFlip => "Hardware: Direct Flip",
            Self::HardwareIndependentFlip => "Hardware: Independent Flip",
            Self::ComposedFlip => "Composed: Flip",
            Self::ComposedCopyGpuGdi => "Composed: Copy with GPU GDI",
            Self::ComposedCopyCpuGdi => "Composed: Copy with CPU GDI",
            Self::ComposedCompositionAtlas => "Composed: Composition Atlas",
            Self::HardwareComposedIndependentFlip => "Hardware Composed: Independent Flip",
        }
    }
}

impl fmt::Display for PresentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PresentMode {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

/// Final outcome of a present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum PresentResult {
    #[default]
    Unknown,
    Presented,
    Discarded,
    Error,
}

impl PresentResult {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Presented => "presented",
            Self::Discarded => "discarded",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for PresentResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Win32K present-history token: (composition surface, present count, bind id).
pub type Win32kToken = (u64, u64, u64);

/// Keys a present was registered under in the secondary indices, so
/// completion can unlink it from each one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct IndexKeys {
    pub win32k_token: Option<Win32kToken>,
    pub legacy_blit_token: Option<u64>,
    pub blt_context: Option<u64>,
}

/// A single attempted frame.
///
/// Timestamps are QPC ticks; zero means "not observed".
#[derive(Debug, Clone, PartialEq)]
pub struct Present {
    /// Creation timestamp.
    pub qpc_time: u64,
    pub swap_chain: u64,
    pub sync_interval: i32,
    pub present_flags: u32,
    pub process_id: u32,

    pub mode: PresentMode,
    pub supports_tearing: bool,
    pub mmio: bool,
    pub seen_dxgk_present: bool,
    pub seen_win32k_events: bool,
    pub was_batched: bool,
    pub dwm_notified: bool,

    pub runtime: Runtime,

    /// Ticks spent inside the runtime present call.
    pub time_taken: u64,
    /// GPU work completed.
    pub ready_time: u64,
    /// Shown, or would have been shown.
    pub screen_time: u64,
    pub final_state: PresentResult,
    pub plane_index: u32,

    pub queue_submit_sequence: u32,
    pub runtime_thread: u32,
    pub hwnd: u64,
    pub token_ptr: u64,
    pub completed: bool,

    /// Creation order, breaks ties between presents with equal timestamps.
    pub(crate) seq: u64,
    pub(crate) dependents: Vec<PresentId>,
    pub(crate) keys: IndexKeys,
}

impl Present {
    pub fn new(qpc_time: u64, process_id: u32, thread_id: u32, runtime: Runtime) -> Self {
        Self {
            qpc_time,
            swap_chain: 0,
            sync_interval: -1,
            present_flags: 0,
            process_id,
            mode: PresentMode::Unknown,
            supports_tearing: false,
            mmio: false,
            seen_dxgk_present: false,
            seen_win32k_events: false,
            was_batched: false,
            dwm_notified: false,
            runtime,
            time_taken: 0,
            ready_time: 0,
            screen_time: 0,
            final_state: PresentResult::Unknown,
            plane_index: 0,
            queue_submit_sequence: 0,
            runtime_thread: thread_id,
            hwnd: 0,
            token_ptr: 0,
            completed: false,
            seq: 0,
            dependents: Vec::new(),
            keys: IndexKeys::default(),
        }
    }

    /// Record a ready signal, keeping the earliest one.
    pub(crate) fn stamp_ready(&mut self, t: u64) {
        self.ready_time = if self.ready_time == 0 {
            t
        } else {
            self.ready_time.min(t)
        };
    }

    /// Record a screen time unless one is already set.
    pub(crate) fn stamp_screen(&mut self, t: u64) {
        if self.screen_time == 0 {
            self.screen_time = t;
        }
    }

    /// A terminal "shown" signal: first screen time and outcome win.
    pub(crate) fn stamp_presented(&mut self, t: u64) {
        self.stamp_screen(t);
        if self.final_state == PresentResult::Unknown {
            self.final_state = PresentResult::Presented;
        }
    }

    pub fn is_presented(&self) -> bool {
        self.final_state == PresentResult::Presented
    }

    /// Swap-chain ordering key.
    pub fn chain_key(&self) -> (u32, u64) {
        (self.process_id, self.swap_chain)
    }
}
