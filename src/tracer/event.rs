use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Provider identifies the trace provider an event record was emitted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Provider {
    Dxgi = 1,
    D3d9 = 2,
    DxgKrnl = 3,
    Win32k = 4,
    Dwm = 5,
    NtProcess = 6,
    Win7DxgkBlt = 7,
    Win7DxgkFlip = 8,
    Win7DxgkPresentHistory = 9,
    Win7DxgkQueuePacket = 10,
    Win7DxgkVSyncDpc = 11,
    Win7DxgkMmioFlip = 12,
    Win7Dwm = 13,
    SteamVr = 14,
    OculusVr = 15,
    HolographicDisplay = 16,
    SpectrumContinuous = 17,
}

/// Maximum Provider value, used for array sizing.
pub const MAX_PROVIDER: usize = 17;

impl Provider {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dxgi => "dxgi",
            Self::D3d9 => "d3d9",
            Self::DxgKrnl => "dxgkrnl",
            Self::Win32k => "win32k",
            Self::Dwm => "dwm",
            Self::NtProcess => "nt_process",
            Self::Win7DxgkBlt => "win7_dxgk_blt",
            Self::Win7DxgkFlip => "win7_dxgk_flip",
            Self::Win7DxgkPresentHistory => "win7_dxgk_present_history",
            Self::Win7DxgkQueuePacket => "win7_dxgk_queue_packet",
            Self::Win7DxgkVSyncDpc => "win7_dxgk_vsync_dpc",
            Self::Win7DxgkMmioFlip => "win7_dxgk_mmio_flip",
            Self::Win7Dwm => "win7_dwm",
            Self::SteamVr => "steamvr",
            Self::OculusVr => "oculusvr",
            Self::HolographicDisplay => "holographic_display",
            Self::SpectrumContinuous => "spectrum_continuous",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        Self::all().iter().copied().find(|p| *p as u8 == v)
    }

    /// Convert from the canonical label name.
    pub fn from_str(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|p| p.as_str() == name)
    }

    /// Return all providers in numeric order.
    pub fn all() -> &'static [Self] {
        &[
            Self::Dxgi,
            Self::D3d9,
            Self::DxgKrnl,
            Self::Win32k,
            Self::Dwm,
            Self::NtProcess,
            Self::Win7DxgkBlt,
            Self::Win7DxgkFlip,
            Self::Win7DxgkPresentHistory,
            Self::Win7DxgkQueuePacket,
            Self::Win7DxgkVSyncDpc,
            Self::Win7DxgkMmioFlip,
            Self::Win7Dwm,
            Self::SteamVr,
            Self::OculusVr,
            Self::HolographicDisplay,
            Self::SpectrumContinuous,
        ]
    }

    /// Kernel and compositor providers that are only subscribed outside simple mode.
    pub const fn is_detailed(self) -> bool {
        matches!(
            self,
            Self::DxgKrnl
                | Self::Win32k
                | Self::Dwm
                | Self::Win7DxgkBlt
                | Self::Win7DxgkFlip
                | Self::Win7DxgkPresentHistory
                | Self::Win7DxgkQueuePacket
                | Self::Win7DxgkVSyncDpc
                | Self::Win7DxgkMmioFlip
                | Self::Win7Dwm
        )
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic opcodes shared by classic providers.
pub mod opcode {
    pub const INFO: u8 = 0;
    pub const START: u8 = 1;
    pub const STOP: u8 = 2;
    pub const DC_START: u8 = 3;
    pub const DC_END: u8 = 4;
}

pub mod dxgi {
    pub const PRESENT_START: u16 = 42;
    pub const PRESENT_STOP: u16 = 43;
    pub const PRESENT_MPO_START: u16 = 55;
    pub const PRESENT_MPO_STOP: u16 = 56;
}

pub mod d3d9 {
    pub const PRESENT_START: u16 = 1;
    pub const PRESENT_STOP: u16 = 2;
}

pub mod dxgkrnl {
    pub const VSYNC_DPC: u16 = 17;
    pub const MMIO_FLIP: u16 = 116;
    pub const BLIT: u16 = 166;
    pub const FLIP: u16 = 168;
    pub const SUBMIT_PRESENT_HISTORY: u16 = 171;
    pub const PROPAGATE_PRESENT_HISTORY: u16 = 172;
    pub const QUEUE_SUBMIT: u16 = 178;
    pub const QUEUE_COMPLETE: u16 = 180;
    pub const PRESENT: u16 = 184;
    pub const PRESENT_HISTORY_DETAILED: u16 = 215;
    pub const FLIP_MPO: u16 = 252;
    pub const MMIO_FLIP_MPO: u16 = 259;
}

pub mod win32k {
    pub const TOKEN_COMPOSITION_SURFACE_OBJECT: u16 = 201;
    pub const TOKEN_STATE_CHANGED: u16 = 301;
}

pub mod dwm {
    pub const SCHEDULE_PRESENT_START: u16 = 15;
    pub const GET_PRESENT_HISTORY: u16 = 64;
    pub const FLIP_CHAIN_PENDING: u16 = 69;
    pub const FLIP_CHAIN_COMPLETE: u16 = 70;
    pub const FLIP_CHAIN_DIRTY: u16 = 101;
    pub const SCHEDULE_SURFACE_UPDATE: u16 = 196;
}

pub mod oculus {
    pub const FUNCTION_CALL_COMPOSITOR: u16 = 0;
    pub const PHASE_SYNC_BEGIN_FRAME: u16 = 63;
    pub const PHASE_SYNC_COMPLETE_FRAME: u16 = 65;
    pub const COMPOSITION_BEGIN: u16 = 48;
    pub const COMPOSITION_END: u16 = 49;
    pub const COMPOSITION_END_SPIN_WAIT: u16 = 53;
    pub const COMPOSITION_MISSED_COMPOSITOR_FRAME: u16 = 56;
    pub const CLIENT_FRAME_MISSED: u16 = 47;
}

/// A single provider-specific payload value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    U64(u64),
    I64(i64),
    F64(f64),
    Str(String),
}

impl FieldValue {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::U64(_) => "u64",
            Self::I64(_) => "i64",
            Self::F64(_) => "f64",
            Self::Str(_) => "string",
        }
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        Self::U64(u64::from(v))
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::I64(i64::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Errors raised when a handler reads a payload field.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    #[error("{provider} event {id}: missing field {name}")]
    Missing {
        provider: Provider,
        id: u16,
        name: &'static str,
    },

    #[error("{provider} event {id}: field {name} is {actual}, expected {expected}")]
    WrongType {
        provider: Provider,
        id: u16,
        name: &'static str,
        actual: &'static str,
        expected: &'static str,
    },

    #[error("{provider} event {id}: field {name} out of range for {expected}")]
    OutOfRange {
        provider: Provider,
        id: u16,
        name: &'static str,
        expected: &'static str,
    },
}

/// A decoded trace event: header plus named payload fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub provider: Provider,
    pub id: u16,
    pub opcode: u8,
    pub version: u8,
    pub pid: u32,
    pub tid: u32,
    /// Monotonic QPC timestamp in ticks.
    pub timestamp: u64,
    /// Task name, used by providers that multiplex on it.
    pub task: String,
    pub fields: HashMap<String, FieldValue>,
}

impl EventRecord {
    pub fn new(provider: Provider, id: u16, pid: u32, tid: u32, timestamp: u64) -> Self {
        Self {
            provider,
            id,
            opcode: opcode::INFO,
            version: 0,
            pid,
            tid,
            timestamp,
            task: String::new(),
            fields: HashMap::new(),
        }
    }

    pub fn with_opcode(mut self, opcode: u8) -> Self {
        self.opcode = opcode;
        self
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Look up a field without failing when absent.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    fn field(&self, name: &'static str) -> Result<&FieldValue, FieldError> {
        self.fields.get(name).ok_or(FieldError::Missing {
            provider: self.provider,
            id: self.id,
            name,
        })
    }

    fn wrong_type(&self, name: &'static str, v: &FieldValue, expected: &'static str) -> FieldError {
        FieldError::WrongType {
            provider: self.provider,
            id: self.id,
            name,
            actual: v.kind(),
            expected,
        }
    }

    fn out_of_range(&self, name: &'static str, expected: &'static str) -> FieldError {
        FieldError::OutOfRange {
            provider: self.provider,
            id: self.id,
            name,
            expected,
        }
    }

    /// Read a pointer-width or 64-bit integer. Signed values keep their bit pattern.
    pub fn u64(&self, name: &'static str) -> Result<u64, FieldError> {
        match self.field(name)? {
            FieldValue::U64(v) => Ok(*v),
            FieldValue::I64(v) => Ok(*v as u64),
            FieldValue::Bool(v) => Ok(u64::from(*v)),
            other => Err(self.wrong_type(name, other, "u64")),
        }
    }

    /// Read a 32-bit unsigned value. Negative 32-bit values (HRESULTs) keep their bit pattern.
    pub fn u32(&self, name: &'static str) -> Result<u32, FieldError> {
        match self.field(name)? {
            FieldValue::U64(v) => u32::try_from(*v).map_err(|_| self.out_of_range(name, "u32")),
            FieldValue::I64(v) => i32::try_from(*v)
                .map(|x| x as u32)
                .map_err(|_| self.out_of_range(name, "u32")),
            FieldValue::Bool(v) => Ok(u32::from(*v)),
            other => Err(self.wrong_type(name, other, "u32")),
        }
    }

    pub fn i32(&self, name: &'static str) -> Result<i32, FieldError> {
        match self.field(name)? {
            FieldValue::I64(v) => i32::try_from(*v).map_err(|_| self.out_of_range(name, "i32")),
            FieldValue::U64(v) => match i32::try_from(*v) {
                Ok(x) => Ok(x),
                Err(_) => u32::try_from(*v)
                    .map(|x| x as i32)
                    .map_err(|_| self.out_of_range(name, "i32")),
            },
            other => Err(self.wrong_type(name, other, "i32")),
        }
    }

    pub fn f64(&self, name: &'static str) -> Result<f64, FieldError> {
        match self.field(name)? {
            FieldValue::F64(v) => Ok(*v),
            FieldValue::U64(v) => Ok(*v as f64),
            FieldValue::I64(v) => Ok(*v as f64),
            other => Err(self.wrong_type(name, other, "f64")),
        }
    }

    pub fn bool(&self, name: &'static str) -> Result<bool, FieldError> {
        match self.field(name)? {
            FieldValue::Bool(v) => Ok(*v),
            FieldValue::U64(v) => Ok(*v != 0),
            FieldValue::I64(v) => Ok(*v != 0),
            other => Err(self.wrong_type(name, other, "bool")),
        }
    }

    pub fn str(&self, name: &'static str) -> Result<&str, FieldError> {
        match self.field(name)? {
            FieldValue::Str(v) => Ok(v.as_str()),
            other => Err(self.wrong_type(name, other, "string")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_roundtrip() {
        for p in Provider::all() {
            assert_eq!(Provider::from_u8(*p as u8), Some(*p));
            assert_eq!(Provider::from_str(p.as_str()), Some(*p));
        }
        assert_eq!(Provider::from_u8(0), None);
        assert_eq!(Provider::from_str("opengl"), None);
    }

    #[test]
    fn test_all_providers() {
        let all = Provider::all();
        assert_eq!(all.len(), MAX_PROVIDER);
        assert_eq!(all[0], Provider::Dxgi);
        assert_eq!(all[MAX_PROVIDER - 1], Provider::SpectrumContinuous);
    }

    #[test]
    fn test_provider_display() {
        assert_eq!(format!("{}", Provider::DxgKrnl), "dxgkrnl");
        assert_eq!(format!("{}", Provider::Win7Dwm), "win7_dwm");
    }

    #[test]
    fn test_detailed_providers() {
        assert!(Provider::DxgKrnl.is_detailed());
        assert!(Provider::Win7DxgkQueuePacket.is_detailed());
        assert!(!Provider::Dxgi.is_detailed());
        assert!(!Provider::SteamVr.is_detailed());
    }

    #[test]
    fn test_field_accessors() {
        let ev = EventRecord::new(Provider::Dxgi, dxgi::PRESENT_STOP, 1, 2, 3)
            .with_field("Result", -2_005_270_527i64)
            .with_field("SyncInterval", 1u32)
            .with_field("pIDXGISwapChain", 0xdead_beefu64)
            .with_field("Flag", true)
            .with_field("Ms", 1.5)
            .with_field("Name", "game.exe");

        assert_eq!(ev.u32("Result").unwrap(), 0x887A_0001);
        assert_eq!(ev.i32("SyncInterval").unwrap(), 1);
        assert_eq!(ev.u64("pIDXGISwapChain").unwrap(), 0xdead_beef);
        assert!(ev.bool("Flag").unwrap());
        assert_eq!(ev.u64("Flag").unwrap(), 1);
        assert!((ev.f64("Ms").unwrap() - 1.5).abs() < f64::EPSILON);
        assert_eq!(ev.str("Name").unwrap(), "game.exe");
    }

    #[test]
    fn test_field_missing() {
        let ev = EventRecord::new(Provider::DxgKrnl, dxgkrnl::QUEUE_SUBMIT, 1, 2, 3);
        let err = ev.u32("SubmitSequence").unwrap_err();
        assert_eq!(
            err,
            FieldError::Missing {
                provider: Provider::DxgKrnl,
                id: dxgkrnl::QUEUE_SUBMIT,
                name: "SubmitSequence",
            }
        );
        assert_eq!(
            err.to_string(),
            "dxgkrnl event 178: missing field SubmitSequence"
        );
    }

    #[test]
    fn test_field_wrong_type_and_range() {
        let ev = EventRecord::new(Provider::Dwm, dwm::FLIP_CHAIN_PENDING, 1, 2, 3)
            .with_field("hwnd", "not a handle")
            .with_field("ulFlipChain", u64::MAX);

        assert!(matches!(
            ev.u64("hwnd"),
            Err(FieldError::WrongType { actual: "string", .. })
        ));
        assert!(matches!(
            ev.u32("ulFlipChain"),
            Err(FieldError::OutOfRange { expected: "u32", .. })
        ));
    }

    #[test]
    fn test_untagged_field_values() {
        let v: FieldValue = serde_json::from_str("42").unwrap();
        assert_eq!(v, FieldValue::U64(42));
        let v: FieldValue = serde_json::from_str("-1").unwrap();
        assert_eq!(v, FieldValue::I64(-1));
        let v: FieldValue = serde_json::from_str("0.25").unwrap();
        assert_eq!(v, FieldValue::F64(0.25));
        let v: FieldValue = serde_json::from_str("false").unwrap();
        assert_eq!(v, FieldValue::Bool(false));
        let v: FieldValue = serde_json::from_str("\"x\"").unwrap();
        assert_eq!(v, FieldValue::Str("x".into()));
    }
}
