use super::{flags, Present, PresentTracker, Runtime};
use crate::tracer::event::{d3d9, dxgi, EventRecord, FieldError};

/// D3DPRESENT_* flags.
pub mod d3d9_flags {
    pub const DONOTWAIT: u32 = 0x1;
    pub const DONOTFLIP: u32 = 0x4;
    pub const FLIPRESTART: u32 = 0x8;
    pub const FORCEIMMEDIATE: u32 = 0x100;
}

/// Present-call status codes that block batching.
pub mod status {
    pub const DXGI_STATUS_OCCLUDED: u32 = 0x087A_0001;
    pub const DXGI_STATUS_NO_DESKTOP_ACCESS: u32 = 0x087A_0005;
    pub const DXGI_STATUS_MODE_CHANGE_IN_PROGRESS: u32 = 0x087A_0008;
    pub const S_PRESENT_OCCLUDED: u32 = 0x0876_0868;
}

fn succeeded(hr: u32) -> bool {
    (hr as i32) >= 0
}

pub fn dxgi_allows_batching(hr: u32) -> bool {
    succeeded(hr)
        && hr != status::DXGI_STATUS_OCCLUDED
        && hr != status::DXGI_STATUS_MODE_CHANGE_IN_PROGRESS
        && hr != status::DXGI_STATUS_NO_DESKTOP_ACCESS
}

pub fn d3d9_allows_batching(hr: u32) -> bool {
    succeeded(hr) && hr != status::S_PRESENT_OCCLUDED
}

/// Translate D3D9 present flags into their DXGI equivalents.
pub fn translate_d3d9_flags(d3d9: u32) -> u32 {
    let mut out = 0;
    if d3d9 & d3d9_flags::DONOTFLIP != 0 {
        out |= flags::DO_NOT_SEQUENCE;
    }
    if d3d9 & d3d9_flags::DONOTWAIT != 0 {
        out |= flags::DO_NOT_WAIT;
    }
    if d3d9 & d3d9_flags::FLIPRESTART != 0 {
        out |= flags::RESTART;
    }
    out
}

impl PresentTracker {
    pub fn handle_dxgi(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        match ev.id {
            dxgi::PRESENT_START | dxgi::PRESENT_MPO_START => {
                let mut p = Present::new(ev.timestamp, ev.pid, ev.tid, Runtime::Dxgi);
                p.swap_chain = ev.u64("pIDXGISwapChain")?;
                p.present_flags = ev.u32("Flags")?;
                p.sync_interval = ev.i32("SyncInterval")?;
                self.runtime_present_start(p);
            }
            dxgi::PRESENT_STOP | dxgi::PRESENT_MPO_STOP => {
                let hr = ev.u32("Result")?;
                self.runtime_present_stop(ev.tid, ev.timestamp, dxgi_allows_batching(hr));
            }
            _ => {}
        }

        Ok(())
    }

    pub fn handle_d3d9(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        match ev.id {
            d3d9::PRESENT_START => {
                let mut p = Present::new(ev.timestamp, ev.pid, ev.tid, Runtime::D3d9);
                p.swap_chain = ev.u64("pSwapchain")?;
                let raw = ev.u32("Flags")?;
                p.present_flags = translate_d3d9_flags(raw);
                if raw & d3d9_flags::FORCEIMMEDIATE != 0 {
                    p.sync_interval = 0;
                }
                self.runtime_present_start(p);
            }
            d3d9::PRESENT_STOP => {
                let hr = ev.u32("Result")?;
                self.runtime_present_stop(ev.tid, ev.timestamp, d3d9_allows_batching(hr));
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::CompletedQueue;
    use crate::present::PresentResult;
    use crate::tracer::event::{opcode, Provider};

    #[test]
    fn test_batching_rules() {
        assert!(dxgi_allows_batching(0));
        assert!(!dxgi_allows_batching(status::DXGI_STATUS_OCCLUDED));
        assert!(!dxgi_allows_batching(status::DXGI_STATUS_MODE_CHANGE_IN_PROGRESS));
        assert!(!dxgi_allows_batching(status::DXGI_STATUS_NO_DESKTOP_ACCESS));
        assert!(!dxgi_allows_batching(0x887A_0001));
        assert!(d3d9_allows_batching(0));
        assert!(!d3d9_allows_batching(status::S_PRESENT_OCCLUDED));
        // Other success codes still batch.
        assert!(dxgi_allows_batching(status::S_PRESENT_OCCLUDED));
    }

    #[test]
    fn test_d3d9_flag_translation() {
        assert_eq!(translate_d3d9_flags(0), 0);
        assert_eq!(
            translate_d3d9_flags(d3d9_flags::DONOTFLIP | d3d9_flags::DONOTWAIT),
            flags::DO_NOT_SEQUENCE | flags::DO_NOT_WAIT
        );
        assert_eq!(translate_d3d9_flags(d3d9_flags::FLIPRESTART), flags::RESTART);
        assert_eq!(translate_d3d9_flags(d3d9_flags::FORCEIMMEDIATE), 0);
    }

    #[test]
    fn test_d3d9_present_lifecycle() {
        let out = Arc::new(CompletedQueue::new());
        let mut t = PresentTracker::new(false, Arc::clone(&out), Arc::default());

        let start = EventRecord::new(Provider::D3d9, d3d9::PRESENT_START, 5, 6, 100)
            .with_opcode(opcode::START)
            .with_field("pSwapchain", 0xfeedu64)
            .with_field("Flags", d3d9_flags::FORCEIMMEDIATE);
        t.handle_d3d9(&start).unwrap();

        let id = t.thread_present(6).unwrap();
        let p = t.get(id).unwrap();
        assert_eq!(p.runtime, Runtime::D3d9);
        assert_eq!(p.swap_chain, 0xfeed);
        assert_eq!(p.sync_interval, 0);

        let stop = EventRecord::new(Provider::D3d9, d3d9::PRESENT_STOP, 5, 6, 130)
            .with_field("Result", status::S_PRESENT_OCCLUDED);
        t.handle_d3d9(&stop).unwrap();

        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].final_state, PresentResult::Discarded);
        assert_eq!(done[0].time_taken, 30);
    }

    #[test]
    fn test_dxgi_missing_field_is_reported() {
        let mut t = PresentTracker::new(false, Arc::default(), Arc::default());
        let start = EventRecord::new(Provider::Dxgi, dxgi::PRESENT_START, 5, 6, 100);
        assert!(matches!(
            t.handle_dxgi(&start),
            Err(FieldError::Missing {
                name: "pIDXGISwapChain",
                ..
            })
        ));
        assert_eq!(t.in_flight(), 0);
    }
}
