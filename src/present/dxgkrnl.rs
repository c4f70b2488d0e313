//! Kernel graphics scheduler events, for both the modern provider and the
//! split legacy providers.

use super::{PresentMode, PresentResult, PresentTracker};
use crate::tracer::event::{dxgkrnl, opcode, EventRecord, FieldError, Provider};

/// Queue packet types that carry a present.
pub mod packet {
    pub const MMIO_FLIP: u32 = 3;
    pub const SOFTWARE: u32 = 7;
}

pub mod mmio_flip_flags {
    pub const FLIP_IMMEDIATE: u32 = 0x2;
}

/// `FlipEntryStatusAfterFlip` values on MMIOFlipMPO version 2+.
pub mod flip_entry_status {
    pub const WAIT_VSYNC: u32 = 5;
    pub const WAIT_COMPLETE: u32 = 11;
}

/// D3DKMT present models reported with present-history tokens.
pub mod model {
    pub const REDIRECTED_GDI: u32 = 1;
    pub const REDIRECTED_FLIP: u32 = 2;
    pub const REDIRECTED_BLT: u32 = 3;
    pub const REDIRECTED_VISTABLT: u32 = 4;
    pub const REDIRECTED_COMPOSITION: u32 = 7;
}

pub fn model_to_mode(m: u32) -> PresentMode {
    match m {
        model::REDIRECTED_BLT => PresentMode::ComposedCopyGpuGdi,
        model::REDIRECTED_VISTABLT => PresentMode::ComposedCopyCpuGdi,
        model::REDIRECTED_FLIP => PresentMode::ComposedFlip,
        model::REDIRECTED_COMPOSITION => PresentMode::ComposedCompositionAtlas,
        _ => PresentMode::Unknown,
    }
}

struct QueueSubmit {
    packet_type: u32,
    submit_sequence: u32,
    present: bool,
    context: u64,
    /// False on sources that never emit the kernel present event.
    supports_dxgk_present: bool,
}

impl PresentTracker {
    pub fn handle_dxgkrnl(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        match ev.id {
            dxgkrnl::FLIP => {
                let interval = ev.i32("FlipInterval")?;
                let mmio = ev.bool("MMIOFlip")?;
                self.dxgk_flip(ev, interval, mmio);
            }
            // All MPO flips are MMIO.
            dxgkrnl::FLIP_MPO => self.dxgk_flip(ev, -1, true),
            dxgkrnl::QUEUE_SUBMIT => {
                let submit = QueueSubmit {
                    packet_type: ev.u32("PacketType")?,
                    submit_sequence: ev.u32("SubmitSequence")?,
                    present: ev.bool("bPresent")?,
                    context: ev.u64("hContext")?,
                    supports_dxgk_present: true,
                };
                self.dxgk_queue_submit(ev, submit);
            }
            dxgkrnl::QUEUE_COMPLETE => {
                self.dxgk_queue_complete(ev.timestamp, ev.u32("SubmitSequence")?);
            }
            dxgkrnl::MMIO_FLIP => {
                let seq = ev.u32("FlipSubmitSequence")?;
                let flags = ev.u32("Flags")?;
                self.dxgk_mmio_flip(ev.timestamp, seq, flags);
            }
            dxgkrnl::MMIO_FLIP_MPO => self.dxgk_mmio_flip_mpo(ev)?,
            dxgkrnl::VSYNC_DPC => {
                let fence = ev.u64("FlipFenceId")?;
                self.dxgk_vsync_dpc(ev.timestamp, (fence >> 32) as u32);
            }
            dxgkrnl::PRESENT => self.dxgk_present(ev)?,
            dxgkrnl::SUBMIT_PRESENT_HISTORY | dxgkrnl::PRESENT_HISTORY_DETAILED => {
                let token = ev.u64("Token")?;
                let token_data = ev.u64("TokenData")?;
                let m = ev.u32("Model")?;
                if m != model::REDIRECTED_GDI {
                    self.dxgk_submit_present_history(ev, token, token_data, model_to_mode(m));
                }
            }
            dxgkrnl::PROPAGATE_PRESENT_HISTORY => {
                self.dxgk_propagate_present_history(ev.timestamp, ev.u64("Token")?);
            }
            dxgkrnl::BLIT => {
                let hwnd = ev.u64("hwnd")?;
                let redirected = ev.u32("bRedirectedPresent")? != 0;
                self.dxgk_blt(ev, hwnd, redirected);
            }
            _ => {}
        }

        Ok(())
    }

    /// Legacy split providers. They feed the same handlers, but queue
    /// submits never see a kernel present event.
    pub fn handle_legacy_dxgkrnl(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        match ev.provider {
            Provider::Win7DxgkBlt => {
                let hwnd = ev.u64("hwnd")?;
                let redirected = ev.u32("bRedirectedPresent")? != 0;
                self.dxgk_blt(ev, hwnd, redirected);
            }
            Provider::Win7DxgkFlip => {
                let interval = ev.i32("FlipInterval")?;
                let mmio = ev.bool("MMIOFlip")?;
                self.dxgk_flip(ev, interval, mmio);
            }
            Provider::Win7DxgkPresentHistory => match ev.opcode {
                opcode::START => {
                    let token = ev.u64("Token")?;
                    self.dxgk_submit_present_history(ev, token, 0, PresentMode::Unknown);
                }
                opcode::INFO => {
                    self.dxgk_propagate_present_history(ev.timestamp, ev.u64("Token")?);
                }
                _ => {}
            },
            Provider::Win7DxgkQueuePacket => match ev.opcode {
                opcode::START => {
                    let raw_type = ev.u32("PacketType")?;
                    let (packet_type, present) = match raw_type {
                        packet::MMIO_FLIP | packet::SOFTWARE => (raw_type, false),
                        _ => (0, ev.bool("bPresent")?),
                    };
                    let submit = QueueSubmit {
                        packet_type,
                        submit_sequence: ev.u32("SubmitSequence")?,
                        present,
                        context: ev.u64("hContext")?,
                        supports_dxgk_present: false,
                    };
                    self.dxgk_queue_submit(ev, submit);
                }
                opcode::STOP => {
                    self.dxgk_queue_complete(ev.timestamp, ev.u32("SubmitSequence")?);
                }
                _ => {}
            },
            Provider::Win7DxgkVSyncDpc => {
                let fence = ev.u64("FlipFenceId")?;
                self.dxgk_vsync_dpc(ev.timestamp, (fence >> 32) as u32);
            }
            Provider::Win7DxgkMmioFlip => {
                let seq = ev.u32("FlipSubmitSequence")?;
                let flags = ev.u32("Flags")?;
                self.dxgk_mmio_flip(ev.timestamp, seq, flags);
            }
            _ => {}
        }

        Ok(())
    }

    /// A blt during present submission. Assume it targets a surface already
    /// on screen until later events say otherwise.
    fn dxgk_blt(&mut self, ev: &EventRecord, hwnd: u64, redirected: bool) {
        let id = self.find_or_create(ev, |p| p.mode != PresentMode::Unknown);
        let Some(p) = self.arena.get_mut(id) else {
            return;
        };

        p.mode = if redirected {
            PresentMode::ComposedCopyCpuGdi
        } else {
            PresentMode::HardwareLegacyCopyToFrontBuffer
        };
        p.supports_tearing = !redirected;
        p.hwnd = hwnd;
    }

    /// A fullscreen flip. An MMIOFlip on the same thread follows.
    fn dxgk_flip(&mut self, ev: &EventRecord, flip_interval: i32, mmio: bool) {
        let id = self.find_or_create(ev, |p| p.queue_submit_sequence != 0 || p.seen_dxgk_present);
        let Some(p) = self.arena.get_mut(id) else {
            return;
        };

        // MPO issues one flip per plane; only the first classifies.
        if p.mode != PresentMode::Unknown {
            return;
        }

        p.mmio = mmio;
        p.mode = PresentMode::HardwareLegacyFlip;
        if p.sync_interval == -1 {
            p.sync_interval = flip_interval;
        }
        if !mmio {
            p.supports_tearing = flip_interval == 0;
        }

        // The compositor's own flip carries every present waiting on it.
        let dwm_thread = self.index.dwm_present_thread;
        if dwm_thread != 0 && ev.tid == dwm_thread {
            std::mem::swap(&mut p.dependents, &mut self.index.waiting_for_dwm);
            self.index.dwm_present_thread = 0;
        }
    }

    fn dxgk_queue_submit(&mut self, ev: &EventRecord, s: QueueSubmit) {
        // Without a kernel present event, the next packet on the blt's
        // context decides: a blt still unredirected here went to the screen.
        if !s.supports_dxgk_present {
            if let Some(id) = self.index.blts_by_context.remove(&s.context) {
                if let Some(p) = self.live_mut(id) {
                    p.keys.blt_context = None;
                    if p.mode == PresentMode::HardwareLegacyCopyToFrontBuffer {
                        p.seen_dxgk_present = true;
                        if p.screen_time != 0 {
                            self.complete(id);
                        }
                    }
                }
            }
        }

        if s.packet_type != packet::MMIO_FLIP && s.packet_type != packet::SOFTWARE && !s.present {
            return;
        }

        let Some(id) = self.by_thread(ev.tid) else {
            return;
        };
        let Some(p) = self.arena.get_mut(id) else {
            return;
        };
        if p.queue_submit_sequence != 0 {
            return;
        }

        p.queue_submit_sequence = s.submit_sequence;
        self.index.by_submit_sequence.insert(s.submit_sequence, id);

        if p.mode == PresentMode::HardwareLegacyCopyToFrontBuffer && !s.supports_dxgk_present {
            p.keys.blt_context = Some(s.context);
            self.index.blts_by_context.insert(s.context, id);
        }
    }

    fn dxgk_queue_complete(&mut self, t: u64, submit_sequence: u32) {
        let Some(id) = self.by_submit_sequence(submit_sequence) else {
            return;
        };
        let Some(p) = self.arena.get_mut(id) else {
            return;
        };

        let legacy_copy = p.mode == PresentMode::HardwareLegacyCopyToFrontBuffer;
        if legacy_copy || (p.mode == PresentMode::HardwareLegacyFlip && !p.mmio) {
            p.stamp_ready(t);
            p.stamp_presented(t);

            // A blt can finish before the kernel present event that tells
            // fullscreen from windowed; defer until that has been seen.
            if p.seen_dxgk_present || !legacy_copy {
                self.complete(id);
            }
        }
    }

    /// GPU work before the flip is done. Also tells immediate from vsync.
    fn dxgk_mmio_flip(&mut self, t: u64, submit_sequence: u32, flags: u32) {
        let Some(id) = self.by_submit_sequence(submit_sequence) else {
            return;
        };
        let Some(p) = self.arena.get_mut(id) else {
            return;
        };

        p.stamp_ready(t);
        if p.mode == PresentMode::ComposedFlip {
            p.mode = PresentMode::HardwareIndependentFlip;
        }

        if flags & mmio_flip_flags::FLIP_IMMEDIATE != 0 {
            p.stamp_presented(t);
            p.supports_tearing = true;
            if p.mode == PresentMode::HardwareLegacyFlip {
                self.complete(id);
            }
        }
    }

    fn dxgk_mmio_flip_mpo(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        let fence = ev.u64("FlipSubmitSequence")?;
        let Some(id) = self.by_submit_sequence((fence >> 32) as u32) else {
            return Ok(());
        };

        let layer = ev.u32("LayerIndex")?;
        let status = if ev.version >= 2 {
            Some(ev.u32("FlipEntryStatusAfterFlip")?)
        } else {
            None
        };

        let Some(p) = self.arena.get_mut(id) else {
            return Ok(());
        };

        // One MPO present may flip several planes.
        if p.ready_time == 0 {
            p.ready_time = ev.timestamp;
            p.plane_index = layer;
        }

        if matches!(
            p.mode,
            PresentMode::HardwareIndependentFlip | PresentMode::ComposedFlip
        ) {
            p.mode = PresentMode::HardwareComposedIndependentFlip;
        }

        if let Some(status) = status {
            if status != flip_entry_status::WAIT_VSYNC {
                if p.final_state == PresentResult::Unknown {
                    p.final_state = PresentResult::Presented;
                }
                p.supports_tearing = true;
                if status == flip_entry_status::WAIT_COMPLETE {
                    p.stamp_screen(ev.timestamp);
                }
                if p.mode == PresentMode::HardwareLegacyFlip {
                    // Completes now, so no later vsync can supply the screen time.
                    p.stamp_screen(ev.timestamp);
                    self.complete(id);
                }
            }
        }

        Ok(())
    }

    /// What flipped to screen at this vsync.
    fn dxgk_vsync_dpc(&mut self, t: u64, submit_sequence: u32) {
        let Some(id) = self.by_submit_sequence(submit_sequence) else {
            return;
        };
        let Some(p) = self.arena.get_mut(id) else {
            return;
        };

        p.stamp_presented(t);
        if p.mode == PresentMode::HardwareLegacyFlip {
            self.complete(id);
        }
    }

    /// End of the kernel present call. Its presence tells a blt that no
    /// present-history token follows.
    fn dxgk_present(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        let Some(id) = self.by_thread(ev.tid) else {
            return Ok(());
        };
        let hwnd = ev.u64("hWindow")?;

        let Some(p) = self.arena.get_mut(id) else {
            return Ok(());
        };

        p.seen_dxgk_present = true;
        if p.hwnd == 0 {
            p.hwnd = hwnd;
        }

        let batched = p.runtime_thread != ev.tid;
        if batched {
            if p.time_taken == 0 {
                p.time_taken = ev.timestamp.saturating_sub(p.qpc_time);
            }
            p.was_batched = true;
        }

        // Fullscreen or compositor-off blt whose work already finished.
        if p.mode == PresentMode::HardwareLegacyCopyToFrontBuffer && p.screen_time != 0 {
            self.complete(id);
        }

        if batched && self.index.by_thread.get(&ev.tid) == Some(&id) {
            self.index.by_thread.remove(&ev.tid);
        }

        Ok(())
    }

    /// Submission of a windowed present while the compositor is on.
    fn dxgk_submit_present_history(
        &mut self,
        ev: &EventRecord,
        token: u64,
        token_data: u64,
        known_mode: PresentMode,
    ) {
        let id = self.find_or_create(ev, |p| p.token_ptr != 0);
        let Some(p) = self.arena.get_mut(id) else {
            return;
        };

        p.ready_time = 0;
        p.screen_time = 0;
        p.supports_tearing = false;
        p.final_state = PresentResult::Unknown;
        p.token_ptr = token;

        match p.mode {
            PresentMode::HardwareLegacyCopyToFrontBuffer => {
                p.mode = PresentMode::ComposedCopyGpuGdi;
            }
            PresentMode::Unknown => {
                // Without Win32K events, tokens that follow no blt and are not
                // composition tokens are assumed to be flip tokens.
                p.mode = if known_mode == PresentMode::ComposedCompositionAtlas {
                    PresentMode::ComposedCompositionAtlas
                } else {
                    PresentMode::ComposedFlip
                };
            }
            PresentMode::ComposedCopyCpuGdi => {
                if token_data == 0 {
                    self.index.wait_for_dwm(&self.arena, id);
                } else {
                    p.keys.legacy_blit_token = Some(token_data);
                    self.index.legacy_blit_tokens.insert(token_data, id);
                }
            }
            _ => {}
        }

        self.index.dxgk_tokens.insert(token, id);
    }

    /// The token is handed to the compositor: a ready signal.
    fn dxgk_propagate_present_history(&mut self, t: u64, token: u64) {
        let Some(id) = self.index.dxgk_tokens.remove(&token) else {
            return;
        };
        let Some(p) = self.live_mut(id) else {
            return;
        };

        p.stamp_ready(t);

        let mode = p.mode;
        let hwnd = p.hwnd;
        if mode == PresentMode::ComposedCompositionAtlas
            || (mode == PresentMode::ComposedFlip && !p.seen_win32k_events)
        {
            self.index.wait_for_dwm(&self.arena, id);
        }

        // The compositor picks the most recent blt per window.
        if mode == PresentMode::ComposedCopyGpuGdi {
            self.supersede_window(hwnd, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::CompletedQueue;
    use crate::present::index::MAX_WAITING_FOR_DWM;
    use crate::present::tracker::MAX_PENDING_PER_SWAP_CHAIN;
    use crate::present::{Present, PresentResult, Runtime};

    const PID: u32 = 10;
    const TID: u32 = 20;

    fn tracker() -> (PresentTracker, Arc<CompletedQueue<Present>>) {
        let out = Arc::new(CompletedQueue::new());
        (
            PresentTracker::new(false, Arc::clone(&out), Arc::default()),
            out,
        )
    }

    fn start(t: &mut PresentTracker, ts: u64) {
        let mut p = Present::new(ts, PID, TID, Runtime::Dxgi);
        p.swap_chain = 0x1000;
        p.sync_interval = 1;
        t.runtime_present_start(p);
    }

    fn kernel(id: u16, ts: u64) -> EventRecord {
        EventRecord::new(Provider::DxgKrnl, id, PID, TID, ts)
    }

    fn queue_submit(ts: u64, seq: u32, packet_type: u32) -> EventRecord {
        kernel(dxgkrnl::QUEUE_SUBMIT, ts)
            .with_field("PacketType", packet_type)
            .with_field("SubmitSequence", seq)
            .with_field("bPresent", false)
            .with_field("hContext", 0xc0u64)
    }

    #[test]
    fn test_model_mapping() {
        assert_eq!(model_to_mode(model::REDIRECTED_BLT), PresentMode::ComposedCopyGpuGdi);
        assert_eq!(model_to_mode(model::REDIRECTED_VISTABLT), PresentMode::ComposedCopyCpuGdi);
        assert_eq!(model_to_mode(model::REDIRECTED_FLIP), PresentMode::ComposedFlip);
        assert_eq!(
            model_to_mode(model::REDIRECTED_COMPOSITION),
            PresentMode::ComposedCompositionAtlas
        );
        assert_eq!(model_to_mode(model::REDIRECTED_GDI), PresentMode::Unknown);
    }

    #[test]
    fn test_fullscreen_flip_to_vsync() {
        let (mut t, out) = tracker();
        start(&mut t, 100);

        t.handle_dxgkrnl(
            &kernel(dxgkrnl::FLIP, 110)
                .with_field("FlipInterval", 1u32)
                .with_field("MMIOFlip", true),
        )
        .unwrap();
        t.handle_dxgkrnl(&queue_submit(120, 5, packet::MMIO_FLIP)).unwrap();
        t.handle_dxgkrnl(
            &kernel(dxgkrnl::MMIO_FLIP, 130)
                .with_field("FlipSubmitSequence", 5u32)
                .with_field("Flags", 0u32),
        )
        .unwrap();
        assert!(out.is_empty());

        t.handle_dxgkrnl(&kernel(dxgkrnl::VSYNC_DPC, 160).with_field("FlipFenceId", 5u64 << 32))
            .unwrap();

        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 1);
        let p = &done[0];
        assert_eq!(p.mode, PresentMode::HardwareLegacyFlip);
        assert_eq!(p.final_state, PresentResult::Presented);
        assert_eq!(p.ready_time, 130);
        assert_eq!(p.screen_time, 160);
        assert!(p.mmio);
        assert!(!p.supports_tearing);
    }

    #[test]
    fn test_non_mmio_flip_completes_on_queue_complete() {
        let (mut t, out) = tracker();
        start(&mut t, 100);

        t.handle_dxgkrnl(
            &kernel(dxgkrnl::FLIP, 110)
                .with_field("FlipInterval", 0u32)
                .with_field("MMIOFlip", false),
        )
        .unwrap();
        t.handle_dxgkrnl(&queue_submit(120, 7, packet::SOFTWARE)).unwrap();
        t.handle_dxgkrnl(&kernel(dxgkrnl::QUEUE_COMPLETE, 150).with_field("SubmitSequence", 7u32))
            .unwrap();

        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 1);
        assert!(done[0].supports_tearing);
        assert_eq!(done[0].screen_time, 150);
        assert_eq!(done[0].ready_time, 150);
    }

    #[test]
    fn test_mpo_flip_immediate_status() {
        let (mut t, out) = tracker();
        start(&mut t, 100);

        t.handle_dxgkrnl(&kernel(dxgkrnl::FLIP_MPO, 110)).unwrap();
        t.handle_dxgkrnl(&queue_submit(120, 9, packet::MMIO_FLIP)).unwrap();
        t.handle_dxgkrnl(
            &kernel(dxgkrnl::MMIO_FLIP_MPO, 140)
                .with_version(2)
                .with_field("FlipSubmitSequence", 9u64 << 32)
                .with_field("LayerIndex", 1u32)
                .with_field("FlipEntryStatusAfterFlip", flip_entry_status::WAIT_COMPLETE),
        )
        .unwrap();

        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].plane_index, 1);
        assert_eq!(done[0].screen_time, 140);
        assert!(done[0].supports_tearing);
    }

    #[test]
    fn test_mpo_legacy_flip_without_wait_status_gets_screen_time() {
        let (mut t, out) = tracker();
        start(&mut t, 100);

        t.handle_dxgkrnl(&kernel(dxgkrnl::FLIP_MPO, 110)).unwrap();
        t.handle_dxgkrnl(&queue_submit(120, 9, packet::MMIO_FLIP)).unwrap();
        t.handle_dxgkrnl(
            &kernel(dxgkrnl::MMIO_FLIP_MPO, 140)
                .with_version(2)
                .with_field("FlipSubmitSequence", 9u64 << 32)
                .with_field("LayerIndex", 0u32)
                .with_field("FlipEntryStatusAfterFlip", 6u32),
        )
        .unwrap();

        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].final_state, PresentResult::Presented);
        assert_eq!(done[0].screen_time, 140);
    }

    #[test]
    fn test_fullscreen_blt_waits_for_kernel_present() {
        let (mut t, out) = tracker();
        start(&mut t, 100);

        t.handle_dxgkrnl(
            &kernel(dxgkrnl::BLIT, 105)
                .with_field("hwnd", 0x55u64)
                .with_field("bRedirectedPresent", 0u32),
        )
        .unwrap();
        let mut submit = queue_submit(110, 3, 0);
        submit = submit.with_field("bPresent", true);
        t.handle_dxgkrnl(&submit).unwrap();
        t.handle_dxgkrnl(&kernel(dxgkrnl::QUEUE_COMPLETE, 115).with_field("SubmitSequence", 3u32))
            .unwrap();
        assert!(out.is_empty());

        t.handle_dxgkrnl(&kernel(dxgkrnl::PRESENT, 118).with_field("hWindow", 0x55u64))
            .unwrap();

        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].mode, PresentMode::HardwareLegacyCopyToFrontBuffer);
        assert_eq!(done[0].screen_time, 115);
        assert!(done[0].seen_dxgk_present);
    }

    #[test]
    fn test_batched_kernel_present() {
        let (mut t, _) = tracker();
        start(&mut t, 100);
        t.runtime_present_stop(TID, 105, true);

        // A kernel worker thread submits the batched present later.
        let ev = EventRecord::new(Provider::DxgKrnl, dxgkrnl::BLIT, PID, 99, 130)
            .with_field("hwnd", 0x55u64)
            .with_field("bRedirectedPresent", 1u32);
        t.handle_dxgkrnl(&ev).unwrap();
        let id = t.thread_present(99).unwrap();

        let ev = EventRecord::new(Provider::DxgKrnl, dxgkrnl::PRESENT, PID, 99, 140)
            .with_field("hWindow", 0x55u64);
        t.handle_dxgkrnl(&ev).unwrap();

        let p = t.get(id).unwrap();
        assert!(p.was_batched);
        assert_eq!(p.time_taken, 5);
        assert_eq!(p.mode, PresentMode::ComposedCopyCpuGdi);
        assert!(t.thread_present(99).is_none());
    }

    #[test]
    fn test_present_history_without_win32k_waits_for_dwm() {
        let (mut t, _) = tracker();
        start(&mut t, 100);

        t.handle_dxgkrnl(
            &kernel(dxgkrnl::SUBMIT_PRESENT_HISTORY, 110)
                .with_field("Token", 0xaa00u64)
                .with_field("TokenData", 0u64)
                .with_field("Model", model::REDIRECTED_FLIP),
        )
        .unwrap();
        let id = t.thread_present(TID).unwrap();
        assert_eq!(t.get(id).map(|p| p.mode), Some(PresentMode::ComposedFlip));

        t.handle_dxgkrnl(&kernel(dxgkrnl::PROPAGATE_PRESENT_HISTORY, 125).with_field("Token", 0xaa00u64))
            .unwrap();
        t.handle_dxgkrnl(&kernel(dxgkrnl::PROPAGATE_PRESENT_HISTORY, 120).with_field("Token", 0xaa00u64))
            .unwrap();

        assert_eq!(t.get(id).map(|p| p.ready_time), Some(125));
        assert_eq!(t.index.waiting_for_dwm, vec![id]);
        assert!(t.index.dxgk_tokens.is_empty());
    }

    #[test]
    fn test_waiting_for_dwm_stays_bounded_without_compositor_flip() {
        let (mut t, _) = tracker();

        for i in 0..2_000u64 {
            let ts = 100 + i * 10;
            let token = 0x1_0000 + i;
            start(&mut t, ts);
            t.handle_dxgkrnl(
                &kernel(dxgkrnl::SUBMIT_PRESENT_HISTORY, ts + 1)
                    .with_field("Token", token)
                    .with_field("TokenData", 0u64)
                    .with_field("Model", model::REDIRECTED_FLIP),
            )
            .unwrap();
            t.handle_dxgkrnl(
                &kernel(dxgkrnl::PROPAGATE_PRESENT_HISTORY, ts + 2).with_field("Token", token),
            )
            .unwrap();
        }

        let waiting = &t.index.waiting_for_dwm;
        assert!(waiting.len() <= MAX_WAITING_FOR_DWM);
        assert!(waiting.iter().all(|id| t.get(*id).is_some()));
        assert!(t.in_flight() <= MAX_PENDING_PER_SWAP_CHAIN);
    }

    #[test]
    fn test_redirected_gdi_model_is_ignored() {
        let (mut t, _) = tracker();
        start(&mut t, 100);
        t.handle_dxgkrnl(
            &kernel(dxgkrnl::SUBMIT_PRESENT_HISTORY, 110)
                .with_field("Token", 1u64)
                .with_field("TokenData", 0u64)
                .with_field("Model", model::REDIRECTED_GDI),
        )
        .unwrap();

        assert!(t.index.dxgk_tokens.is_empty());
    }

    #[test]
    fn test_legacy_blt_resolved_by_next_packet_on_context() {
        let (mut t, out) = tracker();
        start(&mut t, 100);

        let legacy = |provider, ts| EventRecord::new(provider, 0, PID, TID, ts);
        t.handle_legacy_dxgkrnl(
            &legacy(Provider::Win7DxgkBlt, 105)
                .with_field("hwnd", 0x55u64)
                .with_field("bRedirectedPresent", 0u32),
        )
        .unwrap();
        t.handle_legacy_dxgkrnl(
            &legacy(Provider::Win7DxgkQueuePacket, 110)
                .with_opcode(opcode::START)
                .with_field("PacketType", 0u32)
                .with_field("bPresent", true)
                .with_field("SubmitSequence", 4u32)
                .with_field("hContext", 0xc1u64),
        )
        .unwrap();
        t.handle_legacy_dxgkrnl(
            &legacy(Provider::Win7DxgkQueuePacket, 115)
                .with_opcode(opcode::STOP)
                .with_field("SubmitSequence", 4u32),
        )
        .unwrap();
        assert!(out.is_empty());

        // Next packet on the same context: not redirected, so it was shown.
        t.handle_legacy_dxgkrnl(
            &legacy(Provider::Win7DxgkQueuePacket, 120)
                .with_opcode(opcode::START)
                .with_field("PacketType", 0u32)
                .with_field("bPresent", false)
                .with_field("SubmitSequence", 5u32)
                .with_field("hContext", 0xc1u64),
        )
        .unwrap();

        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].screen_time, 115);
        assert!(t.index.blts_by_context.is_empty());
    }
}
