use super::{PresentMode, PresentTracker};
use crate::tracer::event::{dwm, EventRecord, FieldError, Provider};

impl PresentTracker {
    pub fn handle_dwm(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        match ev.id {
            // The compositor picks up the most recent present of each window.
            dwm::GET_PRESENT_HISTORY => {
                let windows = std::mem::take(&mut self.index.by_window);
                for id in windows.into_values() {
                    let Some(p) = self.live_mut(id) else {
                        continue;
                    };
                    if !matches!(
                        p.mode,
                        PresentMode::ComposedCopyGpuGdi | PresentMode::ComposedCopyCpuGdi
                    ) {
                        continue;
                    }
                    p.dwm_notified = true;
                    self.index.wait_for_dwm(&self.arena, id);
                }
            }
            dwm::SCHEDULE_PRESENT_START => {
                self.index.dwm_present_thread = ev.tid;
            }
            dwm::FLIP_CHAIN_PENDING | dwm::FLIP_CHAIN_COMPLETE | dwm::FLIP_CHAIN_DIRTY => {
                if ev.provider == Provider::Win7Dwm {
                    return Ok(());
                }

                // The legacy blit token is a flip chain id and a serial number.
                let flip_chain = ev.u64("ulFlipChain")? as u32;
                let serial = ev.u64("ulSerialNumber")? as u32;
                let token = (u64::from(flip_chain) << 32) | u64::from(serial);
                let hwnd = ev.u64("hwnd")?;

                let Some(id) = self.index.legacy_blit_tokens.remove(&token) else {
                    return Ok(());
                };
                let Some(p) = self.live_mut(id) else {
                    return Ok(());
                };
                p.dwm_notified = true;
                p.keys.legacy_blit_token = None;
                if p.hwnd == 0 {
                    p.hwnd = hwnd;
                }

                self.supersede_window(hwnd, id);
            }
            dwm::SCHEDULE_SURFACE_UPDATE => {
                let key = (
                    ev.u64("luidSurface")?,
                    ev.u64("PresentCount")?,
                    ev.u64("bindId")?,
                );
                if let Some(&id) = self.index.win32k_tokens.get(&key) {
                    if let Some(p) = self.live_mut(id) {
                        p.dwm_notified = true;
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }
}
