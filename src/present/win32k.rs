use super::{flags, PresentMode, PresentResult, PresentTracker, Win32kToken};
use crate::tracer::event::{win32k, EventRecord, FieldError};

/// `NewState` values of TokenStateChanged.
pub mod token_state {
    pub const IN_FRAME: u32 = 3;
    pub const CONFIRMED: u32 = 4;
    pub const RETIRED: u32 = 5;
    pub const DISCARDED: u32 = 6;
}

fn token_key(ev: &EventRecord) -> Result<Win32kToken, FieldError> {
    Ok((
        ev.u64("CompositionSurfaceLuid")?,
        ev.u64("PresentCount")?,
        ev.u64("BindId")?,
    ))
}

impl PresentTracker {
    pub fn handle_win32k(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        match ev.id {
            win32k::TOKEN_COMPOSITION_SURFACE_OBJECT => {
                let key = token_key(ev)?;
                let id = self.find_or_create(ev, |p| p.seen_win32k_events);
                if let Some(p) = self.arena.get_mut(id) {
                    p.mode = PresentMode::ComposedFlip;
                    p.seen_win32k_events = true;
                    p.keys.win32k_token = Some(key);
                    self.index.win32k_tokens.insert(key, id);
                }
            }
            win32k::TOKEN_STATE_CHANGED => self.token_state_changed(ev)?,
            _ => {}
        }

        Ok(())
    }

    fn token_state_changed(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        let key = token_key(ev)?;
        let Some(id) = self
            .index
            .win32k_tokens
            .get(&key)
            .and_then(|id| self.live(*id))
        else {
            return Ok(());
        };
        let state = ev.u32("NewState")?;

        match state {
            // Composition is starting.
            token_state::IN_FRAME => {
                let independent = ev.bool("IndependentFlip")?;
                let Some(p) = self.arena.get_mut(id) else {
                    return Ok(());
                };
                if independent && p.mode == PresentMode::ComposedFlip {
                    p.mode = PresentMode::HardwareIndependentFlip;
                }

                let hwnd = p.hwnd;
                if hwnd != 0 {
                    self.supersede_window(hwnd, id);
                }
            }
            // Submitted. Unless already discarded it will reach the screen.
            token_state::CONFIRMED => {
                let Some(p) = self.arena.get_mut(id) else {
                    return Ok(());
                };
                if p.final_state == PresentResult::Unknown {
                    // DO_NOT_SEQUENCE presents can be confirmed when a frame
                    // was composed as the token completed.
                    p.final_state = if p.present_flags & flags::DO_NOT_SEQUENCE != 0 {
                        PresentResult::Discarded
                    } else {
                        PresentResult::Presented
                    };
                }

                let hwnd = p.hwnd;
                if hwnd != 0 && self.index.by_window.get(&hwnd) == Some(&id) {
                    self.index.by_window.remove(&hwnd);
                }
            }
            // The token's buffer is now displayed.
            token_state::RETIRED => {
                if let Some(p) = self.arena.get_mut(id) {
                    p.stamp_screen(ev.timestamp);
                }
            }
            token_state::DISCARDED => {
                self.index.win32k_tokens.remove(&key);
                if let Some(p) = self.arena.get_mut(id) {
                    if p.final_state == PresentResult::Unknown || p.screen_time == 0 {
                        p.final_state = PresentResult::Discarded;
                    }
                }
                self.complete(id);
            }
            _ => {}
        }

        Ok(())
    }
}
