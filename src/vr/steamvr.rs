use std::collections::VecDeque;
use std::sync::Arc;

use super::{pop_live, push_live, ChainId, CompositorFrame, CompositorKind, FrameChains};
use crate::engine::CompletedQueue;
use crate::tracer::event::{EventRecord, FieldError};

/// A decoded SteamVR log line.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Message {
    /// `[Compositor Client] Received Idx=<i> Id=<id>`
    Received { frame_id: u64 },
    SubmitLeft,
    SubmitRight,
    SubmitEnd,
    /// `[Compositor] NewFrame id=<id> idx=<i>`
    NewFrame { id: u64, idx: u64 },
    EndPresent,
    /// `[Compositor] LastSceneTextureIndex=<n> id=<id> vsync=<v>`
    LastSceneTexture { index: u64 },
    /// `[Compositor] TimeSinceLastVSync: <ms>(<ticks>)`
    TimeSinceLastVsync { ms: f64 },
}

/// Value of the first `key=value` word in `rest`.
fn word_value<'a>(rest: &'a str, key: &str) -> Option<&'a str> {
    rest.split_whitespace()
        .find_map(|w| w.strip_prefix(key).and_then(|v| v.strip_prefix('=')))
}

fn word_u64(rest: &str, key: &str) -> Option<u64> {
    word_value(rest, key)?.parse().ok()
}

/// `Ok(None)` for lines that are not part of the frame pipeline,
/// `Err(())` for pipeline lines that do not parse.
fn parse_message(msg: &str) -> Result<Option<Message>, ()> {
    let msg = msg.trim_end_matches('\0').trim();

    if let Some(rest) = msg.strip_prefix("[Compositor Client] ") {
        let m = if rest.starts_with("Received") {
            Message::Received {
                frame_id: word_u64(rest, "Id").ok_or(())?,
            }
        } else if rest.starts_with("Submit Left") {
            Message::SubmitLeft
        } else if rest.starts_with("Submit Right") {
            Message::SubmitRight
        } else if rest.starts_with("Submit End") {
            Message::SubmitEnd
        } else {
            return Ok(None);
        };
        return Ok(Some(m));
    }

    let Some(rest) = msg.strip_prefix("[Compositor] ") else {
        return Ok(None);
    };
    let m = if rest.starts_with("NewFrame") {
        Message::NewFrame {
            id: word_u64(rest, "id").ok_or(())?,
            idx: word_u64(rest, "idx").ok_or(())?,
        }
    } else if rest.starts_with("End Present") {
        Message::EndPresent
    } else if rest.starts_with("LastSceneTextureIndex") {
        Message::LastSceneTexture {
            index: word_u64(rest, "LastSceneTextureIndex").ok_or(())?,
        }
    } else if let Some(tail) = rest.strip_prefix("TimeSinceLastVSync:") {
        let ms = tail.split('(').next().unwrap_or_default().trim();
        Message::TimeSinceLastVsync {
            ms: ms.parse().map_err(|_| ())?,
        }
    } else {
        return Ok(None);
    };
    Ok(Some(m))
}

/// Correlates SteamVR client submits with compositor passes.
///
/// The payload is a free-form log line in the `Message` field.
pub struct SteamVrTracker {
    chains: FrameChains,
    /// App frames waiting on each submit stage, tagged with their frame id.
    submit_left: VecDeque<(u64, ChainId)>,
    submit_right: VecDeque<(u64, ChainId)>,
    submit_end: VecDeque<(u64, ChainId)>,
    /// Compositor passes, tagged with the compositor's frame id.
    reprojection: VecDeque<(u64, ChainId)>,
    last_texture: VecDeque<(u64, ChainId)>,
    vsync: VecDeque<((), ChainId)>,
    /// Process of the most recent app submit.
    last_process: u32,
}

impl SteamVrTracker {
    pub fn new(output: Arc<CompletedQueue<CompositorFrame>>) -> Self {
        Self {
            chains: FrameChains::new(output),
            submit_left: VecDeque::new(),
            submit_right: VecDeque::new(),
            submit_end: VecDeque::new(),
            reprojection: VecDeque::new(),
            last_texture: VecDeque::new(),
            vsync: VecDeque::new(),
            last_process: 0,
        }
    }

    /// Frames not yet emitted.
    pub fn in_flight(&self) -> usize {
        self.chains.len()
    }

    pub fn handle(&mut self, ev: &EventRecord) -> Result<(), FieldError> {
        let Ok(message) = parse_message(ev.str("Message")?) else {
            return Err(FieldError::OutOfRange {
                provider: ev.provider,
                id: ev.id,
                name: "Message",
                expected: "compositor log line",
            });
        };
        let Some(message) = message else {
            return Ok(());
        };
        let ts = ev.timestamp;

        match message {
            Message::Received { frame_id } => {
                let mut frame = CompositorFrame::new(CompositorKind::SteamVr, ts, ev.pid);
                frame.frame_id = frame_id;
                frame.app_render_start = ts;
                self.last_process = ev.pid;

                let id = self.chains.insert(frame);
                self.chains.by_frame_id.insert(frame_id, id);
                push_live(&mut self.submit_left, (frame_id, id), &self.chains);
            }
            Message::SubmitLeft => {
                if let Some(entry) = pop_live(&mut self.submit_left, &self.chains) {
                    push_live(&mut self.submit_right, entry, &self.chains);
                }
            }
            Message::SubmitRight => {
                if let Some(entry) = pop_live(&mut self.submit_right, &self.chains) {
                    push_live(&mut self.submit_end, entry, &self.chains);
                }
            }
            // The app is done rendering; the frame is not shown yet.
            Message::SubmitEnd => {
                if let Some((_, id)) = pop_live(&mut self.submit_end, &self.chains) {
                    if let Some(frame) = self.chains.get_mut(id) {
                        frame.app_render_end = ts;
                        frame.app_rendering_completed = true;
                    }
                }
            }
            Message::NewFrame { id: compositor_id, idx } => {
                let Some(chain) = self.pair_compositor_frame(compositor_id, ev) else {
                    return Ok(());
                };
                if let Some(frame) = self.chains.get_mut(chain) {
                    frame.reprojection_start = ts;
                    // Nothing new from the app for this pass.
                    if idx == 0 {
                        frame.app_miss = true;
                    }
                }
                push_live(&mut self.reprojection, (compositor_id, chain), &self.chains);
            }
            Message::EndPresent => {
                if let Some((cid, chain)) = pop_live(&mut self.reprojection, &self.chains) {
                    if let Some(frame) = self.chains.get_mut(chain) {
                        frame.reprojection_end = ts;
                    }
                    push_live(&mut self.last_texture, (cid, chain), &self.chains);
                }
            }
            Message::LastSceneTexture { index } => {
                if let Some((cid, chain)) = pop_live(&mut self.last_texture, &self.chains) {
                    if let Some(frame) = self.chains.get_mut(chain) {
                        // The compositor reused an older scene texture.
                        if index < cid && !frame.app_miss {
                            frame.warp_miss = true;
                        }
                    }
                    push_live(&mut self.vsync, ((), chain), &self.chains);
                }
            }
            Message::TimeSinceLastVsync { ms } => {
                if let Some((_, chain)) = pop_live(&mut self.vsync, &self.chains) {
                    if let Some(frame) = self.chains.get_mut(chain) {
                        frame.ms_since_last_vsync = ms;
                        frame.vsync_indicator = ts;
                    }
                    self.chains.complete(chain);
                }
            }
        }

        Ok(())
    }

    /// Find the app frame a compositor pass belongs to. The compositor
    /// counter can drift one either way from the client's.
    fn pair_compositor_frame(&mut self, compositor_id: u64, ev: &EventRecord) -> Option<ChainId> {
        let candidates = [
            Some(compositor_id),
            compositor_id.checked_add(1),
            compositor_id.checked_sub(1),
        ];
        for frame_id in candidates.into_iter().flatten() {
            if let Some(chain) = self.chains.take_frame_id(frame_id) {
                return Some(chain);
            }
        }

        // Compositor pass with no known app.
        if self.last_process == 0 {
            return None;
        }
        let mut frame = CompositorFrame::new(CompositorKind::SteamVr, ev.timestamp, self.last_process);
        frame.frame_id = compositor_id;
        Some(self.chains.insert(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::Provider;

    const APP: u32 = 12;
    const COMPOSITOR: u32 = 34;

    fn tracker() -> (SteamVrTracker, Arc<CompletedQueue<CompositorFrame>>) {
        let out = Arc::new(CompletedQueue::new());
        (SteamVrTracker::new(Arc::clone(&out)), out)
    }

    fn line(t: &mut SteamVrTracker, pid: u32, ts: u64, msg: &str) {
        let ev = EventRecord::new(Provider::SteamVr, 0, pid, 1, ts).with_field("Message", msg);
        t.handle(&ev).unwrap();
    }

    fn compositor_pass(t: &mut SteamVrTracker, ts: u64, id: u64, idx: u64, texture: u64) {
        line(t, COMPOSITOR, ts, &format!("[Compositor] NewFrame id={id} idx={idx}"));
        line(t, COMPOSITOR, ts + 5, "[Compositor] End Present");
        line(
            t,
            COMPOSITOR,
            ts + 6,
            &format!("[Compositor] LastSceneTextureIndex={texture} id={id} vsync=1"),
        );
        line(t, COMPOSITOR, ts + 8, "[Compositor] TimeSinceLastVSync: 1.070581(701642)");
    }

    #[test]
    fn test_parse_messages() {
        assert_eq!(
            parse_message("[Compositor Client] Received Idx=2 Id=42"),
            Ok(Some(Message::Received { frame_id: 42 }))
        );
        assert_eq!(
            parse_message("[Compositor] NewFrame id=7 idx=0"),
            Ok(Some(Message::NewFrame { id: 7, idx: 0 }))
        );
        assert_eq!(
            parse_message("[Compositor] TimeSinceLastVSync: 2.5(1234)\0"),
            Ok(Some(Message::TimeSinceLastVsync { ms: 2.5 }))
        );
        assert_eq!(parse_message("[Compositor] Something else"), Ok(None));
        assert_eq!(parse_message("[Compositor] NewFrame id=x idx=0"), Err(()));
    }

    #[test]
    fn test_stage_queues_bounded_without_submit_lines() {
        let (mut t, out) = tracker();
        for frame_id in 1..=2_000u64 {
            let ts = frame_id * 100;
            line(&mut t, APP, ts, &format!("[Compositor Client] Received Idx=1 Id={frame_id}"));
            compositor_pass(&mut t, ts + 10, frame_id, 1, frame_id);
        }

        assert_eq!(out.len(), 2_000);
        assert_eq!(t.in_flight(), 0);
        assert!(t.submit_left.len() <= 1);
        assert!(t.submit_right.is_empty() && t.submit_end.is_empty());
    }

    #[test]
    fn test_full_chain() {
        let (mut t, out) = tracker();
        line(&mut t, APP, 100, "[Compositor Client] Received Idx=1 Id=42");
        line(&mut t, APP, 110, "[Compositor Client] Submit Left");
        line(&mut t, APP, 115, "[Compositor Client] Submit Right");
        line(&mut t, APP, 120, "[Compositor Client] Submit End");
        compositor_pass(&mut t, 130, 42, 1, 42);

        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 1);
        let f = &done[0];
        assert_eq!(f.process_id, APP);
        assert_eq!(f.frame_id, 42);
        assert_eq!(f.app_render_start, 100);
        assert_eq!(f.app_render_end, 120);
        assert!(f.app_rendering_completed);
        assert_eq!(f.reprojection_start, 130);
        assert_eq!(f.reprojection_end, 135);
        assert_eq!(f.vsync_indicator, 138);
        assert!((f.ms_since_last_vsync - 1.070581).abs() < 1e-9);
        assert!(!f.app_miss && !f.warp_miss);
        assert_eq!(t.in_flight(), 0);
    }

    #[test]
    fn test_compositor_one_behind_finds_app_frame() {
        let (mut t, out) = tracker();
        line(&mut t, APP, 100, "[Compositor Client] Received Idx=1 Id=42");
        compositor_pass(&mut t, 130, 41, 3, 41);

        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].frame_id, 42);
        assert_eq!(done[0].process_id, APP);
        assert!(!done[0].app_miss);
    }

    #[test]
    fn test_idx_zero_is_app_miss() {
        let (mut t, out) = tracker();
        line(&mut t, APP, 100, "[Compositor Client] Received Idx=1 Id=41");
        compositor_pass(&mut t, 130, 42, 0, 40);

        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].frame_id, 41);
        assert!(done[0].app_miss);
        // App misses are never also warp misses.
        assert!(!done[0].warp_miss);
    }

    #[test]
    fn test_old_texture_is_warp_miss() {
        let (mut t, out) = tracker();
        line(&mut t, APP, 100, "[Compositor Client] Received Idx=1 Id=42");
        compositor_pass(&mut t, 130, 42, 1, 40);
        assert!(out.try_dequeue_all()[0].warp_miss);
    }

    #[test]
    fn test_unknown_app_pass_is_skipped() {
        let (mut t, out) = tracker();
        compositor_pass(&mut t, 130, 9, 1, 9);
        assert!(out.is_empty());
        assert_eq!(t.in_flight(), 0);
    }

    #[test]
    fn test_unmatched_pass_fabricates_frame_for_last_app() {
        let (mut t, out) = tracker();
        line(&mut t, APP, 100, "[Compositor Client] Received Idx=1 Id=5");
        compositor_pass(&mut t, 130, 5, 1, 5);
        compositor_pass(&mut t, 200, 20, 1, 20);

        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 2);
        assert_eq!(done[1].frame_id, 20);
        assert_eq!(done[1].process_id, APP);
        assert_eq!(done[1].app_render_start, 0);
    }

    #[test]
    fn test_completion_flushes_dangling_app_frames() {
        let (mut t, out) = tracker();
        line(&mut t, APP, 100, "[Compositor Client] Received Idx=1 Id=10");
        line(&mut t, APP, 110, "[Compositor Client] Received Idx=2 Id=11");
        line(&mut t, APP, 120, "[Compositor Client] Received Idx=3 Id=15");
        compositor_pass(&mut t, 130, 15, 1, 15);

        let done = out.try_dequeue_all();
        let ids: Vec<u64> = done.iter().map(|f| f.frame_id).collect();
        assert_eq!(ids, vec![10, 11, 15]);
        assert!(done[0].app_miss && done[1].app_miss);
        assert_eq!(t.in_flight(), 0);
    }

    #[test]
    fn test_unparseable_message_is_an_error() {
        let (mut t, _) = tracker();
        let ev = EventRecord::new(Provider::SteamVr, 0, APP, 1, 1)
            .with_field("Message", "[Compositor Client] Received Idx=1 Id=zz");
        assert!(t.handle(&ev).is_err());
        let ev = EventRecord::new(Provider::SteamVr, 0, APP, 1, 1);
        assert!(t.handle(&ev).is_err());
    }
}
