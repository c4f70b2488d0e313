use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;

use super::arena::Arena;
use super::{Present, PresentId, Win32kToken};

/// Presents waiting on a compositor flip beyond this drop the oldest.
pub const MAX_WAITING_FOR_DWM: usize = 256;

/// Ordering key within a process: creation timestamp, then creation order.
pub type ProcessKey = (u64, u64);

/// Every keyed mapping used to find an in-flight present again.
///
/// Indices hold [`PresentId`]s only; the arena owns the records. An id
/// that no longer resolves is treated as absent.
#[derive(Default)]
pub struct CorrelationIndex {
    /// At most one in-flight present per calling thread.
    pub by_thread: HashMap<u32, PresentId>,
    /// Presents per process, oldest first. Used to pick up batched presents.
    pub by_process: HashMap<u32, BTreeMap<ProcessKey, PresentId>>,
    /// Submission order per (process, swap chain). Only ever trimmed from the front.
    pub by_chain: HashMap<(u32, u64), VecDeque<PresentId>>,
    pub by_submit_sequence: HashMap<u32, PresentId>,
    pub win32k_tokens: HashMap<Win32kToken, PresentId>,
    pub dxgk_tokens: HashMap<u64, PresentId>,
    pub legacy_blit_tokens: HashMap<u64, PresentId>,
    /// Ordered so compositor pickups are deterministic.
    pub by_window: BTreeMap<u64, PresentId>,
    /// Blts on sources without a kernel present event, keyed by DXG context.
    pub blts_by_context: HashMap<u64, PresentId>,
    /// Presents that complete with the compositor's next present.
    pub waiting_for_dwm: Vec<PresentId>,
    /// Thread the compositor issues its own presents from, 0 when unknown.
    pub dwm_present_thread: u32,
}

fn remove_hashed<K: Eq + Hash>(map: &mut HashMap<K, PresentId>, key: &K, id: PresentId) {
    if map.get(key) == Some(&id) {
        map.remove(key);
    }
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove `id` from every secondary index it is registered under.
    ///
    /// Keys now owned by a different present are left alone. The chain
    /// queue is not touched.
    pub fn unlink(&mut self, id: PresentId, p: &Present) {
        if p.queue_submit_sequence != 0 {
            remove_hashed(&mut self.by_submit_sequence, &p.queue_submit_sequence, id);
        }
        if p.hwnd != 0 && self.by_window.get(&p.hwnd) == Some(&id) {
            self.by_window.remove(&p.hwnd);
        }
        if p.token_ptr != 0 {
            remove_hashed(&mut self.dxgk_tokens, &p.token_ptr, id);
        }
        if let Some(token) = p.keys.win32k_token {
            remove_hashed(&mut self.win32k_tokens, &token, id);
        }
        if let Some(token) = p.keys.legacy_blit_token {
            remove_hashed(&mut self.legacy_blit_tokens, &token, id);
        }
        if let Some(ctx) = p.keys.blt_context {
            remove_hashed(&mut self.blts_by_context, &ctx, id);
        }

        if let Some(procs) = self.by_process.get_mut(&p.process_id) {
            procs.remove(&(p.qpc_time, p.seq));
            if procs.is_empty() {
                self.by_process.remove(&p.process_id);
            }
        }

        self.by_thread.retain(|_, v| *v != id);
    }

    /// Queue `id` for the compositor's next flip.
    ///
    /// Entries that were abandoned or completed meanwhile are dropped first.
    pub fn wait_for_dwm(&mut self, arena: &Arena, id: PresentId) {
        self.waiting_for_dwm
            .retain(|w| *w != id && arena.get(*w).is_some_and(|p| !p.completed));
        if self.waiting_for_dwm.len() >= MAX_WAITING_FOR_DWM {
            let excess = self.waiting_for_dwm.len() + 1 - MAX_WAITING_FOR_DWM;
            self.waiting_for_dwm.drain(..excess);
        }
        self.waiting_for_dwm.push(id);
    }

    /// Number of presents waiting in swap-chain queues.
    pub fn queued(&self) -> usize {
        self.by_chain.values().map(VecDeque::len).sum()
    }
}
