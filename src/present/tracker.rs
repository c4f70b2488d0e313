use std::sync::Arc;

use tracing::{debug, trace};

use super::arena::Arena;
use super::flags;
use super::index::CorrelationIndex;
use super::{Present, PresentId, PresentMode, PresentResult, Runtime};
use crate::engine::CompletedQueue;
use crate::tracer::event::EventRecord;
use crate::tracer::stats::PipelineStats;

/// A swap-chain queue longer than this abandons its oldest entry.
pub const MAX_PENDING_PER_SWAP_CHAIN: usize = 256;

enum Step {
    /// Check for double completion and cascade into dependents.
    Enter(PresentId),
    /// Drop the present from the secondary indices.
    Settle(PresentId),
    /// Resolve earlier siblings, mark completed, drain the queue head.
    Flush(PresentId),
}

/// Producer-side correlation state for presents.
///
/// Owned by the producer thread; only the output queue is shared.
pub struct PresentTracker {
    pub(super) arena: Arena,
    pub(super) index: CorrelationIndex,
    simple_mode: bool,
    next_seq: u64,
    output: Arc<CompletedQueue<Present>>,
    stats: Arc<PipelineStats>,
}

impl PresentTracker {
    pub fn new(
        simple_mode: bool,
        output: Arc<CompletedQueue<Present>>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            arena: Arena::new(),
            index: CorrelationIndex::new(),
            simple_mode,
            next_seq: 0,
            output,
            stats,
        }
    }

    pub fn simple_mode(&self) -> bool {
        self.simple_mode
    }

    /// Look up an in-flight present.
    pub fn get(&self, id: PresentId) -> Option<&Present> {
        self.arena.get(id)
    }

    /// Presents created but not yet emitted.
    pub fn in_flight(&self) -> usize {
        self.arena.len()
    }

    /// The present currently associated with a thread, if any.
    pub fn thread_present(&self, tid: u32) -> Option<PresentId> {
        self.index.by_thread.get(&tid).copied()
    }

    /// `id` if it still resolves to a present that has not completed.
    pub(super) fn live(&self, id: PresentId) -> Option<PresentId> {
        self.arena.get(id).filter(|p| !p.completed).map(|_| id)
    }

    pub(super) fn live_mut(&mut self, id: PresentId) -> Option<&mut Present> {
        self.arena.get_mut(id).filter(|p| !p.completed)
    }

    /// Live present on a thread.
    pub(super) fn by_thread(&self, tid: u32) -> Option<PresentId> {
        self.index
            .by_thread
            .get(&tid)
            .and_then(|id| self.live(*id))
    }

    pub(super) fn by_submit_sequence(&self, seq: u32) -> Option<PresentId> {
        self.index
            .by_submit_sequence
            .get(&seq)
            .and_then(|id| self.live(*id))
    }

    /// Point a window at `id`. A different live occupant is superseded: it
    /// will never reach the screen, so it is discarded and completed.
    pub(super) fn supersede_window(&mut self, hwnd: u64, id: PresentId) {
        let Some(old) = self.index.by_window.insert(hwnd, id) else {
            return;
        };
        if old == id {
            return;
        }

        if let Some(p) = self.live_mut(old) {
            p.final_state = PresentResult::Discarded;
            trace!(hwnd, qpc = p.qpc_time, "Window present superseded");
            self.complete(old);
        }
    }

    /// Register a new present under its thread, process and swap chain.
    fn track(&mut self, mut present: Present, thread_id: u32) -> PresentId {
        present.seq = self.next_seq;
        self.next_seq += 1;

        let process_key = (present.qpc_time, present.seq);
        let pid = present.process_id;
        let chain = present.chain_key();

        let id = self.arena.insert(present);
        self.index.by_thread.insert(thread_id, id);
        self.index
            .by_process
            .entry(pid)
            .or_default()
            .insert(process_key, id);
        self.index.by_chain.entry(chain).or_default().push_back(id);

        self.prune_chain(chain);

        id
    }

    /// Resolve the present a kernel event on `ev.tid` refers to.
    ///
    /// A thread present for which `is_stuck` holds has already progressed
    /// past this event; it is dropped from the thread index and a fresh
    /// lookup is made.
    pub(super) fn find_or_create(
        &mut self,
        ev: &EventRecord,
        is_stuck: impl Fn(&Present) -> bool,
    ) -> PresentId {
        if let Some(&id) = self.index.by_thread.get(&ev.tid) {
            match self.arena.get(id) {
                Some(p) if !p.completed && !is_stuck(p) => return id,
                Some(p) if !p.completed => {
                    trace!(tid = ev.tid, qpc = p.qpc_time, "Evicting stuck present from thread");
                    self.index.by_thread.remove(&ev.tid);
                }
                _ => {
                    self.index.by_thread.remove(&ev.tid);
                }
            }
        }

        // Batched presents are popped off the driver queue in process order.
        if let Some(procs) = self.index.by_process.get_mut(&ev.pid) {
            let arena = &self.arena;
            let batched = procs
                .iter()
                .find(|(_, id)| {
                    arena
                        .get(**id)
                        .is_some_and(|p| !p.completed && p.mode == PresentMode::Unknown)
                })
                .map(|(k, id)| (*k, *id));

            if let Some((key, id)) = batched {
                procs.remove(&key);
                self.index.by_thread.insert(ev.tid, id);
                return id;
            }
        }

        // Not from a runtime we track (composition buffers, other APIs).
        let present = Present::new(ev.timestamp, ev.pid, ev.tid, Runtime::Other);
        self.track(present, ev.tid)
    }

    /// Begin tracking a runtime present call. Test presents are ignored.
    pub fn runtime_present_start(&mut self, present: Present) {
        if present.present_flags & flags::TEST != 0 {
            return;
        }

        let tid = present.runtime_thread;
        self.track(present, tid);
    }

    /// The runtime present call on `tid` returned at `timestamp`.
    pub fn runtime_present_stop(&mut self, tid: u32, timestamp: u64, allow_batching: bool) {
        let Some(id) = self.by_thread(tid) else {
            return;
        };

        let simple_mode = self.simple_mode;
        if let Some(p) = self.arena.get_mut(id) {
            p.time_taken = timestamp.saturating_sub(p.qpc_time);

            if !allow_batching || simple_mode {
                if allow_batching {
                    // Nothing past the runtime call is tracked; its return
                    // stands in for the screen time.
                    p.stamp_presented(timestamp);
                } else {
                    p.final_state = PresentResult::Discarded;
                }
                self.complete(id);
            }
        }

        if self.index.by_thread.get(&tid) == Some(&id) {
            self.index.by_thread.remove(&tid);
        }
    }

    /// Complete a present, its dependents and any earlier siblings it
    /// overtakes, then drain its swap-chain queue head to the output.
    ///
    /// Runs as an explicit worklist so adversarial dependency chains cannot
    /// exhaust the stack.
    pub fn complete(&mut self, id: PresentId) {
        let mut work = vec![Step::Enter(id)];

        while let Some(step) = work.pop() {
            match step {
                Step::Enter(id) => {
                    let Some(p) = self.arena.get_mut(id) else {
                        continue;
                    };

                    if p.completed {
                        p.final_state = PresentResult::Error;
                        self.stats.double_completion();
                        debug!(
                            pid = p.process_id,
                            qpc = p.qpc_time,
                            "Present completed twice, marking error"
                        );
                        continue;
                    }

                    let screen_time = p.screen_time;
                    let dependents = std::mem::take(&mut p.dependents);

                    work.push(Step::Settle(id));
                    for dep in dependents.into_iter().rev() {
                        if let Some(d) = self.live_mut(dep) {
                            d.screen_time = screen_time;
                            d.final_state = PresentResult::Presented;
                        }
                        work.push(Step::Enter(dep));
                    }
                }
                Step::Settle(id) => {
                    if let Some(p) = self.arena.get(id) {
                        self.index.unlink(id, p);
                        work.push(Step::Flush(id));
                    }
                }
                Step::Flush(id) => {
                    let Some(p) = self.arena.get(id) else {
                        continue;
                    };
                    let chain = p.chain_key();
                    let outcome = p.final_state;
                    let screen_time = p.screen_time;

                    // A shown present resolves every earlier sibling first so
                    // screen times stay monotonic per swap chain.
                    if outcome == PresentResult::Presented {
                        if let Some(earlier) = self.earliest_pending_before(chain, id) {
                            if let Some(e) = self.arena.get_mut(earlier) {
                                if e.final_state == PresentResult::Unknown {
                                    e.final_state = outcome;
                                    if e.screen_time == 0 {
                                        e.screen_time = screen_time;
                                    }
                                }
                            }
                            work.push(Step::Flush(id));
                            work.push(Step::Enter(earlier));
                            continue;
                        }
                    }

                    if let Some(p) = self.arena.get_mut(id) {
                        p.completed = true;
                    }

                    let queued = self
                        .index
                        .by_chain
                        .get(&chain)
                        .is_some_and(|q| q.contains(&id));
                    if queued {
                        self.drain_chain(chain);
                    } else if let Some(p) = self.arena.remove(id) {
                        self.output.push(p);
                    }
                }
            }
        }
    }

    /// First not-yet-completed present queued ahead of `id`.
    fn earliest_pending_before(&self, chain: (u32, u64), id: PresentId) -> Option<PresentId> {
        let queue = self.index.by_chain.get(&chain)?;
        queue
            .iter()
            .take_while(|q| **q != id)
            .copied()
            .find(|q| self.live(*q).is_some())
    }

    /// Emit completed presents from the head of a swap-chain queue.
    fn drain_chain(&mut self, chain: (u32, u64)) {
        let Some(queue) = self.index.by_chain.get_mut(&chain) else {
            return;
        };

        let mut batch = Vec::new();
        while let Some(&front) = queue.front() {
            match self.arena.get(front) {
                Some(p) if !p.completed => break,
                Some(_) => {
                    queue.pop_front();
                    if let Some(p) = self.arena.remove(front) {
                        batch.push(p);
                    }
                }
                None => {
                    queue.pop_front();
                }
            }
        }

        if queue.is_empty() {
            self.index.by_chain.remove(&chain);
        }

        self.output.extend(batch);
    }

    /// Bound a swap-chain queue by abandoning its oldest entries.
    fn prune_chain(&mut self, chain: (u32, u64)) {
        loop {
            let Some(queue) = self.index.by_chain.get_mut(&chain) else {
                return;
            };
            if queue.len() <= MAX_PENDING_PER_SWAP_CHAIN {
                return;
            }
            let Some(head) = queue.pop_front() else {
                return;
            };

            if let Some(p) = self.arena.remove(head) {
                self.index.unlink(head, &p);
                self.stats.present_abandoned();
                debug!(
                    pid = p.process_id,
                    swap_chain = p.swap_chain,
                    qpc = p.qpc_time,
                    mode = %p.mode,
                    "Abandoning stuck present"
                );
            }

            self.drain_chain(chain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::Provider;

    fn tracker() -> (PresentTracker, Arc<CompletedQueue<Present>>, Arc<PipelineStats>) {
        let out = Arc::new(CompletedQueue::new());
        let stats = Arc::new(PipelineStats::default());
        (
            PresentTracker::new(false, Arc::clone(&out), Arc::clone(&stats)),
            out,
            stats,
        )
    }

    fn start(t: &mut PresentTracker, qpc: u64, tid: u32, swap_chain: u64) -> PresentId {
        let mut p = Present::new(qpc, 1, tid, Runtime::Dxgi);
        p.swap_chain = swap_chain;
        t.runtime_present_start(p);
        t.thread_present(tid).unwrap()
    }

    fn kernel_event(tid: u32, ts: u64) -> EventRecord {
        EventRecord::new(Provider::DxgKrnl, 0, 1, tid, ts)
    }

    #[test]
    fn test_test_presents_are_ignored() {
        let (mut t, _, _) = tracker();
        let mut p = Present::new(10, 1, 2, Runtime::Dxgi);
        p.present_flags = flags::TEST;
        t.runtime_present_start(p);

        assert_eq!(t.in_flight(), 0);
        assert!(t.thread_present(2).is_none());
    }

    #[test]
    fn test_stop_without_batching_discards() {
        let (mut t, out, _) = tracker();
        start(&mut t, 10, 2, 0x100);
        t.runtime_present_stop(2, 15, false);

        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].final_state, PresentResult::Discarded);
        assert_eq!(done[0].time_taken, 5);
        assert!(done[0].completed);
        assert_eq!(t.in_flight(), 0);
    }

    #[test]
    fn test_stop_with_batching_releases_thread() {
        let (mut t, out, _) = tracker();
        let id = start(&mut t, 10, 2, 0x100);
        t.runtime_present_stop(2, 12, true);

        assert!(out.is_empty());
        assert!(t.thread_present(2).is_none());
        assert_eq!(t.get(id).map(|p| p.time_taken), Some(2));
    }

    #[test]
    fn test_simple_mode_completes_on_stop() {
        let out = Arc::new(CompletedQueue::new());
        let mut t = PresentTracker::new(true, Arc::clone(&out), Arc::default());
        start(&mut t, 10, 2, 0x100);
        t.runtime_present_stop(2, 12, true);

        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].final_state, PresentResult::Presented);
        assert_eq!(done[0].screen_time, 12);
    }

    #[test]
    fn test_find_or_create_picks_batched_present() {
        let (mut t, _, _) = tracker();
        let a = start(&mut t, 10, 2, 0x100);
        t.runtime_present_stop(2, 11, true);

        // A kernel worker thread picks up the batched present.
        let got = t.find_or_create(&kernel_event(99, 20), |p| p.mode != PresentMode::Unknown);
        assert_eq!(got, a);
        assert_eq!(t.thread_present(99), Some(a));
    }

    #[test]
    fn test_find_or_create_evicts_stuck() {
        let (mut t, _, _) = tracker();
        let a = start(&mut t, 10, 2, 0x100);
        if let Some(p) = t.arena.get_mut(a) {
            p.mode = PresentMode::HardwareLegacyFlip;
        }

        let got = t.find_or_create(&kernel_event(2, 20), |p| p.mode != PresentMode::Unknown);
        assert_ne!(got, a);
        let p = t.get(got).unwrap();
        assert_eq!(p.runtime, Runtime::Other);
        assert_eq!(p.swap_chain, 0);
        assert_eq!(p.qpc_time, 20);
        // The stuck present is still queued, never retroactively completed.
        assert!(t.get(a).is_some());
    }

    #[test]
    fn test_out_of_order_completion_waits_for_head() {
        let (mut t, out, _) = tracker();
        let a = start(&mut t, 10, 2, 0x100);
        let b = start(&mut t, 20, 2, 0x100);

        if let Some(p) = t.arena.get_mut(b) {
            p.final_state = PresentResult::Discarded;
        }
        t.complete(b);
        assert!(out.is_empty());

        if let Some(p) = t.arena.get_mut(a) {
            p.final_state = PresentResult::Discarded;
        }
        t.complete(a);

        let done = out.try_dequeue_all();
        assert_eq!(
            done.iter().map(|p| p.qpc_time).collect::<Vec<_>>(),
            vec![10, 20]
        );
    }

    #[test]
    fn test_presented_force_completes_earlier_siblings() {
        let (mut t, out, _) = tracker();
        start(&mut t, 10, 2, 0x100);
        start(&mut t, 20, 3, 0x100);
        let c = start(&mut t, 30, 4, 0x100);

        if let Some(p) = t.arena.get_mut(c) {
            p.final_state = PresentResult::Presented;
            p.screen_time = 40;
        }
        t.complete(c);

        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 3);
        assert_eq!(
            done.iter().map(|p| p.qpc_time).collect::<Vec<_>>(),
            vec![10, 20, 30]
        );
        assert!(done.iter().all(|p| p.final_state == PresentResult::Presented));
        assert!(done.iter().all(|p| p.screen_time == 40));
    }

    #[test]
    fn test_dependents_complete_together() {
        let (mut t, out, _) = tracker();
        let app = start(&mut t, 10, 2, 0x100);
        let dwm = start(&mut t, 20, 3, 0x200);

        if let Some(p) = t.arena.get_mut(dwm) {
            p.dependents.push(app);
            p.screen_time = 50;
            p.final_state = PresentResult::Presented;
        }
        t.complete(dwm);

        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 2);
        let app = done.iter().find(|p| p.swap_chain == 0x100).unwrap();
        assert_eq!(app.screen_time, 50);
        assert_eq!(app.final_state, PresentResult::Presented);
    }

    #[test]
    fn test_double_completion_marks_error() {
        let (mut t, out, stats) = tracker();
        let a = start(&mut t, 10, 2, 0x100);
        let b = start(&mut t, 20, 3, 0x100);

        t.complete(b);
        t.complete(b);

        assert_eq!(t.get(b).map(|p| p.final_state), Some(PresentResult::Error));
        assert_eq!(stats.snapshot().double_completions, 1);
        assert!(out.is_empty());

        t.complete(a);
        assert_eq!(out.try_dequeue_all().len(), 2);
    }

    #[test]
    fn test_queue_pruning_abandons_head() {
        let (mut t, out, stats) = tracker();
        let first = start(&mut t, 0, 2, 0x100);
        let second = start(&mut t, 1, 2, 0x100);
        if let Some(p) = t.arena.get_mut(second) {
            p.completed = true;
        }

        for i in 0..MAX_PENDING_PER_SWAP_CHAIN as u64 - 1 {
            start(&mut t, 2 + i, 2, 0x100);
        }

        assert!(t.get(first).is_none());
        assert_eq!(stats.snapshot().presents_abandoned, 1);
        // The completed entry blocked behind the abandoned head drains.
        let done = out.try_dequeue_all();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].qpc_time, 1);
    }
}
