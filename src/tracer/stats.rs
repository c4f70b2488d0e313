use std::sync::atomic::{AtomicU64, Ordering};

use super::event::{Provider, MAX_PROVIDER};

/// Lock-free per-Provider counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct ProviderStats {
    counts: [AtomicU64; MAX_PROVIDER + 1],
}

impl ProviderStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment the counter for the given provider by one.
    pub fn record(&self, p: Provider) {
        if let Some(counter) = self.counts.get(p as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Atomically read and reset all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(Provider, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(p) = Provider::from_u8(i as u8) {
                    result.push((p, v));
                }
            }
        }

        result
    }
}

impl Default for ProviderStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Events and buffers the OS trace layer reported as lost.
///
/// Written by the producer, read by the consumer each tick.
#[derive(Default)]
pub struct LostEventCounters {
    events: AtomicU64,
    buffers: AtomicU64,
    events_total: AtomicU64,
    buffers_total: AtomicU64,
}

impl LostEventCounters {
    pub fn record(&self, events: u64, buffers: u64) {
        self.events.fetch_add(events, Ordering::Relaxed);
        self.buffers.fetch_add(buffers, Ordering::Relaxed);
        self.events_total.fetch_add(events, Ordering::Relaxed);
        self.buffers_total.fetch_add(buffers, Ordering::Relaxed);
    }

    /// Read and reset the per-interval counts as `(events, buffers)`.
    pub fn take(&self) -> (u64, u64) {
        (
            self.events.swap(0, Ordering::Relaxed),
            self.buffers.swap(0, Ordering::Relaxed),
        )
    }

    /// Lifetime totals as `(events, buffers)`.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.events_total.load(Ordering::Relaxed),
            self.buffers_total.load(Ordering::Relaxed),
        )
    }
}

/// Correlation-engine anomaly counters.
#[derive(Default)]
pub struct PipelineStats {
    events_dropped: AtomicU64,
    presents_abandoned: AtomicU64,
    double_completions: AtomicU64,
}

/// Point-in-time view of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSnapshot {
    pub events_dropped: u64,
    pub presents_abandoned: u64,
    pub double_completions: u64,
}

impl PipelineStats {
    pub fn event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn present_abandoned(&self) {
        self.presents_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn double_completion(&self) {
        self.double_completions.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            events_dropped: self.events_dropped.swap(0, Ordering::Relaxed),
            presents_abandoned: self.presents_abandoned.swap(0, Ordering::Relaxed),
            double_completions: self.double_completions.swap(0, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = ProviderStats::new();
        stats.record(Provider::Dxgi);
        stats.record(Provider::Dxgi);
        stats.record(Provider::DxgKrnl);

        let snap = stats.snapshot();
        assert_eq!(snap.len(), 2);

        let dxgi = snap
            .iter()
            .find(|(p, _)| *p == Provider::Dxgi)
            .map(|(_, v)| *v);
        assert_eq!(dxgi, Some(2));

        let kernel = snap
            .iter()
            .find(|(p, _)| *p == Provider::DxgKrnl)
            .map(|(_, v)| *v);
        assert_eq!(kernel, Some(1));
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = ProviderStats::new();
        stats.record(Provider::SteamVr);

        assert_eq!(stats.snapshot().len(), 1);
        assert!(stats.snapshot().is_empty());
    }

    #[test]
    fn test_lost_counters() {
        let lost = LostEventCounters::default();
        lost.record(3, 1);
        lost.record(2, 0);

        assert_eq!(lost.take(), (5, 1));
        assert_eq!(lost.take(), (0, 0));
        assert_eq!(lost.totals(), (5, 1));
    }

    #[test]
    fn test_pipeline_snapshot() {
        let stats = PipelineStats::default();
        stats.event_dropped();
        stats.present_abandoned();
        stats.present_abandoned();
        stats.double_completion();

        assert_eq!(
            stats.snapshot(),
            PipelineSnapshot {
                events_dropped: 1,
                presents_abandoned: 2,
                double_completions: 1,
            }
        );
        assert_eq!(stats.snapshot(), PipelineSnapshot::default());
    }
}
