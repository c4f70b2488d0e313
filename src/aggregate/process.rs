use std::collections::hash_map::{self, HashMap};

use tracing::{debug, info};

use super::swap_chain::SwapChainData;
use crate::present::Present;

pub const UNKNOWN_PROCESS: &str = "<unknown>";

/// Which processes to report on. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessFilter {
    target_pid: Option<u32>,
    /// Lowercased image names.
    names: Vec<String>,
}

impl ProcessFilter {
    pub fn new(target_pid: Option<u32>, names: &[String]) -> Self {
        Self {
            target_pid,
            names: names.iter().map(|n| n.to_lowercase()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.target_pid.is_none() && self.names.is_empty()
    }

    pub fn matches(&self, pid: u32, image_name: &str) -> bool {
        if self.is_empty() || self.target_pid == Some(pid) {
            return true;
        }
        let image_name = image_name.to_lowercase();
        self.names.iter().any(|n| *n == image_name)
    }
}

/// What a swap chain looked like just before a present was added to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentContext {
    pub image_name: String,
    /// Creation time of the previous present on the chain.
    pub previous_present: Option<u64>,
    /// Screen time of the previous displayed present on the chain.
    pub previous_screen: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub image_name: String,
    pub target: bool,
    pub swap_chains: HashMap<u64, SwapChainData>,
}

/// Known processes and their swap chains, keyed by pid.
#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: HashMap<u32, ProcessInfo>,
    filter: ProcessFilter,
}

impl ProcessTable {
    pub fn new(filter: ProcessFilter) -> Self {
        Self {
            processes: HashMap::new(),
            filter,
        }
    }

    /// Record a process start, replacing any stale entry for a reused pid.
    pub fn start(&mut self, pid: u32, image_name: &str) {
        let target = self.filter.matches(pid, image_name);
        if target && !self.filter.is_empty() {
            info!(pid, image_name, "Target process started");
        }
        self.processes.insert(
            pid,
            ProcessInfo {
                image_name: image_name.to_string(),
                target,
                swap_chains: HashMap::new(),
            },
        );
    }

    pub fn stop(&mut self, pid: u32) -> Option<ProcessInfo> {
        let info = self.processes.remove(&pid)?;
        if info.target && !self.filter.is_empty() {
            info!(pid, image_name = %info.image_name, "Target process stopped");
        }
        Some(info)
    }

    /// Look up a process, creating it as unknown on first sight.
    pub fn get_or_insert(&mut self, pid: u32) -> &mut ProcessInfo {
        let filter = &self.filter;
        self.processes.entry(pid).or_insert_with(|| ProcessInfo {
            image_name: UNKNOWN_PROCESS.to_string(),
            target: filter.matches(pid, UNKNOWN_PROCESS),
            swap_chains: HashMap::new(),
        })
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessInfo> {
        self.processes.get(&pid)
    }

    /// Fold a completed present into its swap chain. Returns `None` if the
    /// process is filtered out.
    pub fn add_present(&mut self, p: &Present, frequency: u64) -> Option<PresentContext> {
        let info = self.get_or_insert(p.process_id);
        if !info.target {
            return None;
        }
        let chain = info.swap_chains.entry(p.swap_chain).or_default();
        let ctx = PresentContext {
            image_name: info.image_name.clone(),
            previous_present: chain.last_present_time(),
            previous_screen: chain.last_screen_time(),
        };
        chain.add(p, frequency);
        Some(ctx)
    }

    /// Drop swap chains with no present within the stale timeout.
    pub fn evict_stale(&mut self, now: u64, frequency: u64) -> usize {
        let mut evicted = 0;
        for (pid, info) in &mut self.processes {
            let before = info.swap_chains.len();
            info.swap_chains
                .retain(|_, chain| !chain.is_stale(now, frequency));
            let removed = before - info.swap_chains.len();
            if removed > 0 {
                debug!(pid = *pid, removed, "Evicted stale swap chains");
            }
            evicted += removed;
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn swap_chain_count(&self) -> usize {
        self.processes.values().map(|p| p.swap_chains.len()).sum()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, u32, ProcessInfo> {
        self.processes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::present::{PresentResult, Runtime};

    const FREQ: u64 = 1_000;

    fn present(pid: u32, swap_chain: u64, qpc: u64) -> Present {
        let mut p = Present::new(qpc, pid, 1, Runtime::Dxgi);
        p.swap_chain = swap_chain;
        p.final_state = PresentResult::Presented;
        p.screen_time = qpc + 5;
        p
    }

    #[test]
    fn test_filter() {
        let any = ProcessFilter::default();
        assert!(any.matches(1, "whatever.exe"));

        let f = ProcessFilter::new(Some(42), &["Game.EXE".to_string()]);
        assert!(f.matches(42, "other.exe"));
        assert!(f.matches(7, "game.exe"));
        assert!(!f.matches(7, "other.exe"));
    }

    #[test]
    fn test_lazy_unknown_process() {
        let mut t = ProcessTable::new(ProcessFilter::default());
        let ctx = t.add_present(&present(5, 0x1, 100), FREQ).unwrap();
        assert_eq!(ctx.image_name, UNKNOWN_PROCESS);
        assert_eq!(ctx.previous_present, None);
        assert_eq!(ctx.previous_screen, None);

        let ctx = t.add_present(&present(5, 0x1, 116), FREQ).unwrap();
        assert_eq!(ctx.previous_present, Some(100));
        assert_eq!(ctx.previous_screen, Some(105));
        assert_eq!(t.swap_chain_count(), 1);
    }

    #[test]
    fn test_filtered_processes_are_skipped() {
        let mut t = ProcessTable::new(ProcessFilter::new(None, &["game.exe".to_string()]));
        t.start(1, "game.exe");
        t.start(2, "browser.exe");

        assert!(t.add_present(&present(1, 0x1, 100), FREQ).is_some());
        assert!(t.add_present(&present(2, 0x1, 100), FREQ).is_none());
        assert!(t.add_present(&present(3, 0x1, 100), FREQ).is_none());
        assert_eq!(t.swap_chain_count(), 1);
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn test_restart_replaces_entry() {
        let mut t = ProcessTable::new(ProcessFilter::default());
        t.start(1, "a.exe");
        t.add_present(&present(1, 0x1, 100), FREQ);
        t.start(1, "b.exe");
        assert_eq!(t.get(1).map(|p| p.image_name.as_str()), Some("b.exe"));
        assert_eq!(t.swap_chain_count(), 0);

        assert!(t.stop(1).is_some());
        assert!(t.stop(1).is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn test_evict_stale_swap_chains() {
        let mut t = ProcessTable::new(ProcessFilter::default());
        t.add_present(&present(1, 0x1, 0), FREQ);
        t.add_present(&present(1, 0x2, 9_000), FREQ);

        assert_eq!(t.evict_stale(15_000, FREQ), 1);
        assert_eq!(t.swap_chain_count(), 1);
        assert!(t.get(1).unwrap().swap_chains.contains_key(&0x2));
    }
}
