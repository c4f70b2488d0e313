use std::collections::vec_deque::{self, VecDeque};

/// Anything placed in a [`RollingWindow`] carries a QPC timestamp.
pub trait Timed {
    fn qpc_time(&self) -> u64;
}

/// A length- and time-bounded history, oldest first.
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    items: VecDeque<T>,
    max_len: usize,
    horizon_ms: u64,
}

impl<T: Timed> RollingWindow<T> {
    pub fn new(max_len: usize, horizon_ms: u64) -> Self {
        Self {
            items: VecDeque::with_capacity(max_len.min(1024) + 1),
            max_len,
            horizon_ms,
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    /// Evict from the front while the window is too long or spans more
    /// than the horizon.
    pub fn prune(&mut self, frequency: u64) {
        while !self.items.is_empty()
            && (self.items.len() > self.max_len || self.span_ms(frequency) > self.horizon_ms as f64)
        {
            self.items.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.items.iter()
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }

    /// Every entry but the newest. Interval statistics sum over these.
    pub fn intervals(&self) -> impl Iterator<Item = &T> {
        self.items.iter().take(self.items.len().saturating_sub(1))
    }

    /// Ticks between the oldest and newest entries.
    pub fn span_ticks(&self) -> u64 {
        match (self.items.front(), self.items.back()) {
            (Some(first), Some(last)) => last.qpc_time().saturating_sub(first.qpc_time()),
            _ => 0,
        }
    }

    fn span_ms(&self, frequency: u64) -> f64 {
        ticks_to_ms(self.span_ticks(), frequency)
    }

    /// Seconds covered by the window, 0 below two samples.
    pub fn history_secs(&self, frequency: u64) -> f64 {
        if self.items.len() < 2 || frequency == 0 {
            return 0.0;
        }
        self.span_ticks() as f64 / frequency as f64
    }

    /// Intervals per second across the window, 0 below two samples.
    pub fn fps(&self, frequency: u64) -> f64 {
        let secs = self.history_secs(frequency);
        if secs <= 0.0 {
            return 0.0;
        }
        (self.items.len() - 1) as f64 / secs
    }
}

pub fn ticks_to_ms(ticks: u64, frequency: u64) -> f64 {
    if frequency == 0 {
        return 0.0;
    }
    ticks as f64 * 1000.0 / frequency as f64
}

/// Average, minimum and maximum of a series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeStat {
    sum: f64,
    count: u32,
    min: f64,
    max: f64,
}

impl RuntimeStat {
    pub fn new() -> Self {
        Self {
            sum: 0.0,
            count: 0,
            min: f64::MAX,
            max: f64::MIN,
        }
    }

    pub fn record(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / f64::from(self.count)
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.min
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.max
    }
}

impl Default for RuntimeStat {
    fn default() -> Self {
        Self::new()
    }
}
