//! Fixed-window running mean, minimum and maximum.

use std::collections::VecDeque;

/// Ring buffer with a running sum plus monotonic min/max deques tagged by
/// a sequence counter. `min()` and `max()` are O(1); `add` is amortised
/// O(1).
#[derive(Debug, Clone)]
pub struct RunningStats {
    values: Vec<f64>,
    sum: f64,
    head: usize,
    count: usize,
    seq: u64,
    min_q: VecDeque<(f64, u64)>,
    max_q: VecDeque<(f64, u64)>,
}

impl RunningStats {
    pub fn new(window: usize) -> Self {
        let mut stats = Self {
            values: Vec::new(),
            sum: 0.0,
            head: 0,
            count: 0,
            seq: 0,
            min_q: VecDeque::new(),
            max_q: VecDeque::new(),
        };
        stats.reset(window);
        stats
    }

    pub fn reset(&mut self, window: usize) {
        self.values.clear();
        self.values.resize(window.max(1), 0.0);
        self.sum = 0.0;
        self.head = 0;
        self.count = 0;
        self.seq = 0;
        self.min_q.clear();
        self.max_q.clear();
    }

    pub fn add(&mut self, value: f64) {
        let window = self.values.len();
        if self.count == window {
            self.sum -= self.values[self.head];
        } else {
            self.count += 1;
        }
        self.sum += value;
        self.values[self.head] = value;
        self.head += 1;
        if self.head == window {
            self.head = 0;
        }
        self.seq += 1;

        while self.min_q.back().is_some_and(|&(v, _)| v >= value) {
            self.min_q.pop_back();
        }
        self.min_q.push_back((value, self.seq));

        while self.max_q.back().is_some_and(|&(v, _)| v <= value) {
            self.max_q.pop_back();
        }
        self.max_q.push_back((value, self.seq));

        // Expire entries that fell out of the window.
        let expire_before = self.seq.saturating_sub(window as u64);
        while self.min_q.front().is_some_and(|&(_, s)| s <= expire_before) {
            self.min_q.pop_front();
        }
        while self.max_q.front().is_some_and(|&(_, s)| s <= expire_before) {
            self.max_q.pop_front();
        }
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.sum / self.count as f64 }
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.min_q.front().map_or(0.0, |&(v, _)| v) }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.max_q.front().map_or(0.0, |&(v, _)| v) }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_full(&self) -> bool {
        self.count == self.values.len()
    }
}
