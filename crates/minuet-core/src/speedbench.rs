//! Request timing ring. Diagnostic only; the pipeline records samples in
//! debug builds.

use std::time::{Instant, SystemTime};

const MAX_ACTIVE: usize = 256;
const HISTORY_CAPACITY: usize = 2048;

#[derive(Debug, Clone)]
pub struct SpeedSample {
    pub path: String,
    pub start_wall: SystemTime,
    pub end_wall: SystemTime,
    pub duration_ms: f64,
}

struct ActiveTimer {
    key: u64,
    path: String,
    start_mono: Instant,
    start_wall: SystemTime,
}

pub struct SpeedBench {
    active: Vec<ActiveTimer>,
    history: Vec<SpeedSample>,
    next_index: usize,
}

impl SpeedBench {
    pub fn new() -> Self {
        SpeedBench {
            active: Vec::new(),
            history: Vec::with_capacity(HISTORY_CAPACITY),
            next_index: 0,
        }
    }

    pub fn start(&mut self, key: u64, path: &str) {
        if let Some(slot) = self.active.iter_mut().find(|t| t.key == key) {
            slot.path = path.to_string();
            slot.start_mono = Instant::now();
            slot.start_wall = SystemTime::now();
            return;
        }
        if self.active.len() >= MAX_ACTIVE {
            return;
        }
        self.active.push(ActiveTimer {
            key,
            path: path.to_string(),
            start_mono: Instant::now(),
            start_wall: SystemTime::now(),
        });
    }

    pub fn end(&mut self, key: u64) {
        let Some(pos) = self.active.iter().position(|t| t.key == key) else {
            return;
        };
        let timer = self.active.swap_remove(pos);

        let duration = timer.start_mono.elapsed();
        let sample = SpeedSample {
            path: timer.path,
            start_wall: timer.start_wall,
            end_wall: SystemTime::now(),
            duration_ms: duration.as_secs_f64() * 1000.0,
        };

        if self.history.len() < HISTORY_CAPACITY {
            self.history.push(sample);
        } else {
            self.history[self.next_index] = sample;
        }
        self.next_index = (self.next_index + 1) % HISTORY_CAPACITY;
    }

    /// History snapshot, oldest first.
    pub fn history(&self) -> Vec<SpeedSample> {
        if self.history.len() < HISTORY_CAPACITY {
            return self.history.clone();
        }
        let mut out = Vec::with_capacity(HISTORY_CAPACITY);
        for i in 0..HISTORY_CAPACITY {
            out.push(self.history[(self.next_index + i) % HISTORY_CAPACITY].clone());
        }
        out
    }

    pub fn sample_count(&self) -> usize {
        self.history.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

impl Default for SpeedBench {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_end_records_a_sample() {
        let mut bench = SpeedBench::new();
        bench.start(1, "/hello");
        bench.end(1);

        assert_eq!(bench.sample_count(), 1);
        assert_eq!(bench.active_count(), 0);
        let history = bench.history();
        assert_eq!(history[0].path, "/hello");
        assert!(history[0].duration_ms >= 0.0);
    }

    #[test]
    fn end_without_start_is_ignored() {
        let mut bench = SpeedBench::new();
        bench.end(99);
        assert_eq!(bench.sample_count(), 0);
    }

    #[test]
    fn history_wraps_fifo() {
        let mut bench = SpeedBench::new();
        for i in 0..(HISTORY_CAPACITY as u64 + 5) {
            bench.start(i, &format!("/r{i}"));
            bench.end(i);
        }
        assert_eq!(bench.sample_count(), HISTORY_CAPACITY);
        let history = bench.history();
        // The five oldest samples were overwritten.
        assert_eq!(history[0].path, "/r5");
        assert_eq!(
            history[HISTORY_CAPACITY - 1].path,
            format!("/r{}", HISTORY_CAPACITY + 4)
        );
    }

    #[test]
    fn restart_overwrites_active_slot() {
        let mut bench = SpeedBench::new();
        bench.start(7, "/first");
        bench.start(7, "/second");
        bench.end(7);
        assert_eq!(bench.history()[0].path, "/second");
    }
}
