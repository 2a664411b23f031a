//! Progress reporting utilities

use std::time::{Duration, Instant};

/// Progress reporter that emits `tracing` events at a fixed step interval
pub struct ProgressReporter {
    total: usize,
    current: usize,
    name: String,
    start_time: Instant,
    every: usize,
    silent: bool,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new(name: impl Into<String>, total: usize) -> Self {
        Self {
            total,
            current: 0,
            name: name.into(),
            start_time: Instant::now(),
            every: 1,
            silent: false,
        }
    }

    /// Create a silent reporter
    pub fn silent(name: impl Into<String>, total: usize) -> Self {
        Self {
            silent: true,
            ..Self::new(name, total)
        }
    }

    /// Only report every `every` increments (and on completion)
    pub fn with_interval(mut self, every: usize) -> Self {
        self.every = every.max(1);
        self
    }

    /// Increment progress
    pub fn inc(&mut self, delta: usize) {
        self.current += delta;
        if self.current % self.every == 0 || self.current >= self.total {
            self.report();
        }
    }

    /// Set current progress
    pub fn set(&mut self, current: usize) {
        self.current = current;
        self.report();
    }

    /// Current position
    pub fn position(&self) -> usize {
        self.current
    }

    /// Estimated time remaining based on the average time per item so far
    pub fn eta(&self) -> Duration {
        if self.current == 0 {
            return Duration::ZERO;
        }
        let per_item = self.start_time.elapsed().as_secs_f64() / self.current as f64;
        let remaining = self.total.saturating_sub(self.current);
        Duration::from_secs_f64(per_item * remaining as f64)
    }

    fn report(&self) {
        if self.silent {
            return;
        }

        let percent = if self.total > 0 {
            (self.current as f64 / self.total as f64 * 100.0) as u32
        } else {
            0
        };

        tracing::info!(
            "{}: {}/{} ({}%) ETA: {:.1}s",
            self.name,
            self.current,
            self.total,
            percent,
            self.eta().as_secs_f64()
        );
    }

    /// Finish the progress report
    pub fn finish(mut self) {
        self.current = self.total;
        self.report();
    }
}
