//! Rolling throughput samples for remaining-time estimates.
//!
//! Samples are `(instant, cumulative processed count)` pairs. Only samples inside
//! the retention window take part in the rate, so a slowdown or speedup shows up
//! within a few seconds instead of being averaged over the whole job.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub at: Instant,
    pub processed: u64,
}

#[derive(Debug, Clone)]
pub struct SampleStore {
    samples: VecDeque<ProgressSample>,
    window: Duration,
    max_samples: usize,
}

impl SampleStore {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            max_samples: max_samples.max(2),
        }
    }

    pub fn record(&mut self, processed: u64) {
        self.record_at(Instant::now(), processed);
    }

    pub fn record_at(&mut self, at: Instant, processed: u64) {
        self.samples.push_back(ProgressSample { at, processed });
        self.trim(at);
    }

    /// Drop everything. Called before every attempt, never mid-transfer.
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Units per second across the retained window, if it is positive.
    pub fn throughput(&self) -> Option<f64> {
        let first = self.samples.front()?;
        let last = self.samples.back()?;
        if self.samples.len() < 2 {
            return None;
        }

        let elapsed = last.at.saturating_duration_since(first.at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }

        let rate = (last.processed as f64 - first.processed as f64) / elapsed;
        (rate > 0.0).then_some(rate)
    }

    /// Time left at the windowed rate. `None` until there is a rate or a total.
    pub fn estimate(&self, processed: u64, total: u64) -> Option<Duration> {
        if total == 0 || processed >= total {
            return None;
        }
        let rate = self.throughput()?;
        let secs = ((total - processed) as f64 / rate).ceil();
        Some(Duration::from_secs(secs as u64))
    }

    fn trim(&mut self, now: Instant) {
        // Keep one sample at or before the cutoff so the window always spans it.
        while self.samples.len() > 2 {
            let second = self.samples[1].at;
            if now.saturating_duration_since(second) >= self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }
}

/// Render a remaining-time estimate at human scale.
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    }
}
