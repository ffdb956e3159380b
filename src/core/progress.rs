//! Normalizes heterogeneous progress notifications into one percentage.
//!
//! Engines report at different granularities: document counts, item position
//! ("collection 2 of 5"), both, or neither while preparing. The aggregator picks
//! the most precise figure available and never lets the displayed value move
//! backwards within one run, whatever order notifications arrive in.

use super::transfer_engine::ProgressEvent;

#[derive(Debug, Clone, Default)]
pub struct ProgressAggregator {
    percent: u8,
    current_item: Option<String>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start of a new run. Retries start from zero again.
    pub fn reset(&mut self) {
        self.percent = 0;
        self.current_item = None;
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn current_item(&self) -> Option<&str> {
        self.current_item.as_deref()
    }

    /// Fold a notification in and return the percentage to display.
    pub fn apply(&mut self, event: &ProgressEvent) -> u8 {
        let candidate = candidate_percent(event).unwrap_or(self.percent);
        self.percent = self.percent.max(candidate);

        if let Some(name) = event.item_name.as_deref().filter(|n| !n.is_empty()) {
            self.current_item = Some(name.to_string());
        }

        self.percent
    }
}

/// First applicable rule wins: document counts, then item position.
fn candidate_percent(event: &ProgressEvent) -> Option<u8> {
    let processed = event.processed.unwrap_or(0);
    let total = event.total.unwrap_or(0);
    if processed > 0 && total > 0 {
        return Some(ratio_percent(processed, total));
    }

    let index = event.item_index.unwrap_or(0);
    let item_total = event.item_total.unwrap_or(0);
    if index > 0 && item_total > 0 {
        // The item in progress is not complete yet.
        return Some(ratio_percent(u64::from(index - 1), u64::from(item_total)));
    }

    None
}

fn ratio_percent(done: u64, total: u64) -> u8 {
    let pct = (done as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}
