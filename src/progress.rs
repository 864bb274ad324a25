//! Byte progress shared by the concurrent downloads of a round.

use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct ProgressState {
    consumed: HashMap<String, u64>,
    advanced: u64,
}

/// Tracks cumulative bytes per object key and advances one progress bar.
///
/// Transports report the cumulative byte count of an object; the tracker
/// turns that into deltas so the bar moves exactly once per byte no matter
/// how the reports of different objects interleave.
#[derive(Debug)]
pub struct ProgressTracker {
    state: Mutex<ProgressState>,
    bar: ProgressBar,
}

impl ProgressTracker {
    /// Creates a tracker expecting `total_bytes`, drawing a bar when `visible`.
    pub fn new(total_bytes: u64, visible: bool) -> Self {
        let bar = if visible {
            let bar = ProgressBar::new(total_bytes);
            let style = ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}")
                .map(|style| style.progress_chars("█▓▒░ "))
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar
        } else {
            ProgressBar::hidden()
        };
        Self::with_bar(bar)
    }

    /// Creates a tracker that never draws.
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            state: Mutex::new(ProgressState::default()),
            bar,
        }
    }

    /// Records that `consumed` bytes of `key` have been transferred so far.
    ///
    /// Reports below the last recorded value for the key are ignored.
    pub fn record(&self, key: &str, consumed: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let last = state.consumed.get(key).copied().unwrap_or(0);
        if consumed <= last {
            if !state.consumed.contains_key(key) {
                state.consumed.insert(key.to_string(), 0);
            }
            return;
        }
        let delta = consumed - last;
        state.consumed.insert(key.to_string(), consumed);
        state.advanced += delta;
        self.bar.inc(delta);
    }

    /// Last cumulative value recorded for `key`.
    pub fn consumed(&self, key: &str) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consumed.get(key).copied().unwrap_or(0)
    }

    /// Total bytes the bar has been advanced by.
    pub fn advanced(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).advanced
    }

    /// Sets the message shown next to the bar.
    pub fn set_message(&self, message: String) {
        self.bar.set_message(message);
    }

    /// Stops drawing and leaves `message` on screen.
    pub fn finish(&self, message: String) {
        self.bar.finish_with_message(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_deltas_are_counted_once() {
        let tracker = ProgressTracker::hidden();
        tracker.record("a", 10);
        tracker.record("a", 25);
        tracker.record("b", 5);
        tracker.record("a", 25);
        assert_eq!(tracker.consumed("a"), 25);
        assert_eq!(tracker.consumed("b"), 5);
        assert_eq!(tracker.advanced(), 30);
    }

    #[test]
    fn test_regressing_report_is_ignored() {
        let tracker = ProgressTracker::hidden();
        tracker.record("a", 100);
        tracker.record("a", 40);
        assert_eq!(tracker.consumed("a"), 100);
        assert_eq!(tracker.advanced(), 100);
        tracker.record("a", 120);
        assert_eq!(tracker.advanced(), 120);
    }

    #[test]
    fn test_concurrent_reports_lose_nothing() {
        let tracker = Arc::new(ProgressTracker::hidden());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    let key = format!("object-{}", i);
                    for step in 1..=1000u64 {
                        tracker.record(&key, step * 3);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.advanced(), 8 * 3000);
    }
}
