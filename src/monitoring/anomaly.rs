/*!
 * Anomaly Detection
 * Heap growth over a sliding time window
 *
 * Strategy: keep the (time, heap) readings that fall inside the window and
 * compare each new reading against the window minimum. Steady high usage
 * is not an anomaly; rapid climbing is.
 */

use std::collections::VecDeque;
use std::time::Duration;

/// Growth that crossed the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowthAnomaly {
    pub grown_bytes: u64,
    pub from_bytes: u64,
    pub to_bytes: u64,
    pub over: Duration,
}

/// Sliding-window heap growth detector
#[derive(Debug, Clone)]
pub struct GrowthDetector {
    threshold_bytes: u64,
    window: Duration,
    readings: VecDeque<(Duration, u64)>,
}

impl GrowthDetector {
    pub fn new(threshold_bytes: u64, window: Duration) -> Self {
        Self {
            threshold_bytes,
            window,
            readings: VecDeque::new(),
        }
    }

    /// Feed a reading taken `at` since the execution started
    ///
    /// Readings must arrive in time order.
    pub fn observe(&mut self, at: Duration, heap_bytes: u64) -> Option<GrowthAnomaly> {
        while let Some(&(oldest, _)) = self.readings.front() {
            if at.saturating_sub(oldest) > self.window {
                self.readings.pop_front();
            } else {
                break;
            }
        }
        self.readings.push_back((at, heap_bytes));

        let &(since, low) = self.readings.iter().min_by_key(|(_, bytes)| *bytes)?;
        let grown = heap_bytes.saturating_sub(low);
        if grown > self.threshold_bytes {
            Some(GrowthAnomaly {
                grown_bytes: grown,
                from_bytes: low,
                to_bytes: heap_bytes,
                over: at.saturating_sub(since),
            })
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.readings.clear();
    }
}
