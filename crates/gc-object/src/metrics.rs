//! GC metrics and statistics.

use std::time::{Duration, Instant};

/// Statistics from the most recent garbage collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcMetrics {
    /// Duration of the last collection.
    pub duration: Duration,
    /// Duration of the clear phase.
    pub clear_duration: Duration,
    /// Duration of the mark phase (including finalization ordering).
    pub mark_duration: Duration,
    /// Duration of the sweep phase.
    pub sweep_duration: Duration,
    /// Number of blocks marked reachable.
    pub objects_marked: usize,
    /// Number of blocks reclaimed.
    pub objects_reclaimed: usize,
    /// Number of bytes reclaimed.
    pub bytes_reclaimed: usize,
    /// Number of blocks surviving.
    pub objects_surviving: usize,
    /// Number of bytes surviving.
    pub bytes_surviving: usize,
    /// Number of finalizer chains queued by this collection.
    pub finalizers_queued: usize,
    /// Total collections run by this collector, including this one.
    pub total_collections: usize,
}

/// Internal helper for capturing phase durations.
///
/// Collection times its three phases:
/// - Clear: reset mark bits
/// - Mark: trace reachable blocks and order finalization
/// - Sweep: reclaim unmarked blocks
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    /// Accumulated clear phase time.
    pub clear: Duration,
    /// Accumulated mark phase time.
    pub mark: Duration,
    /// Accumulated sweep phase time.
    pub sweep: Duration,
    /// Start time of current phase.
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            clear: Duration::ZERO,
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End the clear phase and record its duration.
    pub fn end_clear(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.clear = start.elapsed();
        }
    }

    /// End the mark phase and record its duration.
    pub fn end_mark(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.mark = start.elapsed();
        }
    }

    /// End the sweep phase and record its duration.
    pub fn end_sweep(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.sweep = start.elapsed();
        }
    }
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_timer_records_each_phase_once() {
        let mut timer = PhaseTimer::new();
        timer.end_clear();
        assert_eq!(timer.clear, Duration::ZERO);

        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_mark();
        assert!(timer.mark >= Duration::from_millis(1));

        // No phase running: nothing recorded.
        timer.end_sweep();
        assert_eq!(timer.sweep, Duration::ZERO);
    }

    #[test]
    fn test_metrics_default_is_zero() {
        let metrics = GcMetrics::default();
        assert_eq!(metrics.total_collections, 0);
        assert_eq!(metrics.duration, Duration::ZERO);
    }
}
