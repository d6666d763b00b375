//! GC tracing support.
//!
//! Compiled with the `tracing` feature. Provides structured spans and events
//! for garbage collection operations.

pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// High-level GC phases.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Reset mark bits.
        Clear,
        /// Trace the live block graph and order finalization.
        Mark,
        /// Reclaim unreachable blocks.
        Sweep,
        /// Run queued finalizer chains.
        Finalize,
    }

    /// Stable identifier for a GC run.
    ///
    /// Correlates all events within a single collection. Monotonically
    /// increasing, starting at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Global counter for generating unique GC IDs.
    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for the entire collection.
    pub fn trace_gc_collection(gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect", gc_id = gc_id.0).entered()
    }

    /// Create a span for a GC phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the start of a GC phase.
    pub fn log_phase_start(phase: GcPhase, bytes_before: usize) {
        tracing::debug!(phase = ?phase, bytes_before, "phase_start");
    }

    /// Log the end of a GC phase.
    pub fn log_phase_end(phase: GcPhase, bytes_reclaimed: usize) {
        tracing::debug!(phase = ?phase, bytes_reclaimed, "phase_end");
    }

    /// Log the end of the mark phase.
    pub fn log_phase_end_mark(phase: GcPhase, objects_marked: usize) {
        tracing::debug!(phase = ?phase, objects_marked, "phase_end");
    }
}
