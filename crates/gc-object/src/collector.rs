//! The collector capability and its mark-sweep implementation.

use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::config::GcConfig;
use crate::error::AllocFailure;
use crate::finalize::{invoke_chain, is_finalizing, Finalizer};
use crate::gc::{self, default_collect_condition, CollectCondition, CollectInfo};
use crate::heap::{BlockKind, BlockRef, Heap};
use crate::metrics::GcMetrics;
use crate::roots::RootSet;
use crate::threads::register_current_thread;

#[cfg(feature = "tracing")]
use crate::tracing::internal::{next_gc_id, trace_gc_collection, trace_phase, GcPhase};

/// What the allocator needs from a garbage collector.
///
/// # Safety
///
/// Implementations must return blocks that stay valid until they are freed
/// or found unreachable, and [`base`](Self::base) must only resolve
/// addresses inside such live blocks.
pub unsafe trait Collector: Send + Sync {
    /// One-time initialization. Called exactly once, before the first
    /// allocation.
    fn init(&self);

    /// Allocate a zeroed block of at least `size` bytes.
    fn malloc(&self, size: usize, kind: BlockKind) -> Result<NonNull<u8>, AllocFailure>;

    /// Start of the live block containing `ptr`, or `None` if `ptr` is not
    /// inside a block this collector owns.
    fn base(&self, ptr: *const u8) -> Option<NonNull<u8>>;

    /// Usable size of the live block containing `ptr`.
    fn block_size(&self, ptr: *const u8) -> Option<usize>;

    /// Kind of the live block containing `ptr`.
    fn block_kind(&self, ptr: *const u8) -> Option<BlockKind>;

    /// Replace the finalizer registered on `base` with `f(previous)`, in a
    /// single critical section.
    fn update_finalizer<F>(&self, base: NonNull<u8>, f: F)
    where
        F: FnOnce(Option<Finalizer>) -> Option<Finalizer>;

    /// Drop whatever finalizer is registered or queued for `base`.
    /// Returns `true` if there was one.
    fn clear_finalizer(&self, base: NonNull<u8>) -> bool;

    /// Number of finalizers chained on `base`.
    fn registered_finalizers(&self, base: NonNull<u8>) -> usize;

    /// Release a block now. Any finalizer on it is discarded unrun.
    ///
    /// # Safety
    ///
    /// `base` must be the exact start of a live block, and nothing may use
    /// the block afterwards.
    unsafe fn free(&self, base: NonNull<u8>);

    /// Treat `ptr` as a root until a matching [`remove_root`](Self::remove_root).
    fn add_root(&self, ptr: *const u8);

    /// Undo one [`add_root`](Self::add_root).
    fn remove_root(&self, ptr: *const u8);

    /// Run a full collection.
    fn collect(&self);
}

/// Everything guarded by the collector lock.
pub struct GcState {
    pub(crate) heap: Heap,
    /// Registered chains, keyed by block base.
    pub(crate) finalizers: HashMap<usize, Finalizer>,
    /// Chains of unreachable blocks waiting in the ready queue.
    pub(crate) pending: HashMap<usize, Finalizer>,
    /// Bases whose chains are running right now.
    pub(crate) running: HashSet<usize>,
    pub(crate) roots: RootSet,
    collect_condition: CollectCondition,
}

impl GcState {
    pub(crate) fn new(max_heap_size: usize) -> Self {
        Self {
            heap: Heap::new(max_heap_size),
            finalizers: HashMap::new(),
            pending: HashMap::new(),
            running: HashSet::new(),
            roots: RootSet::default(),
            collect_condition: default_collect_condition,
        }
    }
}

/// Conservative, non-moving mark-sweep collector.
///
/// Thread-aware: with [`scan_stack`](GcConfig::scan_stack) on, a collection
/// parks every other registered thread and scans its stack and registers.
/// Threads register on their first allocation, root or collection, or
/// through [`register_current_thread`](crate::register_current_thread).
///
/// Unreachable blocks with finalizers are kept for one more cycle; their
/// chains go to a ready queue and run with no lock held, either right
/// after the collection or, with
/// [`finalize_on_demand`](GcConfig::finalize_on_demand), when
/// [`invoke_finalizers`](Self::invoke_finalizers) is called.
pub struct MarkSweep {
    config: GcConfig,
    state: Mutex<GcState>,
    ready: SegQueue<usize>,
    metrics: Mutex<GcMetrics>,
    init_calls: AtomicUsize,
    initialized: AtomicBool,
    collections: AtomicUsize,
}

impl MarkSweep {
    /// Create a collector with its own heap.
    #[must_use]
    pub fn new(config: GcConfig) -> Self {
        Self {
            state: Mutex::new(GcState::new(config.max_heap_size)),
            config,
            ready: SegQueue::new(),
            metrics: Mutex::new(GcMetrics::default()),
            init_calls: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
            collections: AtomicUsize::new(0),
        }
    }

    /// The configuration this collector was built with.
    #[must_use]
    pub const fn config(&self) -> &GcConfig {
        &self.config
    }

    /// How many times [`Collector::init`] ran.
    #[must_use]
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::Acquire)
    }

    /// Number of collections run so far.
    #[must_use]
    pub fn collections(&self) -> usize {
        self.collections.load(Ordering::Acquire)
    }

    /// Statistics from the most recent collection.
    #[must_use]
    pub fn last_metrics(&self) -> GcMetrics {
        *self.metrics.lock()
    }

    /// Bytes held by live blocks.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.state.lock().heap.allocated_bytes()
    }

    /// Bytes mapped from the operating system.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.state.lock().heap.mapped_bytes()
    }

    /// Replace the automatic collection condition.
    pub fn set_collect_condition(&self, condition: CollectCondition) {
        self.state.lock().collect_condition = condition;
    }

    /// Scan `len` bytes at `start` on every collection.
    ///
    /// # Safety
    ///
    /// The region must stay readable until [`remove_roots`](Self::remove_roots)
    /// is called with the same `start`.
    pub unsafe fn add_roots(&self, start: *const u8, len: usize) {
        self.state.lock().roots.add_region(start as usize, len);
    }

    /// Stop scanning the region(s) starting at `start`.
    pub fn remove_roots(&self, start: *const u8) {
        self.state.lock().roots.remove_region(start as usize);
    }

    /// Whether finalizer chains are waiting to run.
    #[must_use]
    pub fn should_invoke_finalizers(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Run every queued finalizer chain. Returns how many chains ran.
    ///
    /// Chains cleared after they were queued are skipped.
    pub fn invoke_finalizers(&self) -> usize {
        #[cfg(feature = "tracing")]
        let _span = trace_phase(GcPhase::Finalize);

        let mut invoked = 0;
        while let Some(base) = self.ready.pop() {
            let chain = {
                let mut state = self.state.lock();
                let Some(chain) = state.pending.remove(&base) else {
                    continue;
                };
                state.running.insert(base);
                chain
            };

            // SAFETY: pending and running blocks are marked by every
            // collection, so the block is still live.
            unsafe { invoke_chain(NonNull::new_unchecked(base as *mut u8), chain) };

            self.state.lock().running.remove(&base);
            invoked += 1;
        }

        #[cfg(feature = "tracing")]
        if invoked > 0 {
            tracing::debug!(invoked, "finalizers_invoked");
        }
        invoked
    }

    fn maybe_collect(&self) {
        if is_finalizing() {
            return;
        }
        let should_collect = {
            let state = self.state.lock();
            let info = CollectInfo::new(&state.heap, self.config.collect_threshold);
            (state.collect_condition)(&info)
        };
        if should_collect {
            self.collect();
        }
    }
}

impl Default for MarkSweep {
    fn default() -> Self {
        Self::new(GcConfig::default())
    }
}

// SAFETY: blocks come from `Heap`, which only releases them on `free` or
// when a sweep finds them unmarked; `base` resolves through its page table.
unsafe impl Collector for MarkSweep {
    fn init(&self) {
        self.init_calls.fetch_add(1, Ordering::AcqRel);
        self.initialized.store(true, Ordering::Release);

        #[cfg(feature = "tracing")]
        if self.config.scan_stack && crate::stack::get_stack_bounds().is_none() {
            tracing::warn!("stack bounds unavailable on this platform; stack scanning covers registers only");
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            scan_stack = self.config.scan_stack,
            collect_threshold = self.config.collect_threshold,
            max_heap_size = self.config.max_heap_size,
            "collector_init"
        );
    }

    fn malloc(&self, size: usize, kind: BlockKind) -> Result<NonNull<u8>, AllocFailure> {
        debug_assert!(
            self.initialized.load(Ordering::Acquire),
            "allocation before collector init"
        );
        register_current_thread();
        self.maybe_collect();
        self.state.lock().heap.alloc(size, kind)
    }

    fn base(&self, ptr: *const u8) -> Option<NonNull<u8>> {
        self.state.lock().heap.find_base(ptr as usize)
    }

    fn block_size(&self, ptr: *const u8) -> Option<usize> {
        self.state.lock().heap.find_block(ptr as usize).map(BlockRef::size)
    }

    fn block_kind(&self, ptr: *const u8) -> Option<BlockKind> {
        self.state.lock().heap.find_block(ptr as usize).map(BlockRef::kind)
    }

    fn update_finalizer<F>(&self, base: NonNull<u8>, f: F)
    where
        F: FnOnce(Option<Finalizer>) -> Option<Finalizer>,
    {
        let key = base.as_ptr() as usize;
        let mut state = self.state.lock();
        let previous = state.finalizers.remove(&key);
        if let Some(next) = f(previous) {
            state.finalizers.insert(key, next);
        }
    }

    fn clear_finalizer(&self, base: NonNull<u8>) -> bool {
        let key = base.as_ptr() as usize;
        let mut state = self.state.lock();
        let registered = state.finalizers.remove(&key).is_some();
        let queued = state.pending.remove(&key).is_some();
        registered || queued
    }

    fn registered_finalizers(&self, base: NonNull<u8>) -> usize {
        let key = base.as_ptr() as usize;
        let state = self.state.lock();
        state
            .finalizers
            .get(&key)
            .or_else(|| state.pending.get(&key))
            .map_or(0, Finalizer::len)
    }

    unsafe fn free(&self, base: NonNull<u8>) {
        let key = base.as_ptr() as usize;
        let mut state = self.state.lock();
        state.finalizers.remove(&key);
        state.pending.remove(&key);
        let released = state.heap.free(base);
        debug_assert!(released.is_some(), "free of {key:#x}, which is not a live block base");
    }

    fn add_root(&self, ptr: *const u8) {
        register_current_thread();
        self.state.lock().roots.add_object(ptr as usize);
    }

    fn remove_root(&self, ptr: *const u8) {
        self.state.lock().roots.remove_object(ptr as usize);
    }

    fn collect(&self) {
        #[cfg(feature = "tracing")]
        let _gc_span = trace_gc_collection(next_gc_id());

        register_current_thread();
        let start = Instant::now();
        let queued = {
            let mut state = self.state.lock();
            let outcome = gc::collect(&mut state, self.config.scan_stack);

            let queued = outcome.ready.len();
            for (base, chain) in outcome.ready {
                state.pending.insert(base, chain);
                self.ready.push(base);
            }

            let total_collections = self.collections.fetch_add(1, Ordering::AcqRel) + 1;
            *self.metrics.lock() = GcMetrics {
                duration: start.elapsed(),
                clear_duration: outcome.timer.clear,
                mark_duration: outcome.timer.mark,
                sweep_duration: outcome.timer.sweep,
                objects_marked: outcome.objects_marked,
                objects_reclaimed: outcome.sweep.objects_reclaimed,
                bytes_reclaimed: outcome.sweep.bytes_reclaimed,
                objects_surviving: outcome.sweep.objects_surviving,
                bytes_surviving: outcome.sweep.bytes_surviving,
                finalizers_queued: queued,
                total_collections,
            };
            queued
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(queued, "collection_finished");

        if !self.config.finalize_on_demand && queued > 0 {
            self.invoke_finalizers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> MarkSweep {
        let config = GcConfig::builder()
            .scan_stack(false)
            .collect_threshold(0)
            .build_unchecked();
        let collector = MarkSweep::new(config);
        collector.init();
        collector
    }

    unsafe fn noop(_base: NonNull<u8>, _data: usize) {}

    #[test]
    fn test_base_resolves_interior_pointers() {
        let gc = collector();
        let block = gc.malloc(100, BlockKind::Normal).unwrap();
        let inner = unsafe { block.as_ptr().add(50) };
        assert_eq!(gc.base(inner), Some(block));
        assert_eq!(gc.block_size(inner), Some(128));
        assert_eq!(gc.block_kind(inner), Some(BlockKind::Normal));

        let local = 0u64;
        assert_eq!(gc.base(std::ptr::addr_of!(local).cast()), None);
    }

    #[test]
    fn test_free_discards_finalizer() {
        let gc = collector();
        let block = gc.malloc(32, BlockKind::Normal).unwrap();
        gc.update_finalizer(block, |_| Some(Finalizer::new(noop, 0)));
        assert_eq!(gc.registered_finalizers(block), 1);

        unsafe { gc.free(block) };
        assert_eq!(gc.base(block.as_ptr()), None);
        gc.collect();
        assert_eq!(gc.last_metrics().finalizers_queued, 0);
    }

    #[test]
    fn test_clear_cancels_queued_chain() {
        let config = GcConfig::builder()
            .scan_stack(false)
            .collect_threshold(0)
            .finalize_on_demand(true)
            .build_unchecked();
        let gc = MarkSweep::new(config);
        gc.init();

        let block = gc.malloc(32, BlockKind::Normal).unwrap();
        gc.update_finalizer(block, |_| Some(Finalizer::new(noop, 0)));
        gc.collect();
        assert!(gc.should_invoke_finalizers());
        assert_eq!(gc.registered_finalizers(block), 1);

        assert!(gc.clear_finalizer(block));
        assert_eq!(gc.invoke_finalizers(), 0);
        assert!(!gc.should_invoke_finalizers());
    }

    #[test]
    fn test_automatic_collection_uses_condition() {
        fn always(_: &CollectInfo) -> bool {
            true
        }

        let gc = collector();
        gc.malloc(32, BlockKind::Normal).unwrap();
        assert_eq!(gc.collections(), 0);

        gc.set_collect_condition(always);
        gc.malloc(32, BlockKind::Normal).unwrap();
        assert_eq!(gc.collections(), 1);
        assert_eq!(gc.last_metrics().total_collections, 1);
    }

    #[test]
    fn test_root_regions() {
        let gc = collector();
        let block = gc.malloc(32, BlockKind::Normal).unwrap();
        let slots = [block.as_ptr() as usize];

        unsafe { gc.add_roots(slots.as_ptr().cast(), std::mem::size_of_val(&slots)) };
        gc.collect();
        assert_eq!(gc.base(block.as_ptr()), Some(block));

        gc.remove_roots(slots.as_ptr().cast());
        gc.collect();
        assert_eq!(gc.base(block.as_ptr()), None);
    }
}
