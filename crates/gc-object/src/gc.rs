//! Mark-sweep collection over the block heap.
//!
//! A collection runs in three phases with the collector's state lock held:
//!
//! 1. **Clear**: reset every mark bit.
//! 2. **Mark**: mark everything reachable from the roots, then order
//!    finalization (see [`order_finalization`]). With stack scanning on,
//!    every other registered thread is parked while roots are traced.
//! 3. **Sweep**: release unmarked collectable blocks.
//!
//! Once tracing finishes, no mutator can reach an unmarked block, so the
//! world is resumed before finalization ordering and the sweep.
//!
//! Marking is conservative. Every aligned word inside a scanned block is a
//! potential pointer, and interior pointers keep their whole block alive.

use crate::collector::GcState;
use crate::finalize::Finalizer;
use crate::heap::{BlockKind, BlockRef, Heap, SweepStats};
use crate::metrics::PhaseTimer;
use crate::scan::scan_region_conservatively;
use crate::threads::{stop_the_world, StoppedWorld};

#[cfg(feature = "tracing")]
use crate::tracing::internal::{log_phase_end, log_phase_end_mark, log_phase_start, trace_phase, GcPhase};

/// Heap figures handed to the collect condition.
#[derive(Debug, Clone, Copy)]
pub struct CollectInfo {
    /// Bytes allocated since the last collection.
    bytes_since_gc: usize,
    /// Bytes currently held by live blocks.
    allocated_bytes: usize,
    /// Bytes mapped from the operating system.
    mapped_bytes: usize,
    /// Configured allocation threshold (0 = never collect automatically).
    collect_threshold: usize,
}

impl CollectInfo {
    pub(crate) const fn new(heap: &Heap, collect_threshold: usize) -> Self {
        Self {
            bytes_since_gc: heap.bytes_since_gc(),
            allocated_bytes: heap.allocated_bytes(),
            mapped_bytes: heap.mapped_bytes(),
            collect_threshold,
        }
    }

    /// Bytes allocated since the last collection.
    #[must_use]
    pub const fn bytes_since_gc(&self) -> usize {
        self.bytes_since_gc
    }

    /// Bytes currently held by live blocks.
    #[must_use]
    pub const fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Bytes mapped from the operating system.
    #[must_use]
    pub const fn mapped_bytes(&self) -> usize {
        self.mapped_bytes
    }

    /// Configured allocation threshold.
    #[must_use]
    pub const fn collect_threshold(&self) -> usize {
        self.collect_threshold
    }
}

/// Decides, before each allocation, whether to collect first.
pub type CollectCondition = fn(&CollectInfo) -> bool;

/// The default collection condition.
///
/// Collects once `collect_threshold` bytes have been allocated since the
/// previous collection. A threshold of 0 disables automatic collection.
#[must_use]
pub const fn default_collect_condition(info: &CollectInfo) -> bool {
    info.collect_threshold != 0 && info.bytes_since_gc >= info.collect_threshold
}

// ============================================================================
// Marking
// ============================================================================

/// Worklist-driven marker.
struct Marker<'h> {
    heap: &'h Heap,
    worklist: Vec<BlockRef>,
    objects_marked: usize,
}

impl<'h> Marker<'h> {
    const fn new(heap: &'h Heap) -> Self {
        Self {
            heap,
            worklist: Vec::new(),
            objects_marked: 0,
        }
    }

    /// Mark `block`; scanned blocks are queued for tracing.
    fn mark(&mut self, block: BlockRef) {
        mark_into(block, &mut self.worklist, &mut self.objects_marked);
    }

    /// Treat `word` as a potential pointer.
    fn mark_word(&mut self, word: usize) {
        if let Some(block) = self.heap.find_block(word) {
            self.mark(block);
        }
    }

    /// Mark every block referenced from inside `block`, ignoring pointers
    /// back into `block` itself.
    fn trace_children(&mut self, block: BlockRef) {
        let Self {
            heap,
            worklist,
            objects_marked,
        } = self;
        // SAFETY: `block` is a live block of `heap`, readable for its size.
        unsafe {
            scan_region_conservatively(block.base().as_ptr(), block.size(), |word| {
                if let Some(child) = heap.find_block(word) {
                    if child != block {
                        mark_into(child, worklist, objects_marked);
                    }
                }
            });
        }
    }

    fn drain(&mut self) {
        while let Some(block) = self.worklist.pop() {
            self.trace_children(block);
        }
    }
}

fn mark_into(block: BlockRef, worklist: &mut Vec<BlockRef>, objects_marked: &mut usize) {
    if block.set_mark() {
        *objects_marked += 1;
        if block.kind().is_scanned() {
            worklist.push(block);
        }
    }
}

// ============================================================================
// Collection
// ============================================================================

/// What a collection produced.
pub struct CollectOutcome {
    /// Chains of blocks that became unreachable, keyed by base address.
    /// Their blocks were kept alive by this collection.
    pub ready: Vec<(usize, Finalizer)>,
    /// Blocks marked reachable.
    pub objects_marked: usize,
    /// Sweep results.
    pub sweep: SweepStats,
    /// Phase durations.
    pub timer: PhaseTimer,
}

/// Run one full collection on `state`.
pub fn collect(state: &mut GcState, scan_stack: bool) -> CollectOutcome {
    let mut timer = PhaseTimer::new();
    #[cfg(feature = "tracing")]
    let before_bytes = state.heap.allocated_bytes();

    // Phase 1: Clear
    {
        #[cfg(feature = "tracing")]
        let _clear_span = trace_phase(GcPhase::Clear);
        #[cfg(feature = "tracing")]
        log_phase_start(GcPhase::Clear, before_bytes);

        timer.start();
        state.heap.clear_all_marks();
        timer.end_clear();

        #[cfg(feature = "tracing")]
        log_phase_end(GcPhase::Clear, 0);
    }

    // Phase 2: Mark
    let (ready_bases, objects_marked) = {
        #[cfg(feature = "tracing")]
        let _mark_span = trace_phase(GcPhase::Mark);
        #[cfg(feature = "tracing")]
        log_phase_start(GcPhase::Mark, before_bytes);

        timer.start();
        let mut marker = Marker::new(&state.heap);
        let uncollectable = state.heap.blocks_of_kind(BlockKind::Uncollectable);
        marker.worklist.reserve(uncollectable.len() + state.roots.objects().count());
        let world = scan_stack.then(stop_the_world);
        mark_roots(&mut marker, state, &uncollectable, world.as_ref());
        marker.drain();
        let stopped_threads = world.as_ref().map_or(0, StoppedWorld::stopped_threads);
        drop(world);
        let ready = order_finalization(&mut marker, state.finalizers.keys().copied());
        timer.end_mark();

        #[cfg(feature = "tracing")]
        {
            tracing::debug!(stopped_threads, "world_resumed");
            log_phase_end_mark(GcPhase::Mark, marker.objects_marked);
        }
        #[cfg(not(feature = "tracing"))]
        let _ = stopped_threads;

        (ready, marker.objects_marked)
    };

    let ready = ready_bases
        .into_iter()
        .filter_map(|base| state.finalizers.remove(&base).map(|chain| (base, chain)))
        .collect();

    // Phase 3: Sweep
    let sweep = {
        #[cfg(feature = "tracing")]
        let _sweep_span = trace_phase(GcPhase::Sweep);
        #[cfg(feature = "tracing")]
        log_phase_start(GcPhase::Sweep, before_bytes);

        timer.start();
        let sweep = state.heap.sweep();
        state.heap.reset_bytes_since_gc();
        timer.end_sweep();

        #[cfg(feature = "tracing")]
        log_phase_end(GcPhase::Sweep, sweep.bytes_reclaimed);

        sweep
    };

    CollectOutcome {
        ready,
        objects_marked,
        sweep,
        timer,
    }
}

/// Mark from every root: uncollectable blocks, rooted objects, root
/// regions, blocks whose finalizers are queued or running, and, when the
/// world is stopped, the calling thread's stack plus every parked stack.
///
/// Runs while other threads may be parked: no logging, no locks, and as
/// little allocation as possible.
fn mark_roots(
    marker: &mut Marker<'_>,
    state: &GcState,
    uncollectable: &[BlockRef],
    world: Option<&StoppedWorld>,
) {
    for &block in uncollectable {
        marker.mark(block);
    }

    for addr in state.roots.objects() {
        marker.mark_word(addr);
    }

    for &(start, len) in state.roots.regions() {
        // SAFETY: `add_roots` requires regions to stay readable while
        // registered.
        unsafe {
            scan_region_conservatively(start as *const u8, len, |word| marker.mark_word(word));
        }
    }

    for &base in state.pending.keys().chain(state.running.iter()) {
        marker.mark_word(base);
    }

    if let Some(world) = world {
        crate::stack::spill_registers_and_scan(|word| marker.mark_word(word));
        world.scan_stacks(|word| marker.mark_word(word));
    }
}

/// Decide which unreachable finalizable blocks are ready.
///
/// Every unmarked candidate has its children marked (pointers to itself
/// are ignored). A candidate that gets marked this way is reachable from
/// another finalizable block and keeps its registration until that block
/// is gone; cycles of finalizable blocks therefore never become ready.
/// The remaining candidates are ready. They are marked so the sweep keeps
/// them until their chains have run.
fn order_finalization(marker: &mut Marker<'_>, registered: impl Iterator<Item = usize>) -> Vec<usize> {
    let candidates: Vec<BlockRef> = registered
        .filter_map(|base| marker.heap.find_block(base))
        .filter(|block| !block.is_marked())
        .collect();

    for &block in &candidates {
        if !block.is_marked() && block.kind().is_scanned() {
            marker.trace_children(block);
            marker.drain();
        }
    }

    let ready: Vec<BlockRef> = candidates.into_iter().filter(|block| !block.is_marked()).collect();
    for &block in &ready {
        marker.mark(block);
    }
    marker.drain();

    ready
        .into_iter()
        .map(|block| block.base().as_ptr() as usize)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    unsafe fn noop(_base: NonNull<u8>, _data: usize) {}

    fn alloc(state: &mut GcState, kind: BlockKind) -> NonNull<u8> {
        state.heap.alloc(64, kind).unwrap()
    }

    unsafe fn link(from: NonNull<u8>, slot: usize, to: NonNull<u8>) {
        unsafe { from.as_ptr().cast::<usize>().add(slot).write(to.as_ptr() as usize) };
    }

    fn register(state: &mut GcState, base: NonNull<u8>) {
        state
            .finalizers
            .insert(base.as_ptr() as usize, Finalizer::new(noop, 0));
    }

    fn ready_bases(outcome: &CollectOutcome) -> Vec<usize> {
        let mut bases: Vec<_> = outcome.ready.iter().map(|(base, _)| *base).collect();
        bases.sort_unstable();
        bases
    }

    #[test]
    fn test_default_condition() {
        let heap = Heap::new(0);
        assert!(!default_collect_condition(&CollectInfo::new(&heap, 0)));
        assert!(!default_collect_condition(&CollectInfo::new(&heap, 64)));

        let mut heap = Heap::new(0);
        heap.alloc(64, BlockKind::Normal).unwrap();
        assert!(default_collect_condition(&CollectInfo::new(&heap, 64)));
    }

    #[test]
    fn test_unrooted_blocks_are_reclaimed() {
        let mut state = GcState::new(0);
        let a = alloc(&mut state, BlockKind::Normal);
        let outcome = collect(&mut state, false);
        assert_eq!(outcome.sweep.objects_reclaimed, 1);
        assert!(state.heap.find_base(a.as_ptr() as usize).is_none());
    }

    #[test]
    fn test_uncollectable_blocks_keep_children_alive() {
        let mut state = GcState::new(0);
        let holder = alloc(&mut state, BlockKind::Uncollectable);
        let child = alloc(&mut state, BlockKind::Normal);
        unsafe { link(holder, 0, child) };

        collect(&mut state, false);
        assert!(state.heap.find_base(child.as_ptr() as usize).is_some());
        assert!(state.heap.find_base(holder.as_ptr() as usize).is_some());
    }

    #[test]
    fn test_pointer_free_blocks_are_not_scanned() {
        let mut state = GcState::new(0);
        let opaque = alloc(&mut state, BlockKind::PointerFree);
        let target = alloc(&mut state, BlockKind::Normal);
        unsafe { link(opaque, 0, target) };
        state.roots.add_object(opaque.as_ptr() as usize);

        collect(&mut state, false);
        assert!(state.heap.find_base(opaque.as_ptr() as usize).is_some());
        assert!(state.heap.find_base(target.as_ptr() as usize).is_none());
    }

    #[test]
    fn test_interior_root_keeps_block() {
        let mut state = GcState::new(0);
        let a = alloc(&mut state, BlockKind::Normal);
        state.roots.add_object(a.as_ptr() as usize + 40);
        collect(&mut state, false);
        assert!(state.heap.find_base(a.as_ptr() as usize).is_some());
    }

    #[test]
    fn test_unreachable_finalizable_block_survives_one_cycle() {
        let mut state = GcState::new(0);
        let a = alloc(&mut state, BlockKind::Normal);
        register(&mut state, a);

        let outcome = collect(&mut state, false);
        assert_eq!(ready_bases(&outcome), vec![a.as_ptr() as usize]);
        assert!(state.finalizers.is_empty());
        assert!(state.heap.find_base(a.as_ptr() as usize).is_some());

        // No longer finalizable: reclaimed on the next cycle.
        let outcome = collect(&mut state, false);
        assert!(outcome.ready.is_empty());
        assert!(state.heap.find_base(a.as_ptr() as usize).is_none());
    }

    #[test]
    fn test_finalization_is_ordered() {
        let mut state = GcState::new(0);
        let outer = alloc(&mut state, BlockKind::Normal);
        let inner = alloc(&mut state, BlockKind::Normal);
        unsafe {
            link(outer, 0, inner);
            link(outer, 1, outer);
        }
        register(&mut state, outer);
        register(&mut state, inner);

        let outcome = collect(&mut state, false);
        assert_eq!(ready_bases(&outcome), vec![outer.as_ptr() as usize]);
        assert!(state.finalizers.contains_key(&(inner.as_ptr() as usize)));
    }

    #[test]
    fn test_finalizable_cycles_are_never_ready() {
        let mut state = GcState::new(0);
        let a = alloc(&mut state, BlockKind::Normal);
        let b = alloc(&mut state, BlockKind::Normal);
        unsafe {
            link(a, 0, b);
            link(b, 0, a);
        }
        register(&mut state, a);
        register(&mut state, b);

        let outcome = collect(&mut state, false);
        assert!(outcome.ready.is_empty());
        assert_eq!(state.finalizers.len(), 2);
    }

    #[test]
    fn test_pending_blocks_are_roots() {
        let mut state = GcState::new(0);
        let b = alloc(&mut state, BlockKind::Normal);
        state.pending.insert(b.as_ptr() as usize, Finalizer::new(noop, 0));
        collect(&mut state, false);
        assert!(state.heap.find_base(b.as_ptr() as usize).is_some());
    }
}
