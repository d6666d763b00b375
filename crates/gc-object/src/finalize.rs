//! Finalizer registration and dispatch.
//!
//! Every managed object gets a cleanup callback keyed to the *base address*
//! of the block that contains it, together with the object's displacement
//! from that base. Several objects that share one block (for example two
//! parts of a composite value that each need teardown) each register on the
//! same base; the registrations form a chain that runs newest first, the way
//! destructors of nested parts unwind.
//!
//! Per base address a finalizer moves through
//! `Unregistered -> Registered -> (SweepFired | ExplicitlyCleared) -> Unregistered`.
//! Both exits remove the entry, so a chain runs at most once per allocation.

use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;

use crate::collector::Collector;

/// A cleanup procedure: receives the block base and the registration's data
/// word (the displacement of the object for object finalizers).
pub type FinalizerProc = unsafe fn(base: NonNull<u8>, data: usize);

/// One registered cleanup, plus the registration it displaced.
pub struct Finalizer {
    proc_: FinalizerProc,
    data: usize,
    next: Option<Box<Finalizer>>,
}

impl Finalizer {
    /// A single-entry chain.
    #[must_use]
    pub const fn new(proc_: FinalizerProc, data: usize) -> Self {
        Self {
            proc_,
            data,
            next: None,
        }
    }

    /// Append `previous` so it runs after this entry.
    #[must_use]
    pub fn chained(mut self, previous: Option<Self>) -> Self {
        debug_assert!(self.next.is_none(), "chaining onto an already chained finalizer");
        self.next = previous.map(Box::new);
        self
    }

    /// Data word of the head entry.
    #[must_use]
    pub const fn data(&self) -> usize {
        self.data
    }

    /// Number of entries in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut len = 1;
        let mut next = self.next.as_deref();
        while let Some(entry) = next {
            len += 1;
            next = entry.next.as_deref();
        }
        len
    }

    /// A chain is never empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Run every entry, head first.
    ///
    /// # Safety
    ///
    /// `base` must be the block this chain was registered on, and the block
    /// must still hold the registered objects.
    unsafe fn run(self, base: NonNull<u8>) {
        let mut current = Some(self);
        while let Some(entry) = current {
            // SAFETY: forwarded from the caller.
            unsafe { (entry.proc_)(base, entry.data) };
            current = entry.next.map(|next| *next);
        }
    }
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finalizer")
            .field("data", &self.data)
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// Currently executing chain
// ============================================================================

thread_local! {
    /// Base address of the chain running on this thread (0 when none).
    static FINALIZING: Cell<usize> = const { Cell::new(0) };
}

/// Returns `true` while this thread is running a finalizer chain.
#[must_use]
pub fn is_finalizing() -> bool {
    FINALIZING.with(Cell::get) != 0
}

struct FinalizingGuard {
    previous: usize,
}

impl FinalizingGuard {
    fn enter(base: usize) -> Self {
        Self {
            previous: FINALIZING.with(|f| f.replace(base)),
        }
    }
}

impl Drop for FinalizingGuard {
    fn drop(&mut self) {
        FINALIZING.with(|f| f.set(self.previous));
    }
}

/// The callback installed with the collector.
///
/// Runs the head entry (`base + displacement` holds its object), then every
/// entry it displaced.
///
/// # Safety
///
/// `chain` must have been removed from the collector's table for `base`,
/// and the block must not have been released.
pub unsafe fn invoke_chain(base: NonNull<u8>, chain: Finalizer) {
    #[cfg(feature = "tracing")]
    tracing::trace!(base = base.as_ptr() as usize, entries = chain.len(), "finalizer_invoke");

    let _guard = FinalizingGuard::enter(base.as_ptr() as usize);
    // SAFETY: forwarded from the caller.
    unsafe { chain.run(base) };
}

/// Object finalizer: drops the `T` at `base + displacement`.
///
/// # Safety
///
/// A live `T` must sit at `base + displacement`.
unsafe fn drop_object<T>(base: NonNull<u8>, displacement: usize) {
    // SAFETY: registration recorded this displacement for a `T`.
    unsafe { std::ptr::drop_in_place(base.as_ptr().add(displacement).cast::<T>()) };
}

// ============================================================================
// Registry
// ============================================================================

/// Attaches and detaches finalizers on a collector.
pub struct Registry<'c, C: Collector> {
    collector: &'c C,
}

impl<C: Collector> Clone for Registry<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Collector> Copy for Registry<'_, C> {}

impl<'c, C: Collector> Registry<'c, C> {
    /// Create a registry view over `collector`.
    #[must_use]
    pub const fn new(collector: &'c C) -> Self {
        Self { collector }
    }

    /// Register the drop glue of the `T` at `object`.
    ///
    /// Returns `false` when `object` is not inside a collector-owned block
    /// (stack values, foreign memory); such objects are never finalized.
    ///
    /// # Safety
    ///
    /// `object` must point to a live `T` that nothing else will drop, and
    /// that stays at this address until the finalizer runs or is cleared.
    pub unsafe fn register_finalizer<T>(&self, object: NonNull<T>) -> bool {
        // SAFETY: forwarded from the caller.
        unsafe { self.register_finalizer_with(object.cast(), drop_object::<T>) }
    }

    /// Register `proc_` for the block containing `data`.
    ///
    /// `proc_` is called with the block base and the displacement of `data`
    /// from it. Any finalizer already registered on the block is kept and
    /// runs after `proc_`. Returns `false` for untracked pointers.
    ///
    /// # Safety
    ///
    /// `proc_` must be sound to call on this block once it is unreachable.
    pub unsafe fn register_finalizer_with(&self, data: NonNull<u8>, proc_: FinalizerProc) -> bool {
        let Some(base) = self.collector.base(data.as_ptr()) else {
            #[cfg(feature = "tracing")]
            tracing::trace!(addr = data.as_ptr() as usize, "finalizer_skip_untracked");
            return false;
        };

        let displacement = data.as_ptr() as usize - base.as_ptr() as usize;
        self.collector.update_finalizer(base, |previous| {
            Some(Finalizer::new(proc_, displacement).chained(previous))
        });

        #[cfg(feature = "tracing")]
        tracing::trace!(base = base.as_ptr() as usize, displacement, "finalizer_registered");
        true
    }

    /// Clear every finalizer on the block containing `object`.
    ///
    /// Ignored for untracked pointers and for the block whose chain is
    /// currently running on this thread. Returns `true` if anything was
    /// cleared.
    pub fn deregister_finalizer(&self, object: *const u8) -> bool {
        let Some(base) = self.collector.base(object) else {
            return false;
        };
        if FINALIZING.with(Cell::get) == base.as_ptr() as usize {
            return false;
        }

        let cleared = self.collector.clear_finalizer(base);
        #[cfg(feature = "tracing")]
        if cleared {
            tracing::trace!(base = base.as_ptr() as usize, "finalizer_cleared");
        }
        cleared
    }

    /// Number of finalizers chained on the block containing `object`.
    #[must_use]
    pub fn finalizer_count(&self, object: *const u8) -> usize {
        self.collector
            .base(object)
            .map_or(0, |base| self.collector.registered_finalizers(base))
    }
}
