//! Strategy-tagged allocation entry points.
//!
//! [`Allocator`] is the single point of contact with a [`Collector`]. It
//! initializes the collector lazily, exactly once, on the first allocation
//! from any thread, and maps each [`Strategy`] onto a block kind.

use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{LazyLock, Once};

use crate::collector::{Collector, MarkSweep};
use crate::config::GcConfig;
use crate::error::{AllocError, AllocFailure};
use crate::finalize::Registry;
use crate::heap::{BlockKind, LARGE_OBJECT_OFFSET};
use crate::object::Obj;
use crate::roots::Root;

/// How a block is managed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Reclaimed automatically once unreachable. Contents are scanned.
    #[default]
    Collected,
    /// Reclaimed automatically, but the contents are never scanned for
    /// pointers. For payloads made of plain numbers or bytes.
    PointerFree,
    /// Scanned like a root and only released by an explicit free.
    Uncollectable,
    /// Flat array storage. Managed like `Uncollectable`; elements get no
    /// individual finalizers.
    RawPlacement,
}

impl Strategy {
    /// Every strategy.
    pub const ALL: [Self; 4] = [
        Self::Collected,
        Self::PointerFree,
        Self::Uncollectable,
        Self::RawPlacement,
    ];

    /// Kind of the block backing this strategy.
    #[must_use]
    pub const fn block_kind(self) -> BlockKind {
        match self {
            Self::Collected => BlockKind::Normal,
            Self::PointerFree => BlockKind::PointerFree,
            Self::Uncollectable | Self::RawPlacement => BlockKind::Uncollectable,
        }
    }

    /// Whether objects constructed under this strategy get finalizers.
    const fn finalizes(self) -> bool {
        !matches!(self, Self::RawPlacement)
    }
}

/// Allocation front end over a collector.
pub struct Allocator<C: Collector = MarkSweep> {
    collector: C,
    init: Once,
    initialized: AtomicBool,
    init_count: AtomicUsize,
}

impl<C: Collector> Allocator<C> {
    /// Wrap `collector`. The collector is initialized on first use.
    pub const fn new(collector: C) -> Self {
        Self {
            collector,
            init: Once::new(),
            initialized: AtomicBool::new(false),
            init_count: AtomicUsize::new(0),
        }
    }

    /// The underlying collector.
    pub const fn collector(&self) -> &C {
        &self.collector
    }

    /// Finalizer registry bound to this allocator's collector.
    pub const fn registry(&self) -> Registry<'_, C> {
        Registry::new(&self.collector)
    }

    fn ensure_init(&self) {
        if self.initialized.load(Ordering::Acquire) {
            return;
        }
        self.init.call_once(|| {
            self.collector.init();
            self.init_count.fetch_add(1, Ordering::AcqRel);
            self.initialized.store(true, Ordering::Release);

            #[cfg(feature = "tracing")]
            tracing::debug!("allocator_initialized");
        });
    }

    /// Whether the collector has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Number of times initialization ran (0 or 1).
    pub fn init_count(&self) -> usize {
        self.init_count.load(Ordering::Acquire)
    }

    /// Allocate a zeroed block of at least `size` bytes.
    ///
    /// A `size` of 0 yields the smallest block.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the collector has no memory left. The
    /// request is not retried.
    pub fn allocate(&self, size: usize, strategy: Strategy) -> Result<NonNull<u8>, AllocError> {
        self.ensure_init();
        self.collector
            .malloc(size, strategy.block_kind())
            .map_err(|reason| {
                #[cfg(feature = "tracing")]
                tracing::debug!(size, ?strategy, %reason, "allocation_failed");
                AllocError::new(size, strategy, reason)
            })
    }

    /// Release a block now. Null is ignored.
    ///
    /// For collected strategies this only returns memory early; the
    /// collector would reclaim the block anyway.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have been returned by [`allocate`](Self::allocate)
    /// with the same `strategy`, and must not be used or freed afterwards.
    pub unsafe fn deallocate(&self, ptr: *mut u8, strategy: Strategy) {
        let Some(base) = NonNull::new(ptr) else {
            return;
        };
        debug_assert_eq!(
            self.collector.base(ptr),
            Some(base),
            "deallocate of a pointer that is not a live block base"
        );
        debug_assert_eq!(
            self.collector.block_kind(ptr),
            Some(strategy.block_kind()),
            "deallocate with a strategy other than the one allocated with"
        );
        // SAFETY: forwarded from the caller.
        unsafe { self.collector.free(base) };
    }

    /// Placement: hand back caller-owned storage unchanged.
    ///
    /// Nothing is registered with the collector.
    #[must_use]
    pub const fn placement_allocate(&self, ptr: NonNull<u8>) -> NonNull<u8> {
        ptr
    }

    /// Collected storage for raw buffers. Never finalized.
    ///
    /// # Errors
    ///
    /// See [`allocate`](Self::allocate).
    pub fn allocate_raw(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate(size, Strategy::Collected)
    }

    /// Release a block from [`allocate_raw`](Self::allocate_raw).
    ///
    /// # Safety
    ///
    /// See [`deallocate`](Self::deallocate).
    pub unsafe fn free_raw(&self, ptr: *mut u8) {
        // SAFETY: forwarded from the caller.
        unsafe { self.deallocate(ptr, Strategy::Collected) };
    }

    /// Move `value` into a new block.
    ///
    /// Types with drop glue get a finalizer that drops them once the block
    /// becomes unreachable (never for [`Strategy::RawPlacement`]). The
    /// finalizer runs on whichever thread collects, hence `T: Send`:
    ///
    /// ```compile_fail
    /// use std::rc::Rc;
    /// use gc_object::{Allocator, MarkSweep, Strategy};
    ///
    /// let alloc = Allocator::new(MarkSweep::default());
    /// let _ = alloc.new_object(Rc::new(1), Strategy::Collected);
    /// ```
    ///
    /// # Errors
    ///
    /// See [`allocate`](Self::allocate).
    ///
    /// # Panics
    ///
    /// Panics if `T` needs more than 128-byte alignment.
    pub fn new_object<T: Send>(&self, value: T, strategy: Strategy) -> Result<Obj<T>, AllocError> {
        // SAFETY: `T: Send`, so its finalizer may drop it on any thread.
        unsafe { self.new_object_unchecked(value, strategy) }
    }

    /// [`new_object`](Self::new_object) for types that are not `Send`.
    ///
    /// # Errors
    ///
    /// See [`allocate`](Self::allocate).
    ///
    /// # Panics
    ///
    /// Panics if `T` needs more than 128-byte alignment.
    ///
    /// # Safety
    ///
    /// If a finalizer is registered, `T` may be dropped on any thread that
    /// collects or calls `invoke_finalizers`. The caller must make that
    /// sound, for example by confining the collector to one thread or by
    /// deleting the object on its own thread while it is still reachable.
    pub unsafe fn new_object_unchecked<T>(
        &self,
        value: T,
        strategy: Strategy,
    ) -> Result<Obj<T>, AllocError> {
        assert!(
            mem::align_of::<T>() <= LARGE_OBJECT_OFFSET,
            "alignment of {} exceeds {LARGE_OBJECT_OFFSET}",
            mem::align_of::<T>()
        );
        let size = mem::size_of::<T>().max(mem::align_of::<T>());
        let ptr = self.allocate(size, strategy)?.cast::<T>();

        // SAFETY: fresh block, large enough and aligned for `T`.
        unsafe { ptr.as_ptr().write(value) };

        if mem::needs_drop::<T>() && strategy.finalizes() {
            // SAFETY: the block holds a live `T` that only the finalizer or
            // `delete_object` will drop.
            unsafe { self.registry().register_finalizer(ptr) };
        }

        // SAFETY: `ptr` holds a live `T`.
        Ok(unsafe { Obj::from_raw(ptr) })
    }

    /// Drop the object now and release its block.
    ///
    /// Its finalizer is cleared first, so no later collection runs it.
    ///
    /// # Safety
    ///
    /// `obj` must come from [`new_object`](Self::new_object) with the same
    /// `strategy`, must not have been deleted or finalized, and must not be
    /// used afterwards.
    pub unsafe fn delete_object<T>(&self, obj: Obj<T>, strategy: Strategy) {
        let ptr = obj.as_ptr();
        self.registry().deregister_finalizer(ptr.cast());
        // SAFETY: forwarded from the caller.
        unsafe {
            std::ptr::drop_in_place(ptr);
            self.deallocate(ptr.cast(), strategy);
        }
    }

    /// Build a `len`-element array in one [`Strategy::RawPlacement`] block.
    ///
    /// Elements get no finalizers; release the array with
    /// [`delete_array`](Self::delete_array).
    ///
    /// # Errors
    ///
    /// Fails if the byte size overflows or the collector has no memory.
    ///
    /// # Panics
    ///
    /// Panics if `T` needs more than 128-byte alignment.
    pub fn new_array<T, F>(&self, len: usize, mut init: F) -> Result<NonNull<[T]>, AllocError>
    where
        F: FnMut(usize) -> T,
    {
        assert!(
            mem::align_of::<T>() <= LARGE_OBJECT_OFFSET,
            "alignment of {} exceeds {LARGE_OBJECT_OFFSET}",
            mem::align_of::<T>()
        );
        let size = mem::size_of::<T>()
            .checked_mul(len)
            .ok_or_else(|| AllocError::new(usize::MAX, Strategy::RawPlacement, AllocFailure::OutOfMemory))?;
        let ptr = self
            .allocate(size.max(mem::align_of::<T>()), Strategy::RawPlacement)?
            .cast::<T>();

        let mut guard = PartialArray {
            allocator: self,
            ptr,
            initialized: 0,
        };
        while guard.initialized < len {
            let value = init(guard.initialized);
            // SAFETY: `initialized < len` and the block holds `len` elements.
            unsafe { ptr.as_ptr().add(guard.initialized).write(value) };
            guard.initialized += 1;
        }
        mem::forget(guard);
        Ok(NonNull::slice_from_raw_parts(ptr, len))
    }

    /// Drop every element and release the block.
    ///
    /// # Safety
    ///
    /// `array` must come from [`new_array`](Self::new_array) and must not be
    /// used afterwards.
    pub unsafe fn delete_array<T>(&self, array: NonNull<[T]>) {
        // SAFETY: forwarded from the caller.
        unsafe {
            std::ptr::drop_in_place(array.as_ptr());
            self.deallocate(array.cast::<u8>().as_ptr(), Strategy::RawPlacement);
        }
    }

    /// Construct `value` in caller-owned storage.
    ///
    /// No collector interaction and no finalizer; the caller drops it.
    ///
    /// # Safety
    ///
    /// `storage` must be valid for writing a `T`.
    pub unsafe fn construct_in<T>(&self, storage: NonNull<T>, value: T) -> NonNull<T> {
        let ptr = self.placement_allocate(storage.cast()).cast::<T>();
        // SAFETY: forwarded from the caller.
        unsafe { ptr.as_ptr().write(value) };
        ptr
    }

    /// Usable size of the block containing `ptr`.
    pub fn size_of_block(&self, ptr: *const u8) -> Option<usize> {
        self.collector.block_size(ptr)
    }

    /// Run a full collection.
    pub fn collect(&self) {
        self.ensure_init();
        self.collector.collect();
    }

    /// Keep `obj` reachable while the returned guard lives.
    pub fn root<T>(&self, obj: Obj<T>) -> Root<'_, T, C> {
        Root::new(&self.collector, obj)
    }
}

/// Unwinds a half-built array: drops the written prefix, frees the block.
struct PartialArray<'a, T, C: Collector> {
    allocator: &'a Allocator<C>,
    ptr: NonNull<T>,
    initialized: usize,
}

impl<T, C: Collector> Drop for PartialArray<'_, T, C> {
    fn drop(&mut self) {
        // SAFETY: the first `initialized` elements were written, and the
        // block came from `allocate` with `RawPlacement`.
        unsafe {
            std::ptr::drop_in_place(NonNull::slice_from_raw_parts(self.ptr, self.initialized).as_ptr());
            self.allocator
                .deallocate(self.ptr.cast::<u8>().as_ptr(), Strategy::RawPlacement);
        }
    }
}

static GLOBAL: LazyLock<Allocator> =
    LazyLock::new(|| Allocator::new(MarkSweep::new(GcConfig::from_env())));

/// The process-wide allocator, configured from the environment.
pub fn global() -> &'static Allocator {
    &GLOBAL
}
