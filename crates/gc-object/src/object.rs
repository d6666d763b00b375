//! Handles to collector-managed objects.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::allocator::{global, Strategy};
use crate::error::AllocError;
use crate::roots::Root;

/// A raw, copyable handle to a `T` living in a collector block.
///
/// `Obj` does not keep its target alive: the collector only sees it if the
/// handle itself sits somewhere it scans (a scanned block, a root region,
/// or the stack of a registered thread). Use [`Root`] to pin an object.
pub struct Obj<T> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

impl<T: Send> Obj<T> {
    /// Allocate `value` on the global collector.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the heap is exhausted.
    pub fn new(value: T) -> Result<Self, AllocError> {
        global().new_object(value, Strategy::Collected)
    }

    /// Allocate `value` on the global collector under `strategy`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the heap is exhausted.
    pub fn new_with(value: T, strategy: Strategy) -> Result<Self, AllocError> {
        global().new_object(value, strategy)
    }
}

impl<T> Obj<T> {
    /// Destroy a global object now.
    ///
    /// # Safety
    ///
    /// See [`Allocator::delete_object`](crate::Allocator::delete_object).
    pub unsafe fn delete(self, strategy: Strategy) {
        // SAFETY: forwarded from the caller.
        unsafe { global().delete_object(self, strategy) };
    }

    /// Wrap a pointer to a managed `T`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live `T`.
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// The object's address.
    #[must_use]
    pub const fn as_ptr(self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// The object's address as an integer.
    #[must_use]
    pub fn addr(self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Borrow the object.
    ///
    /// # Safety
    ///
    /// The object must still be reachable (or rooted) and not deleted for
    /// the whole lifetime `'a`.
    #[must_use]
    pub const unsafe fn as_ref<'a>(self) -> &'a T {
        // SAFETY: forwarded from the caller.
        unsafe { &*self.ptr.as_ptr() }
    }

    /// Mutably borrow the object.
    ///
    /// # Safety
    ///
    /// As [`as_ref`](Self::as_ref), and no other reference to the object may
    /// exist for `'a`.
    #[must_use]
    pub unsafe fn as_mut<'a>(self) -> &'a mut T {
        // SAFETY: forwarded from the caller.
        unsafe { &mut *self.ptr.as_ptr() }
    }

    /// Whether two handles point at the same object.
    #[must_use]
    pub fn ptr_eq(self, other: Self) -> bool {
        self.ptr == other.ptr
    }

    /// Root this global object.
    #[must_use]
    pub fn root(self) -> Root<'static, T> {
        global().root(self)
    }
}

impl<T> Clone for Obj<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Obj<T> {}

impl<T> fmt::Debug for Obj<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Obj").field(&self.ptr).finish()
    }
}

impl<T> fmt::Pointer for Obj<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.ptr, f)
    }
}

// SAFETY: an `Obj` is a shared pointer into a thread-safe collector.
unsafe impl<T: Send + Sync> Send for Obj<T> {}
// SAFETY: as above.
unsafe impl<T: Send + Sync> Sync for Obj<T> {}
