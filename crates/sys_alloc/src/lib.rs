//! Anonymous page mappings for the collector heap.
//!
//! Every page handed out here is zero-filled by the operating system and
//! aligned to at least the system page size.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// A handle to an anonymous memory mapping.
///
/// The region is unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping covers no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

// SAFETY: the mapping is plain memory owned by this handle.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with length 0.
    /// A length must be set before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self { len: 0 }
    }

    /// Sets the length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Creates an anonymous, read-write, zero-filled mapping.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length, or the OS error when the
    /// mapping cannot be created.
    ///
    /// # Safety
    ///
    /// The returned memory is only valid while the `Mmap` is alive. Callers
    /// that hand out raw pointers into it must not use them after the handle
    /// is dropped.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let inner = unsafe { os::MmapInner::map_anon(self.len)? };
        Ok(Mmap { inner })
    }
}
