//! Explicit roots.
//!
//! Besides uncollectable blocks and (optionally) the stack, the collector
//! treats two kinds of explicit roots as live: single objects pinned by a
//! [`Root`] guard, and raw memory regions added with
//! [`MarkSweep::add_roots`](crate::MarkSweep::add_roots).

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;

use crate::collector::{Collector, MarkSweep};
use crate::object::Obj;

/// The explicit root set of one collector.
#[derive(Debug, Default)]
pub struct RootSet {
    /// Rooted object addresses with their pin counts.
    objects: HashMap<usize, usize>,
    /// Registered regions as `(start, len)`.
    regions: Vec<(usize, usize)>,
}

impl RootSet {
    /// Pin `addr`. Nested pins are counted.
    pub fn add_object(&mut self, addr: usize) {
        *self.objects.entry(addr).or_insert(0) += 1;
    }

    /// Undo one [`add_object`](Self::add_object).
    pub fn remove_object(&mut self, addr: usize) {
        if let Some(count) = self.objects.get_mut(&addr) {
            *count -= 1;
            if *count == 0 {
                self.objects.remove(&addr);
            }
        }
    }

    /// Add a region to scan on every collection.
    pub fn add_region(&mut self, start: usize, len: usize) {
        self.regions.push((start, len));
    }

    /// Remove every region that starts at `start`.
    pub fn remove_region(&mut self, start: usize) {
        self.regions.retain(|&(s, _)| s != start);
    }

    /// Pinned object addresses.
    pub fn objects(&self) -> impl Iterator<Item = usize> + '_ {
        self.objects.keys().copied()
    }

    /// Registered regions.
    #[must_use]
    pub fn regions(&self) -> &[(usize, usize)] {
        &self.regions
    }
}

/// Keeps an object reachable for as long as the guard lives.
///
/// Dereferencing a `Root` is safe: the object cannot be collected while it
/// is rooted. (It can still be destroyed explicitly, which is why
/// [`Allocator::delete_object`](crate::Allocator::delete_object) is
/// `unsafe`.)
pub struct Root<'c, T, C: Collector = MarkSweep> {
    obj: Obj<T>,
    collector: &'c C,
}

impl<'c, T, C: Collector> Root<'c, T, C> {
    /// Root `obj` on `collector`.
    pub fn new(collector: &'c C, obj: Obj<T>) -> Self {
        collector.add_root(obj.as_ptr().cast());
        Self { obj, collector }
    }

    /// The rooted handle.
    #[must_use]
    pub const fn obj(&self) -> Obj<T> {
        self.obj
    }
}

impl<T, C: Collector> Deref for Root<'_, T, C> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: rooted objects are never collected.
        unsafe { self.obj.as_ref() }
    }
}

impl<T, C: Collector> Clone for Root<'_, T, C> {
    fn clone(&self) -> Self {
        Self::new(self.collector, self.obj)
    }
}

impl<T, C: Collector> Drop for Root<'_, T, C> {
    fn drop(&mut self) {
        self.collector.remove_root(self.obj.as_ptr().cast());
    }
}

impl<T: fmt::Debug, C: Collector> fmt::Debug for Root<'_, T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Root").field(&**self).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_pins_are_counted() {
        let mut roots = RootSet::default();
        roots.add_object(0x1000);
        roots.add_object(0x1000);
        roots.remove_object(0x1000);
        assert_eq!(roots.objects().collect::<Vec<_>>(), vec![0x1000]);
        roots.remove_object(0x1000);
        assert_eq!(roots.objects().count(), 0);
        roots.remove_object(0x1000);
    }

    #[test]
    fn test_regions() {
        let mut roots = RootSet::default();
        roots.add_region(0x2000, 64);
        roots.add_region(0x3000, 8);
        roots.remove_region(0x2000);
        assert_eq!(roots.regions(), &[(0x3000, 8)]);
    }
}
