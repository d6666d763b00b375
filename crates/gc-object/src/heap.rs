//! `BiBOP` (Big Bag of Pages) block storage.
//!
//! Memory is divided into 4KB pages. Each page holds blocks of a single size
//! class and a single [`BlockKind`], so the metadata for any address can be
//! found by masking the address down to its page and consulting the page
//! table. Blocks larger than [`MAX_SMALL_OBJECT_SIZE`] get a dedicated
//! multi-page mapping whose pages all resolve to one header.
//!
//! The heap never dereferences a page it did not map itself: every address
//! is validated against the page table before its header is read. That is
//! what makes it safe to feed arbitrary words (stack slots, block contents)
//! into [`Heap::find_base`].

use std::collections::HashMap;
use std::ptr::NonNull;

use sys_alloc::{Mmap, MmapOptions};

use crate::error::AllocFailure;

// ============================================================================
// Constants
// ============================================================================

/// Size of each heap page.
pub const PAGE_SIZE: usize = 4096;

/// Mask for extracting the page address from a pointer.
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Magic number for validating heap pages ("GCOB" in ASCII).
pub const MAGIC_GC_PAGE: u32 = 0x4743_4F42;

/// Size classes for small blocks.
pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Blocks larger than this go to the large object space.
pub const MAX_SMALL_OBJECT_SIZE: usize = 2048;

/// Alignment guaranteed for every block.
pub const MIN_ALIGN: usize = 16;

/// Offset of the payload inside a large-object mapping.
///
/// Large payloads are aligned to this value.
pub const LARGE_OBJECT_OFFSET: usize = 128;

const FLAG_LARGE: u8 = 0x01;

const _: () = assert!(std::mem::size_of::<PageHeader>() <= LARGE_OBJECT_OFFSET);
const _: () = assert!(PageHeader::max_objects(SIZE_CLASSES[0]) <= 256);

// ============================================================================
// BlockKind
// ============================================================================

/// Memory discipline of a block, fixed per page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockKind {
    /// Collected and scanned for pointers.
    Normal = 0,
    /// Collected, never scanned for pointers.
    PointerFree = 1,
    /// Scanned, but only released by an explicit free.
    Uncollectable = 2,
}

impl BlockKind {
    /// All kinds, in segment order.
    pub const ALL: [Self; 3] = [Self::Normal, Self::PointerFree, Self::Uncollectable];

    const fn index(self) -> usize {
        self as usize
    }

    /// Whether the contents of blocks of this kind are scanned for pointers.
    #[must_use]
    pub const fn is_scanned(self) -> bool {
        !matches!(self, Self::PointerFree)
    }

    /// Whether unreachable blocks of this kind are reclaimed by a sweep.
    #[must_use]
    pub const fn is_collectable(self) -> bool {
        !matches!(self, Self::Uncollectable)
    }
}

// ============================================================================
// PageHeader - Metadata at the start of each page
// ============================================================================

/// Metadata stored at the beginning of each page (or large mapping).
#[repr(C)]
pub struct PageHeader {
    /// Magic number to validate this is a heap page.
    pub magic: u32,
    /// Kind of every block on this page.
    pub kind: BlockKind,
    /// Bitflags (`is_large_object`).
    pub flags: u8,
    /// Index of the first free slot.
    pub free_list_head: Option<u16>,
    /// Size of each block in bytes (payload size for large objects).
    pub block_size: usize,
    /// Number of block slots on this page.
    pub obj_count: usize,
    /// Offset of the first slot from the page start.
    pub header_size: usize,
    /// One mark bit per slot.
    pub mark_bitmap: [u64; 4],
    /// One allocated bit per slot.
    pub alloc_bitmap: [u64; 4],
}

impl PageHeader {
    /// Calculate the header size, rounded up to block alignment.
    #[must_use]
    pub const fn header_size(block_size: usize) -> usize {
        let base = std::mem::size_of::<Self>();
        (base + block_size - 1) & !(block_size - 1)
    }

    /// Calculate maximum blocks per page for a given block size.
    #[must_use]
    pub const fn max_objects(block_size: usize) -> usize {
        (PAGE_SIZE - Self::header_size(block_size)) / block_size
    }

    /// Whether this header describes a large-object mapping.
    #[must_use]
    pub const fn is_large(&self) -> bool {
        self.flags & FLAG_LARGE != 0
    }

    /// Check if the slot at `index` is marked.
    #[must_use]
    pub const fn is_marked(&self, index: usize) -> bool {
        (self.mark_bitmap[index / 64] & (1 << (index % 64))) != 0
    }

    /// Set the mark bit for the slot at `index`.
    pub const fn set_mark(&mut self, index: usize) {
        self.mark_bitmap[index / 64] |= 1 << (index % 64);
    }

    /// Clear all mark bits.
    pub const fn clear_all_marks(&mut self) {
        self.mark_bitmap = [0; 4];
    }

    /// Check if the slot at `index` holds a live allocation.
    #[must_use]
    pub const fn is_allocated(&self, index: usize) -> bool {
        (self.alloc_bitmap[index / 64] & (1 << (index % 64))) != 0
    }

    /// Set the allocated bit for the slot at `index`.
    pub const fn set_allocated(&mut self, index: usize) {
        self.alloc_bitmap[index / 64] |= 1 << (index % 64);
    }

    /// Clear the allocated bit for the slot at `index`.
    pub const fn clear_allocated(&mut self, index: usize) {
        self.alloc_bitmap[index / 64] &= !(1 << (index % 64));
    }

    /// Address of the slot at `index`.
    #[must_use]
    pub fn slot_addr(&self, index: usize) -> usize {
        std::ptr::from_ref(self) as usize + self.header_size + index * self.block_size
    }
}

// ============================================================================
// BlockRef - A resolved block
// ============================================================================

/// A live block, identified by its page header and slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    header: NonNull<PageHeader>,
    index: usize,
}

impl BlockRef {
    /// Start address of the block.
    #[must_use]
    pub fn base(self) -> NonNull<u8> {
        // SAFETY: a BlockRef is only built for a mapped page.
        let addr = unsafe { self.header.as_ref() }.slot_addr(self.index);
        // SAFETY: slot addresses lie inside a live mapping and are never null.
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    /// Usable size of the block in bytes.
    #[must_use]
    pub fn size(self) -> usize {
        unsafe { self.header.as_ref() }.block_size
    }

    /// Kind of the block.
    #[must_use]
    pub fn kind(self) -> BlockKind {
        unsafe { self.header.as_ref() }.kind
    }

    /// Whether the block is marked in the current cycle.
    #[must_use]
    pub fn is_marked(self) -> bool {
        unsafe { self.header.as_ref() }.is_marked(self.index)
    }

    /// Mark the block. Returns `true` if it was not marked before.
    pub fn set_mark(self) -> bool {
        // SAFETY: the heap lock is held by whoever owns the `&mut Heap` that
        // produced this reference.
        let header = unsafe { &mut *self.header.as_ptr() };
        if header.is_marked(self.index) {
            return false;
        }
        header.set_mark(self.index);
        true
    }
}

// ============================================================================
// Segment - Size-class based block pool
// ============================================================================

/// Pages of one size class and one kind.
struct Segment {
    block_size: usize,
    pages: Vec<NonNull<PageHeader>>,
    /// Page currently being allocated from.
    current: usize,
}

impl Segment {
    const fn new(block_size: usize) -> Self {
        Self {
            block_size,
            pages: Vec::new(),
            current: 0,
        }
    }

    /// Pop a slot from the first page with a free slot.
    fn try_allocate(&mut self) -> Option<NonNull<u8>> {
        let n = self.pages.len();
        for step in 0..n {
            let page_idx = (self.current + step) % n;
            let page = self.pages[page_idx];
            // SAFETY: pages in a segment stay mapped for the heap's lifetime.
            unsafe {
                let header = &mut *page.as_ptr();
                if let Some(idx) = header.free_list_head {
                    let idx = idx as usize;
                    let ptr = header.slot_addr(idx) as *mut u8;
                    header.free_list_head = ptr.cast::<Option<u16>>().read_unaligned();
                    header.set_allocated(idx);
                    self.current = page_idx;
                    return Some(NonNull::new_unchecked(ptr));
                }
            }
        }
        None
    }
}

/// Push a slot onto its page's free list.
///
/// # Safety
///
/// `header` must be a mapped small page and `index` one of its slots.
unsafe fn push_free(header: &mut PageHeader, index: usize) {
    let slot = header.slot_addr(index) as *mut u8;
    // SAFETY: the slot lies inside the page and is at least 16 bytes.
    unsafe {
        std::ptr::write_bytes(slot, 0, header.block_size);
        slot.cast::<Option<u16>>().write_unaligned(header.free_list_head);
    }
    #[allow(clippy::cast_possible_truncation)]
    let index = index as u16;
    header.free_list_head = Some(index);
}

/// A large block and the mapping that backs it.
struct LargeBlock {
    map: Mmap,
}

/// Result of a sweep over the whole heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Blocks returned to the free pool.
    pub objects_reclaimed: usize,
    /// Bytes returned to the free pool.
    pub bytes_reclaimed: usize,
    /// Blocks still allocated after the sweep.
    pub objects_surviving: usize,
    /// Bytes still allocated after the sweep.
    pub bytes_surviving: usize,
}

// ============================================================================
// Heap - Central block manager
// ============================================================================

/// Central block manager coordinating all segments.
pub struct Heap {
    /// One segment per (kind, size class).
    segments: [[Segment; SIZE_CLASSES.len()]; 3],
    /// Large blocks keyed by header address.
    large_objects: HashMap<usize, LargeBlock>,
    /// Every mapped page address, pointing at the header that owns it.
    page_table: HashMap<usize, NonNull<PageHeader>>,
    /// Backing mappings for small pages.
    mappings: Vec<Mmap>,
    mapped_bytes: usize,
    allocated_bytes: usize,
    bytes_since_gc: usize,
    /// Cap on `mapped_bytes`; 0 means unlimited.
    max_heap_size: usize,
}

// SAFETY: all raw pointers point into mappings owned by the heap itself, and
// the heap is only ever reached through its collector's lock.
unsafe impl Send for Heap {}

impl Heap {
    /// Create a new empty heap.
    #[must_use]
    pub fn new(max_heap_size: usize) -> Self {
        Self {
            segments: std::array::from_fn(|_| {
                std::array::from_fn(|class| Segment::new(SIZE_CLASSES[class]))
            }),
            large_objects: HashMap::new(),
            page_table: HashMap::new(),
            mappings: Vec::new(),
            mapped_bytes: 0,
            allocated_bytes: 0,
            bytes_since_gc: 0,
            max_heap_size,
        }
    }

    /// Bytes currently handed out to live blocks.
    #[must_use]
    pub const fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Bytes currently mapped from the operating system.
    #[must_use]
    pub const fn mapped_bytes(&self) -> usize {
        self.mapped_bytes
    }

    /// Bytes allocated since the last collection.
    #[must_use]
    pub const fn bytes_since_gc(&self) -> usize {
        self.bytes_since_gc
    }

    pub(crate) const fn reset_bytes_since_gc(&mut self) {
        self.bytes_since_gc = 0;
    }

    fn map(&mut self, len: usize) -> Result<Mmap, AllocFailure> {
        let mapped_bytes = self
            .mapped_bytes
            .checked_add(len)
            .ok_or(AllocFailure::OutOfMemory)?;
        if self.max_heap_size != 0 && mapped_bytes > self.max_heap_size {
            return Err(AllocFailure::HeapLimit);
        }
        // SAFETY: the mapping is owned by the heap and outlives every pointer
        // handed out into it.
        let map = unsafe { MmapOptions::new().len(len).map_anon() }
            .map_err(|_| AllocFailure::OutOfMemory)?;
        self.mapped_bytes = mapped_bytes;
        Ok(map)
    }

    /// Map a fresh small page and thread all of its slots onto the free list.
    fn map_page(&mut self, block_size: usize, kind: BlockKind) -> Result<NonNull<PageHeader>, AllocFailure> {
        let map = self.map(PAGE_SIZE)?;
        let ptr = map.ptr();
        debug_assert_eq!(ptr as usize % PAGE_SIZE, 0);

        #[allow(clippy::cast_ptr_alignment)]
        let header = ptr.cast::<PageHeader>();
        let obj_count = PageHeader::max_objects(block_size);

        // SAFETY: we just mapped this memory and it is page aligned.
        unsafe {
            header.write(PageHeader {
                magic: MAGIC_GC_PAGE,
                kind,
                flags: 0,
                free_list_head: None,
                block_size,
                obj_count,
                header_size: PageHeader::header_size(block_size),
                mark_bitmap: [0; 4],
                alloc_bitmap: [0; 4],
            });
            // Reverse order so the lowest slot is handed out first.
            for index in (0..obj_count).rev() {
                push_free(&mut *header, index);
            }
        }

        // SAFETY: checked by the mapping above.
        let page = unsafe { NonNull::new_unchecked(header) };
        self.page_table.insert(ptr as usize, page);
        self.mappings.push(map);
        Ok(page)
    }

    /// Allocate a zeroed block of at least `size` bytes.
    ///
    /// # Errors
    ///
    /// Fails when a new page cannot be mapped or the heap limit is reached.
    pub fn alloc(&mut self, size: usize, kind: BlockKind) -> Result<NonNull<u8>, AllocFailure> {
        let size = size.max(1);
        if size > MAX_SMALL_OBJECT_SIZE {
            return self.alloc_large(size, kind);
        }

        let class = size_class_index(size);
        let block_size = self.segments[kind.index()][class].block_size;

        let ptr = if let Some(ptr) = self.segments[kind.index()][class].try_allocate() {
            ptr
        } else {
            let page = self.map_page(block_size, kind)?;
            let segment = &mut self.segments[kind.index()][class];
            segment.pages.push(page);
            segment.current = segment.pages.len() - 1;
            segment.try_allocate().ok_or(AllocFailure::OutOfMemory)?
        };

        // SAFETY: the slot is block_size bytes inside a live page. Only the
        // free-list link can be non-zero here.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, std::mem::size_of::<Option<u16>>()) };

        self.allocated_bytes += block_size;
        self.bytes_since_gc += block_size;
        Ok(ptr)
    }

    /// Allocate a large block on its own mapping.
    fn alloc_large(&mut self, size: usize, kind: BlockKind) -> Result<NonNull<u8>, AllocFailure> {
        let alloc_size = size
            .checked_add(LARGE_OBJECT_OFFSET)
            .and_then(|total| total.checked_next_multiple_of(PAGE_SIZE))
            .ok_or(AllocFailure::OutOfMemory)?;
        let map = self.map(alloc_size)?;
        let ptr = map.ptr();

        #[allow(clippy::cast_ptr_alignment)]
        let header = ptr.cast::<PageHeader>();
        // SAFETY: freshly mapped, page aligned.
        unsafe {
            header.write(PageHeader {
                magic: MAGIC_GC_PAGE,
                kind,
                flags: FLAG_LARGE,
                free_list_head: None,
                block_size: size,
                obj_count: 1,
                header_size: LARGE_OBJECT_OFFSET,
                mark_bitmap: [0; 4],
                alloc_bitmap: [0; 4],
            });
            (*header).set_allocated(0);
        }

        let header_ptr = unsafe { NonNull::new_unchecked(header) };
        for page in 0..alloc_size / PAGE_SIZE {
            self.page_table.insert(ptr as usize + page * PAGE_SIZE, header_ptr);
        }
        self.large_objects.insert(ptr as usize, LargeBlock { map });

        self.allocated_bytes += size;
        self.bytes_since_gc += size;
        // SAFETY: the payload offset lies inside the mapping.
        Ok(unsafe { NonNull::new_unchecked(ptr.add(LARGE_OBJECT_OFFSET)) })
    }

    /// Resolve any address to the live block that contains it.
    ///
    /// This is the base-address lookup: interior pointers resolve to the
    /// start of their block. Addresses outside the heap, inside page headers,
    /// or inside free slots resolve to `None`.
    #[must_use]
    pub fn find_block(&self, addr: usize) -> Option<BlockRef> {
        let header_ptr = *self.page_table.get(&(addr & PAGE_MASK))?;
        // SAFETY: every page table entry points at a header we mapped.
        let header = unsafe { header_ptr.as_ref() };
        debug_assert_eq!(header.magic, MAGIC_GC_PAGE);

        let data_start = header_ptr.as_ptr() as usize + header.header_size;
        if addr < data_start {
            return None;
        }

        let offset = addr - data_start;
        if header.is_large() {
            if offset >= header.block_size || !header.is_allocated(0) {
                return None;
            }
            return Some(BlockRef {
                header: header_ptr,
                index: 0,
            });
        }

        let index = offset / header.block_size;
        if index >= header.obj_count || !header.is_allocated(index) {
            return None;
        }
        Some(BlockRef {
            header: header_ptr,
            index,
        })
    }

    /// Start address of the live block containing `addr`.
    #[must_use]
    pub fn find_base(&self, addr: usize) -> Option<NonNull<u8>> {
        self.find_block(addr).map(BlockRef::base)
    }

    /// Release a block. `base` must be the exact start of a live block.
    ///
    /// Returns the number of bytes released, or `None` if `base` is not the
    /// start of a live block.
    pub fn free(&mut self, base: NonNull<u8>) -> Option<usize> {
        let block = self.find_block(base.as_ptr() as usize)?;
        if block.base() != base {
            return None;
        }
        Some(self.release(block))
    }

    fn release(&mut self, block: BlockRef) -> usize {
        let size = block.size();
        // SAFETY: `block` was resolved through the page table.
        let header = unsafe { &mut *block.header.as_ptr() };
        if header.is_large() {
            let header_addr = block.header.as_ptr() as usize;
            if let Some(large) = self.large_objects.remove(&header_addr) {
                let len = large.map.len();
                for page in 0..len / PAGE_SIZE {
                    self.page_table.remove(&(header_addr + page * PAGE_SIZE));
                }
                self.mapped_bytes -= len;
                // Dropping the block unmaps it.
                drop(large);
            }
        } else {
            header.clear_allocated(block.index);
            // SAFETY: small page, valid slot index.
            unsafe { push_free(header, block.index) };
        }
        self.allocated_bytes -= size;
        size
    }

    /// Iterate over all page headers (small pages and large mappings).
    pub fn all_pages(&self) -> impl Iterator<Item = NonNull<PageHeader>> + '_ {
        self.segments
            .iter()
            .flatten()
            .flat_map(|segment| segment.pages.iter().copied())
            .chain(self.large_objects.keys().map(|&addr| {
                // SAFETY: keys are header addresses of live mappings.
                unsafe { NonNull::new_unchecked(addr as *mut PageHeader) }
            }))
    }

    /// All live blocks of the given kind.
    #[must_use]
    pub fn blocks_of_kind(&self, kind: BlockKind) -> Vec<BlockRef> {
        let mut blocks = Vec::new();
        for header_ptr in self.all_pages() {
            // SAFETY: pages from all_pages are live.
            let header = unsafe { header_ptr.as_ref() };
            if header.kind != kind {
                continue;
            }
            for index in 0..header.obj_count {
                if header.is_allocated(index) {
                    blocks.push(BlockRef {
                        header: header_ptr,
                        index,
                    });
                }
            }
        }
        blocks
    }

    /// Clear all mark bits.
    pub fn clear_all_marks(&mut self) {
        for page in self.all_pages() {
            // SAFETY: pages from all_pages are live and we hold `&mut self`.
            unsafe { (*page.as_ptr()).clear_all_marks() };
        }
    }

    /// Reclaim every unmarked collectable block.
    pub fn sweep(&mut self) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut dead_large = Vec::new();

        let pages: Vec<_> = self.all_pages().collect();
        for header_ptr in pages {
            // SAFETY: snapshot of live pages; large pages are only released
            // after this loop.
            let header = unsafe { &mut *header_ptr.as_ptr() };
            for index in 0..header.obj_count {
                if !header.is_allocated(index) {
                    continue;
                }
                if header.is_marked(index) || !header.kind.is_collectable() {
                    stats.objects_surviving += 1;
                    stats.bytes_surviving += header.block_size;
                    continue;
                }
                let block = BlockRef {
                    header: header_ptr,
                    index,
                };
                if header.is_large() {
                    dead_large.push(block);
                } else {
                    stats.objects_reclaimed += 1;
                    stats.bytes_reclaimed += self.release(block);
                }
            }
        }

        for block in dead_large {
            stats.objects_reclaimed += 1;
            stats.bytes_reclaimed += self.release(block);
        }

        stats
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Compute the index into the segments array.
const fn size_class_index(size: usize) -> usize {
    let mut class = 0;
    while SIZE_CLASSES[class] < size {
        class += 1;
    }
    class
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_routing() {
        assert_eq!(size_class_index(1), 0);
        assert_eq!(size_class_index(16), 0);
        assert_eq!(size_class_index(17), 1);
        assert_eq!(size_class_index(2048), 7);
    }

    #[test]
    fn test_blocks_are_aligned_and_zeroed() {
        let mut heap = Heap::default();
        for size in [1, 24, 100, 700, 2048] {
            let ptr = heap.alloc(size, BlockKind::Normal).unwrap();
            assert_eq!(ptr.as_ptr() as usize % MIN_ALIGN, 0);
            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
            assert!(bytes.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_interior_pointer_resolves_to_base() {
        let mut heap = Heap::default();
        let small = heap.alloc(64, BlockKind::Normal).unwrap();
        let large = heap.alloc(10_000, BlockKind::Normal).unwrap();

        let small_addr = small.as_ptr() as usize;
        let large_addr = large.as_ptr() as usize;
        assert_eq!(heap.find_base(small_addr + 40), Some(small));
        assert_eq!(heap.find_base(large_addr + 9_000), Some(large));
        assert_eq!(heap.find_base(large_addr + 10_000), None);
        assert_eq!(large_addr % LARGE_OBJECT_OFFSET, 0);
    }

    #[test]
    fn test_foreign_and_free_addresses_do_not_resolve() {
        let mut heap = Heap::default();
        let local = 7_u64;
        assert!(heap.find_base(std::ptr::addr_of!(local) as usize).is_none());

        let ptr = heap.alloc(32, BlockKind::Normal).unwrap();
        let page = ptr.as_ptr() as usize & PAGE_MASK;
        assert!(heap.find_base(page).is_none(), "header must not resolve");

        assert_eq!(heap.free(ptr), Some(32));
        assert!(heap.find_base(ptr.as_ptr() as usize).is_none());
    }

    #[test]
    fn test_free_requires_exact_base() {
        let mut heap = Heap::default();
        let ptr = heap.alloc(64, BlockKind::Uncollectable).unwrap();
        let interior = NonNull::new(ptr.as_ptr().wrapping_add(8)).unwrap();
        assert_eq!(heap.free(interior), None);
        assert_eq!(heap.free(ptr), Some(64));
        assert_eq!(heap.allocated_bytes(), 0);
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let mut heap = Heap::default();
        let a = heap.alloc(128, BlockKind::Normal).unwrap();
        heap.free(a);
        let b = heap.alloc(128, BlockKind::Normal).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_kinds_use_separate_pages() {
        let mut heap = Heap::default();
        let normal = heap.alloc(32, BlockKind::Normal).unwrap();
        let atomic = heap.alloc(32, BlockKind::PointerFree).unwrap();
        let fixed = heap.alloc(32, BlockKind::Uncollectable).unwrap();

        let page = |p: NonNull<u8>| p.as_ptr() as usize & PAGE_MASK;
        assert_ne!(page(normal), page(atomic));
        assert_ne!(page(atomic), page(fixed));
        assert_eq!(heap.find_block(atomic.as_ptr() as usize).unwrap().kind(), BlockKind::PointerFree);
    }

    #[test]
    fn test_sweep_reclaims_unmarked_collectable_only() {
        let mut heap = Heap::default();
        let kept = heap.alloc(64, BlockKind::Normal).unwrap();
        let dead = heap.alloc(64, BlockKind::Normal).unwrap();
        let dead_large = heap.alloc(5000, BlockKind::PointerFree).unwrap();
        let fixed = heap.alloc(64, BlockKind::Uncollectable).unwrap();

        heap.clear_all_marks();
        heap.find_block(kept.as_ptr() as usize).unwrap().set_mark();
        let stats = heap.sweep();

        assert_eq!(stats.objects_reclaimed, 2);
        assert_eq!(stats.bytes_reclaimed, 64 + 5000);
        assert_eq!(stats.objects_surviving, 2);
        assert!(heap.find_base(dead.as_ptr() as usize).is_none());
        assert!(heap.find_base(dead_large.as_ptr() as usize).is_none());
        assert!(heap.find_base(fixed.as_ptr() as usize).is_some());
        assert_eq!(heap.allocated_bytes(), 128);
    }

    #[test]
    fn test_heap_limit() {
        let mut heap = Heap::new(PAGE_SIZE);
        assert!(heap.alloc(16, BlockKind::Normal).is_ok());
        assert_eq!(heap.alloc(16, BlockKind::PointerFree), Err(AllocFailure::HeapLimit));
    }

    #[test]
    fn test_oversized_requests_fail_without_mapping() {
        let mut heap = Heap::default();
        for size in [
            usize::MAX,
            usize::MAX - 64,
            usize::MAX - LARGE_OBJECT_OFFSET - PAGE_SIZE,
        ] {
            assert_eq!(heap.alloc(size, BlockKind::Normal), Err(AllocFailure::OutOfMemory));
        }
        assert_eq!(heap.mapped_bytes(), 0);
        assert_eq!(heap.allocated_bytes(), 0);
    }
}
