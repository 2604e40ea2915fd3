//! A kernel-style heap allocator layered over [`rsm_pagemgr::PageManager`].
//!
//! Small, fixed-size requests are served from one of a handful of slab size classes;
//! everything else comes from a chunk-granular free list ("subheap"). Slab classes grow
//! by drawing a block from the subheap layer rather than the page manager directly, so
//! the two share one free pool; only the subheap layer itself draws fresh pages from a
//! [`rsm_pagemgr::PageManager`], on demand, so the heap grows lazily instead of claiming
//! all of its eventual memory up front.

#![cfg_attr(not(test), no_std)]

mod bitset;
mod error;
mod slab;
mod subheap;

use core::ptr::NonNull;

pub use error::HeapError;
use rsm_pagemgr::PageManager;
use rsm_sync::SpinMutex;
use slab::{SLAB_COUNT, SLAB_MIN_SIZE, SlabHeap};
use subheap::{CHUNK_SIZE, Subheap};
#[cfg(test)]
use subheap::BEST_FIT_THRESHOLD;

#[cfg(feature = "scrub")]
const ALLOC_SCRUB_BYTE: u8 = 0xbb;
#[cfg(feature = "scrub")]
const FREE_SCRUB_BYTE: u8 = 0xaa;

const fn slab_block_size(page_size: usize) -> usize {
    page_size * 16
}

const fn heap_max_align(page_size: usize) -> usize {
    let block = slab_block_size(page_size);
    if page_size > block { page_size } else { block }
}

const fn max_slab_size() -> usize {
    SLAB_MIN_SIZE << (SLAB_COUNT - 1)
}

/// Rounds `size` up to the granularity the heap would actually hand out for it: the next
/// power-of-two slab class if it's small enough to qualify, otherwise the next multiple
/// of [`subheap`]'s chunk size.
fn alloc_granularity(size: usize) -> usize {
    let size = size.max(1);
    if size <= max_slab_size() {
        size.max(SLAB_MIN_SIZE).next_power_of_two()
    } else {
        size.next_multiple_of(CHUNK_SIZE)
    }
}

/// The scrub state of a pointer previously returned by a [`HeapAllocator`], as reported
/// by [`HeapAllocator::classify`]. Diagnostic only: built by sampling the region's
/// leading bytes against the alloc/free scrub sentinels, so it's a heuristic, not proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryState {
    /// Leading bytes match neither scrub sentinel, or scrubbing is disabled.
    Ok,
    /// Leading bytes still carry the alloc-scrub pattern: `ptr` looks like it hasn't
    /// been written to since it was handed out.
    PossiblyUninit,
    /// Leading bytes carry the free-scrub pattern: `ptr` looks like it was freed and
    /// never reallocated, so reading or writing through it now is a likely
    /// use-after-free.
    PossiblyFreed,
}

struct Inner<'pm, const PAGE_SIZE: usize> {
    pm: &'pm PageManager<PAGE_SIZE>,
    subheaps: Option<NonNull<Subheap>>,
    slabs: [SlabHeap; SLAB_COUNT],
}

/// A heap allocator drawing pages from a [`PageManager`] as it grows.
///
/// `PAGE_SIZE` must match the page manager it was built with.
pub struct HeapAllocator<'pm, const PAGE_SIZE: usize = 4096> {
    inner: SpinMutex<Inner<'pm, PAGE_SIZE>>,
}

unsafe impl<const PAGE_SIZE: usize> Send for HeapAllocator<'_, PAGE_SIZE> {}
unsafe impl<const PAGE_SIZE: usize> Sync for HeapAllocator<'_, PAGE_SIZE> {}

impl<'pm, const PAGE_SIZE: usize> HeapAllocator<'pm, PAGE_SIZE> {
    /// Builds a heap allocator seeded with at least `min_initmem` bytes drawn from `pm`.
    /// Further allocations grow the heap from `pm` automatically as needed.
    pub fn new(pm: &'pm PageManager<PAGE_SIZE>, min_initmem: usize) -> Result<Self, HeapError> {
        let min_pages = min_subheap_pages::<PAGE_SIZE>();
        let req_pages = min_initmem
            .div_ceil(PAGE_SIZE)
            .max(min_pages)
            .next_power_of_two();
        let (ptr, npages) = pm
            .alloc_pages_min(req_pages, min_pages)
            .map_err(|_| HeapError::OutOfMemory)?;

        let subheap = unsafe { Subheap::place(ptr, npages * PAGE_SIZE, heap_max_align(PAGE_SIZE)) };
        let slabs = core::array::from_fn(|i| {
            SlabHeap::new(SLAB_MIN_SIZE << i, slab_block_size(PAGE_SIZE))
        });

        Ok(Self {
            inner: SpinMutex::new(Inner {
                pm,
                subheaps: Some(subheap),
                slabs,
            }),
        })
    }

    /// The granularity [`Self::alloc`] would actually allocate for a request of `size`
    /// bytes: the slab class it rounds up to, or the chunk multiple.
    pub fn alloc_size(size: usize) -> usize {
        alloc_granularity(size)
    }

    /// Allocates `size` bytes aligned to `size_of::<usize>()`.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.alloc_aligned(size, align_of::<usize>())
    }

    /// Allocates `size` bytes aligned to `align`, a power of two no larger than `PAGE_SIZE`.
    pub fn alloc_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        if size == 0 || align == 0 || !align.is_power_of_two() || align > PAGE_SIZE {
            debug_assert!(false, "alloc_aligned: invalid request size={size} align={align}");
            return Err(HeapError::InvalidArgument { alignment: align });
        }

        let rounded = alloc_granularity(size);
        let mut inner = self.inner.lock();

        if rounded <= max_slab_size() && align <= rounded {
            let idx = (rounded / SLAB_MIN_SIZE).trailing_zeros() as usize;
            if let Some(ptr) = inner.alloc_from_slab(idx) {
                scrub(ptr, rounded, ScrubKind::Alloc);
                log::trace!("heap alloc size={size} align={align} -> slab[{idx}]");
                return Ok(ptr);
            }
        }

        if let Some(ptr) = inner.alloc_from_subheaps(rounded, align) {
            scrub(ptr, rounded, ScrubKind::Alloc);
            return Ok(ptr);
        }

        inner.try_expand(rounded.max(align))?;
        let ptr = inner
            .alloc_from_subheaps(rounded, align)
            .ok_or(HeapError::OutOfMemory)?;
        scrub(ptr, rounded, ScrubKind::Alloc);
        Ok(ptr)
    }

    /// Frees `size` bytes previously returned by [`Self::alloc`] or [`Self::alloc_aligned`]
    /// for that same `size`.
    pub fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<(), HeapError> {
        let rounded = alloc_granularity(size);
        scrub(ptr, rounded, ScrubKind::Free);
        let mut inner = self.inner.lock();

        // `rounded` alone doesn't prove the allocation went through the slab path: a
        // small size with an alignment larger than its slab class forces `alloc_aligned`
        // to fall back to a subheap, since slab items are only self-aligned to their own
        // size. `owns_block` confirms the pointer actually lives in that class's blocks
        // before trusting the slab free path.
        if rounded <= max_slab_size() {
            let idx = (rounded / SLAB_MIN_SIZE).trailing_zeros() as usize;
            if inner.slabs[idx].owns_block(ptr) {
                inner.slabs[idx].free(ptr);
                return Ok(());
            }
        }

        let mut cur = inner.subheaps;
        while let Some(node) = cur {
            let sh = unsafe { node.as_ref() };
            if sh.contains(ptr) {
                sh.free(ptr, rounded);
                return Ok(());
            }
            cur = sh.next;
        }
        Err(HeapError::InvalidRegion)
    }

    /// Diagnoses whether `ptr` looks uninitialized or already freed, by sampling its
    /// leading bytes against the scrub sentinels. Only meaningful with the `scrub`
    /// feature enabled; without it, allocations are never stamped, so this always
    /// reports `Ok`. Never used on the fast path.
    pub fn classify(&self, ptr: NonNull<u8>) -> MemoryState {
        classify_scrub(ptr)
    }

    /// Bytes currently free across all subheaps. Slab-class memory isn't tracked here,
    /// matching the original allocator's own `kmem_avail`.
    pub fn avail_bytes(&self) -> usize {
        let inner = self.inner.lock();
        let mut total = 0;
        let mut cur = inner.subheaps;
        while let Some(node) = cur {
            let sh = unsafe { node.as_ref() };
            total += sh.avail_bytes();
            cur = sh.next;
        }
        total
    }

    /// Total subheap capacity, in bytes.
    pub fn capacity_bytes(&self) -> usize {
        let inner = self.inner.lock();
        let mut total = 0;
        let mut cur = inner.subheaps;
        while let Some(node) = cur {
            let sh = unsafe { node.as_ref() };
            total += sh.capacity_bytes();
            cur = sh.next;
        }
        total
    }
}

fn min_subheap_pages<const PAGE_SIZE: usize>() -> usize {
    Subheap::MIN_SIZE.div_ceil(PAGE_SIZE).max(1).next_power_of_two()
}

impl<const PAGE_SIZE: usize> Inner<'_, PAGE_SIZE> {
    fn alloc_from_subheaps(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let mut cur = self.subheaps;
        while let Some(node) = cur {
            let sh = unsafe { node.as_ref() };
            if let Some(ptr) = sh.alloc(size, align) {
                return Some(ptr);
            }
            cur = sh.next;
        }
        None
    }

    /// Hands out one item from slab class `idx`, growing it from the subheap layer first
    /// if every block it already holds is full. `None` means the subheap layer itself
    /// had no room and couldn't be expanded either; the caller falls back to a direct
    /// subheap allocation of the same rounded size, so this never reports `OutOfMemory`
    /// on its own.
    fn alloc_from_slab(&mut self, idx: usize) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.slabs[idx].try_alloc() {
            return Some(ptr);
        }
        self.acquire_slab_block(idx)?;
        self.slabs[idx].try_alloc()
    }

    /// Sources one more self-aligned block for slab class `idx` from the heap's own
    /// subheap layer, falling back to expanding that layer from the page manager if it
    /// has no room — mirroring the original allocator's `kmem_heapalloc` path, which
    /// grows a slab class through the general heap rather than going to the page
    /// manager directly.
    fn acquire_slab_block(&mut self, idx: usize) -> Option<()> {
        let block_size = self.slabs[idx].block_size();
        let block_ptr = match self.alloc_from_subheaps(block_size, block_size) {
            Some(ptr) => ptr,
            None => {
                self.try_expand(block_size).ok()?;
                self.alloc_from_subheaps(block_size, block_size)?
            }
        };
        self.slabs[idx].add_block(block_ptr);
        Some(())
    }

    /// Grows the heap by pulling another page run from the page manager and adding it as
    /// a new subheap. This is the heap's last resort before reporting failure to the
    /// caller: there's nowhere further to fall back to.
    fn try_expand(&mut self, min_size: usize) -> Result<(), HeapError> {
        let req_pages = min_size.div_ceil(PAGE_SIZE).max(1).next_power_of_two();
        let min_pages = min_subheap_pages::<PAGE_SIZE>();
        let (ptr, npages) = self
            .pm
            .alloc_pages_min(req_pages, min_pages)
            .map_err(|_| HeapError::OutOfMemory)?;

        let mut node = unsafe { Subheap::place(ptr, npages * PAGE_SIZE, heap_max_align(PAGE_SIZE)) };
        unsafe {
            node.as_mut().next = self.subheaps;
        }
        self.subheaps = Some(node);
        log::debug!("heap expanded by {npages} pages");
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum ScrubKind {
    Alloc,
    Free,
}

#[cfg(feature = "scrub")]
fn scrub(ptr: NonNull<u8>, len: usize, kind: ScrubKind) {
    let byte = match kind {
        ScrubKind::Alloc => ALLOC_SCRUB_BYTE,
        ScrubKind::Free => FREE_SCRUB_BYTE,
    };
    unsafe {
        ptr.as_ptr().write_bytes(byte, len);
    }
}

#[cfg(not(feature = "scrub"))]
fn scrub(_ptr: NonNull<u8>, _len: usize, _kind: ScrubKind) {}

/// Width of the sample window `classify` inspects. Every size class this allocator ever
/// hands out, slab or subheap, is at least this many bytes, so the read never runs past
/// the end of a genuinely live allocation.
#[cfg(feature = "scrub")]
const SCRUB_SAMPLE_LEN: usize = core::mem::size_of::<usize>();

#[cfg(feature = "scrub")]
fn classify_scrub(ptr: NonNull<u8>) -> MemoryState {
    let sample = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), SCRUB_SAMPLE_LEN) };
    if sample.iter().all(|&b| b == FREE_SCRUB_BYTE) {
        MemoryState::PossiblyFreed
    } else if sample.iter().all(|&b| b == ALLOC_SCRUB_BYTE) {
        MemoryState::PossiblyUninit
    } else {
        MemoryState::Ok
    }
}

#[cfg(not(feature = "scrub"))]
fn classify_scrub(_ptr: NonNull<u8>) -> MemoryState {
    MemoryState::Ok
}
