//! A binary buddy page allocator over a caller-supplied, contiguous host byte range.
//!
//! The allocator never asks the host OS for memory itself: acquiring the backing range is
//! the caller's job (see [`PageManager::new`]). This mirrors how a kernel's own page
//! allocator is handed physical memory by the boot loader rather than calling `mmap`.

#![cfg_attr(not(test), no_std)]

mod bitset;
mod error;

use core::ptr::NonNull;

use bitset::BitsetView;
pub use error::PmError;
use rsm_sync::SpinMutex;

/// The largest pow2 order of page size used by the buddy tree.
///
/// This has almost no impact on capacity: most of the managed range ends up in blocks near
/// the top order regardless of how high `MAX_ORDER` is set, since `rmm_create`'s freelist
/// seeding always peels off the largest available power of two first.
pub const MAX_ORDER: u32 = 20;

const ORDER_COUNT: usize = MAX_ORDER as usize + 1;

struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

struct OrderState {
    free_list: Option<NonNull<FreeNode>>,
    bitset: BitsetView,
}

struct Inner<const PAGE_SIZE: usize> {
    start_addr: usize,
    end_addr: usize,
    free_bytes: usize,
    orders: [OrderState; ORDER_COUNT],
    _page_size: core::marker::PhantomData<[(); PAGE_SIZE]>,
}

/// A binary buddy allocator managing page runs over `[start, end)`.
///
/// `PAGE_SIZE` is the smallest (order-0) block size and must be a power of two.
pub struct PageManager<const PAGE_SIZE: usize = 4096> {
    inner: SpinMutex<Inner<PAGE_SIZE>>,
}

unsafe impl<const PAGE_SIZE: usize> Send for PageManager<PAGE_SIZE> {}
unsafe impl<const PAGE_SIZE: usize> Sync for PageManager<PAGE_SIZE> {}

const fn is_pow2(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

fn floor_pow2(n: usize) -> usize {
    debug_assert!(n > 0);
    1usize << (usize::BITS - 1 - n.leading_zeros())
}

fn order_of(npages: usize) -> u32 {
    debug_assert!(is_pow2(npages));
    npages.trailing_zeros()
}

impl<const PAGE_SIZE: usize> PageManager<PAGE_SIZE> {
    /// Creates a page manager over `[start, start + len)`.
    ///
    /// Per-order bitset metadata is carved out of the high end of the range, shrinking the
    /// range actually available for page allocation. Returns [`PmError::RangeTooSmall`] if
    /// the range cannot hold that metadata plus at least one page.
    ///
    /// # Safety
    ///
    /// `start` must be a valid pointer to `len` bytes that are exclusively owned by the
    /// returned `PageManager` for its entire lifetime.
    pub unsafe fn new(start: *mut u8, len: usize) -> Result<Self, PmError> {
        assert!(is_pow2(PAGE_SIZE));

        let raw_start = start.addr();
        let aligned_start = raw_start.next_multiple_of(PAGE_SIZE);
        let end = raw_start + len;
        if aligned_start >= end {
            return Err(PmError::RangeTooSmall);
        }
        let mut memsize = end - aligned_start;

        let nchunks = memsize / PAGE_SIZE;
        let bset_nbytes = nchunks / 8;
        const BSET_EXTRA_NBYTES: usize = 2;
        let bitset_size = |order: u32| (bset_nbytes >> order) + BSET_EXTRA_NBYTES;

        let mut bset_total_size = 0usize;
        for order in 0..ORDER_COUNT as u32 {
            bset_total_size += bitset_size(order);
        }

        memsize = memsize
            .checked_sub(bset_total_size + PAGE_SIZE)
            .ok_or(PmError::RangeTooSmall)?;
        memsize -= memsize % PAGE_SIZE;
        if memsize == 0 {
            return Err(PmError::RangeTooSmall);
        }

        let mut bitset_cursor = end - bset_total_size;
        let orders: [OrderState; ORDER_COUNT] = core::array::from_fn(|order| {
            let size = bitset_size(order as u32);
            let view = unsafe {
                BitsetView::new(NonNull::new(bitset_cursor as *mut u8).unwrap(), size)
            };
            view.zero();
            bitset_cursor += size;
            OrderState {
                free_list: None,
                bitset: view,
            }
        });

        let mut inner = Inner::<PAGE_SIZE> {
            start_addr: aligned_start,
            end_addr: aligned_start + memsize,
            free_bytes: memsize,
            orders,
            _page_size: core::marker::PhantomData,
        };

        // Seed freelists: peel off the largest representable power-of-two run repeatedly.
        let mut npages_total = memsize / PAGE_SIZE;
        let mut cursor = aligned_start;
        let max_order_npages = 1usize << MAX_ORDER;
        while npages_total > 0 {
            let npages = floor_pow2(npages_total).min(max_order_npages);
            npages_total -= npages;
            let order = order_of(npages);
            let block_size = PAGE_SIZE << order;

            let mut node = NonNull::new(cursor as *mut FreeNode).unwrap();
            let state = &mut inner.orders[order as usize];
            unsafe {
                node.as_mut().next = state.free_list;
            }
            state.free_list = Some(node);

            let bit = (cursor - aligned_start) / block_size;
            state.bitset.clear(bit);
            state.bitset.set(bit + 1);

            cursor += block_size;
        }

        Ok(Self {
            inner: SpinMutex::new(inner),
        })
    }

    /// Allocates a page-aligned run of `npages` contiguous pages. `npages` must be a power
    /// of two.
    pub fn alloc_pages(&self, npages: usize) -> Result<NonNull<u8>, PmError> {
        if npages == 0 || !is_pow2(npages) || order_of(npages) > MAX_ORDER {
            debug_assert!(false, "alloc_pages: invalid npages {npages}");
            return Err(PmError::InvalidArgument { npages });
        }
        let order = order_of(npages);

        let mut inner = self.inner.lock();
        let addr = inner.alloc_order(order)?;
        inner.free_bytes -= npages * PAGE_SIZE;
        log::trace!("alloc_pages({npages}) -> {addr:#x}");
        Ok(NonNull::new(addr as *mut u8).unwrap())
    }

    /// Tries `ceil_pow2(req_npages)` first, then halves the request down to `min_npages`
    /// until an allocation succeeds. Returns the actual page count allocated.
    pub fn alloc_pages_min(
        &self,
        req_npages: usize,
        min_npages: usize,
    ) -> Result<(NonNull<u8>, usize), PmError> {
        let min_npages = min_npages.max(1);
        // A request past `MAX_ORDER` is handled the same way as ordinary exhaustion: clamp
        // to the largest representable order and let the halving loop below work down from
        // there, rather than bouncing it straight to `InvalidArgument`.
        let mut npages = req_npages
            .next_power_of_two()
            .min(1usize << MAX_ORDER);
        loop {
            match self.alloc_pages(npages) {
                Ok(ptr) => return Ok((ptr, npages)),
                Err(PmError::OutOfMemory) if npages > min_npages => npages >>= 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Frees a run of pages previously returned by [`Self::alloc_pages`] or
    /// [`Self::alloc_pages_min`].
    ///
    /// The order the run was allocated at is not needed: it is recovered by scanning each
    /// order's bitset from order 0 upward, the same way the original allocator's free path
    /// does, rather than trusting a caller-supplied page count.
    ///
    /// # Safety
    ///
    /// `ptr` must be a pointer previously returned by this allocator, not yet freed.
    pub unsafe fn free_pages(&self, ptr: NonNull<u8>) {
        let mut inner = self.inner.lock();
        let addr = ptr.as_ptr().addr();
        debug_assert!(addr >= inner.start_addr && addr < inner.end_addr);
        let rel_addr = addr - inner.start_addr;
        let order = inner.discover_order(rel_addr);
        let freed_order = inner.free_order(rel_addr, order);
        inner.free_bytes += PAGE_SIZE << freed_order;
        log::trace!("free_pages() <- {addr:#x}");
    }

    /// Total page capacity of the managed range (after metadata overhead).
    pub fn capacity_pages(&self) -> usize {
        let inner = self.inner.lock();
        (inner.end_addr - inner.start_addr) / PAGE_SIZE
    }

    /// Currently free page count, summed across all orders.
    pub fn free_pages_total(&self) -> usize {
        self.inner.lock().free_bytes / PAGE_SIZE
    }

    /// The largest contiguous free run currently available, in pages.
    pub fn free_pages_largest_run(&self) -> usize {
        let inner = self.inner.lock();
        let mut best = 0usize;
        for (order, state) in inner.orders.iter().enumerate() {
            if state.free_list.is_some() {
                best = best.max(1usize << order);
            }
        }
        best
    }

    /// The first address managed by this allocator (after metadata carve-out).
    pub fn start_address(&self) -> usize {
        self.inner.lock().start_addr
    }
}

impl<const PAGE_SIZE: usize> Inner<PAGE_SIZE> {
    /// Recovers the order a block at `rel_addr` was allocated at.
    ///
    /// `alloc_order` only ever sets the bit at the order it actually allocated at; every
    /// finer order's bit for the same address is left clear, since no allocation has ever
    /// happened at that granularity there. So the allocation's own order is the first,
    /// scanning from order 0 upward, whose bit for this address is set.
    fn discover_order(&self, rel_addr: usize) -> u32 {
        for order in 0..ORDER_COUNT as u32 {
            let bit = rel_addr / (PAGE_SIZE << order);
            if self.orders[order as usize].bitset.get(bit) {
                return order;
            }
        }
        unreachable!("freed address not allocated at any order")
    }

    /// Allocates a block at `order`, splitting a larger block if none is free. Returns the
    /// block's address relative to `start_addr`... no: returns the absolute address.
    fn alloc_order(&mut self, order: u32) -> Result<usize, PmError> {
        if order > MAX_ORDER {
            return Err(PmError::OutOfMemory);
        }

        let addr = if let Some(mut node) = self.orders[order as usize].free_list {
            self.orders[order as usize].free_list = unsafe { node.as_mut().next };
            (node.as_ptr()).addr()
        } else {
            let parent_addr = self.alloc_order(order + 1)?;
            let size = PAGE_SIZE << order;
            let buddy_addr = parent_addr + size;
            let mut buddy = NonNull::new(buddy_addr as *mut FreeNode).unwrap();
            unsafe {
                buddy.as_mut().next = self.orders[order as usize].free_list;
            }
            self.orders[order as usize].free_list = Some(buddy);
            parent_addr
        };

        let bit = (addr - self.start_addr) / (PAGE_SIZE << order);
        debug_assert!(!self.orders[order as usize].bitset.get(bit));
        self.orders[order as usize].bitset.set(bit);
        Ok(addr)
    }

    /// Frees the block at `rel_addr` (relative to `start_addr`) known to have been
    /// allocated at `order`, merging with its buddy while possible. Returns the order at
    /// which the block ended up after merging (used to credit `free_bytes` correctly, since
    /// merges only ever grow the order of a single freed block).
    fn free_order(&mut self, rel_addr: usize, order: u32) -> u32 {
        debug_assert!(order <= MAX_ORDER);
        let block_size = PAGE_SIZE << order;
        let bit = rel_addr / block_size;
        self.orders[order as usize].bitset.clear(bit);

        let buddy_rel = rel_addr ^ block_size;
        let buddy_bit = buddy_rel / block_size;
        if order < MAX_ORDER && !self.orders[order as usize].bitset.get(buddy_bit) {
            // Buddy is free: unlink it and merge upward.
            let buddy_addr = self.start_addr + buddy_rel;
            self.unlink(order, buddy_addr);
            let merged_rel = rel_addr.min(buddy_rel);
            self.free_order(merged_rel, order + 1)
        } else {
            let mut node = NonNull::new((self.start_addr + rel_addr) as *mut FreeNode).unwrap();
            unsafe {
                node.as_mut().next = self.orders[order as usize].free_list;
            }
            self.orders[order as usize].free_list = Some(node);
            order
        }
    }

    /// Removes the node at `addr` from `orders[order]`'s freelist.
    ///
    /// The freelist is singly linked, so this is a linear scan; buddy lists are typically
    /// short since most memory lives near the top order after `new`'s seeding pass.
    fn unlink(&mut self, order: u32, addr: usize) {
        let state = &mut self.orders[order as usize];
        let target = addr as *mut FreeNode;

        match state.free_list {
            Some(head) if head.as_ptr() == target => {
                state.free_list = unsafe { head.as_ref().next };
                return;
            }
            _ => {}
        }

        let mut cur = state.free_list;
        while let Some(mut node) = cur {
            let next = unsafe { node.as_mut().next };
            if let Some(next_node) = next {
                if next_node.as_ptr() == target {
                    unsafe {
                        node.as_mut().next = next_node.as_ref().next;
                    }
                    return;
                }
            }
            cur = next;
        }
        unreachable!("freed buddy not found on its freelist");
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::UnsafeCell, collections::HashSet};

    use super::*;

    const PAGE_SIZE: usize = 4096;

    #[repr(align(4096))]
    struct Heap(UnsafeCell<[u8; PAGE_SIZE * 256]>);
    unsafe impl Sync for Heap {}

    fn new_pm() -> PageManager<PAGE_SIZE> {
        let heap = Box::leak(Box::new(Heap(UnsafeCell::new([0; PAGE_SIZE * 256]))));
        let ptr = heap.0.get().cast::<u8>();
        unsafe { PageManager::<PAGE_SIZE>::new(ptr, PAGE_SIZE * 256).unwrap() }
    }

    #[test]
    fn alloc_free_roundtrip_is_idempotent() {
        let pm = new_pm();
        let cap = pm.capacity_pages();
        let initial_largest_run = pm.free_pages_largest_run();
        let p1 = pm.alloc_pages(4).unwrap();
        unsafe { pm.free_pages(p1) };
        let p2 = pm.alloc_pages(4).unwrap();
        assert_eq!(p1, p2);
        unsafe { pm.free_pages(p2) };
        assert_eq!(pm.free_pages_total(), cap);
        assert_eq!(pm.free_pages_largest_run(), initial_largest_run);
    }

    #[test]
    fn sixteen_interleaved_allocations_coalesce_fully() {
        let pm = new_pm();
        let cap = pm.capacity_pages();
        let initial_largest_run = pm.free_pages_largest_run();

        let mut ptrs = vec![];
        let mut addrs = HashSet::new();
        for _ in 0..16 {
            let p = pm.alloc_pages(4).unwrap();
            assert!(addrs.insert(p.as_ptr().addr()));
            assert_eq!(p.as_ptr().addr() % (4 * PAGE_SIZE), 0);
            ptrs.push(p);
        }
        let extra = pm.alloc_pages(1).unwrap();

        // tip-tap free order: 0, 15, 2, 13, 4, 11, 6, 9, 8, 7, 10, 5, 12, 3, 14, 1
        for i in 0..16 {
            let idx = if i % 2 == 1 { 16 - i } else { i };
            unsafe { pm.free_pages(ptrs[idx]) };
        }
        unsafe { pm.free_pages(extra) };

        assert_eq!(pm.free_pages_total(), cap);
        assert_eq!(pm.free_pages_largest_run(), initial_largest_run);
    }

    #[test]
    fn allocation_exhausts_and_reports_out_of_memory() {
        let pm = new_pm();
        let cap = pm.capacity_pages();
        let initial_largest_run = pm.free_pages_largest_run();
        let mut ptrs = vec![];
        loop {
            match pm.alloc_pages(1) {
                Ok(p) => ptrs.push(p),
                Err(PmError::OutOfMemory) => break,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert_eq!(ptrs.len(), cap);
        for p in ptrs {
            unsafe { pm.free_pages(p) };
        }
        assert_eq!(pm.free_pages_largest_run(), initial_largest_run);
    }

    #[test]
    fn non_power_of_two_is_rejected() {
        let pm = new_pm();
        assert_eq!(
            pm.alloc_pages(3),
            Err(PmError::InvalidArgument { npages: 3 })
        );
    }

    #[test]
    fn largest_representable_block_round_trips_cleanly() {
        let pm = new_pm();

        // The managed range's own largest representable order: one allocation as big as
        // `free_pages_largest_run` ever gets here, standing in for an allocation at
        // `MAX_ORDER` on a range actually large enough to reach it.
        let npages = pm.free_pages_largest_run();
        assert!(npages > 0 && is_pow2(npages));

        let total_before = pm.free_pages_total();
        let p = pm.alloc_pages(npages).unwrap();
        assert_eq!(p.as_ptr().addr() % (npages * PAGE_SIZE), 0);
        assert_eq!(pm.free_pages_total(), total_before - npages);

        unsafe { pm.free_pages(p) };
        assert_eq!(pm.free_pages_total(), total_before);
        assert_eq!(pm.free_pages_largest_run(), npages);
    }

    #[test]
    fn alloc_pages_min_falls_back_to_smaller_orders() {
        let pm = new_pm();
        let cap = pm.capacity_pages();

        // Reserve all but 3 single pages so a request for 4 must fall back to 2 (or 1).
        let mut singles = vec![];
        for _ in 0..(cap - 3) {
            singles.push(pm.alloc_pages(1).unwrap());
        }
        assert_eq!(pm.free_pages_total(), 3);

        let (p, n) = pm.alloc_pages_min(4, 1).unwrap();
        assert!(n < 4);
        unsafe { pm.free_pages(p) };

        for s in singles {
            unsafe { pm.free_pages(s) };
        }
    }
}
