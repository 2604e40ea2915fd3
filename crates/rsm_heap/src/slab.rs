use core::mem::{align_of, size_of};
use core::ptr::NonNull;

pub(crate) const SLAB_COUNT: usize = 4;
pub(crate) const SLAB_MIN_SIZE: usize = size_of::<usize>();

struct FreeItem {
    next: Option<NonNull<FreeItem>>,
}

/// A self-aligned block of fixed-size items.
///
/// The block's host address is a multiple of its own size, so any item pointer can be
/// masked back down to its owning block's header (`ptr & !(block_size - 1)`) without
/// needing a side table.
struct SlabBlock {
    next: Option<NonNull<SlabBlock>>,
    free_list: Option<NonNull<FreeItem>>,
    bump_offset: usize,
    nfree: usize,
    nitems: usize,
}

impl SlabBlock {
    fn header_items_offset(item_size: usize) -> usize {
        size_of::<SlabBlock>().next_multiple_of(item_size.max(align_of::<SlabBlock>()))
    }
}

/// A single size class of the slab allocator: every item handed out is exactly
/// `item_size` bytes, carved from blocks of `block_size` bytes obtained from the heap's
/// subheap layer. `SlabHeap` itself has no notion of where a block comes from; its caller
/// sources one with [`Self::add_block`] when [`Self::try_alloc`] reports it has none left.
pub(crate) struct SlabHeap {
    item_size: usize,
    block_size: usize,
    usable: Option<NonNull<SlabBlock>>,
    full: Option<NonNull<SlabBlock>>,
}

impl SlabHeap {
    pub(crate) const fn new(item_size: usize, block_size: usize) -> Self {
        Self {
            item_size,
            block_size,
            usable: None,
            full: None,
        }
    }

    pub(crate) fn item_size(&self) -> usize {
        self.item_size
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_of(&self, ptr: NonNull<u8>) -> NonNull<SlabBlock> {
        let mask = !(self.block_size - 1);
        let block_addr = (ptr.as_ptr() as usize) & mask;
        unsafe { NonNull::new_unchecked(block_addr as *mut SlabBlock) }
    }

    /// Installs a self-aligned, `block_size`-byte block obtained by the caller and links
    /// it into the usable list. The caller owns sourcing the backing memory; this only
    /// knows how to lay out a fresh block's header and item pool within it.
    pub(crate) fn add_block(&mut self, block_ptr: NonNull<u8>) {
        let items_offset = SlabBlock::header_items_offset(self.item_size);
        let nitems = (self.block_size - items_offset) / self.item_size;
        let block = unsafe {
            block_ptr.as_ptr().cast::<SlabBlock>().write(SlabBlock {
                next: self.usable,
                free_list: None,
                bump_offset: items_offset,
                nfree: nitems,
                nitems,
            });
            NonNull::new_unchecked(block_ptr.as_ptr().cast::<SlabBlock>())
        };
        self.usable = Some(block);
    }

    /// Hands out one item from an already-usable block, or `None` if every block is full.
    /// The caller is responsible for calling [`Self::add_block`] and retrying when this
    /// returns `None`.
    pub(crate) fn try_alloc(&mut self) -> Option<NonNull<u8>> {
        let mut block_ptr = self.usable?;
        let block = unsafe { block_ptr.as_mut() };
        let item = if let Some(mut free) = block.free_list {
            let free_ref = unsafe { free.as_mut() };
            block.free_list = free_ref.next;
            free.cast::<u8>()
        } else {
            let offset = block.bump_offset;
            block.bump_offset += self.item_size;
            unsafe { NonNull::new_unchecked((block_ptr.as_ptr() as *mut u8).add(offset)) }
        };
        block.nfree -= 1;
        if block.nfree == 0 {
            self.usable = block.next;
            block.next = self.full;
            self.full = Some(block_ptr);
        }
        Some(item)
    }

    pub(crate) fn free(&mut self, ptr: NonNull<u8>) {
        let mut block_ptr = self.block_of(ptr);
        let block = unsafe { block_ptr.as_mut() };
        let was_full = block.nfree == 0;
        let mut item = ptr.cast::<FreeItem>();
        unsafe {
            item.as_mut().next = block.free_list;
        }
        block.free_list = Some(item);
        block.nfree += 1;
        if was_full {
            self.unlink_full(block_ptr);
            block.next = self.usable;
            self.usable = Some(block_ptr);
        }
    }

    fn unlink_full(&mut self, target: NonNull<SlabBlock>) {
        let head = &mut self.full;
        let mut cur = *head;
        let mut prev: Option<NonNull<SlabBlock>> = None;
        while let Some(mut node) = cur {
            let node_ref = unsafe { node.as_mut() };
            if node == target {
                match prev {
                    Some(mut p) => unsafe { p.as_mut().next = node_ref.next },
                    None => *head = node_ref.next,
                }
                return;
            }
            prev = Some(node);
            cur = node_ref.next;
        }
    }

    /// Whether `ptr`'s owning block belongs to this size class. Used only by the
    /// diagnostic classifier; an O(n) scan over both lists is acceptable there.
    pub(crate) fn owns_block(&self, ptr: NonNull<u8>) -> bool {
        let target = self.block_of(ptr);
        [self.usable, self.full].into_iter().any(|list| {
            let mut cur = list;
            while let Some(node) = cur {
                if node == target {
                    return true;
                }
                cur = unsafe { node.as_ref() }.next;
            }
            false
        })
    }

    pub(crate) fn avail_items(&self) -> usize {
        let mut total = 0;
        let mut cur = self.usable;
        while let Some(node) = cur {
            let node_ref = unsafe { node.as_ref() };
            total += node_ref.nfree;
            cur = node_ref.next;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use std::cell::UnsafeCell;
    use std::collections::HashSet;

    use rsm_pagemgr::PageManager;

    use super::*;

    const PAGE_SIZE: usize = 4096;

    #[repr(align(65536))]
    struct Mem(UnsafeCell<[u8; PAGE_SIZE * 64]>);
    unsafe impl Sync for Mem {}

    fn new_pm() -> PageManager<PAGE_SIZE> {
        let mem = Box::leak(Box::new(Mem(UnsafeCell::new([0; PAGE_SIZE * 64]))));
        let ptr = mem.0.get().cast::<u8>();
        unsafe { PageManager::<PAGE_SIZE>::new(ptr, PAGE_SIZE * 64).unwrap() }
    }

    /// Stands in for the heap's `acquire_slab_block`: sources a fresh block straight
    /// from the page manager rather than a subheap, since these tests exercise
    /// `SlabHeap` in isolation.
    fn alloc(slab: &mut SlabHeap, pm: &PageManager<PAGE_SIZE>) -> Option<NonNull<u8>> {
        if let Some(item) = slab.try_alloc() {
            return Some(item);
        }
        let block = pm.alloc_pages(slab.block_size() / PAGE_SIZE).ok()?;
        slab.add_block(block);
        slab.try_alloc()
    }

    #[test]
    fn grows_on_demand_and_hands_out_distinct_items() {
        let pm = new_pm();
        let mut slab = SlabHeap::new(64, PAGE_SIZE * 16);

        let mut seen = HashSet::new();
        for _ in 0..8 {
            let item = alloc(&mut slab, &pm).unwrap();
            assert!(seen.insert(item.as_ptr().addr()));
        }
    }

    #[test]
    fn freed_items_are_recycled_before_bumping_further() {
        let pm = new_pm();
        let mut slab = SlabHeap::new(64, PAGE_SIZE * 16);

        let a = alloc(&mut slab, &pm).unwrap();
        let b = alloc(&mut slab, &pm).unwrap();
        slab.free(a);

        let recycled = alloc(&mut slab, &pm).unwrap();
        assert_eq!(recycled.as_ptr(), a.as_ptr());
        slab.free(b);
        slab.free(recycled);
    }

    #[test]
    fn full_block_moves_off_the_usable_list_and_back_on_free() {
        let pm = new_pm();
        let mut slab = SlabHeap::new(4096, PAGE_SIZE * 4);

        let mut items = vec![];
        while slab.avail_items() > 0 || items.is_empty() {
            match alloc(&mut slab, &pm) {
                Some(p) => items.push(p),
                None => break,
            }
        }
        assert!(slab.owns_block(items[0]));
        assert_eq!(slab.avail_items(), 0);

        let last = items.pop().unwrap();
        slab.free(last);
        assert!(slab.avail_items() > 0);
        for p in items {
            slab.free(p);
        }
    }
}
