use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use crate::bitset::ChunkBitset;

#[cfg(target_pointer_width = "64")]
pub(crate) const CHUNK_SIZE: usize = 64;
#[cfg(not(target_pointer_width = "64"))]
pub(crate) const CHUNK_SIZE: usize = 32;

/// Allocations at or above this many chunks use a best-fit search; below it, first-fit.
///
/// First-fit keeps small, frequent allocations cheap to place; best-fit keeps large, rarer
/// ones from fragmenting the chunk space into unusable slivers.
pub(crate) const BEST_FIT_THRESHOLD: usize = 128;

/// A chunk-granular free-list heap carved out of one contiguous host region.
///
/// `data` holds `chunk_cap` chunks of `CHUNK_SIZE` bytes; the use-bitset for those chunks
/// is appended immediately after them, inside the same region `heap_init` was given.
pub(crate) struct Subheap {
    pub(crate) next: Option<NonNull<Subheap>>,
    data: NonNull<u8>,
    chunk_cap: usize,
    bitset: ChunkBitset,
}

/// Splits `size` bytes into a chunk region and a trailing use-bitset, the way
/// `heap_init` in the original allocator does: start from the largest chunk count that
/// could fit if the bitset were free, then shrink by doubling steps until the bitset
/// actually fits after the chunks it describes.
fn layout(size: usize) -> (usize, usize) {
    let mut chunk_cap = size / CHUNK_SIZE - 1;
    let mut step = 1usize;
    loop {
        let bitset_end = chunk_cap * CHUNK_SIZE + chunk_cap.div_ceil(8);
        if bitset_end <= size {
            return (chunk_cap, chunk_cap * CHUNK_SIZE);
        }
        chunk_cap -= step;
        step *= 2;
    }
}

impl Subheap {
    pub(crate) const MIN_SIZE: usize = CHUNK_SIZE * 2;

    /// Carves a `Subheap` header and its chunk region out of one host byte range and
    /// links it in, the way `kmem_add_subheap` does.
    ///
    /// The header itself has to live somewhere inside `storage`, since there is no
    /// allocator to hand it memory from (this crate *is* the allocator). If `storage` is
    /// already aligned to `max_align`, the header is placed at the high end so the chunk
    /// region keeps that alignment; otherwise the header goes at the low end and the
    /// chunk region starts at the next `max_align` boundary.
    ///
    /// # Safety
    ///
    /// `storage` must point to `size` valid, writable bytes not referenced by anything
    /// else for as long as the returned `Subheap` (and the chunks it hands out) are alive.
    /// `size` must be at least [`Self::MIN_SIZE`] plus the header's own footprint.
    pub(crate) unsafe fn place(storage: NonNull<u8>, size: usize, max_align: usize) -> NonNull<Subheap> {
        let base = storage.as_ptr() as usize;
        let header_size = size_of::<Subheap>().next_multiple_of(align_of::<Subheap>());

        let (header_addr, data_addr, data_size) = if base % max_align == 0 {
            let header_addr = (base + size - header_size) & !(align_of::<Subheap>() - 1);
            (header_addr, base, header_addr - base)
        } else {
            let data_addr = (base + header_size).next_multiple_of(max_align);
            (base, data_addr, base + size - data_addr)
        };

        debug_assert!(data_size >= Self::MIN_SIZE);
        let (chunk_cap, bitset_offset) = layout(data_size);
        let data = unsafe { NonNull::new_unchecked(data_addr as *mut u8) };
        let bitset_bytes = unsafe { NonNull::new_unchecked(data.as_ptr().add(bitset_offset)) };
        let bitset = unsafe { ChunkBitset::new(bitset_bytes, chunk_cap) };

        unsafe {
            let header_ptr = header_addr as *mut Subheap;
            header_ptr.write(Subheap {
                next: None,
                data,
                chunk_cap,
                bitset,
            });
            NonNull::new_unchecked(header_ptr)
        }
    }

    pub(crate) fn contains(&self, ptr: NonNull<u8>) -> bool {
        let base = self.data.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= base && addr < base + self.chunk_cap * CHUNK_SIZE
    }

    pub(crate) fn capacity_bytes(&self) -> usize {
        self.chunk_cap * CHUNK_SIZE
    }

    pub(crate) fn avail_bytes(&self) -> usize {
        (0..self.chunk_cap)
            .filter(|&chunk| !self.bitset.get(chunk))
            .count()
            * CHUNK_SIZE
    }

    pub(crate) fn alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let nchunks = size.div_ceil(CHUNK_SIZE).max(1);
        let chunk_align = (align / CHUNK_SIZE).max(1);
        let start = if nchunks < BEST_FIT_THRESHOLD {
            self.bitset.find_first_fit(nchunks, chunk_align)
        } else {
            self.bitset.find_best_fit(nchunks, chunk_align)
        }?;
        self.bitset.set_range(start, nchunks, true);
        Some(unsafe { NonNull::new_unchecked(self.data.as_ptr().add(start * CHUNK_SIZE)) })
    }

    pub(crate) fn free(&self, ptr: NonNull<u8>, size: usize) {
        let nchunks = size.div_ceil(CHUNK_SIZE).max(1);
        let offset = ptr.as_ptr() as usize - self.data.as_ptr() as usize;
        debug_assert_eq!(offset % CHUNK_SIZE, 0);
        self.bitset.set_range(offset / CHUNK_SIZE, nchunks, false);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::UnsafeCell;

    use super::*;

    #[repr(align(4096))]
    struct Storage(UnsafeCell<[u8; 4096]>);
    unsafe impl Sync for Storage {}

    fn place_subheap(storage: &'static Storage, max_align: usize) -> NonNull<Subheap> {
        let ptr = unsafe { NonNull::new_unchecked(storage.0.get().cast::<u8>()) };
        unsafe { Subheap::place(ptr, 4096, max_align) }
    }

    #[test]
    fn alloc_and_free_round_trip() {
        static STORAGE: Storage = Storage(UnsafeCell::new([0; 4096]));
        let sh = unsafe { place_subheap(&STORAGE, 1).as_ref() };

        let p = sh.alloc(CHUNK_SIZE, 1).unwrap();
        assert!(sh.contains(p));
        sh.free(p, CHUNK_SIZE);

        // The freed chunk is reusable immediately.
        let p2 = sh.alloc(CHUNK_SIZE, 1).unwrap();
        assert_eq!(p.as_ptr(), p2.as_ptr());
        sh.free(p2, CHUNK_SIZE);
    }

    #[test]
    fn alloc_honors_chunk_alignment() {
        static STORAGE: Storage = Storage(UnsafeCell::new([0; 4096]));
        // `max_align` must cover the requested alignment so `place` keeps the data
        // region itself aligned to it; the storage's own 4096-byte alignment satisfies
        // a max_align this small.
        let sh = unsafe { place_subheap(&STORAGE, CHUNK_SIZE * 2).as_ref() };

        // Consume exactly one chunk so the next free run starts misaligned for a
        // 2-chunk-aligned request.
        let odd = sh.alloc(CHUNK_SIZE, 1).unwrap();
        let p = sh.alloc(CHUNK_SIZE, CHUNK_SIZE * 2).unwrap();
        assert_eq!((p.as_ptr() as usize) % (CHUNK_SIZE * 2), 0);
        sh.free(odd, CHUNK_SIZE);
        sh.free(p, CHUNK_SIZE);
    }

    #[test]
    fn contains_rejects_addresses_outside_the_data_region() {
        static STORAGE: Storage = Storage(UnsafeCell::new([0; 4096]));
        let sh = unsafe { place_subheap(&STORAGE, 1).as_ref() };

        let p = sh.alloc(CHUNK_SIZE, 1).unwrap();
        assert!(sh.contains(p));
        let outside = unsafe { NonNull::new_unchecked(p.as_ptr().add(sh.capacity_bytes() + 1)) };
        assert!(!sh.contains(outside));
        sh.free(p, CHUNK_SIZE);
    }

    #[test]
    fn exhausting_capacity_reports_none() {
        static STORAGE: Storage = Storage(UnsafeCell::new([0; 4096]));
        let sh = unsafe { place_subheap(&STORAGE, 1).as_ref() };

        let cap = sh.capacity_bytes();
        let mut ptrs = vec![];
        loop {
            match sh.alloc(CHUNK_SIZE, 1) {
                Some(p) => ptrs.push(p),
                None => break,
            }
        }
        assert!(sh.alloc(1, 1).is_none());
        for p in ptrs {
            sh.free(p, CHUNK_SIZE);
        }
        assert_eq!(sh.avail_bytes(), cap);
    }
}
