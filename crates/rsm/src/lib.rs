//! The memory subsystem of a register-based VM: page allocation, a general-purpose heap,
//! and guest virtual memory, bundled behind one type.
//!
//! Everything here is a thin re-export plus [`MemorySubsystem`], which owns one
//! [`PageManager`] and one [`HeapAllocator`] and builds [`PageDirectory`]/
//! [`TranslationCache`] pairs on top of them. An embedding interpreter depends on this
//! crate alone rather than on the three component crates directly.

#![cfg_attr(not(test), no_std)]
#![feature(allocator_api)]

pub use rsm_heap::{HeapAllocator, HeapError, MemoryState};
pub use rsm_pagemgr::{PageManager, PmError};
pub use rsm_vmem::{CACHE_ENTRIES, GuestInt, PageDirectory, TranslationCache, VmError, vm_addr_max, vm_addr_min};

/// Owns the page manager and heap allocator backing one VM instance, and mints
/// [`PageDirectory`]s (each with its own [`TranslationCache`]) for the guest address spaces
/// running on top of it.
///
/// `PAGE_SIZE` is shared by every component; `VM_ADDR_BITS` sizes the guest address space
/// handed to each directory this subsystem creates.
pub struct MemorySubsystem<'pm, const PAGE_SIZE: usize = 4096, const VM_ADDR_BITS: u32 = 48> {
    pm: &'pm PageManager<PAGE_SIZE>,
    heap: HeapAllocator<'pm, PAGE_SIZE>,
}

impl<'pm, const PAGE_SIZE: usize, const VM_ADDR_BITS: u32> MemorySubsystem<'pm, PAGE_SIZE, VM_ADDR_BITS> {
    /// Builds a subsystem over an already-initialized page manager, reserving
    /// `heap_min_pages` pages of initial heap backing.
    pub fn new(pm: &'pm PageManager<PAGE_SIZE>, heap_min_pages: usize) -> Result<Self, HeapError> {
        let heap = HeapAllocator::new(pm, heap_min_pages * PAGE_SIZE)?;
        Ok(Self { pm, heap })
    }

    /// The host-side heap shared by every guest running on this subsystem.
    pub fn heap(&self) -> &HeapAllocator<'pm, PAGE_SIZE> {
        &self.heap
    }

    /// The underlying page manager, for components that need raw pages directly.
    pub fn page_manager(&self) -> &'pm PageManager<PAGE_SIZE> {
        self.pm
    }

    /// Creates a fresh guest page directory over this subsystem's page manager.
    ///
    /// `max_resident_ptabs` bounds how many leaf page tables stay resident before the
    /// directory starts purging the coldest one; see [`PageDirectory::new`].
    pub fn new_page_directory(
        &self,
        max_resident_ptabs: usize,
    ) -> Result<PageDirectory<'pm, PAGE_SIZE, VM_ADDR_BITS>, VmError> {
        PageDirectory::new(self.pm, max_resident_ptabs)
    }

    /// Creates a fresh, empty translation cache for a new guest execution context.
    pub fn new_translation_cache(&self) -> TranslationCache<PAGE_SIZE> {
        TranslationCache::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{boxed::Box, cell::UnsafeCell};

    use super::*;

    const PAGE_SIZE: usize = 4096;

    #[repr(align(4096))]
    struct Mem(UnsafeCell<[u8; PAGE_SIZE * 8192]>);
    unsafe impl Sync for Mem {}

    fn new_pm() -> PageManager<PAGE_SIZE> {
        let mem = Box::leak(Box::new(Mem(UnsafeCell::new([0; PAGE_SIZE * 8192]))));
        let ptr = mem.0.get().cast::<u8>();
        unsafe { PageManager::<PAGE_SIZE>::new(ptr, PAGE_SIZE * 8192).unwrap() }
    }

    #[test]
    fn heap_and_vm_coexist_over_one_page_manager() {
        let pm = new_pm();
        let subsystem = MemorySubsystem::<PAGE_SIZE, 48>::new(&pm, 16).unwrap();

        let block = subsystem.heap().alloc(64).unwrap();
        unsafe {
            block.as_ptr().write_bytes(0x11, 64);
        }

        let pagedir = subsystem.new_page_directory(32).unwrap();
        let mut cache = subsystem.new_translation_cache();
        cache.store::<u64, 48>(&pagedir, 0x9000, 7).unwrap();
        let value: u64 = cache.load(&pagedir, 0x9000).unwrap();
        assert_eq!(value, 7);

        subsystem.heap().free(block, 64).unwrap();
    }
}
