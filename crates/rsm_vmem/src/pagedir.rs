use core::{
    ptr::NonNull,
    slice,
    sync::atomic::{AtomicU64, Ordering},
};

use lru::{Lru, LruMap};
use rsm_pagemgr::PageManager;
use rsm_sync::SpinMutex;

use crate::{VmError, pte::Pte};

/// Guest addresses below this are reserved: VFN 0 must never be mapped.
pub const fn vm_addr_min(page_size: usize) -> u64 {
    page_size as u64
}

/// The highest addressable guest byte for a given `VM_ADDR_BITS`.
pub const fn vm_addr_max(vm_addr_bits: u32) -> u64 {
    (1u64 << vm_addr_bits) - 1
}

pub(crate) const fn page_size_bits(page_size: usize) -> u32 {
    page_size.trailing_zeros()
}

fn ptes_per_table(page_size: usize) -> usize {
    page_size / size_of::<Pte>()
}

fn ptab_bits(page_size: usize) -> u32 {
    ptes_per_table(page_size).trailing_zeros()
}

fn level_count(vm_addr_bits: u32, page_size: usize) -> u32 {
    let vfn_bits = vm_addr_bits - page_size_bits(page_size);
    vfn_bits.div_ceil(ptab_bits(page_size))
}

/// Bookkeeping for one slot of the bounded leaf-table LRU pool.
///
/// A "leaf table" is the deepest page table in the directory: the one whose PTEs point
/// directly at guest backing pages rather than at further tables. `max_resident_ptabs`
/// (the LRU pool's capacity) bounds how many of these can be resident at once; interior
/// tables above the leaf level are unbounded and never evicted, since they are cheap (one
/// page per up to `PTAB_LEN` leaf tables) relative to the leaf tables and the guest pages
/// hanging off them.
#[derive(Default)]
struct LeafResidency {
    /// `vfn >> PTAB_BITS`: identifies which leaf table this slot is tracking.
    key: Option<u64>,
    /// Whether a real leaf table currently backs `key`.
    resident: bool,
    /// Host address of the leaf table's page, valid iff `resident`.
    ptab_addr: Option<NonNull<Pte>>,
    /// The PTE, in the parent (second-to-last-level) table, that points at this leaf table.
    /// Cleared (zeroed) on eviction so the next walk re-creates it from scratch.
    parent_pte: Option<NonNull<Pte>>,
}

unsafe impl Send for LeafResidency {}

type ResidencyMutex = SpinMutex<LeafResidency>;
type ResidencyMap = LruMap<u64, ResidencyMutex>;

/// Real leaf keys are `vfn >> PTAB_BITS`, bounded well below `u64::MAX` by `VM_ADDR_BITS`.
/// Purge requests count down from the top of the key space so each one is guaranteed to be
/// a fresh miss against the LRU map: if every purge reused the same sentinel, the slot it
/// recycled would get promoted to MRU under that sentinel and every later purge would just
/// hit that same now-empty slot instead of evicting a genuinely different cold table.
const FIRST_PURGE_KEY: u64 = u64::MAX;

struct Inner<'pm, const PAGE_SIZE: usize> {
    pm: &'pm PageManager<PAGE_SIZE>,
    root: NonNull<Pte>,
    leaf_tables: Lru<SpinMutex<ResidencyMap>>,
    next_purge_key: AtomicU64,
}

unsafe impl<const PAGE_SIZE: usize> Send for Inner<'_, PAGE_SIZE> {}

/// A multi-level guest page directory, built atop a [`PageManager`].
///
/// `PAGE_SIZE` must match the page manager it draws pages from; `VM_ADDR_BITS` sizes the
/// guest address space (default 48, giving a 4-level directory at the default page size).
pub struct PageDirectory<'pm, const PAGE_SIZE: usize = 4096, const VM_ADDR_BITS: u32 = 48> {
    inner: SpinMutex<Inner<'pm, PAGE_SIZE>>,
}

unsafe impl<const PAGE_SIZE: usize, const VM_ADDR_BITS: u32> Send
    for PageDirectory<'_, PAGE_SIZE, VM_ADDR_BITS>
{
}
unsafe impl<const PAGE_SIZE: usize, const VM_ADDR_BITS: u32> Sync
    for PageDirectory<'_, PAGE_SIZE, VM_ADDR_BITS>
{
}

impl<'pm, const PAGE_SIZE: usize, const VM_ADDR_BITS: u32> PageDirectory<'pm, PAGE_SIZE, VM_ADDR_BITS> {
    /// Creates a page directory with one page allocated from `pm` for the root table.
    ///
    /// `max_resident_ptabs` bounds how many leaf tables (and the guest pages they map) stay
    /// resident before the directory starts purging the coldest one.
    pub fn new(pm: &'pm PageManager<PAGE_SIZE>, max_resident_ptabs: usize) -> Result<Self, VmError> {
        let root = pm.alloc_pages(1).map_err(|_| VmError::OutOfMemory)?;
        unsafe {
            root.as_ptr().write_bytes(0, PAGE_SIZE);
        }
        Ok(Self {
            inner: SpinMutex::new(Inner {
                pm,
                root: root.cast(),
                leaf_tables: Lru::new(max_resident_ptabs.max(1)),
                next_purge_key: AtomicU64::new(FIRST_PURGE_KEY),
            }),
        })
    }

    /// Translates a guest virtual address to a host address, allocating backing pages (and
    /// intermediate tables) lazily on first touch.
    pub fn translate(&self, vaddr: u64) -> Result<u64, VmError> {
        if vaddr < vm_addr_min(PAGE_SIZE) {
            return Err(VmError::InvalidArgument { vaddr });
        }
        if vaddr > vm_addr_max(VM_ADDR_BITS) {
            return Err(VmError::OutOfRange { vaddr });
        }

        let mut inner = self.inner.lock();
        let leaf_pte = self.walk(&mut inner, vaddr)?;
        let page_bits = page_size_bits(PAGE_SIZE);
        let offset = vaddr & ((1u64 << page_bits) - 1);
        Ok((unsafe { *leaf_pte.as_ptr() }).host_addr(page_bits) as u64 + offset)
    }

    fn walk(&self, inner: &mut Inner<'pm, PAGE_SIZE>, vaddr: u64) -> Result<NonNull<Pte>, VmError> {
        let page_bits = page_size_bits(PAGE_SIZE);
        let pbits = ptab_bits(PAGE_SIZE);
        let nptes = ptes_per_table(PAGE_SIZE);
        let levels = level_count(VM_ADDR_BITS, PAGE_SIZE);
        let vfn = vaddr >> page_bits;

        let mut table = inner.root;
        let mut parent_of_leaf: Option<NonNull<Pte>> = None;

        debug_assert!(nptes.is_power_of_two());
        for level in 1..=levels {
            let shift = pbits * (levels - level);
            let idx = ((vfn >> shift) as usize) & (nptes - 1);
            let pte_ptr = unsafe { NonNull::new_unchecked(table.as_ptr().add(idx)) };
            let pte = unsafe { *pte_ptr.as_ptr() };

            if level == levels {
                let leaf_key = vfn >> pbits;
                self.register_leaf(inner, leaf_key, table, parent_of_leaf)?;

                if pte.is_zero() {
                    let page = self.alloc_data_page(inner, leaf_key)?;
                    unsafe {
                        *pte_ptr.as_ptr() = Pte::from_host_addr(page.as_ptr().addr(), page_bits);
                    }
                }
                return Ok(pte_ptr);
            }

            table = if pte.is_zero() {
                let new_table = self
                    .alloc_zeroed_page(inner.pm)
                    .ok_or(VmError::OutOfMemory)?;
                unsafe {
                    *pte_ptr.as_ptr() = Pte::from_host_addr(new_table.as_ptr().addr(), page_bits);
                }
                new_table.cast()
            } else {
                unsafe { NonNull::new_unchecked(pte.host_addr(page_bits) as *mut Pte) }
            };
            parent_of_leaf = Some(pte_ptr);
        }
        unreachable!("levels is always >= 1, loop always returns at level == levels")
    }

    fn alloc_zeroed_page(&self, pm: &PageManager<PAGE_SIZE>) -> Option<NonNull<u8>> {
        let page = pm.alloc_pages(1).ok()?;
        unsafe {
            page.as_ptr().write_bytes(0, PAGE_SIZE);
        }
        Some(page)
    }

    /// Ensures the leaf table at `table` (identified by `leaf_key`) is tracked by the
    /// bounded LRU pool, evicting and tearing down the coldest other resident leaf table if
    /// the pool is full and this is a table the pool hasn't seen before.
    fn register_leaf(
        &self,
        inner: &Inner<'pm, PAGE_SIZE>,
        leaf_key: u64,
        table: NonNull<Pte>,
        parent_pte: Option<NonNull<Pte>>,
    ) -> Result<(), VmError> {
        // A directory shallow enough that the root doubles as the only leaf table has
        // nothing to evict: there is exactly one such table and it lives forever.
        let Some(parent_pte) = parent_pte else {
            return Ok(());
        };

        let Some(slot) = inner.leaf_tables.get(leaf_key) else {
            return Err(VmError::OutOfMemory);
        };
        let mut res = slot.value().lock();

        if res.key == Some(leaf_key) && res.resident {
            debug_assert_eq!(res.ptab_addr, Some(table));
            return Ok(());
        }

        if res.resident {
            let victim_addr = res.ptab_addr.expect("resident slot always has an address");
            let victim_parent = res.parent_pte.expect("resident slot always has a parent");
            self.teardown_leaf_table(inner.pm, victim_addr, victim_parent);
        }

        res.key = Some(leaf_key);
        res.resident = true;
        res.ptab_addr = Some(table);
        res.parent_pte = Some(parent_pte);
        Ok(())
    }

    /// Allocates a guest backing page, retrying once after purging an unrelated cold leaf
    /// table if the page manager is exhausted.
    fn alloc_data_page(
        &self,
        inner: &Inner<'pm, PAGE_SIZE>,
        current_leaf_key: u64,
    ) -> Result<NonNull<u8>, VmError> {
        if let Ok(page) = inner.pm.alloc_pages(1) {
            return Ok(page);
        }
        self.purge_one_cold_leaf(inner, current_leaf_key);
        inner.pm.alloc_pages(1).map_err(|_| VmError::OutOfMemory)
    }

    fn purge_one_cold_leaf(&self, inner: &Inner<'pm, PAGE_SIZE>, current_leaf_key: u64) {
        let purge_key = inner.next_purge_key.fetch_sub(1, Ordering::Relaxed);
        let Some(slot) = inner.leaf_tables.get(purge_key) else {
            return;
        };
        let mut res = slot.value().lock();
        if res.resident && res.key != Some(current_leaf_key) {
            let victim_addr = res.ptab_addr.expect("resident slot always has an address");
            let victim_parent = res.parent_pte.expect("resident slot always has a parent");
            self.teardown_leaf_table(inner.pm, victim_addr, victim_parent);
            res.resident = false;
            res.ptab_addr = None;
            res.parent_pte = None;
        }
    }

    /// Frees every backing page a leaf table still references, then the table itself, and
    /// zeroes the parent's pointer to it so the next walk recreates it from scratch.
    fn teardown_leaf_table(
        &self,
        pm: &PageManager<PAGE_SIZE>,
        table: NonNull<Pte>,
        parent_pte: NonNull<Pte>,
    ) {
        let page_bits = page_size_bits(PAGE_SIZE);
        let nptes = ptes_per_table(PAGE_SIZE);
        let entries = unsafe { slice::from_raw_parts_mut(table.as_ptr(), nptes) };
        for entry in entries.iter_mut() {
            if !entry.is_zero() {
                let addr = entry.host_addr(page_bits);
                unsafe { pm.free_pages(NonNull::new_unchecked(addr as *mut u8)) };
                *entry = Pte::zero();
            }
        }
        unsafe {
            pm.free_pages(table.cast());
            *parent_pte.as_ptr() = Pte::zero();
        }
        log::debug!("vmem: purged cold leaf table {:#x}", table.as_ptr().addr());
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::UnsafeCell, collections::HashSet};

    use super::*;

    const PAGE_SIZE: usize = 4096;

    #[repr(align(4096))]
    struct Mem(UnsafeCell<[u8; PAGE_SIZE * 4096]>);
    unsafe impl Sync for Mem {}

    fn new_pm() -> PageManager<PAGE_SIZE> {
        let mem = Box::leak(Box::new(Mem(UnsafeCell::new([0; PAGE_SIZE * 4096]))));
        let ptr = mem.0.get().cast::<u8>();
        unsafe { PageManager::<PAGE_SIZE>::new(ptr, PAGE_SIZE * 4096).unwrap() }
    }

    #[test]
    fn translate_is_stable_across_repeated_calls() {
        let pm = new_pm();
        let pd = PageDirectory::<PAGE_SIZE>::new(&pm, 64).unwrap();
        let a = pd.translate(0xdeadbee4).unwrap();
        let b = pd.translate(0xdeadbee4).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_pages_translate_to_distinct_hosts() {
        let pm = new_pm();
        let pd = PageDirectory::<PAGE_SIZE>::new(&pm, 64).unwrap();
        let mut hosts = HashSet::new();
        for i in 0..64u64 {
            let vaddr = PAGE_SIZE as u64 * (1 + i);
            let h = pd.translate(vaddr).unwrap();
            assert!(hosts.insert(h & !(PAGE_SIZE as u64 - 1)));
        }
    }

    #[test]
    fn vfn_zero_is_rejected() {
        let pm = new_pm();
        let pd = PageDirectory::<PAGE_SIZE>::new(&pm, 64).unwrap();
        assert_eq!(pd.translate(0), Err(VmError::InvalidArgument { vaddr: 0 }));
    }

    #[test]
    fn eviction_reclaims_and_rewalks_cold_leaf_tables() {
        let pm = new_pm();
        // Small pool so a handful of distant pages force a purge.
        let pd = PageDirectory::<PAGE_SIZE>::new(&pm, 2).unwrap();

        // Each step is far enough away to land in a different leaf table.
        let stride = (1u64 << ptab_bits(PAGE_SIZE)) * PAGE_SIZE as u64;
        let first = PAGE_SIZE as u64;
        let h0 = pd.translate(first).unwrap();

        for i in 1..8u64 {
            pd.translate(first + i * stride).unwrap();
        }

        // The first mapping's leaf table has long since been evicted; touching it again
        // must re-walk and allocate fresh backing storage rather than panicking, and
        // (since PM state differs) may legitimately return a different host address.
        let h0_again = pd.translate(first).unwrap();
        assert_eq!(h0 & !(PAGE_SIZE as u64 - 1) != 0, true);
        assert_eq!(h0_again & !(PAGE_SIZE as u64 - 1) != 0, true);
    }
}
