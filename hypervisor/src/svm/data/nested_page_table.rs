//! Nested page tables: the guest-physical to host-physical translation
//! layer, built once before the VM starts with 2 MiB leaf pages.

use bitfield::bitfield;
use x86_64::PhysAddr;

use crate::mem::{PageAllocator, PAGE_SIZE, PAGE_SIZE_2M};

const ENTRY_COUNT: usize = 512;

const LV4_SHIFT: u64 = 39;
const LV3_SHIFT: u64 = 30;
const LV2_SHIFT: u64 = 21;
const INDEX_MASK: u64 = 0x1FF;

bitfield! {
    /// A level-4/level-3 entry referencing the next table.
    struct TableEntry(u64);
    impl Debug;
    valid, set_valid: 0, 0;
    write, set_write: 1, 1;
    user, set_user: 2, 2;
    pfn, set_pfn: 51, 12;
}

bitfield! {
    /// A level-2 entry mapping a 2 MiB page, see
    /// `Figure 5-25 (2-Mbyte PDE-Long Mode)`.
    struct LargePageEntry(u64);
    impl Debug;
    valid, set_valid: 0, 0;
    write, set_write: 1, 1;
    user, set_user: 2, 2;
    large_page, set_large_page: 7, 7;
    pfn, set_pfn: 51, 21;
}

/// A built nested page table, identified by its level-4 root. The table is
/// immutable once the VM starts: there is no unmap or remap operation, and
/// no nested-page-fault handler grows it at run time.
pub struct NestedPageTable {
    root_pa: PhysAddr,
}

impl NestedPageTable {
    /// Maps `[guest_base, guest_base + size)` to
    /// `[host_base, host_base + size)` in 2 MiB steps. `size` must be a
    /// multiple of 2 MiB and both bases must be 2 MiB aligned.
    pub fn build(
        guest_base: u64,
        host_base: PhysAddr,
        size: usize,
        allocator: &dyn PageAllocator,
    ) -> Self {
        assert!(size % PAGE_SIZE_2M == 0, "NPT size must be 2 MiB granular");
        assert!(host_base.is_aligned(PAGE_SIZE_2M as u64));

        let lv4 = allocate_table(allocator);
        log::debug!("NPT level-4 table @ {:p}", lv4);

        for chunk in 0..size / PAGE_SIZE_2M {
            let offset = (chunk * PAGE_SIZE_2M) as u64;
            map_2m(guest_base + offset, host_base + offset, lv4, allocator);
        }

        Self {
            root_pa: allocator.virt_to_phys(lv4 as *const u8),
        }
    }

    /// Physical address of the level-4 root, for the VMCB `N_CR3` field.
    pub fn root_pa(&self) -> PhysAddr {
        self.root_pa
    }
}

fn allocate_table(allocator: &dyn PageAllocator) -> *mut u64 {
    let table = allocator
        .alloc_aligned_pages(1, PAGE_SIZE)
        .expect("failed to allocate a nested page table");
    unsafe { core::ptr::write_bytes(table.as_ptr(), 0, PAGE_SIZE) };
    table.as_ptr().cast()
}

/// Walks or creates the entry for `addr` in the next-level table referenced
/// by `entry`.
fn next_table(entry: &mut u64, allocator: &dyn PageAllocator) -> *mut u64 {
    let mut view = TableEntry(*entry);
    if view.valid() == 0 {
        let table = allocate_table(allocator);
        view.set_valid(1);
        view.set_write(1);
        view.set_user(1);
        view.set_pfn(allocator.virt_to_phys(table as *const u8).as_u64() >> 12);
        *entry = view.0;
        return table;
    }

    allocator.phys_to_virt(PhysAddr::new(view.pfn() << 12)).cast()
}

fn map_2m(gpa: u64, hpa: PhysAddr, lv4: *mut u64, allocator: &dyn PageAllocator) {
    let lv4_entry = unsafe { &mut *lv4.add((gpa >> LV4_SHIFT & INDEX_MASK) as usize) };
    let lv3 = next_table(lv4_entry, allocator);

    let lv3_entry = unsafe { &mut *lv3.add((gpa >> LV3_SHIFT & INDEX_MASK) as usize) };
    let lv2 = next_table(lv3_entry, allocator);

    let lv2_entry = unsafe { &mut *lv2.add((gpa >> LV2_SHIFT & INDEX_MASK) as usize) };
    if LargePageEntry(*lv2_entry).valid() != 0 {
        panic!("nested page table: guest page {:#x} is already mapped", gpa);
    }

    let mut leaf = LargePageEntry(0);
    leaf.set_valid(1);
    leaf.set_write(1);
    leaf.set_user(1);
    leaf.set_large_page(1);
    leaf.set_pfn(hpa.as_u64() >> LV2_SHIFT);
    *lv2_entry = leaf.0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::testing::TestAllocator;

    /// Follows the table walk for `gpa` and returns the mapped host
    /// physical address.
    fn translate(root_pa: PhysAddr, gpa: u64) -> Option<u64> {
        let allocator = TestAllocator;
        let lv4: *const u64 = allocator.phys_to_virt(root_pa).cast();

        let lv4_entry = TableEntry(unsafe { *lv4.add((gpa >> LV4_SHIFT & INDEX_MASK) as usize) });
        if lv4_entry.valid() == 0 {
            return None;
        }

        let lv3: *const u64 = allocator.phys_to_virt(PhysAddr::new(lv4_entry.pfn() << 12)).cast();
        let lv3_entry = TableEntry(unsafe { *lv3.add((gpa >> LV3_SHIFT & INDEX_MASK) as usize) });
        if lv3_entry.valid() == 0 {
            return None;
        }

        let lv2: *const u64 = allocator.phys_to_virt(PhysAddr::new(lv3_entry.pfn() << 12)).cast();
        let leaf = LargePageEntry(unsafe { *lv2.add((gpa >> LV2_SHIFT & INDEX_MASK) as usize) });
        if leaf.valid() == 0 {
            return None;
        }
        assert_eq!(leaf.large_page(), 1);
        assert_eq!(leaf.write(), 1);
        assert_eq!(leaf.user(), 1);

        Some((leaf.pfn() << LV2_SHIFT) + (gpa & (PAGE_SIZE_2M as u64 - 1)))
    }

    #[test]
    fn maps_guest_range_to_host_range() {
        let allocator = TestAllocator;
        let host_base = PhysAddr::new(0x8000_0000);
        let size = 8 * PAGE_SIZE_2M;

        let npt = NestedPageTable::build(0, host_base, size, &allocator);

        assert_eq!(translate(npt.root_pa(), 0), Some(0x8000_0000));
        assert_eq!(
            translate(npt.root_pa(), PAGE_SIZE_2M as u64),
            Some(0x8000_0000 + PAGE_SIZE_2M as u64)
        );
        assert_eq!(
            translate(npt.root_pa(), 7 * PAGE_SIZE_2M as u64 + 0x1234),
            Some(0x8000_0000 + 7 * PAGE_SIZE_2M as u64 + 0x1234)
        );
        // One past the end is unmapped.
        assert_eq!(translate(npt.root_pa(), size as u64), None);
    }

    #[test]
    fn spans_level_boundaries() {
        let allocator = TestAllocator;
        // Crosses a level-3 boundary (1 GiB).
        let guest_base = (1 << LV3_SHIFT) - 2 * PAGE_SIZE_2M as u64;
        let host_base = PhysAddr::new(0x4000_0000);

        let npt = NestedPageTable::build(guest_base, host_base, 4 * PAGE_SIZE_2M, &allocator);

        for chunk in 0..4u64 {
            let offset = chunk * PAGE_SIZE_2M as u64;
            assert_eq!(
                translate(npt.root_pa(), guest_base + offset),
                Some(host_base.as_u64() + offset)
            );
        }
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn remapping_is_a_fatal_error() {
        let allocator = TestAllocator;
        let lv4 = allocate_table(&allocator);
        map_2m(0x20_0000, PhysAddr::new(0x20_0000), lv4, &allocator);
        map_2m(0x20_0000, PhysAddr::new(0x40_0000), lv4, &allocator);
    }
}
