//! Host virtual-to-physical translation.
//!
//! The bootloader hands over control with UEFI's identity mapping plus the
//! high-half kernel window. Once the frame allocator is live the kernel
//! rebuilds its page tables: physical memory moves behind the direct map at
//! [`DIRECT_MAP_BASE`] and the identity mapping disappears. Translation is
//! phase-aware so allocations made before the switch stay valid.

use core::sync::atomic::{AtomicBool, Ordering};

use hypervisor::mem::{PageAllocator, PAGE_SIZE, PAGE_SIZE_2M};
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use crate::allocator::HOST_ALLOCATOR;

/// Base of the direct mapping of all physical memory.
pub const DIRECT_MAP_BASE: u64 = 0xFFFF_8880_0000_0000;
/// Size of the direct mapping; one full level-4 entry.
pub const DIRECT_MAP_SIZE: u64 = 512 * 1024 * 1024 * 1024;
/// The kernel image window: maps physical 0 upward.
pub const KERNEL_BASE: u64 = 0xFFFF_FFFF_8000_0000;

const ENTRY_PRESENT: u64 = 1 << 0;
const ENTRY_WRITE: u64 = 1 << 1;
const ENTRY_PS: u64 = 1 << 7;

static RECONSTRUCTED: AtomicBool = AtomicBool::new(false);

pub fn virt_to_phys(addr: u64) -> u64 {
    if addr >= KERNEL_BASE {
        addr - KERNEL_BASE
    } else if RECONSTRUCTED.load(Ordering::Acquire) {
        addr - DIRECT_MAP_BASE
    } else {
        addr
    }
}

pub fn phys_to_virt(phys: u64) -> u64 {
    if RECONSTRUCTED.load(Ordering::Acquire) {
        phys + DIRECT_MAP_BASE
    } else {
        phys
    }
}

fn allocate_table() -> *mut u64 {
    // Still identity mapped here; the returned pointer is also the
    // physical address.
    let table = HOST_ALLOCATOR
        .alloc_aligned_pages(1, PAGE_SIZE)
        .expect("failed to allocate a host page table");
    unsafe { core::ptr::write_bytes(table.as_ptr(), 0, PAGE_SIZE) };
    table.as_ptr().cast()
}

fn lv4_index(addr: u64) -> usize {
    (addr >> 39 & 0x1FF) as usize
}

fn lv3_index(addr: u64) -> usize {
    (addr >> 30 & 0x1FF) as usize
}

/// Builds the kernel's own page tables (direct map + kernel window, 2 MiB
/// pages) and switches CR3 to them. Must run exactly once, before anything
/// holds pointers into the identity mapping.
pub fn reconstruct_mapping() {
    assert!(
        !RECONSTRUCTED.load(Ordering::Acquire),
        "memory mapping is already reconstructed"
    );

    let lv4 = allocate_table();

    // Direct map: one level-3 table of 512 GiB, each GiB a table of 2 MiB
    // pages.
    let lv3_direct = allocate_table();
    unsafe {
        *lv4.add(lv4_index(DIRECT_MAP_BASE)) =
            lv3_direct as u64 | ENTRY_PRESENT | ENTRY_WRITE;
    }
    for gib in 0..(DIRECT_MAP_SIZE >> 30) {
        let lv2 = allocate_table();
        unsafe { *lv3_direct.add(gib as usize) = lv2 as u64 | ENTRY_PRESENT | ENTRY_WRITE };

        for entry in 0..512u64 {
            let phys = (gib << 30) + entry * PAGE_SIZE_2M as u64;
            unsafe { *lv2.add(entry as usize) = phys | ENTRY_PRESENT | ENTRY_WRITE | ENTRY_PS };
        }
    }

    // Kernel window: the first GiB of physical memory, which covers the
    // loaded image, its stack and the boot data.
    let lv3_kernel = allocate_table();
    let lv2_kernel = allocate_table();
    unsafe {
        *lv4.add(lv4_index(KERNEL_BASE)) = lv3_kernel as u64 | ENTRY_PRESENT | ENTRY_WRITE;
        *lv3_kernel.add(lv3_index(KERNEL_BASE)) =
            lv2_kernel as u64 | ENTRY_PRESENT | ENTRY_WRITE;
    }
    for entry in 0..512u64 {
        let phys = entry * PAGE_SIZE_2M as u64;
        unsafe { *lv2_kernel.add(entry as usize) = phys | ENTRY_PRESENT | ENTRY_WRITE | ENTRY_PS };
    }

    let frame = PhysFrame::containing_address(PhysAddr::new(lv4 as u64));
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };

    // Translation flips over only once the new tables are live.
    RECONSTRUCTED.store(true, Ordering::Release);
}
