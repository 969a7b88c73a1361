//! Physical frame allocator and the kernel heap.
//!
//! The frame allocator is a bitmap over the usable regions of the UEFI
//! memory map; it backs every allocation the hypervisor engine makes (VMCB,
//! bitmaps, nested page tables, guest RAM) through the [`PageAllocator`]
//! trait. The byte-granular kernel heap is a `linked_list_allocator` region
//! carved out of it.

use core::alloc::Layout;
use core::ptr::NonNull;

use hypervisor::mem::{PageAllocator, PAGE_SIZE};
use linked_list_allocator::LockedHeap;
use spin::Mutex;
use x86_64::PhysAddr;

use crate::boot_info::MemoryMap;
use crate::mem;

/// Maximum physical memory the bitmap can manage.
const MAX_PHYSICAL_SIZE: u64 = 128 * 1024 * 1024 * 1024;
const FRAME_COUNT: usize = (MAX_PHYSICAL_SIZE / PAGE_SIZE as u64) as usize;
const BITS_PER_LINE: usize = u64::BITS as usize;
const NUM_LINES: usize = FRAME_COUNT / BITS_PER_LINE;

const HEAP_SIZE: usize = 2 * 1024 * 1024;

/// One bit per 4 KiB frame; a set bit means the frame is in use.
struct FrameBitmap {
    lines: [u64; NUM_LINES],
    /// First frame id past the managed range.
    frame_end: usize,
}

impl FrameBitmap {
    const fn new() -> Self {
        Self {
            // Everything is reserved until the memory map says otherwise.
            lines: [u64::MAX; NUM_LINES],
            frame_end: 0,
        }
    }

    fn is_used(&self, frame: usize) -> bool {
        self.lines[frame / BITS_PER_LINE] & (1 << (frame % BITS_PER_LINE)) != 0
    }

    fn set_used(&mut self, frame: usize) {
        self.lines[frame / BITS_PER_LINE] |= 1 << (frame % BITS_PER_LINE);
    }

    fn set_free(&mut self, frame: usize) {
        self.lines[frame / BITS_PER_LINE] &= !(1 << (frame % BITS_PER_LINE));
    }

    fn init(&mut self, map: &MemoryMap) {
        for desc in map.iter() {
            if !desc.is_usable() {
                continue;
            }

            let first = desc.physical_start as usize / PAGE_SIZE;
            let count = desc.number_of_pages as usize;
            let last = (first + count).min(FRAME_COUNT);
            for frame in first..last {
                self.set_free(frame);
            }
            self.frame_end = self.frame_end.max(last);
        }

        // Frame 0 is never handed out.
        self.set_used(0);
    }

    /// First-fit scan for `count` contiguous free frames starting at a
    /// multiple of `align` frames.
    fn alloc(&mut self, count: usize, align: usize) -> Option<u64> {
        let align = align.max(1);
        let mut frame = align;

        while frame + count <= self.frame_end {
            if let Some(used) = (frame..frame + count).find(|&f| self.is_used(f)) {
                frame = (used + 1).next_multiple_of(align);
                continue;
            }

            for f in frame..frame + count {
                self.set_used(f);
            }
            return Some((frame * PAGE_SIZE) as u64);
        }

        None
    }

    fn free(&mut self, phys: u64, count: usize) {
        let first = phys as usize / PAGE_SIZE;
        for frame in first..first + count {
            self.set_free(frame);
        }
    }
}

static FRAMES: Mutex<FrameBitmap> = Mutex::new(FrameBitmap::new());

pub fn init_frames(map: &MemoryMap) {
    FRAMES.lock().init(map);
}

/// The host side of the engine's allocation seam.
pub struct HostAllocator;

pub static HOST_ALLOCATOR: HostAllocator = HostAllocator;

impl PageAllocator for HostAllocator {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.alloc_aligned_pages(size.div_ceil(PAGE_SIZE), PAGE_SIZE)
    }

    fn alloc_aligned_pages(&self, pages: usize, align: usize) -> Option<NonNull<u8>> {
        let align_frames = (align / PAGE_SIZE).max(1);
        let phys = FRAMES.lock().alloc(pages, align_frames)?;

        NonNull::new(mem::phys_to_virt(phys) as *mut u8)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        let phys = mem::virt_to_phys(ptr.as_ptr() as u64);
        FRAMES.lock().free(phys, size.div_ceil(PAGE_SIZE));
    }

    fn virt_to_phys(&self, ptr: *const u8) -> PhysAddr {
        PhysAddr::new(mem::virt_to_phys(ptr as u64))
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> *mut u8 {
        mem::phys_to_virt(phys.as_u64()) as *mut u8
    }
}

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

pub fn init_heap() {
    let region = HOST_ALLOCATOR
        .alloc(HEAP_SIZE)
        .expect("failed to allocate the kernel heap");

    unsafe { HEAP.lock().init(region.as_ptr(), HEAP_SIZE) };
}

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("allocation failure: {:?}", layout);
}
