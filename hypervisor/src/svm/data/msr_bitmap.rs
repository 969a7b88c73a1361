use core::ptr::NonNull;

use x86_64::PhysAddr;

use crate::mem::{PageAllocator, PAGE_SIZE};

/// The MSR permission map consists of four bit vectors of 16 Kbits each,
/// see `15.11 MSR Intercepts`.
pub const MSRPM_PAGES: usize = 2;

/// The MSR permission map handed to the CPU through `MSRPM_BASE_PA`.
///
/// Every bit is left set so that all RDMSR/WRMSR accesses trap to the MSR
/// intercept handler; the handler decides per MSR what the guest may see.
pub struct MsrBitmap {
    bitmap: NonNull<u8>,
    pa: PhysAddr,
}

impl MsrBitmap {
    pub fn build(allocator: &dyn PageAllocator) -> Self {
        let bitmap = allocator
            .alloc_aligned_pages(MSRPM_PAGES, PAGE_SIZE)
            .expect("failed to allocate the MSR permission map");
        unsafe { core::ptr::write_bytes(bitmap.as_ptr(), 0xFF, MSRPM_PAGES * PAGE_SIZE) };

        let pa = allocator.virt_to_phys(bitmap.as_ptr());
        Self { bitmap, pa }
    }

    pub fn pa(&self) -> PhysAddr {
        self.pa
    }

    #[cfg(test)]
    fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.bitmap.as_ptr(), MSRPM_PAGES * PAGE_SIZE) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::testing::TestAllocator;

    #[test]
    fn every_msr_is_intercepted() {
        let bitmap = MsrBitmap::build(&TestAllocator);
        assert!(bitmap.as_slice().iter().all(|&byte| byte == 0xFF));
        assert_eq!(bitmap.pa().as_u64() % PAGE_SIZE as u64, 0);
    }
}
