//! The handoff ABI between the UEFI bootloader and the kernel. The layout
//! is shared with the loader; every pointer in here is a physical address
//! valid under the loader's identity mapping.

/// Sanity marker the bootloader writes first.
pub const BOOT_MAGIC: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// `EFI_MEMORY_DESCRIPTOR`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemoryDescriptor {
    pub kind: u32,
    pub physical_start: u64,
    pub virtual_start: u64,
    pub number_of_pages: u64,
    pub attribute: u64,
}

/// `EfiBootServicesCode`.
const BOOT_SERVICES_CODE: u32 = 3;
/// `EfiConventionalMemory`.
const CONVENTIONAL_MEMORY: u32 = 7;

impl MemoryDescriptor {
    /// Whether the region may be handed to the frame allocator. Regions the
    /// firmware still describes as boot-services code are free once the
    /// kernel runs; everything else may hold live data (page tables, the
    /// kernel image, ACPI tables).
    pub fn is_usable(&self) -> bool {
        self.kind == CONVENTIONAL_MEMORY || self.kind == BOOT_SERVICES_CODE
    }
}

/// The UEFI memory map as captured at `ExitBootServices` time. Descriptors
/// are iterated with the firmware-reported stride, which may exceed
/// `size_of::<MemoryDescriptor>()`.
#[derive(Debug)]
#[repr(C)]
pub struct MemoryMap {
    pub buffer_size: u64,
    pub descriptors: *const MemoryDescriptor,
    pub map_size: u64,
    pub map_key: u64,
    pub descriptor_size: u64,
    pub descriptor_version: u32,
}

impl MemoryMap {
    pub fn iter(&self) -> impl Iterator<Item = &MemoryDescriptor> {
        let base = self.descriptors as *const u8;
        let stride = self.descriptor_size as usize;
        let count = (self.map_size / self.descriptor_size) as usize;

        (0..count).map(move |i| unsafe { &*base.add(i * stride).cast() })
    }
}

/// Where the loader placed the guest kernel image and initrd.
#[derive(Debug)]
#[repr(C)]
pub struct GuestInfo {
    /// Physical address of the loaded guest kernel image.
    pub guest_image: *const u8,
    /// Size in bytes of the guest image.
    pub guest_size: u64,
    /// Physical address of the loaded initrd, null when absent.
    pub initrd_addr: *const u8,
    /// Size in bytes of the initrd.
    pub initrd_size: u64,
}

#[derive(Debug)]
#[repr(C)]
pub struct BootInfo {
    pub magic: u64,
    pub map: MemoryMap,
    pub guest: GuestInfo,
}

impl BootInfo {
    pub fn is_valid(&self) -> bool {
        self.magic == BOOT_MAGIC
    }
}
