//! Linux/x86 boot protocol structures.
//!
//! The layouts are a strict binary contract with the guest kernel: the setup
//! header lives at file offset 0x1F1 of a bzImage and the boot-parameters
//! ("zero page") structure is exactly 0x1000 bytes. Field offsets follow
//! Documentation/arch/x86/boot.rst, protocol v2.15.

use bitfield::bitfield;

/// Guest physical address of the boot-parameters page.
pub const LAYOUT_BOOTPARAM: u64 = 0x0001_0000;
/// Guest physical address of the kernel command line.
pub const LAYOUT_CMDLINE: u64 = 0x0002_0000;
/// Guest physical address the protected-mode kernel code is loaded at.
pub const LAYOUT_KERNEL_BASE: u64 = 0x0010_0000;

/// File offset of the setup header within a bzImage.
pub const SETUP_HEADER_OFFSET: usize = 0x1F1;

/// Maximum number of entries in the E820 map.
pub const E820_MAX_ENTRIES: usize = 128;

/// E820 memory region types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum E820Type {
    Ram = 1,
    Reserved = 2,
    Acpi = 3,
    Nvs = 4,
    Unusable = 5,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct E820Entry {
    pub addr: u64,
    pub size: u64,
    pub kind: u32,
}
const_assert_eq!(core::mem::size_of::<E820Entry>(), 0x14);

bitfield! {
    /// The `loadflags` byte of the setup header.
    #[derive(Clone, Copy)]
    pub struct LoadFlags(u8);
    impl Debug;
    /// Protected-mode code is loaded at 0x10_0000.
    pub loaded_high, set_loaded_high: 0, 0;
    /// KASLR is enabled.
    pub kaslr_flag, set_kaslr_flag: 1, 1;
    /// Suppress early messages.
    pub quiet_flag, set_quiet_flag: 5, 5;
    /// Do not reload the segment registers in the 32-bit entry point.
    pub keep_segments, set_keep_segments: 6, 6;
    /// `heap_end_ptr` is valid.
    pub can_use_heap, set_can_use_heap: 7, 7;
}

/// The bzImage setup header.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct SetupHeader {
    /// The number of setup sectors (read-only; 0 means 4).
    pub setup_sects: u8,
    pub root_flags: u16,
    pub syssize: u32,
    pub ram_size: u16,
    pub vid_mode: u16,
    pub root_dev: u16,
    pub boot_flag: u16,
    pub jump: u16,
    pub header: u32,
    /// Boot protocol version supported (read-only).
    pub version: u16,
    pub realmode_swtch: u32,
    pub start_sys_seg: u16,
    pub kernel_version: u16,
    /// The type of loader; 0xFF when no ID is assigned.
    pub type_of_loader: u8,
    pub loadflags: LoadFlags,
    pub setup_move_size: u16,
    pub code32_start: u32,
    /// 32-bit linear address of the initial ramdisk, 0 when absent.
    pub ramdisk_image: u32,
    pub ramdisk_size: u32,
    pub bootsect_kludge: u32,
    /// Offset of the end of the setup heap minus 0x200.
    pub heap_end_ptr: u16,
    pub ext_loader_ver: u8,
    pub ext_loader_type: u8,
    /// 32-bit linear address of the kernel command line.
    pub cmd_line_ptr: u32,
    pub initrd_addr_max: u32,
    pub kernel_alignment: u32,
    pub relocatable_kernel: u8,
    pub min_alignment: u8,
    pub xloadflags: u16,
    /// Maximum size of the command line (read-only).
    pub cmdline_size: u32,
    pub hardware_subarch: u32,
    pub hardware_subarch_data: u64,
    pub payload_offset: u32,
    pub payload_length: u32,
    pub setup_data: u64,
    pub pref_address: u64,
    pub init_size: u32,
    pub handover_offset: u32,
    pub kernel_info_offset: u32,
}
const_assert_eq!(core::mem::size_of::<SetupHeader>(), 0x7B);

impl SetupHeader {
    /// Reads the setup header out of a bzImage, applying the historical
    /// `setup_sects == 0` fallback.
    pub fn from_bzimage(image: &[u8]) -> Self {
        assert!(
            image.len() >= SETUP_HEADER_OFFSET + core::mem::size_of::<Self>(),
            "guest image is too small to hold a setup header"
        );

        let mut hdr: Self = unsafe {
            core::ptr::read_unaligned(image.as_ptr().add(SETUP_HEADER_OFFSET).cast())
        };
        if hdr.setup_sects == 0 {
            hdr.setup_sects = 4;
        }

        hdr
    }

    /// Offset of the protected-mode kernel code within the image: the boot
    /// sector plus `setup_sects` sectors of real-mode setup code.
    pub fn protected_code_offset(&self) -> usize {
        (self.setup_sects as usize + 1) * 512
    }
}

/// The boot-parameters ("zero page") structure handed to the guest kernel.
/// Fields prefixed with `_` are unimplemented and only pad the layout.
#[repr(C, packed)]
pub struct BootParams {
    _screen_info: [u8; 0x40],
    _apm_bios_info: [u8; 0x14],
    _pad2: [u8; 4],
    pub tboot_addr: u64,
    pub ist_info: [u8; 0x10],
    _pad3: [u8; 0x10],
    pub hd0_info: [u8; 0x10],
    pub hd1_info: [u8; 0x10],
    _sys_desc_table: [u8; 0x10],
    _olpc_ofw_header: [u8; 0x10],
    _pad4: [u8; 0x80],
    _edid_info: [u8; 0x80],
    _efi_info: [u8; 0x20],
    pub alt_mem_k: u32,
    pub scratch: u32,
    /// Number of valid entries in `e820_map`.
    pub e820_entries: u8,
    pub eddbuf_entries: u8,
    pub edd_mbr_sig_buf_entries: u8,
    pub kbd_status: u8,
    _pad6: [u8; 5],
    pub hdr: SetupHeader,
    _pad7: [u8; 0x290 - SETUP_HEADER_OFFSET - core::mem::size_of::<SetupHeader>()],
    _edd_mbr_sig_buffer: [u32; 0x10],
    /// System memory map retrievable via INT 15h, AX=E820h.
    pub e820_map: [E820Entry; E820_MAX_ENTRIES],
    _unimplemented: [u8; 0x330],
}
const_assert_eq!(core::mem::size_of::<BootParams>(), 0x1000);

impl BootParams {
    /// An all-zero boot-parameters page.
    pub fn new() -> Self {
        // Every field is a plain integer or byte array, so the zero pattern
        // is a valid value.
        unsafe { core::mem::zeroed() }
    }

    /// Appends an entry to the E820 map.
    pub fn add_e820_entry(&mut self, addr: u64, size: u64, kind: E820Type) {
        let index = self.e820_entries as usize;
        assert!(index < E820_MAX_ENTRIES, "E820 map is full");

        self.e820_map[index] = E820Entry {
            addr,
            size,
            kind: kind as u32,
        };
        self.e820_entries += 1;
    }

    /// The raw bytes of the page, for copying into guest memory.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(
                self as *const Self as *const u8,
                core::mem::size_of::<Self>(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_bzimage(setup_sects: u8) -> Vec<u8> {
        let mut image = vec![0u8; 0x4000];
        let mut hdr: SetupHeader = unsafe { core::mem::zeroed() };
        hdr.setup_sects = setup_sects;
        hdr.boot_flag = 0xAA55;
        hdr.header = 0x5372_6448; // "HdrS"
        hdr.version = 0x020F;
        hdr.cmdline_size = 2048;
        let bytes = unsafe {
            core::slice::from_raw_parts(
                &hdr as *const SetupHeader as *const u8,
                core::mem::size_of::<SetupHeader>(),
            )
        };
        image[SETUP_HEADER_OFFSET..SETUP_HEADER_OFFSET + bytes.len()].copy_from_slice(bytes);
        image
    }

    #[test]
    fn parses_setup_header() {
        let image = synthetic_bzimage(2);
        let hdr = SetupHeader::from_bzimage(&image);

        assert_eq!({ hdr.boot_flag }, 0xAA55);
        assert_eq!({ hdr.version }, 0x020F);
        assert_eq!(hdr.setup_sects, 2);
        assert_eq!(hdr.protected_code_offset(), 3 * 512);
    }

    #[test]
    fn zero_setup_sects_defaults_to_four() {
        let image = synthetic_bzimage(0);
        let hdr = SetupHeader::from_bzimage(&image);

        assert_eq!(hdr.setup_sects, 4);
        assert_eq!(hdr.protected_code_offset(), 5 * 512);
    }

    #[test]
    #[should_panic(expected = "too small")]
    fn rejects_truncated_image() {
        let image = vec![0u8; SETUP_HEADER_OFFSET];
        let _ = SetupHeader::from_bzimage(&image);
    }

    #[test]
    fn e820_entries_append_in_order() {
        let mut bp = BootParams::new();
        bp.add_e820_entry(0, LAYOUT_KERNEL_BASE, E820Type::Ram);
        bp.add_e820_entry(LAYOUT_KERNEL_BASE, 0x100_0000, E820Type::Reserved);

        assert_eq!(bp.e820_entries, 2);
        let first = bp.e820_map[0];
        let second = bp.e820_map[1];
        assert_eq!({ first.addr }, 0);
        assert_eq!({ first.size }, LAYOUT_KERNEL_BASE);
        assert_eq!({ first.kind }, E820Type::Ram as u32);
        assert_eq!({ second.addr }, LAYOUT_KERNEL_BASE);
        assert_eq!({ second.kind }, E820Type::Reserved as u32);
    }

    #[test]
    #[should_panic(expected = "E820 map is full")]
    fn e820_map_is_capped() {
        let mut bp = BootParams::new();
        for i in 0..=E820_MAX_ENTRIES {
            bp.add_e820_entry(i as u64 * 0x1000, 0x1000, E820Type::Ram);
        }
    }
}
