//! The VM orchestrator: owns the vCPU and guest RAM, stages a Linux
//! bzImage per the boot protocol, and drives the endless VMRUN loop.

use alloc::sync::Arc;

use snafu::Snafu;

use crate::linux::{self, BootParams, E820Type, SetupHeader};
use crate::mem::{PageAllocator, PAGE_SIZE, PAGE_SIZE_2M};
use crate::support;
use crate::svm::data::nested_page_table::NestedPageTable;
use crate::svm::vcpu::{PendingIrqs, SerialTx, VirtualCpu};

/// Size in bytes of guest RAM.
pub const GUEST_MEMORY_SIZE: usize = 100 * 1024 * 1024;
const_assert!(GUEST_MEMORY_SIZE % PAGE_SIZE_2M == 0);

/// TLB tag for the guest; ASID 0 belongs to the host.
const GUEST_ASID: u32 = 1;

const KERNEL_CMDLINE: &[u8] = b"console=ttyS0 earlyprintk=serial nokaslr";

/// Configuration-time failures. The caller decides whether to continue
/// running without virtualization.
#[derive(Debug, Snafu)]
pub enum VmError {
    /// Not an AMD processor with the SVM feature.
    #[snafu(display("the system does not support AMD-V virtualization"))]
    SystemNotSupported,
    /// SVM exists but the firmware disabled it.
    #[snafu(display("SVM is disabled by the firmware"))]
    SvmDisabled,
}

pub struct Vm {
    vcpu: VirtualCpu,
    guest_mem: &'static mut [u8],
}

impl Vm {
    /// Verifies that the processor can virtualize and creates the vCPU.
    pub fn new(
        serial_tx: SerialTx,
        host_data_selector: u16,
        allocator: &dyn PageAllocator,
    ) -> Result<Self, VmError> {
        if !support::has_amd_vendor() {
            log::error!("Unsupported CPU vendor");
            return Err(VmError::SystemNotSupported);
        }
        if !support::is_svm_supported() {
            return Err(VmError::SvmDisabled);
        }

        Ok(Self {
            vcpu: VirtualCpu::new(0, GUEST_ASID, serial_tx, host_data_selector, allocator),
            guest_mem: &mut [],
        })
    }

    /// Enables the SVM extensions and configures the control block.
    pub fn init(&mut self, allocator: &dyn PageAllocator) {
        self.vcpu.virtualize(allocator);
        log::info!("vCPU #{} is created.", self.vcpu.id());

        self.vcpu.setup_guest_state();
    }

    /// The pending-IRQ mask the host's interrupt dispatcher feeds.
    pub fn pending_irqs(&self) -> Arc<PendingIrqs> {
        self.vcpu.pending_irqs()
    }

    /// Allocates guest RAM, stages the kernel image and builds the nested
    /// page table over the whole region.
    pub fn setup_guest_memory(&mut self, guest_image: &[u8], allocator: &dyn PageAllocator) {
        let memory = allocator
            .alloc_aligned_pages(GUEST_MEMORY_SIZE / PAGE_SIZE, PAGE_SIZE_2M)
            .expect("failed to allocate guest memory");
        let guest_mem =
            unsafe { core::slice::from_raw_parts_mut(memory.as_ptr(), GUEST_MEMORY_SIZE) };

        load_linux(guest_mem, guest_image);

        let host_base = allocator.virt_to_phys(memory.as_ptr());
        let npt = NestedPageTable::build(0, host_base, GUEST_MEMORY_SIZE, allocator);
        self.vcpu.set_npt(npt.root_pa(), host_base);
        self.guest_mem = guest_mem;

        log::info!(
            "Guest memory is mapped: HVA={:p} (size={:#x})",
            memory.as_ptr(),
            GUEST_MEMORY_SIZE
        );
    }

    /// Enters the guest and never returns. Host interrupts are disabled on
    /// this core; from here on the GIF windows in the exit handlers are the
    /// only points where the host consumes interrupts.
    pub fn run(&mut self) -> ! {
        assert!(!self.guest_mem.is_empty(), "guest memory is not set up");

        x86_64::instructions::interrupts::disable();
        self.vcpu.run()
    }
}

/// Stages the boot-protocol data and the protected-mode kernel code into
/// guest RAM. The slice length is the guest's physical memory size.
fn load_linux(guest_mem: &mut [u8], image: &[u8]) {
    assert!(
        image.len() < guest_mem.len(),
        "bzImage size exceeds guest memory size"
    );

    let mut hdr = SetupHeader::from_bzimage(image);
    hdr.type_of_loader = 0xFF; // no assigned loader id
    hdr.ext_loader_ver = 0;

    let mut loadflags = hdr.loadflags;
    loadflags.set_loaded_high(1); // the kernel code goes to 0x10_0000
    loadflags.set_can_use_heap(1); // memory below the boot params is heap
    loadflags.set_keep_segments(1); // segments are already flat with base 0
    hdr.loadflags = loadflags;

    hdr.heap_end_ptr = (linux::LAYOUT_BOOTPARAM - 0x200) as u16;
    hdr.cmd_line_ptr = linux::LAYOUT_CMDLINE as u32;
    hdr.vid_mode = 0xFFFF; // normal VGA

    let mut bp = BootParams::new();
    bp.hdr = hdr;
    bp.add_e820_entry(0, linux::LAYOUT_KERNEL_BASE, E820Type::Ram);
    bp.add_e820_entry(
        linux::LAYOUT_KERNEL_BASE,
        guest_mem.len() as u64 - linux::LAYOUT_KERNEL_BASE,
        E820Type::Ram,
    );

    // Command line, truncated to what the kernel is willing to read.
    let cmdline_max = (hdr.cmdline_size as usize).min(256);
    let cmdline_base = linux::LAYOUT_CMDLINE as usize;
    let len = KERNEL_CMDLINE.len().min(cmdline_max);
    guest_mem[cmdline_base..cmdline_base + cmdline_max].fill(0);
    guest_mem[cmdline_base..cmdline_base + len].copy_from_slice(&KERNEL_CMDLINE[..len]);

    load_image(guest_mem, bp.as_bytes(), linux::LAYOUT_BOOTPARAM as usize);

    // The real-mode sectors are skipped; only the protected-mode code is
    // loaded since the guest enters at the 32-bit entry point.
    let code_offset = hdr.protected_code_offset();
    load_image(
        guest_mem,
        &image[code_offset..],
        linux::LAYOUT_KERNEL_BASE as usize,
    );

    log::info!("Guest memory region: 0x0 - {:#x}", guest_mem.len());
    log::info!("Guest kernel code offset: {:#x}", code_offset);
}

fn load_image(memory: &mut [u8], image: &[u8], addr: usize) {
    assert!(
        memory.len() >= addr + image.len(),
        "guest memory size is insufficient"
    );
    memory[addr..addr + image.len()].copy_from_slice(image);
}
