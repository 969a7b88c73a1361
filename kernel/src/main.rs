//! Nidhogg: a bare-metal kernel that turns itself into a type-1 AMD-V
//! hypervisor and boots an unmodified Linux kernel as its guest.

#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]

extern crate alloc;

use core::arch::global_asm;

use hypervisor::vm::Vm;

mod allocator;
mod boot_info;
mod gdt;
mod interrupts;
mod logger;
mod mem;
mod panic;
mod serial;

use boot_info::BootInfo;

const BOOT_STACK_SIZE: usize = 16 * 4096;

#[repr(C, align(16))]
struct BootStack([u8; BOOT_STACK_SIZE]);

static mut BOOT_STACK: BootStack = BootStack([0; BOOT_STACK_SIZE]);

// The bootloader jumps here with the BootInfo pointer in RDI, which the
// stack switch leaves untouched.
global_asm!(
    ".global kernel_entry",
    "kernel_entry:",
    "lea rsp, [{stack} + {stack_size}]",
    "call {main}",
    "2:",
    "hlt",
    "jmp 2b",
    stack = sym BOOT_STACK,
    stack_size = const BOOT_STACK_SIZE,
    main = sym kernel_main,
);

extern "C" fn kernel_main(boot_info: &'static BootInfo) -> ! {
    serial::init();
    logger::init();
    log::info!("Booting Nidhogg...");

    if !boot_info.is_valid() {
        panic!("invalid boot info magic");
    }

    gdt::init();
    interrupts::init_idt();

    allocator::init_frames(&boot_info.map);
    log::info!("Initialized page allocator.");

    // The handoff pointers are physical addresses; capture them while the
    // loader's identity mapping is still in place.
    let guest_image_pa = boot_info.guest.guest_image as u64;
    let guest_image_len = boot_info.guest.guest_size as usize;

    log::info!("Reconstructing memory mapping...");
    mem::reconstruct_mapping();

    allocator::init_heap();
    log::info!("Initialized general allocator.");

    interrupts::init_pic();
    log::info!("Initialized PIC.");

    interrupts::enable_line(interrupts::IrqLine::Timer);
    log::info!("Enabled PIT.");

    interrupts::enable_line(interrupts::IrqLine::Serial1);
    serial::enable_interrupts();
    log::info!("Enabled serial interrupts.");

    let allocator = &allocator::HOST_ALLOCATOR;
    match Vm::new(serial::write_byte, gdt::kernel_data_selector().0, allocator) {
        Ok(mut vm) => {
            vm.init(allocator);
            log::info!("Enabled SVM extensions.");

            let guest_image = unsafe {
                core::slice::from_raw_parts(
                    mem::phys_to_virt(guest_image_pa) as *const u8,
                    guest_image_len,
                )
            };
            vm.setup_guest_memory(guest_image, allocator);
            log::info!("Set up guest memory.");

            interrupts::subscribe(vm.pending_irqs());

            log::info!("Starting the virtual machine...");
            vm.run()
        }
        Err(err) => log::error!("Failed to create a VM instance: {}", err),
    }

    log::warn!("End of life...");
    panic::endless_halt()
}
