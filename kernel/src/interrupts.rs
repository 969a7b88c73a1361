//! IDT setup, the host 8259 driver, and the IRQ bridge to the guest.
//!
//! Every IRQ in the window shared with the guest flows through
//! [`irq_dispatch`]: the subscribed pending mask is marked first (so the
//! guest sees the line), then the physical PIC is acknowledged. The guest's
//! own EOI writes never reach hardware; the hypervisor swallows them.

use alloc::sync::Arc;

use hypervisor::bits::bit_u8;
use hypervisor::svm::vcpu::PendingIrqs;
use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::instructions::port::Port;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

/// First vector of the primary PIC after remapping.
pub const PIC_1_OFFSET: u8 = 32;
/// First vector of the secondary PIC after remapping.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// The vCPU's pending-IRQ mask, installed once the VM exists.
static IRQ_SUBSCRIBER: Mutex<Option<Arc<PendingIrqs>>> = Mutex::new(None);

/// Legacy IRQ lines.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum IrqLine {
    Timer = 0,
    Keyboard = 1,
    Cascade = 2,
    Serial2 = 3,
    Serial1 = 4,
    Parallel23 = 5,
    Floppy = 6,
    Parallel1 = 7,
    Rtc = 8,
    Acpi = 9,
    Mouse = 12,
    Coprocessor = 13,
    PrimaryAta = 14,
    SecondaryAta = 15,
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::error!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    panic!(
        "EXCEPTION: DOUBLE FAULT (error: {})\n{:#?}",
        error_code, stack_frame
    );
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT (error: {:#x})\n{:#?}",
        error_code, stack_frame
    );
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    panic!("EXCEPTION: INVALID OPCODE\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    log::error!("EXCEPTION: PAGE FAULT");
    log::error!("Accessed Address: {:?}", Cr2::read());
    log::error!("Error Code: {:?}", error_code);
    panic!("{:#?}", stack_frame);
}

macro_rules! irq_handler {
    ($name:ident, $line:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            irq_dispatch($line);
        }
    };
}

irq_handler!(irq0_handler, 0);
irq_handler!(irq1_handler, 1);
irq_handler!(irq2_handler, 2);
irq_handler!(irq3_handler, 3);
irq_handler!(irq4_handler, 4);
irq_handler!(irq5_handler, 5);
irq_handler!(irq6_handler, 6);
irq_handler!(irq7_handler, 7);
irq_handler!(irq8_handler, 8);
irq_handler!(irq9_handler, 9);
irq_handler!(irq10_handler, 10);
irq_handler!(irq11_handler, 11);
irq_handler!(irq12_handler, 12);
irq_handler!(irq13_handler, 13);
irq_handler!(irq14_handler, 14);
irq_handler!(irq15_handler, 15);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);

        idt[PIC_1_OFFSET as usize].set_handler_fn(irq0_handler);
        idt[PIC_1_OFFSET as usize + 1].set_handler_fn(irq1_handler);
        idt[PIC_1_OFFSET as usize + 2].set_handler_fn(irq2_handler);
        idt[PIC_1_OFFSET as usize + 3].set_handler_fn(irq3_handler);
        idt[PIC_1_OFFSET as usize + 4].set_handler_fn(irq4_handler);
        idt[PIC_1_OFFSET as usize + 5].set_handler_fn(irq5_handler);
        idt[PIC_1_OFFSET as usize + 6].set_handler_fn(irq6_handler);
        idt[PIC_1_OFFSET as usize + 7].set_handler_fn(irq7_handler);
        idt[PIC_2_OFFSET as usize].set_handler_fn(irq8_handler);
        idt[PIC_2_OFFSET as usize + 1].set_handler_fn(irq9_handler);
        idt[PIC_2_OFFSET as usize + 2].set_handler_fn(irq10_handler);
        idt[PIC_2_OFFSET as usize + 3].set_handler_fn(irq11_handler);
        idt[PIC_2_OFFSET as usize + 4].set_handler_fn(irq12_handler);
        idt[PIC_2_OFFSET as usize + 5].set_handler_fn(irq13_handler);
        idt[PIC_2_OFFSET as usize + 6].set_handler_fn(irq14_handler);
        idt[PIC_2_OFFSET as usize + 7].set_handler_fn(irq15_handler);
        idt
    };
}

pub fn init_idt() {
    IDT.load();
}

/// Remaps the PIC pair, masks every line, and turns interrupts back on.
/// Individual lines are opened with [`enable_line`].
pub fn init_pic() {
    x86_64::instructions::interrupts::disable();

    unsafe {
        PICS.lock().initialize();

        Port::<u8>::new(0x21).write(0xFF);
        Port::<u8>::new(0xA1).write(0xFF);
    }

    x86_64::instructions::interrupts::enable();
}

/// Unmasks one IRQ line on the physical controller (OCW1).
pub fn enable_line(line: IrqLine) {
    let line = line as u8;
    let mut data_port = Port::<u8>::new(if line < 8 { 0x21 } else { 0xA1 });

    unsafe {
        let mask = data_port.read();
        data_port.write(mask & !bit_u8(line % 8));
    }
}

/// Routes IRQs in the shared window into the guest's pending mask.
pub fn subscribe(pending: Arc<PendingIrqs>) {
    *IRQ_SUBSCRIBER.lock() = Some(pending);
}

/// Common IRQ path: mark the line for the guest, then acknowledge the
/// physical controller. The order matters; acknowledging first would let
/// the same line fire again before the guest ever saw it.
fn irq_dispatch(line: u8) {
    if let Some(pending) = IRQ_SUBSCRIBER.lock().as_ref() {
        pending.mark(line);
    }

    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + line);
    }
}
