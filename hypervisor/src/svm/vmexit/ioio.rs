//! I/O port virtualization: the 8259 PIC protocol, the first 8250 serial
//! port, PIT pass-through and a handful of stubbed legacy ranges. A port
//! outside the dispatch table aborts the machine; passing unknown accesses
//! through to hardware silently is exactly what the fully-masked permission
//! bitmap exists to prevent.

use bitfield::bitfield;
use x86_64::instructions::port::Port;

use super::ExitType;
use crate::bits::bit_u8;
use crate::svm::data::guest_io::PicInitPhase;
use crate::svm::vcpu::{VirtualCpu, IRQ_CASCADE};

/// ICW1 with IC4 set: the only initialization command the emulation accepts.
const ICW1_INIT: u8 = 0x11;

bitfield! {
    /// EXITINFO1 layout for the IOIO intercept, see `15.10.2 IO
    /// Instruction Intercepts`.
    #[derive(Clone, Copy)]
    pub struct IoioInfo(u32);
    impl Debug;
    pub is_in, _: 0, 0;
    pub str_op, _: 2, 2;
    pub rep, _: 3, 3;
    pub sz8, _: 4, 4;
    pub sz16, _: 5, 5;
    pub sz32, _: 6, 6;
    pub port, _: 31, 16;
}

pub fn handle(vcpu: &mut VirtualCpu) -> ExitType {
    let info = IoioInfo(vcpu.vmcb().control_area.exit_info1 as u32);

    if info.is_in() != 0 {
        handle_in(vcpu, info);
    } else {
        handle_out(vcpu, info);
    }

    ExitType::IncrementRip
}

fn handle_in(vcpu: &mut VirtualCpu, info: IoioInfo) {
    let port = info.port() as u16;

    match port {
        0x0040..=0x0047 => pit_in(vcpu, info),
        0x0020 | 0x00A0 => vcpu.abort(format_args!(
            "I/O-in from PIC command port: {:#x}",
            port
        )),
        0x0021 | 0x00A1 => pic_data_in(vcpu, info),
        // PS/2 controller. Not emulated.
        0x0060 | 0x0064 => vcpu.vmcb_mut().save_area.rax = 0,
        // RTC. Not emulated.
        0x0070 | 0x0071 => vcpu.vmcb_mut().save_area.rax = 0,
        // DMA page registers. Not emulated.
        0x0080..=0x008F => vcpu.vmcb_mut().save_area.rax = 0,
        // Second, fourth and third serial ports. Ignore.
        0x02E8..=0x02EF | 0x02F8..=0x02FF | 0x03E8..=0x03EF => {}
        // VGA. Not emulated.
        0x03B0..=0x03DF => vcpu.vmcb_mut().save_area.rax = 0,
        0x03F8..=0x03FF => serial_in(vcpu, info),
        // PCI configuration space. Unimplemented.
        0x0CF8..=0x0CFF => vcpu.vmcb_mut().save_area.rax = 0,
        // Old PCI. Ignore.
        0xC000..=0xCFFF => {}
        _ => vcpu.abort(format_args!("unhandled I/O-in port: {:#x}", port)),
    }
}

fn handle_out(vcpu: &mut VirtualCpu, info: IoioInfo) {
    let port = info.port() as u16;

    match port {
        0x0040..=0x0047 => pit_out(vcpu, info),
        0x0020 | 0x00A0 => pic_command_out(vcpu, info),
        0x0021 | 0x00A1 => pic_data_out(vcpu, info),
        // Legacy controllers the guest probes during boot. Ignore.
        0x0060 | 0x0064 | 0x0070 | 0x0071 => {}
        0x0080..=0x008F => {}
        0x02E8..=0x02EF | 0x02F8..=0x02FF | 0x03E8..=0x03EF => {}
        0x03B0..=0x03DF => {}
        0x03F8..=0x03FF => serial_out(vcpu, info),
        0x0CF8..=0x0CFF => {}
        0xC000..=0xCFFF => {}
        _ => vcpu.abort(format_args!("unhandled I/O-out port: {:#x}", port)),
    }
}

// =============================================================================

/// 8259 command port (ICW1 / OCW2 / OCW3).
fn pic_command_out(vcpu: &mut VirtualCpu, info: IoioInfo) {
    let port = info.port() as u16;
    if info.sz8() == 0 {
        vcpu.abort(format_args!("non-byte access to PIC port {:#x}", port));
    }

    let command = (vcpu.vmcb().save_area.rax & 0xFF) as u8;
    match command {
        // ICW1: begin (re-)initialization.
        ICW1_INIT => {
            if port == 0x20 {
                vcpu.io_state.primary_phase = PicInitPhase::Phase1;
            } else {
                vcpu.io_state.secondary_phase = PicInitPhase::Phase1;
            }
        }
        // OCW2 specific EOI. Swallowed: the physical PIC is acknowledged by
        // the host's interrupt handler, never by the guest.
        0x60..=0x67 => {}
        _ => vcpu.abort(format_args!("unsupported PIC command: {:#x}", command)),
    }
}

/// 8259 data port read. Only the interrupt mask is readable, and only
/// outside an initialization sequence.
fn pic_data_in(vcpu: &mut VirtualCpu, info: IoioInfo) {
    let port = info.port() as u16;
    if info.sz8() == 0 {
        vcpu.abort(format_args!("non-byte access to PIC port {:#x}", port));
    }

    let (phase, mask) = if port == 0x21 {
        (vcpu.io_state.primary_phase, vcpu.io_state.primary_mask)
    } else {
        (vcpu.io_state.secondary_phase, vcpu.io_state.secondary_mask)
    };

    match phase {
        PicInitPhase::Uninitialized | PicInitPhase::Inited => {
            vcpu.vmcb_mut().save_area.rax = mask as u64;
        }
        _ => vcpu.abort(format_args!(
            "PIC data read during initialization: {:#x}",
            port
        )),
    }
}

/// 8259 data port write: OCW1 outside an initialization sequence, ICW2-4
/// within one.
fn pic_data_out(vcpu: &mut VirtualCpu, info: IoioInfo) {
    let port = info.port() as u16;
    if info.sz8() == 0 {
        vcpu.abort(format_args!("non-byte access to PIC port {:#x}", port));
    }

    let primary = port == 0x21;
    let value = (vcpu.vmcb().save_area.rax & 0xFF) as u8;
    let phase = if primary {
        vcpu.io_state.primary_phase
    } else {
        vcpu.io_state.secondary_phase
    };

    let (new_phase, new_mask, new_base) = match phase {
        // OCW1: interrupt mask.
        PicInitPhase::Uninitialized | PicInitPhase::Inited => (phase, Some(value), None),
        // ICW2: vector offset.
        PicInitPhase::Phase1 => (PicInitPhase::Phase2, None, Some(value)),
        // ICW3: cascade wiring is fixed, anything else is a lie about the
        // (virtual) board layout.
        PicInitPhase::Phase2 => {
            let expected = if primary { bit_u8(IRQ_CASCADE) } else { 2 };
            if value != expected {
                vcpu.abort(format_args!("unexpected PIC cascade identity: {:#x}", value));
            }
            (PicInitPhase::Phase3, None, None)
        }
        // ICW4: mode byte, accepted as-is.
        PicInitPhase::Phase3 => (PicInitPhase::Inited, None, None),
    };

    let state = &mut vcpu.io_state;
    if primary {
        state.primary_phase = new_phase;
        if let Some(mask) = new_mask {
            state.primary_mask = mask;
        }
        if let Some(base) = new_base {
            state.primary_base = base;
        }
    } else {
        state.secondary_phase = new_phase;
        if let Some(mask) = new_mask {
            state.secondary_mask = mask;
        }
        if let Some(base) = new_base {
            state.secondary_base = base;
        }
    }
}

// =============================================================================

fn serial_in(vcpu: &mut VirtualCpu, info: IoioInfo) {
    let port = info.port() as u16;

    let value = match port {
        // Receive buffer. Pass-through.
        0x3F8 => unsafe { Port::<u8>::new(port).read() },
        // Interrupt Enable Register. Shadowed so that hardware interrupt
        // generation stays under the VMM's control.
        0x3F9 => vcpu.io_state.ier,
        // Interrupt Identification Register. Pass-through.
        0x3FA => unsafe { Port::<u8>::new(port).read() },
        // Line Control Register (the MSB is DLAB).
        0x3FB => 0x00,
        // Modem Control Register. Shadowed.
        0x3FC => vcpu.io_state.mcr,
        // Line Status Register. Pass-through.
        0x3FD => unsafe { Port::<u8>::new(port).read() },
        // Modem Status Register. Pass-through.
        0x3FE => unsafe { Port::<u8>::new(port).read() },
        // Scratch Register: the 8250 has none.
        0x3FF => 0x00,
        _ => unreachable!(),
    };

    vcpu.vmcb_mut().save_area.rax = value as u64;
}

fn serial_out(vcpu: &mut VirtualCpu, info: IoioInfo) {
    let port = info.port() as u16;
    let value = (vcpu.vmcb().save_area.rax & 0xFF) as u8;

    match port {
        // Transmit buffer.
        0x3F8 => (vcpu.serial_tx)(value),
        // Interrupt Enable Register. Shadowed.
        0x3F9 => vcpu.io_state.ier = value,
        // FIFO control. Ignore.
        0x3FA => {}
        // Line Control Register. Ignore.
        0x3FB => {}
        // Modem Control Register. Shadowed.
        0x3FC => vcpu.io_state.mcr = value,
        // Scratch Register. Ignore.
        0x3FF => {}
        _ => vcpu.abort(format_args!(
            "unsupported I/O-out to the first serial port: {:#x}",
            port
        )),
    }
}

// =============================================================================

/// PIT counter and control ports are passed through unmodified; the host
/// programs the timer and the guest only reads it back.
fn pit_in(vcpu: &mut VirtualCpu, info: IoioInfo) {
    let port = info.port() as u16;

    let value = if info.sz8() != 0 {
        unsafe { Port::<u8>::new(port).read() as u64 }
    } else if info.sz16() != 0 {
        unsafe { Port::<u16>::new(port).read() as u64 }
    } else {
        unsafe { Port::<u32>::new(port).read() as u64 }
    };

    vcpu.vmcb_mut().save_area.rax = value;
}

fn pit_out(vcpu: &mut VirtualCpu, info: IoioInfo) {
    let port = info.port() as u16;
    let rax = vcpu.vmcb().save_area.rax;

    if info.sz8() != 0 {
        unsafe { Port::<u8>::new(port).write(rax as u8) };
    } else if info.sz16() != 0 {
        unsafe { Port::<u16>::new(port).write(rax as u16) };
    } else {
        unsafe { Port::<u32>::new(port).write(rax as u32) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::testing::TestAllocator;
    use crate::svm::vcpu::tests::test_vcpu;
    use std::sync::Mutex;

    const SZ8: u32 = 1 << 4;
    const SZ16: u32 = 1 << 5;
    const IN: u32 = 1;
    const OUT: u32 = 0;

    fn run_io(vcpu: &mut VirtualCpu, port: u16, flags: u32, al: u64) {
        vcpu.vmcb_mut().save_area.rax = al;
        vcpu.vmcb_mut().control_area.exit_info1 = ((port as u32) << 16 | flags) as u64;
        assert_eq!(handle(vcpu), ExitType::IncrementRip);
    }

    fn init_pic_sequence(vcpu: &mut VirtualCpu, command_port: u16, vector_base: u8) {
        let data_port = command_port + 1;
        let cascade = if command_port == 0x20 { 0b100 } else { 0b010 };
        run_io(vcpu, command_port, OUT | SZ8, ICW1_INIT as u64);
        run_io(vcpu, data_port, OUT | SZ8, vector_base as u64);
        run_io(vcpu, data_port, OUT | SZ8, cascade);
        run_io(vcpu, data_port, OUT | SZ8, 0x01);
    }

    #[test]
    fn pic_initialization_protocol() {
        let mut vcpu = test_vcpu();

        run_io(&mut vcpu, 0x20, OUT | SZ8, ICW1_INIT as u64);
        assert_eq!(vcpu.io_state.primary_phase, PicInitPhase::Phase1);

        run_io(&mut vcpu, 0x21, OUT | SZ8, 0x20);
        assert_eq!(vcpu.io_state.primary_phase, PicInitPhase::Phase2);
        assert_eq!(vcpu.io_state.primary_base, 0x20);

        run_io(&mut vcpu, 0x21, OUT | SZ8, 0b100);
        assert_eq!(vcpu.io_state.primary_phase, PicInitPhase::Phase3);

        run_io(&mut vcpu, 0x21, OUT | SZ8, 0x01);
        assert_eq!(vcpu.io_state.primary_phase, PicInitPhase::Inited);

        init_pic_sequence(&mut vcpu, 0xA0, 0x28);
        assert_eq!(vcpu.io_state.secondary_phase, PicInitPhase::Inited);
        assert_eq!(vcpu.io_state.secondary_base, 0x28);
    }

    #[test]
    fn icw1_restarts_the_sequence_from_any_phase() {
        let mut vcpu = test_vcpu();
        init_pic_sequence(&mut vcpu, 0x20, 0x20);
        assert_eq!(vcpu.io_state.primary_phase, PicInitPhase::Inited);

        run_io(&mut vcpu, 0x20, OUT | SZ8, ICW1_INIT as u64);
        assert_eq!(vcpu.io_state.primary_phase, PicInitPhase::Phase1);
    }

    #[test]
    #[should_panic(expected = "unexpected PIC cascade identity")]
    fn wrong_cascade_identity_aborts() {
        let mut vcpu = test_vcpu();
        run_io(&mut vcpu, 0x20, OUT | SZ8, ICW1_INIT as u64);
        run_io(&mut vcpu, 0x21, OUT | SZ8, 0x20);
        run_io(&mut vcpu, 0x21, OUT | SZ8, 0b001);
    }

    #[test]
    fn mask_round_trips_outside_initialization() {
        let mut vcpu = test_vcpu();
        init_pic_sequence(&mut vcpu, 0x20, 0x20);

        run_io(&mut vcpu, 0x21, OUT | SZ8, 0xFE);
        assert_eq!(vcpu.io_state.primary_mask, 0xFE);

        run_io(&mut vcpu, 0x21, IN | SZ8, 0);
        assert_eq!(vcpu.vmcb().save_area.rax, 0xFE);
    }

    #[test]
    fn guest_eoi_is_swallowed() {
        let mut vcpu = test_vcpu();
        init_pic_sequence(&mut vcpu, 0x20, 0x20);

        // Specific EOI for line 2; the emulated state must not change and
        // nothing may reach the physical PIC.
        run_io(&mut vcpu, 0x20, OUT | SZ8, 0x62);
        assert_eq!(vcpu.io_state.primary_phase, PicInitPhase::Inited);
    }

    #[test]
    #[should_panic(expected = "unsupported PIC command")]
    fn unknown_pic_command_aborts() {
        let mut vcpu = test_vcpu();
        run_io(&mut vcpu, 0x20, OUT | SZ8, 0x0A);
    }

    #[test]
    #[should_panic(expected = "non-byte access")]
    fn word_sized_pic_access_aborts() {
        let mut vcpu = test_vcpu();
        run_io(&mut vcpu, 0x21, OUT | SZ16, 0xFFFF);
    }

    #[test]
    #[should_panic(expected = "0x9999")]
    fn unmapped_port_aborts_with_the_port_number() {
        let mut vcpu = test_vcpu();
        run_io(&mut vcpu, 0x9999, IN | SZ8, 0);
    }

    #[test]
    fn pci_config_reads_zero() {
        let mut vcpu = test_vcpu();
        run_io(&mut vcpu, 0x0CF8, IN | SZ8, 0xFFFF_FFFF);
        assert_eq!(vcpu.vmcb().save_area.rax, 0);
    }

    #[test]
    fn secondary_uart_probes_are_ignored() {
        let mut vcpu = test_vcpu();
        run_io(&mut vcpu, 0x2F8, OUT | SZ8, b'x' as u64);
        run_io(&mut vcpu, 0x3E9, IN | SZ8, 0);
    }

    #[test]
    fn serial_ier_and_mcr_are_shadowed() {
        let mut vcpu = test_vcpu();

        run_io(&mut vcpu, 0x3F9, OUT | SZ8, 0x0F);
        assert_eq!(vcpu.io_state.ier, 0x0F);
        run_io(&mut vcpu, 0x3FC, OUT | SZ8, 0x0B);
        assert_eq!(vcpu.io_state.mcr, 0x0B);

        run_io(&mut vcpu, 0x3F9, IN | SZ8, 0);
        assert_eq!(vcpu.vmcb().save_area.rax, 0x0F);
        run_io(&mut vcpu, 0x3FC, IN | SZ8, 0);
        assert_eq!(vcpu.vmcb().save_area.rax, 0x0B);

        // LCR and scratch read as fixed values.
        run_io(&mut vcpu, 0x3FB, IN | SZ8, 0xAA);
        assert_eq!(vcpu.vmcb().save_area.rax, 0);
        run_io(&mut vcpu, 0x3FF, IN | SZ8, 0xAA);
        assert_eq!(vcpu.vmcb().save_area.rax, 0);
    }

    static CAPTURED_TX: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    fn capture_tx(byte: u8) {
        CAPTURED_TX.lock().unwrap().push(byte);
    }

    #[test]
    fn transmit_reaches_the_serial_sink() {
        let mut vcpu = VirtualCpu::new(0, 1, capture_tx, 0x10, &TestAllocator);
        vcpu.setup_guest_state();

        run_io(&mut vcpu, 0x3F8, OUT | SZ8, b'H' as u64);
        assert_eq!(CAPTURED_TX.lock().unwrap().as_slice(), b"H");
    }
}
