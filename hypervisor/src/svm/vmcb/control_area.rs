use bitfield::bitfield;
use bitflags::bitflags;

// Size: 0x400
#[repr(C)]
pub struct ControlArea {
    pub intercept_cr_read: u16,   // +0x000
    pub intercept_cr_write: u16,  // +0x002
    pub intercept_dr_read: u16,   // +0x004
    pub intercept_dr_write: u16,  // +0x006
    pub intercept_exception: u32, // +0x008

    pub intercept_misc1: InterceptMisc1,    // +0x00c
    pub intercept_misc2: InterceptMisc2,    // +0x010
    pub reserved1: [u8; 0x03c - 0x014],         // +0x014
    pub pause_filter_threshold: u16,        // +0x03c
    pub pause_filter_count: u16,            // +0x03e
    pub iopm_base_pa: u64,                  // +0x040
    pub msrpm_base_pa: u64,                 // +0x048
    pub tsc_offset: u64,                    // +0x050
    pub guest_asid: u32,                    // +0x058
    pub tlb_control: u32,                   // +0x05c
    pub vintr: u64,                         // +0x060
    pub interrupt_shadow: u64,              // +0x068
    pub exit_code: u64,                     // +0x070
    pub exit_info1: u64,                    // +0x078
    pub exit_info2: u64,                    // +0x080
    pub exit_int_info: u64,                 // +0x088
    pub np_enable: u64,                     // +0x090
    pub avic_apic_bar: u64,                 // +0x098
    pub guest_pa_of_ghcb: u64,              // +0x0a0
    pub event_inj: u64,                     // +0x0a8
    pub ncr3: u64,                          // +0x0b0
    pub lbr_virtualization_enable: u64,     // +0x0b8
    pub vmcb_clean: u64,                    // +0x0c0
    pub nrip: u64,                          // +0x0c8
    pub num_of_bytes_fetched: u8,           // +0x0d0
    pub guest_instruction_bytes: [u8; 15],  // +0x0d1
    pub avic_apic_backing_page_pointer: u64, // +0x0e0
    pub reserved2: u64,                     // +0x0e8
    pub avic_logical_table_pointer: u64,    // +0x0f0
    pub avic_physical_table_pointer: u64,   // +0x0f8
    pub reserved3: u64,                     // +0x100
    pub vmcb_save_state_pointer: u64,       // +0x108
    pub reserved4: [u8; 0x400 - 0x110],     // +0x110
}
const_assert_eq!(core::mem::size_of::<ControlArea>(), 0x400);

/// `TLB_CONTROL` value: do nothing on VMRUN.
pub const TLB_CONTROL_DO_NOTHING: u32 = 0x0;
/// `TLB_CONTROL` value: flush this guest's TLB entries on VMRUN.
pub const TLB_CONTROL_FLUSH_GUEST_TLB: u32 = 0x3;

/// `NP_ENABLE` bit 0: nested paging.
pub const NP_ENABLE_NESTED_PAGING: u64 = 1 << 0;

bitflags! {
    pub struct InterceptMisc1: u32 {
        const INTERCEPT_INTR = 1 << 0;
        const INTERCEPT_NMI = 1 << 1;
        const INTERCEPT_SMI = 1 << 2;
        const INTERCEPT_INIT = 1 << 3;
        const INTERCEPT_VINTR = 1 << 4;
        const INTERCEPT_CR0 = 1 << 5;

        const INTERCEPT_READ_IDTR = 1 << 6;
        const INTERCEPT_READ_GDTR = 1 << 7;
        const INTERCEPT_READ_LDTR = 1 << 8;
        const INTERCEPT_READ_TR = 1 << 9;

        const INTERCEPT_WRITE_IDTR = 1 << 10;
        const INTERCEPT_WRITE_GDTR = 1 << 11;
        const INTERCEPT_WRITE_LDTR = 1 << 12;
        const INTERCEPT_WRITE_TR = 1 << 13;

        const INTERCEPT_RDTSC = 1 << 14;
        const INTERCEPT_RDPMC = 1 << 15;
        const INTERCEPT_PUSHF = 1 << 16;
        const INTERCEPT_POPF = 1 << 17;
        const INTERCEPT_CPUID = 1 << 18;
        const INTERCEPT_RSM = 1 << 19;
        const INTERCEPT_IRET = 1 << 20;
        const INTERCEPT_INTN = 1 << 21;
        const INTERCEPT_INVD = 1 << 22;
        const INTERCEPT_PAUSE = 1 << 23;
        const INTERCEPT_HLT = 1 << 24;
        const INTERCEPT_INVLPG = 1 << 25;
        const INTERCEPT_INVLPGA = 1 << 26;
        const INTERCEPT_IOIO_PROT = 1 << 27;
        const INTERCEPT_MSR_PROT = 1 << 28;
        const INTERCEPT_TASK_SWITCHES = 1 << 29;
        const INTERCEPT_FERR_FREEZE = 1 << 30;
        const INTERCEPT_SHUTDOWN = 1 << 31;
    }

    pub struct InterceptMisc2: u32 {
        const INTERCEPT_VMRUN = 1 << 0;
        const INTERCEPT_VMMCALL = 1 << 1;
        const INTERCEPT_VMLOAD = 1 << 2;
        const INTERCEPT_VMSAVE = 1 << 3;
        const INTERCEPT_STGI = 1 << 4;
        const INTERCEPT_CLGI = 1 << 5;
        const INTERCEPT_SKINIT = 1 << 6;
        const INTERCEPT_RDTSCP = 1 << 7;
        const INTERCEPT_ICEBP = 1 << 8;
        const INTERCEPT_WBINVD = 1 << 9;
        const INTERCEPT_MONITOR = 1 << 10;
        const INTERCEPT_MWAIT = 1 << 11;
        const INTERCEPT_MWAIT_CONDITIONAL = 1 << 12;
        const INTERCEPT_XSETBV = 1 << 13;
    }
}

bitfield! {
    /// Accessor over the `VINTR` word at +0x060, see `15.21 Virtual
    /// Interrupts`.
    pub struct VIntr(u64);
    impl Debug;
    pub v_tpr, set_v_tpr: 7, 0;
    pub v_irq, set_v_irq: 8, 8;
    pub v_intr_prio, set_v_intr_prio: 19, 16;
    pub v_ign_tpr, set_v_ign_tpr: 20, 20;
    pub v_intr_masking, set_v_intr_masking: 24, 24;
    pub v_intr_vector, set_v_intr_vector: 39, 32;
}

/// The `EXITCODE` values this VMM arms intercepts for. Every other code is a
/// configuration bug or hardware state the design does not recover from, so
/// the dispatcher treats unknown codes as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Physical interrupt while the guest was running.
    Intr,
    Cpuid,
    Hlt,
    Ioio,
    Msr,
    Vmmcall,
}

impl ExitCode {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0x60 => Some(Self::Intr),
            0x72 => Some(Self::Cpuid),
            0x78 => Some(Self::Hlt),
            0x7B => Some(Self::Ioio),
            0x7C => Some(Self::Msr),
            0x81 => Some(Self::Vmmcall),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vintr_field_placement() {
        let mut vintr = VIntr(0);
        vintr.set_v_irq(1);
        vintr.set_v_intr_vector(0x20);
        assert_eq!(vintr.0, (1 << 8) | (0x20 << 32));

        vintr.set_v_ign_tpr(1);
        vintr.set_v_intr_masking(1);
        assert_eq!(vintr.v_ign_tpr(), 1);
        assert_eq!(vintr.v_intr_masking(), 1);
    }

    #[test]
    fn exit_codes_decode() {
        assert_eq!(ExitCode::from_raw(0x60), Some(ExitCode::Intr));
        assert_eq!(ExitCode::from_raw(0x72), Some(ExitCode::Cpuid));
        assert_eq!(ExitCode::from_raw(0x7B), Some(ExitCode::Ioio));
        // VMRUN is intercepted but deliberately unhandled.
        assert_eq!(ExitCode::from_raw(0x80), None);
        assert_eq!(ExitCode::from_raw(u64::MAX), None);
    }
}
