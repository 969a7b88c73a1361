/// Guest registers that are not part of the VMCB state-save area. The CPU
/// only auto-saves RAX/RSP/RIP and the system state on #VMEXIT; everything
/// here is saved and restored manually by the VMRUN trampoline, which
/// addresses the fields by the offsets pinned below.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(16))]
pub struct GuestRegisters {
    pub rcx: u64, // +0x00
    pub rdx: u64, // +0x08
    pub rbx: u64, // +0x10
    pub rbp: u64, // +0x18
    pub rsi: u64, // +0x20
    pub rdi: u64, // +0x28
    pub r8: u64,  // +0x30
    pub r9: u64,  // +0x38
    pub r10: u64, // +0x40
    pub r11: u64, // +0x48
    pub r12: u64, // +0x50
    pub r13: u64, // +0x58
    pub r14: u64, // +0x60
    pub r15: u64, // +0x68

    // 16-byte alignment is load-bearing: the trampoline moves these with
    // `movaps`.
    pub xmm0: u128, // +0x70
    pub xmm1: u128, // +0x80
    pub xmm2: u128, // +0x90
    pub xmm3: u128, // +0xa0
    pub xmm4: u128, // +0xb0
    pub xmm5: u128, // +0xc0
    pub xmm6: u128, // +0xd0
    pub xmm7: u128, // +0xe0
}
const_assert_eq!(core::mem::offset_of!(GuestRegisters, rbx), 0x10);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, r15), 0x68);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, xmm0), 0x70);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, xmm7), 0xe0);
const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 0xf0);

impl GuestRegisters {
    pub const fn new() -> Self {
        Self {
            rcx: 0,
            rdx: 0,
            rbx: 0,
            rbp: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            xmm0: 0,
            xmm1: 0,
            xmm2: 0,
            xmm3: 0,
            xmm4: 0,
            xmm5: 0,
            xmm6: 0,
            xmm7: 0,
        }
    }
}
