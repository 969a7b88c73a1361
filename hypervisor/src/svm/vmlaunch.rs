//! The VMRUN trampoline: the one place raw assembly crosses the host/guest
//! boundary.
//!
//! `launch_vm` runs the guest until the next #VMEXIT. The CPU only swaps
//! RAX/RSP/RIP and system state through the VMCB, so the remaining
//! general-purpose registers and XMM0-7 are moved between the CPU and
//! [`GuestRegisters`] by hand. The field offsets in the assembly are pinned
//! by `const_assert_eq!` in `data/guest.rs`.
//!
//! Register contract: `rdi` = `&mut GuestRegisters`, `rsi` = VMCB physical
//! address. Callee-saved registers are preserved; everything else is
//! clobbered. The caller must hold GIF clear so that the only way out of the
//! guest is a #VMEXIT.

use core::arch::global_asm;

use super::data::guest::GuestRegisters;

global_asm!(
    ".global launch_vm",
    ".align 16",
    "launch_vm:",
    // Callee-saved host registers.
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    // RAX carries the VMCB physical address into VMLOAD/VMRUN/VMSAVE and
    // must not be touched until after VMRUN.
    "mov rax, rsi",
    // Keep the register-file pointer for after the exit.
    "push rdi",
    // Load the guest register file. RBX is the walking pointer, so its own
    // value is loaded last.
    "mov rbx, rdi",
    "mov rcx, [rbx + 0x00]",
    "mov rdx, [rbx + 0x08]",
    "mov rbp, [rbx + 0x18]",
    "mov rsi, [rbx + 0x20]",
    "mov rdi, [rbx + 0x28]",
    "mov r8,  [rbx + 0x30]",
    "mov r9,  [rbx + 0x38]",
    "mov r10, [rbx + 0x40]",
    "mov r11, [rbx + 0x48]",
    "mov r12, [rbx + 0x50]",
    "mov r13, [rbx + 0x58]",
    "mov r14, [rbx + 0x60]",
    "mov r15, [rbx + 0x68]",
    "movaps xmm0, xmmword ptr [rbx + 0x70]",
    "movaps xmm1, xmmword ptr [rbx + 0x80]",
    "movaps xmm2, xmmword ptr [rbx + 0x90]",
    "movaps xmm3, xmmword ptr [rbx + 0xa0]",
    "movaps xmm4, xmmword ptr [rbx + 0xb0]",
    "movaps xmm5, xmmword ptr [rbx + 0xc0]",
    "movaps xmm6, xmmword ptr [rbx + 0xd0]",
    "movaps xmm7, xmmword ptr [rbx + 0xe0]",
    "mov rbx, [rbx + 0x10]",
    // Enter the guest; execution resumes below on #VMEXIT.
    "vmload rax",
    "vmrun rax",
    "vmsave rax",
    // Store the guest register file. RAX is free again: the guest's RAX
    // went to the VMCB state-save area.
    "mov rax, [rsp]",
    "mov [rax + 0x00], rcx",
    "mov [rax + 0x08], rdx",
    "mov [rax + 0x10], rbx",
    "mov [rax + 0x18], rbp",
    "mov [rax + 0x20], rsi",
    "mov [rax + 0x28], rdi",
    "mov [rax + 0x30], r8",
    "mov [rax + 0x38], r9",
    "mov [rax + 0x40], r10",
    "mov [rax + 0x48], r11",
    "mov [rax + 0x50], r12",
    "mov [rax + 0x58], r13",
    "mov [rax + 0x60], r14",
    "mov [rax + 0x68], r15",
    "movaps xmmword ptr [rax + 0x70], xmm0",
    "movaps xmmword ptr [rax + 0x80], xmm1",
    "movaps xmmword ptr [rax + 0x90], xmm2",
    "movaps xmmword ptr [rax + 0xa0], xmm3",
    "movaps xmmword ptr [rax + 0xb0], xmm4",
    "movaps xmmword ptr [rax + 0xc0], xmm5",
    "movaps xmmword ptr [rax + 0xd0], xmm6",
    "movaps xmmword ptr [rax + 0xe0], xmm7",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

extern "C" {
    /// Runs the guest described by `vmcb_pa` until the next #VMEXIT.
    pub fn launch_vm(guest_regs: *mut GuestRegisters, vmcb_pa: u64);
}
