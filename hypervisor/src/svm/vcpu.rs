//! The virtual CPU: VMCB ownership, manually saved guest state, interrupt
//! injection and the VMRUN/#VMEXIT loop.

use alloc::sync::Arc;
use core::arch::asm;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU16, Ordering};

use x86::msr::{rdmsr, wrmsr, IA32_EFER};
use x86_64::registers::control::Cr0Flags;
use x86_64::registers::rflags::RFlags;
use x86_64::PhysAddr;

use crate::bits::{bit_u16, bit_u8};
use crate::linux;
use crate::mem::{PageAllocator, PAGE_SIZE};
use crate::svm::data::guest::GuestRegisters;
use crate::svm::data::guest_io::{GuestIoState, PicInitPhase};
use crate::svm::data::io_bitmap::IoBitmap;
use crate::svm::data::msr_bitmap::MsrBitmap;
use crate::svm::data::segmentation;
use crate::svm::msr::{EFER_SVME, SVM_MSR_VM_HSAVE_PA};
use crate::svm::vmcb::control_area::{
    ExitCode, InterceptMisc1, InterceptMisc2, VIntr, NP_ENABLE_NESTED_PAGING,
    TLB_CONTROL_DO_NOTHING,
};
use crate::svm::vmcb::save_area::VmcbSegment;
use crate::svm::vmcb::Vmcb;
use crate::svm::vmexit::{self, ExitType};
use crate::svm::vmlaunch::launch_vm;

/// IRQ line of the cascade input on the primary PIC.
pub const IRQ_CASCADE: u8 = 2;

/// Byte sink for the guest's serial transmit path.
pub type SerialTx = fn(u8);

/// Host IRQ lines 0-15 awaiting delivery to the guest.
///
/// The host's interrupt handlers mark lines here (before sending EOI to the
/// physical PIC) while the injection scan drains them, so the mask is
/// atomic. Shared between the vCPU and the host IRQ dispatcher via `Arc`.
pub struct PendingIrqs(AtomicU16);

impl PendingIrqs {
    pub const fn new() -> Self {
        Self(AtomicU16::new(0))
    }

    pub fn mark(&self, line: u8) {
        self.0.fetch_or(bit_u16(line), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> u16 {
        self.0.load(Ordering::Relaxed)
    }

    fn clear(&self, line: u8) {
        self.0.fetch_and(!bit_u16(line), Ordering::Relaxed);
    }
}

/// One logical guest processor. Only one is ever created: the VM is
/// single-vCPU and the engine runs on the boot processor alone.
pub struct VirtualCpu {
    id: usize,
    asid: u32,

    vmcb: NonNull<Vmcb>,
    /// Physical address of the VMCB; VMRUN takes the physical address.
    vmcb_pa: PhysAddr,

    /// Guest registers the hardware does not save into the VMCB.
    pub(crate) guest_regs: GuestRegisters,

    /// Host physical address backing guest physical address zero.
    guest_base: PhysAddr,

    /// Emulated device state.
    pub(crate) io_state: GuestIoState,

    pending_irqs: Arc<PendingIrqs>,
    /// Line last handed to the virtual-interrupt mechanism; re-armed when a
    /// physical interrupt preempts its delivery.
    last_injected_irq: u8,

    /// Sink for guest serial output.
    pub(crate) serial_tx: SerialTx,
    /// Selector reloaded into FS/GS after every #VMEXIT.
    host_data_selector: u16,

    msr_bitmap: MsrBitmap,
    io_bitmap: IoBitmap,
}

impl VirtualCpu {
    /// Creates the vCPU and allocates its control block and permission
    /// bitmaps. Allocation failure at this stage is unrecoverable.
    pub fn new(
        id: usize,
        asid: u32,
        serial_tx: SerialTx,
        host_data_selector: u16,
        allocator: &dyn PageAllocator,
    ) -> Self {
        let vmcb = allocator
            .alloc_aligned_pages(1, PAGE_SIZE)
            .expect("failed to allocate the VMCB");
        unsafe { core::ptr::write_bytes(vmcb.as_ptr(), 0, PAGE_SIZE) };
        let vmcb_pa = allocator.virt_to_phys(vmcb.as_ptr());

        Self {
            id,
            asid,
            vmcb: vmcb.cast(),
            vmcb_pa,
            guest_regs: GuestRegisters::new(),
            guest_base: PhysAddr::zero(),
            io_state: GuestIoState::new(),
            pending_irqs: Arc::new(PendingIrqs::new()),
            last_injected_irq: 0,
            serial_tx,
            host_data_selector,
            msr_bitmap: MsrBitmap::build(allocator),
            io_bitmap: IoBitmap::build(allocator),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The pending-IRQ mask to hand to the host's interrupt dispatcher.
    pub fn pending_irqs(&self) -> Arc<PendingIrqs> {
        Arc::clone(&self.pending_irqs)
    }

    pub(crate) fn vmcb(&self) -> &Vmcb {
        unsafe { self.vmcb.as_ref() }
    }

    pub(crate) fn vmcb_mut(&mut self) -> &mut Vmcb {
        unsafe { self.vmcb.as_mut() }
    }

    /// Enables the SVM extensions on the current processor.
    pub fn virtualize(&mut self, allocator: &dyn PageAllocator) {
        // The CPU spills host state here across VMRUN/#VMEXIT.
        let hsave = allocator
            .alloc(PAGE_SIZE)
            .expect("failed to allocate the host state-save area");
        let hsave_pa = allocator.virt_to_phys(hsave.as_ptr());

        unsafe {
            wrmsr(SVM_MSR_VM_HSAVE_PA, hsave_pa.as_u64());
            wrmsr(IA32_EFER, rdmsr(IA32_EFER) | EFER_SVME);
        }
    }

    /// Configures the VMCB for the first entry: intercepts, permission
    /// bitmaps, flat 32-bit segments, and the Linux protected-mode entry
    /// environment.
    pub fn setup_guest_state(&mut self) {
        let msrpm_pa = self.msr_bitmap.pa().as_u64();
        let iopm_pa = self.io_bitmap.pa().as_u64();
        let asid = self.asid;
        let vmcb = self.vmcb_mut();

        vmcb.control_area.intercept_misc1 = InterceptMisc1::INTERCEPT_INTR
            | InterceptMisc1::INTERCEPT_CPUID
            | InterceptMisc1::INTERCEPT_HLT
            | InterceptMisc1::INTERCEPT_IOIO_PROT
            | InterceptMisc1::INTERCEPT_MSR_PROT;
        vmcb.control_area.intercept_misc2 =
            InterceptMisc2::INTERCEPT_VMRUN | InterceptMisc2::INTERCEPT_VMMCALL;

        // The guest's IF only masks virtual interrupts, and the virtual TPR
        // never blocks injection.
        let mut vintr = VIntr(0);
        vintr.set_v_ign_tpr(1);
        vintr.set_v_intr_masking(1);
        vmcb.control_area.vintr = vintr.0;

        vmcb.control_area.guest_asid = asid;
        vmcb.control_area.np_enable = NP_ENABLE_NESTED_PAGING;

        // Default-intercept permission maps; see the bitmap builders for
        // what is selectively passed through.
        vmcb.control_area.msrpm_base_pa = msrpm_pa;
        vmcb.control_area.iopm_base_pa = iopm_pa;

        // Flat 4 GiB segments; the guest starts in 32-bit protected mode at
        // the Linux entry point. FS and GS are covered by VMLOAD.
        let code = VmcbSegment {
            selector: 0,
            attrib: segmentation::flat_code32(),
            limit: u32::MAX,
            base: 0,
        };
        let data = VmcbSegment {
            attrib: segmentation::flat_data32(),
            ..code
        };
        vmcb.save_area.cs = code;
        vmcb.save_area.ds = data;
        vmcb.save_area.es = data;
        vmcb.save_area.fs = data;
        vmcb.save_area.gs = data;
        vmcb.save_area.ss = data;

        // Clearing EFER.SVME while the guest runs is undefined behavior.
        vmcb.save_area.efer = EFER_SVME;

        // Protected mode without paging.
        vmcb.save_area.cr0 = (Cr0Flags::PROTECTED_MODE_ENABLE
            | Cr0Flags::EXTENSION_TYPE
            | Cr0Flags::NUMERIC_ERROR)
            .bits();

        vmcb.save_area.rip = linux::LAYOUT_KERNEL_BASE;

        // The 32-bit boot protocol passes boot_params in RSI.
        self.guest_regs.rsi = linux::LAYOUT_BOOTPARAM;
    }

    /// Installs the nested page table and records where guest RAM lives.
    pub fn set_npt(&mut self, root: PhysAddr, guest_base: PhysAddr) {
        self.vmcb_mut().control_area.ncr3 = root.as_u64();
        self.guest_base = guest_base;
    }

    /// Runs the guest forever. Every #VMEXIT is dispatched and the guest is
    /// re-entered; unhandled exits abort the machine.
    pub fn run(&mut self) -> ! {
        loop {
            // All caller-saved state is dealt with by the trampoline.
            unsafe { launch_vm(&mut self.guest_regs, self.vmcb_pa.as_u64()) };
            self.handle_exit();
        }
    }

    fn handle_exit(&mut self) {
        // A TLB flush request only applies to the entry it was set for.
        self.vmcb_mut().control_area.tlb_control = TLB_CONTROL_DO_NOTHING;

        // #VMEXIT does not restore the host's FS and GS selectors.
        unsafe {
            asm!(
                "mov fs, {0:x}",
                "mov gs, {0:x}",
                in(reg) self.host_data_selector,
                options(nostack, preserves_flags),
            );
        }

        let raw = self.vmcb().control_area.exit_code;
        let exit_type = match ExitCode::from_raw(raw) {
            Some(ExitCode::Intr) => self.handle_intr(),
            Some(ExitCode::Cpuid) => vmexit::cpuid::handle(self),
            Some(ExitCode::Hlt) => self.handle_hlt(),
            Some(ExitCode::Ioio) => vmexit::ioio::handle(self),
            Some(ExitCode::Msr) => vmexit::msr::handle(self),
            Some(ExitCode::Vmmcall) => vmexit::vmmcall::handle(self),
            None => {
                self.dump_exit_info();
                self.abort(format_args!("unhandled #VMEXIT: exitcode={:#x}", raw))
            }
        };

        // Completed-instruction emulation is signaled to the guest by moving
        // RIP to the next instruction. Exits for instructions that did not
        // execute (physical interrupts) must never do this.
        if exit_type == ExitType::IncrementRip {
            let vmcb = self.vmcb_mut();
            vmcb.save_area.rip = vmcb.control_area.nrip;
        }
    }

    /// A physical interrupt forced the exit. The host consumes it inside a
    /// GIF window (its handler marks the line as pending for the guest and
    /// sends EOI to the physical PIC), then delivery to the guest is
    /// attempted.
    fn handle_intr(&mut self) -> ExitType {
        // The exit may have preempted a virtual interrupt the guest had not
        // consumed yet; put it back so it is not dropped.
        if VIntr(self.vmcb().control_area.vintr).v_irq() != 0 {
            self.pending_irqs.mark(self.last_injected_irq);
        }

        unsafe {
            stgi();
            clgi();
        }

        self.inject_pending_irq();
        ExitType::Continue
    }

    /// The guest halted. Idle like real hardware: halt with the GIF open
    /// until an interrupt arrives that can actually be delivered.
    fn handle_hlt(&mut self) -> ExitType {
        while !self.inject_pending_irq() {
            unsafe { stgi() };
            x86_64::instructions::hlt();
            unsafe { clgi() };
        }

        self.vmcb_mut().control_area.interrupt_shadow = 0;
        ExitType::IncrementRip
    }

    /// Injects the highest-priority deliverable IRQ, if any. EOI is never
    /// the guest's job: the host handler already acknowledged the physical
    /// PIC, which is why undelivered lines must be re-armed instead of
    /// re-fired.
    fn inject_pending_irq(&mut self) -> bool {
        let pending = self.pending_irqs.snapshot();
        if pending == 0 {
            return false;
        }
        // The guest cannot take interrupts before its PIC is programmed.
        if self.io_state.primary_phase != PicInitPhase::Inited {
            return false;
        }
        // The guest is blocking (virtual) interrupts.
        let rflags = RFlags::from_bits_truncate(self.vmcb().save_area.rflags);
        if !rflags.contains(RFlags::INTERRUPT_FLAG) {
            return false;
        }

        let secondary_masked = self.io_state.primary_mask & bit_u8(IRQ_CASCADE) != 0;

        for line in 0..16u8 {
            if secondary_masked && line >= 8 {
                break;
            }
            if pending & bit_u16(line) == 0 {
                continue;
            }

            let (mask, base, delta) = if line < 8 {
                (self.io_state.primary_mask, self.io_state.primary_base, line)
            } else {
                (
                    self.io_state.secondary_mask,
                    self.io_state.secondary_base,
                    line - 8,
                )
            };
            if mask & bit_u8(delta) != 0 {
                continue;
            }

            let mut vintr = VIntr(self.vmcb().control_area.vintr);
            vintr.set_v_irq(1);
            vintr.set_v_intr_vector(base as u64 + delta as u64);
            self.vmcb_mut().control_area.vintr = vintr.0;

            self.pending_irqs.clear(line);
            self.last_injected_irq = line;
            return true;
        }

        false
    }

    /// Dumps the guest state and halts the machine. Guest protocol
    /// violations are containment failures, not recoverable errors.
    pub(crate) fn abort(&self, args: fmt::Arguments) -> ! {
        self.dump_guest_state();
        panic!("{}", args);
    }

    fn dump_guest_state(&self) {
        let vmcb = self.vmcb();
        let regs = &self.guest_regs;

        log::error!("=== vCPU #{} ===", self.id);
        log::error!("[Guest State]");
        log::error!("RIP: {:#018x}", vmcb.save_area.rip);
        log::error!("RSP: {:#018x}", vmcb.save_area.rsp);
        log::error!("RAX: {:#018x}", vmcb.save_area.rax);
        log::error!("RBX: {:#018x}", regs.rbx);
        log::error!("RCX: {:#018x}", regs.rcx);
        log::error!("RDX: {:#018x}", regs.rdx);
        log::error!("RSI: {:#018x}", regs.rsi);
        log::error!("RDI: {:#018x}", regs.rdi);
        log::error!("RBP: {:#018x}", regs.rbp);
        log::error!("R8 : {:#018x}", regs.r8);
        log::error!("R9 : {:#018x}", regs.r9);
        log::error!("R10: {:#018x}", regs.r10);
        log::error!("R11: {:#018x}", regs.r11);
        log::error!("R12: {:#018x}", regs.r12);
        log::error!("R13: {:#018x}", regs.r13);
        log::error!("R14: {:#018x}", regs.r14);
        log::error!("R15: {:#018x}", regs.r15);
        log::error!("CR0: {:#018x}", vmcb.save_area.cr0);
        log::error!("CR3: {:#018x}", vmcb.save_area.cr3);
        log::error!("CR4: {:#018x}", vmcb.save_area.cr4);
        log::error!("EFER: {:#018x}", vmcb.save_area.efer);
        log::error!(
            "CS : {:#06x} {:#018x} {:#010x}",
            vmcb.save_area.cs.selector,
            vmcb.save_area.cs.base,
            vmcb.save_area.cs.limit
        );
        log::error!("guest RAM @ {:#x}", self.guest_base.as_u64());
    }

    fn dump_exit_info(&self) {
        let control = &self.vmcb().control_area;
        log::error!("=== #VMEXIT ===");
        log::error!("EXITCODE : {:#x}", control.exit_code);
        log::error!("EXITINFO1: {:#x}", control.exit_info1);
        log::error!("EXITINFO2: {:#x}", control.exit_info2);
    }
}

#[inline]
unsafe fn stgi() {
    asm!("stgi", options(nomem, nostack));
}

#[inline]
unsafe fn clgi() {
    asm!("clgi", options(nomem, nostack));
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mem::testing::TestAllocator;

    fn sink(_byte: u8) {}

    /// A vCPU with an allocated, configured VMCB for handler tests.
    pub(crate) fn test_vcpu() -> VirtualCpu {
        let mut vcpu = VirtualCpu::new(0, 1, sink, 0x10, &TestAllocator);
        vcpu.setup_guest_state();
        vcpu
    }

    /// Puts the emulated PIC pair into the fully-initialized state with all
    /// lines unmasked and the guest accepting interrupts.
    fn make_injectable(vcpu: &mut VirtualCpu) {
        vcpu.io_state.primary_phase = PicInitPhase::Inited;
        vcpu.io_state.secondary_phase = PicInitPhase::Inited;
        vcpu.io_state.primary_mask = 0;
        vcpu.io_state.secondary_mask = 0;
        vcpu.io_state.primary_base = 0x20;
        vcpu.io_state.secondary_base = 0x28;
        vcpu.vmcb_mut().save_area.rflags = RFlags::INTERRUPT_FLAG.bits();
    }

    #[test]
    fn setup_configures_the_control_block() {
        let vcpu = test_vcpu();
        let vmcb = vcpu.vmcb();

        assert!(vmcb
            .control_area
            .intercept_misc1
            .contains(InterceptMisc1::INTERCEPT_CPUID | InterceptMisc1::INTERCEPT_IOIO_PROT));
        assert!(vmcb
            .control_area
            .intercept_misc2
            .contains(InterceptMisc2::INTERCEPT_VMRUN));
        assert_eq!(vmcb.control_area.guest_asid, 1);
        assert_eq!(vmcb.control_area.np_enable, NP_ENABLE_NESTED_PAGING);

        // Protected mode, numeric error, extension type; paging off.
        assert_eq!(vmcb.save_area.cr0, 0x31);
        assert_eq!(vmcb.save_area.rip, linux::LAYOUT_KERNEL_BASE);
        assert_eq!(vcpu.guest_regs.rsi, linux::LAYOUT_BOOTPARAM);
        assert_eq!(vmcb.save_area.cs.attrib, 0xC9B);
        assert_eq!(vmcb.save_area.ds.attrib, 0xC93);
        assert_eq!(vmcb.save_area.cs.limit, u32::MAX);
        assert_eq!(vmcb.save_area.efer, EFER_SVME);
    }

    #[test]
    fn injection_round_trip() {
        let mut vcpu = test_vcpu();
        make_injectable(&mut vcpu);

        vcpu.pending_irqs.mark(4);
        assert!(vcpu.inject_pending_irq());

        let vintr = VIntr(vcpu.vmcb().control_area.vintr);
        assert_eq!(vintr.v_irq(), 1);
        assert_eq!(vintr.v_intr_vector(), 0x24);
        assert_eq!(vcpu.pending_irqs.snapshot(), 0);
        assert_eq!(vcpu.last_injected_irq, 4);
    }

    #[test]
    fn injection_respects_line_mask() {
        let mut vcpu = test_vcpu();
        make_injectable(&mut vcpu);
        vcpu.io_state.primary_mask = bit_u8(4);

        vcpu.pending_irqs.mark(4);
        assert!(!vcpu.inject_pending_irq());
        // The line stays pending for when the guest unmasks it.
        assert_eq!(vcpu.pending_irqs.snapshot(), bit_u16(4));
    }

    #[test]
    fn injection_deferred_until_pic_is_initialized() {
        let mut vcpu = test_vcpu();
        make_injectable(&mut vcpu);
        vcpu.io_state.primary_phase = PicInitPhase::Phase2;

        vcpu.pending_irqs.mark(0);
        assert!(!vcpu.inject_pending_irq());
    }

    #[test]
    fn injection_deferred_while_guest_blocks_interrupts() {
        let mut vcpu = test_vcpu();
        make_injectable(&mut vcpu);
        vcpu.vmcb_mut().save_area.rflags = 0;

        vcpu.pending_irqs.mark(0);
        assert!(!vcpu.inject_pending_irq());
    }

    #[test]
    fn lower_lines_win_priority() {
        let mut vcpu = test_vcpu();
        make_injectable(&mut vcpu);

        vcpu.pending_irqs.mark(7);
        vcpu.pending_irqs.mark(1);
        assert!(vcpu.inject_pending_irq());
        assert_eq!(vcpu.last_injected_irq, 1);
        assert_eq!(vcpu.pending_irqs.snapshot(), bit_u16(7));
    }

    #[test]
    fn secondary_lines_use_the_secondary_base() {
        let mut vcpu = test_vcpu();
        make_injectable(&mut vcpu);

        vcpu.pending_irqs.mark(10);
        assert!(vcpu.inject_pending_irq());
        let vintr = VIntr(vcpu.vmcb().control_area.vintr);
        assert_eq!(vintr.v_intr_vector(), 0x2A);
    }

    #[test]
    fn masked_cascade_blocks_secondary_lines() {
        let mut vcpu = test_vcpu();
        make_injectable(&mut vcpu);
        vcpu.io_state.primary_mask = bit_u8(IRQ_CASCADE);

        vcpu.pending_irqs.mark(10);
        assert!(!vcpu.inject_pending_irq());
        assert_eq!(vcpu.pending_irqs.snapshot(), bit_u16(10));
    }
}
