//! MSR virtualization for the fixed set of registers a Linux guest touches
//! on the supported boot path. Anything outside the set aborts the machine:
//! silently ignoring an MSR write corrupts guest assumptions.

use x86::msr::{
    wrmsr, IA32_CSTAR, IA32_EFER, IA32_FMASK, IA32_FS_BASE, IA32_GS_BASE, IA32_KERNEL_GSBASE,
    IA32_LSTAR, IA32_STAR, IA32_SYSENTER_CS, IA32_SYSENTER_EIP, IA32_SYSENTER_ESP, IA32_TSC_AUX,
};
use x86_64::registers::model_specific::EferFlags;

use super::ExitType;
use crate::bits::{concat, set_low32};
use crate::svm::msr::MSR_APIC_BASE;
use crate::svm::vcpu::VirtualCpu;
use crate::svm::vmcb::control_area::TLB_CONTROL_FLUSH_GUEST_TLB;

/// Handles an MSR intercept. EXITINFO1 distinguishes the direction.
pub fn handle(vcpu: &mut VirtualCpu) -> ExitType {
    match vcpu.vmcb().control_area.exit_info1 {
        0 => handle_rdmsr(vcpu),
        1 => handle_wrmsr(vcpu),
        info => vcpu.abort(format_args!("malformed MSR exit info: {:#x}", info)),
    }

    ExitType::IncrementRip
}

fn handle_rdmsr(vcpu: &mut VirtualCpu) {
    let msr = vcpu.guest_regs.rcx as u32;

    match msr {
        // All-ones reads as "disabled", which stops the guest from ever
        // touching the real local APIC.
        MSR_APIC_BASE => set_ret_val(vcpu, u64::MAX),
        IA32_EFER => {
            let efer = vcpu.vmcb().save_area.efer;
            set_ret_val(vcpu, efer);
        }
        _ => vcpu.abort(format_args!("unhandled RDMSR: {:#x}", msr)),
    }
}

fn handle_wrmsr(vcpu: &mut VirtualCpu) {
    let msr = vcpu.guest_regs.rcx as u32;
    let value = concat(vcpu.guest_regs.rdx as u32, vcpu.vmcb().save_area.rax as u32);

    match msr {
        // Unused on the host, no restore needed.
        IA32_SYSENTER_CS => vcpu.vmcb_mut().save_area.sysenter_cs = value,
        IA32_SYSENTER_ESP => vcpu.vmcb_mut().save_area.sysenter_esp = value,
        IA32_SYSENTER_EIP => vcpu.vmcb_mut().save_area.sysenter_eip = value,
        IA32_EFER => {
            let old = vcpu.vmcb().save_area.efer;
            let rising = value & !old;
            // Turning on long mode or NX changes how existing guest
            // translations must be interpreted.
            if rising
                & (EferFlags::LONG_MODE_ENABLE | EferFlags::NO_EXECUTE_ENABLE).bits()
                != 0
            {
                vcpu.vmcb_mut().control_area.tlb_control = TLB_CONTROL_FLUSH_GUEST_TLB;
            }
            vcpu.vmcb_mut().save_area.efer = value;
        }
        // TODO: restore the host values on #VMEXIT as needed.
        IA32_STAR => vcpu.vmcb_mut().save_area.star = value,
        IA32_LSTAR => vcpu.vmcb_mut().save_area.lstar = value,
        IA32_CSTAR => vcpu.vmcb_mut().save_area.cstar = value,
        IA32_FMASK => vcpu.vmcb_mut().save_area.sfmask = value,
        IA32_FS_BASE => vcpu.vmcb_mut().save_area.fs.base = value,
        IA32_GS_BASE => vcpu.vmcb_mut().save_area.gs.base = value,
        IA32_KERNEL_GSBASE => vcpu.vmcb_mut().save_area.kernel_gs_base = value,
        IA32_TSC_AUX => unsafe { wrmsr(IA32_TSC_AUX, value) },
        _ => vcpu.abort(format_args!("unhandled WRMSR: {:#x}", msr)),
    }
}

/// Splits a 64-bit result into EDX:EAX the way RDMSR returns it.
fn set_ret_val(vcpu: &mut VirtualCpu, value: u64) {
    set_low32(&mut vcpu.guest_regs.rdx, (value >> 32) as u32);
    set_low32(&mut vcpu.vmcb_mut().save_area.rax, value as u32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svm::vcpu::tests::test_vcpu;
    use crate::svm::vcpu::VirtualCpu;
    use crate::svm::vmcb::control_area::TLB_CONTROL_DO_NOTHING;

    fn write_msr(vcpu: &mut VirtualCpu, msr: u32, value: u64) {
        vcpu.vmcb_mut().control_area.exit_info1 = 1;
        vcpu.guest_regs.rcx = msr as u64;
        vcpu.guest_regs.rdx = value >> 32;
        vcpu.vmcb_mut().save_area.rax = value & 0xFFFF_FFFF;
        assert_eq!(handle(vcpu), ExitType::IncrementRip);
    }

    fn read_msr(vcpu: &mut VirtualCpu, msr: u32) -> u64 {
        vcpu.vmcb_mut().control_area.exit_info1 = 0;
        vcpu.guest_regs.rcx = msr as u64;
        assert_eq!(handle(vcpu), ExitType::IncrementRip);
        concat(
            vcpu.guest_regs.rdx as u32,
            vcpu.vmcb().save_area.rax as u32,
        )
    }

    #[test]
    fn apic_base_reads_as_disabled() {
        let mut vcpu = test_vcpu();
        assert_eq!(read_msr(&mut vcpu, MSR_APIC_BASE), u64::MAX);
    }

    #[test]
    fn efer_read_mirrors_the_shadow() {
        let mut vcpu = test_vcpu();
        vcpu.vmcb_mut().save_area.efer = 0x1D01;
        assert_eq!(read_msr(&mut vcpu, IA32_EFER), 0x1D01);
    }

    #[test]
    fn efer_lme_rising_edge_requests_a_tlb_flush() {
        let mut vcpu = test_vcpu();

        write_msr(&mut vcpu, IA32_EFER, EferFlags::LONG_MODE_ENABLE.bits());
        assert_eq!(
            vcpu.vmcb().control_area.tlb_control,
            TLB_CONTROL_FLUSH_GUEST_TLB
        );
        assert_eq!(
            vcpu.vmcb().save_area.efer,
            EferFlags::LONG_MODE_ENABLE.bits()
        );
    }

    #[test]
    fn efer_rewrite_without_transition_does_not_flush() {
        let mut vcpu = test_vcpu();
        let value = EferFlags::LONG_MODE_ENABLE.bits();
        write_msr(&mut vcpu, IA32_EFER, value);

        // The flush request from the first write is consumed by the next
        // entry; model that before rewriting the same value.
        vcpu.vmcb_mut().control_area.tlb_control = TLB_CONTROL_DO_NOTHING;
        write_msr(&mut vcpu, IA32_EFER, value);
        assert_eq!(vcpu.vmcb().control_area.tlb_control, TLB_CONTROL_DO_NOTHING);
    }

    #[test]
    fn syscall_msrs_are_shadowed_in_the_vmcb() {
        let mut vcpu = test_vcpu();

        write_msr(&mut vcpu, IA32_LSTAR, 0xFFFF_8000_1234_5678);
        write_msr(&mut vcpu, IA32_STAR, 0x0023_0010_0000_0000);
        write_msr(&mut vcpu, IA32_FS_BASE, 0x1000);
        write_msr(&mut vcpu, IA32_KERNEL_GSBASE, 0x2000);

        assert_eq!(vcpu.vmcb().save_area.lstar, 0xFFFF_8000_1234_5678);
        assert_eq!(vcpu.vmcb().save_area.star, 0x0023_0010_0000_0000);
        assert_eq!(vcpu.vmcb().save_area.fs.base, 0x1000);
        assert_eq!(vcpu.vmcb().save_area.kernel_gs_base, 0x2000);
    }

    #[test]
    #[should_panic(expected = "unhandled WRMSR")]
    fn unknown_msr_write_aborts() {
        let mut vcpu = test_vcpu();
        write_msr(&mut vcpu, 0xC001_0000, 1);
    }

    #[test]
    #[should_panic(expected = "unhandled RDMSR")]
    fn unknown_msr_read_aborts() {
        let mut vcpu = test_vcpu();
        let _ = read_msr(&mut vcpu, 0x8B);
    }

    #[test]
    #[should_panic(expected = "malformed MSR exit info")]
    fn malformed_exit_info_aborts() {
        let mut vcpu = test_vcpu();
        vcpu.vmcb_mut().control_area.exit_info1 = 2;
        let _ = handle(&mut vcpu);
    }
}
