//! Checks whether the boot processor is able to run the hypervisor.

use x86::cpuid::{cpuid, CpuId};
use x86::msr::rdmsr;

use crate::svm::msr::{SVM_MSR_VM_CR, VM_CR_SVMDIS};

/// Whether CPUID leaf 0 reports the `AuthenticAMD` vendor string.
pub fn has_amd_vendor() -> bool {
    let regs = cpuid!(0x0);

    regs.ebx == u32::from_le_bytes(*b"Auth")
        && regs.edx == u32::from_le_bytes(*b"enti")
        && regs.ecx == u32::from_le_bytes(*b"cAMD")
}

/// Whether SVM is implemented and enabled.
///
/// Follows the algorithm from `15.4 Enabling SVM` of the AMD manual: the
/// feature bit in `CPUID Fn8000_0001_ECX` must be set and the `SVMDIS` lock
/// bit in the `VM_CR` MSR must be clear. When the firmware locked SVM down
/// there is nothing the kernel can do but report it.
pub fn is_svm_supported() -> bool {
    let has_svm = CpuId::new()
        .get_extended_processor_and_feature_identifiers()
        .map(|f| f.has_svm())
        .unwrap_or(false);
    if !has_svm {
        log::warn!("Processor does not support SVM");
        return false;
    }

    let vm_cr = unsafe { rdmsr(SVM_MSR_VM_CR) };
    if vm_cr & VM_CR_SVMDIS != 0 {
        log::warn!("SVM is disabled at the firmware level (VM_CR.SVMDIS)");
        return false;
    }

    true
}
