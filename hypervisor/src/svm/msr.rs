//! SVM-specific model-specific registers.

/// `EFER.SVME`, gates every SVM instruction.
pub const EFER_SVME: u64 = 1 << 12;

/// `VM_CR` MSR, see `15.30.1 VM_CR MSR (C001_0114h)`.
pub const SVM_MSR_VM_CR: u32 = 0xC001_0114;
/// `VM_CR.SVMDIS`: SVM is disabled by the firmware.
pub const VM_CR_SVMDIS: u64 = 1 << 4;

/// `VM_HSAVE_PA` MSR: physical address of the host state-save area.
pub const SVM_MSR_VM_HSAVE_PA: u32 = 0xC001_0117;

/// `IA32_APIC_BASE`; emulated for the guest, never passed through.
pub const MSR_APIC_BASE: u32 = 0x0000_001B;
