//! Emulated device state the VMM preserves on behalf of the guest.

/// Initialization phase of an emulated 8259 controller. The ICW sequence is
/// strictly ordered; ICW1 restarts it from any phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicInitPhase {
    Uninitialized,
    Phase1,
    Phase2,
    Phase3,
    Inited,
}

/// Guest I/O state: the 8250 registers shadowed instead of being forwarded
/// to hardware, and the full state of the emulated PIC pair.
#[derive(Debug, Clone)]
pub struct GuestIoState {
    /// Serial Interrupt Enable Register shadow.
    pub ier: u8,
    /// Serial Modem Control Register shadow.
    pub mcr: u8,

    /// Interrupt mask of the primary PIC (OCW1).
    pub primary_mask: u8,
    /// Interrupt mask of the secondary PIC (OCW1).
    pub secondary_mask: u8,
    pub primary_phase: PicInitPhase,
    pub secondary_phase: PicInitPhase,
    /// Vector offset of the primary PIC (ICW2).
    pub primary_base: u8,
    /// Vector offset of the secondary PIC (ICW2).
    pub secondary_base: u8,
}

impl GuestIoState {
    pub const fn new() -> Self {
        Self {
            ier: 0,
            mcr: 0,
            primary_mask: 0xFF,
            secondary_mask: 0xFF,
            primary_phase: PicInitPhase::Uninitialized,
            secondary_phase: PicInitPhase::Uninitialized,
            primary_base: 0,
            secondary_base: 0,
        }
    }
}
