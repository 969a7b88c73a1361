pub mod control_area;
pub mod save_area;

use control_area::ControlArea;
use save_area::SaveArea;

/// The Virtual Machine Control Block: the page exchanged with the CPU on
/// every VMRUN/#VMEXIT. Everything the host wants preserved across an exit
/// must be read or written here explicitly, nothing is implicit.
// Size: 0x1000
#[repr(C, align(4096))]
pub struct Vmcb {
    pub control_area: ControlArea, // +0x000
    pub save_area: SaveArea,       // +0x400
    pub reserved: [u8; 0x1000 - 0x400 - core::mem::size_of::<SaveArea>()],
}
const_assert_eq!(core::mem::size_of::<Vmcb>(), 0x1000);
