use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};

struct Selectors {
    code: SegmentSelector,
    data: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code = gdt.add_entry(Descriptor::kernel_code_segment());
        let data = gdt.add_entry(Descriptor::kernel_data_segment());
        (gdt, Selectors { code, data })
    };
}

/// Replaces whatever descriptor table the bootloader left behind.
pub fn init() {
    GDT.0.load();

    unsafe {
        CS::set_reg(GDT.1.code);
        DS::set_reg(GDT.1.data);
        ES::set_reg(GDT.1.data);
        SS::set_reg(GDT.1.data);
        FS::set_reg(GDT.1.data);
        GS::set_reg(GDT.1.data);
    }
}

/// The kernel data selector; the vCPU reloads FS/GS with it after every
/// #VMEXIT.
pub fn kernel_data_selector() -> SegmentSelector {
    GDT.1.data
}
