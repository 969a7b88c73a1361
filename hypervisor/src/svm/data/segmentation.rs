use bitfield::bitfield;

bitfield! {
    /// The packed 12-bit segment attributes used by the VMCB state-save
    /// area: the concatenation of bits 55:52 and 47:40 of the in-memory
    /// 64-bit segment descriptor.
    pub struct SegmentAttribute(u16);
    impl Debug;
    pub accessed, set_accessed: 0, 0;
    pub rw, set_rw: 1, 1;
    pub dc, set_dc: 2, 2;
    pub executable, set_executable: 3, 3;
    pub desc_type, set_desc_type: 4, 4;
    pub dpl, set_dpl: 6, 5;
    pub present, set_present: 7, 7;
    pub avl, set_avl: 8, 8;
    pub long_mode, set_long_mode: 9, 9;
    pub default_bit, set_default_bit: 10, 10;
    pub granularity, set_granularity: 11, 11;
}

/// Attributes of a flat ring-0 32-bit code segment (the guest boots through
/// the Linux 32-bit entry point).
pub fn flat_code32() -> u16 {
    let mut attr = SegmentAttribute(0);
    attr.set_accessed(1);
    attr.set_rw(1);
    attr.set_executable(1);
    attr.set_desc_type(1);
    attr.set_present(1);
    attr.set_default_bit(1);
    attr.set_granularity(1);
    attr.0
}

/// Attributes of a flat ring-0 32-bit data segment.
pub fn flat_data32() -> u16 {
    let mut attr = SegmentAttribute(0);
    attr.set_accessed(1);
    attr.set_rw(1);
    attr.set_desc_type(1);
    attr.set_present(1);
    attr.set_default_bit(1);
    attr.set_granularity(1);
    attr.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_segment_encodings() {
        // Present, granular, 32-bit, non-system; executable only for code.
        assert_eq!(flat_code32(), 0xC9B);
        assert_eq!(flat_data32(), 0xC93);
    }

    #[test]
    fn dpl_occupies_two_bits() {
        let mut attr = SegmentAttribute(0);
        attr.set_dpl(3);
        assert_eq!(attr.0, 0b11 << 5);
    }
}
