/*++

Licensed under the Apache-2.0 license.

File Name:

   layout.rs

Abstract:

    Fixed-size little-endian layouts of the Boot Guard structures. Variable
    length parts (hash structures, lists, key material) are encoded by the
    codec around these.

--*/

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Eight byte structure identifier, e.g. `__ACBP__`.
pub type StructureId = [u8; 8];

pub const BPMH_STRUCTURE_ID: StructureId = *b"__ACBP__";
pub const IBB_STRUCTURE_ID: StructureId = *b"__IBBS__";
pub const TXT_STRUCTURE_ID: StructureId = *b"__TXTS__";
pub const PMSE_STRUCTURE_ID: StructureId = *b"__PMSG__";
pub const KM_STRUCTURE_ID: StructureId = *b"__KEYM__";

pub const BPMH_VERSION: u8 = 0x23;
pub const BPMH_HEADER_STRUCT_VERSION: u8 = 0x20;
pub const IBB_VERSION: u8 = 0x20;
pub const TXT_VERSION: u8 = 0x21;
pub const PMSE_VERSION: u8 = 0x20;
pub const KM_VERSION: u8 = 0x21;

/// Version byte of the key, signature and key-signature descriptors.
pub const KEY_SIGNATURE_VERSION: u8 = 0x10;

/// Common element prefix: type tag, version and the element's total size.
#[repr(C)]
#[derive(
    FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Debug, Default, Clone, Copy, PartialEq, Eq,
)]
pub struct StructInfo {
    pub id: StructureId,
    pub version: u8,
    pub variable0: u8,
    pub element_size: U16,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Debug, Default, Clone, Copy)]
pub struct BpmhFields {
    pub key_signature_offset: U16,
    pub bpm_revision: u8,
    pub bpm_svn: u8,
    pub acm_svn_auth: u8,
    pub reserved0: u8,
    pub nem_data_stack: U16,
}

/// IBB element fields preceding the post-IBB hash.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Debug, Default, Clone, Copy)]
pub struct IbbFixedFields {
    pub reserved0: u8,
    pub set_number: u8,
    pub reserved1: u8,
    pub pbet_value: u8,
    pub flags: U32,
    pub ibb_mchbar: U64,
    pub vtd_bar: U64,
    pub dma_prot_base0: U32,
    pub dma_prot_limit0: U32,
    pub dma_prot_base1: U64,
    pub dma_prot_limit1: U64,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Debug, Default, Clone, Copy)]
pub struct IbbSegmentFields {
    pub reserved: [u8; 2],
    pub flags: U16,
    pub base: U32,
    pub size: U32,
}

/// TXT element fields preceding its digest list.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Debug, Default, Clone, Copy)]
pub struct TxtFixedFields {
    pub reserved0: u8,
    pub set_number: u8,
    pub sinit_min_svn_auth: u8,
    pub reserved1: u8,
    pub control_flags: U32,
    pub pwr_down_interval: U16,
    pub ptt_cmos_offset0: u8,
    pub ptt_cmos_offset1: u8,
    pub acpi_base_offset: U16,
    pub reserved2: [u8; 2],
    pub pwrm_base_offset: U32,
}

/// Key manifest fields preceding the key hash list.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Debug, Default, Clone, Copy)]
pub struct KmFixedFields {
    pub key_manifest_signature_offset: U16,
    pub reserved: [u8; 3],
    pub revision: u8,
    pub km_svn: u8,
    pub km_id: u8,
    pub pub_key_hash_alg: U16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(size_of::<StructInfo>(), 12);
        assert_eq!(size_of::<BpmhFields>(), 8);
        assert_eq!(size_of::<IbbFixedFields>(), 48);
        assert_eq!(size_of::<IbbSegmentFields>(), 12);
        assert_eq!(size_of::<TxtFixedFields>(), 20);
        assert_eq!(size_of::<KmFixedFields>(), 10);
    }
}
