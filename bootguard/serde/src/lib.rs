/*++

Licensed under the Apache-2.0 license.

File Name:

   lib.rs

Abstract:

    Binary encoding of Boot Guard elements and manifests.

--*/

mod codec;
mod element;
mod manifest;

pub use element::{
    decode_element, decode_key_signature, element_size, encode_element, encode_key_signature,
    peek_struct_info, BPMH_SIZE, STRUCT_INFO_SIZE,
};
pub use manifest::{
    assemble, assemble_bpm, assemble_km, bpm_signed_region_end, disassemble_bpm, disassemble_km,
    km_signed_region_end, truncate, validate_bpm, AssembledManifest, DisassembleOptions,
};
