// Licensed under the Apache-2.0 license

use bg_prov_fit::{
    extract, offset_to_phys, stitch, FIT_ENTRY_SIZE, FIT_ENTRY_VERSION, FIT_POINTER_OFFSET,
    FIT_SIGNATURE,
};
use bg_prov_gen::{
    km_pubkey_hash, BootGuardOptions, BpmOverrides, DigestEngine, MappedImage, ManifestSigner,
};
use bg_prov_openssl::OsslCrypto;
use bg_prov_serde::{disassemble_bpm, DisassembleOptions};
use bg_prov_types::*;
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;

const IMAGE_LEN: usize = 0x2_0000;
const FIT_OFFSET: usize = 0x1_F000;
const IBB_BASE: u32 = 0xFFFE_0000;
const IBB_SIZE: u32 = 0x4000;

fn bios_image() -> Vec<u8> {
    let mut image = vec![0xFF; IMAGE_LEN];
    for (i, b) in image[..IBB_SIZE as usize].iter_mut().enumerate() {
        *b = (i % 253) as u8;
    }

    let mut header = [0u8; FIT_ENTRY_SIZE];
    header[..8].copy_from_slice(&FIT_SIGNATURE);
    header[8] = 1;
    header[12..14].copy_from_slice(&FIT_ENTRY_VERSION.to_le_bytes());
    image[FIT_OFFSET..FIT_OFFSET + FIT_ENTRY_SIZE].copy_from_slice(&header);

    let pointer = offset_to_phys(IMAGE_LEN, FIT_OFFSET).unwrap();
    image[IMAGE_LEN - FIT_POINTER_OFFSET..][..8].copy_from_slice(&pointer.to_le_bytes());
    image
}

#[test]
fn test_provision_bios_image() {
    let crypto = OsslCrypto::default();
    let signer = ManifestSigner::new(&crypto);
    let engine = DigestEngine::new(&crypto, &[Algorithm::SHA256]).unwrap();
    let bpm_key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let group = EcGroup::from_curve_name(Nid::SECP384R1).unwrap();
    let km_key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
    let image = bios_image();

    let mut options = BootGuardOptions::template();
    BpmOverrides {
        segment_base: Some(IBB_BASE),
        segment_size: Some(IBB_SIZE),
        ..Default::default()
    }
    .apply(&mut options.boot_policy_manifest)
    .unwrap();
    let mut bpm = options.build_bpm().unwrap();
    let mut km = options.build_km().unwrap();

    signer.bind(&mut bpm.pmse, &bpm_key).unwrap();
    engine
        .rehash(&mut bpm, Some(&mut km), &MappedImage::new(&image))
        .unwrap();
    let bpm_signed = signer.sign_bpm(&mut bpm, &bpm_key).unwrap();
    let km_signed = signer.sign_km(&mut km, &km_key).unwrap();

    let stitched = stitch(&image, &[], &bpm_signed.bytes, &km_signed.bytes).unwrap();
    assert_eq!(&stitched[..IBB_SIZE as usize], &image[..IBB_SIZE as usize]);

    let payloads = extract(&stitched).unwrap();
    let bpm_bytes = payloads.bpm.unwrap();
    let km_bytes = payloads.km.unwrap();
    assert!(signer.verify_bpm(bpm_bytes).unwrap());
    assert!(signer.verify_km(km_bytes).unwrap());

    // The IBB digest still matches the stitched image.
    let mut rehashed = disassemble_bpm(bpm_bytes, DisassembleOptions::default()).unwrap();
    engine
        .rehash_bpm(&mut rehashed, &MappedImage::new(&stitched))
        .unwrap();
    assert_eq!(rehashed, bpm);

    // Configuration read back from the image rebuilds the same IBB.
    let read_back = BootGuardOptions::from_bios_image(&stitched).unwrap();
    assert_eq!(read_back.build_bpm().unwrap().ibb, bpm.ibb);

    let fuse_hash = km_pubkey_hash(&crypto, &km, Algorithm::SHA384).unwrap();
    assert_eq!(fuse_hash.bytes.len(), 48);
}
