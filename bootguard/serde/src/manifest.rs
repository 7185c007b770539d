/*++

Licensed under the Apache-2.0 license.

File Name:

   manifest.rs

Abstract:

    Manifest assembler: lays out complete Key Manifests and Boot Policy
    Manifests and parses them back, tracking where the signed region ends.

--*/

use bg_prov_types::layout::PMSE_STRUCTURE_ID;
use bg_prov_types::*;

use crate::element::*;

/// A serialized manifest together with the offsets derived from it.
///
/// Offsets are produced by each assembly and must not be reused after the
/// manifest is mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledManifest {
    pub bytes: Vec<u8>,

    /// Offset of the first byte of the key/signature pair. Everything before
    /// it is covered by the signature.
    pub signed_region_end: usize,
}

impl AssembledManifest {
    pub fn total_len(&self) -> usize {
        self.bytes.len()
    }

    /// The bytes covered by the manifest signature.
    pub fn signed_prefix(&self) -> &[u8] {
        &self.bytes[..self.signed_region_end]
    }
}

/// Options controlling how strictly a manifest is parsed.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisassembleOptions {
    /// Reject elements that are not in canonical order (all IBB elements,
    /// then the optional TXT element). The signature element must be last
    /// regardless of this setting.
    pub strict_order: bool,
}

/// Check the structural invariants of a Boot Policy Manifest.
pub fn validate_bpm(bpm: &BootPolicyManifest) -> BgResult<()> {
    if bpm.header.nem_data_stack == 0 {
        return Err(BgError::invalid("NEM data stack size must not be zero"));
    }
    if bpm.ibb.is_empty() {
        return Err(BgError::invalid("at least one IBB element is required"));
    }
    if !bpm.ibb.iter().any(|ibb| ibb.set_number == 0) {
        return Err(BgError::invalid("no startup IBB element (set number 0)"));
    }
    for (i, ibb) in bpm.ibb.iter().enumerate() {
        if ibb.segments.is_empty() {
            return Err(BgError::invalid(format!("IBB element {i} has no segments")));
        }
        ibb.digest_list.check_unique()?;
    }
    if let Some(txt) = &bpm.txt {
        txt.digest_list.check_unique()?;
    }
    Ok(())
}

/// Assemble a Boot Policy Manifest from a header and its elements.
///
/// Elements must be in canonical order: IBB elements, at most one TXT
/// element, then exactly one signature element. Digests are not computed
/// here.
pub fn assemble(header: &BpmHeader, elements: &[Element]) -> BgResult<AssembledManifest> {
    let mut bpm = BootPolicyManifest {
        header: header.clone(),
        ..Default::default()
    };
    let mut pmse = None;
    for (i, element) in elements.iter().enumerate() {
        if pmse.is_some() {
            return Err(BgError::invalid("signature element must be the last element"));
        }
        match element {
            Element::Ibb(ibb) if bpm.txt.is_none() => bpm.ibb.push(ibb.clone()),
            Element::Ibb(_) => {
                return Err(BgError::invalid(format!(
                    "IBB element {i} follows the TXT element"
                )))
            }
            Element::Txt(_) if bpm.txt.is_some() => {
                return Err(BgError::invalid("more than one TXT element"))
            }
            Element::Txt(txt) => bpm.txt = Some(txt.clone()),
            Element::Signature(sig) => pmse = Some(sig.clone()),
            Element::KeyManifestBody(_) => {
                return Err(BgError::invalid(
                    "key manifest body cannot be part of a boot policy manifest",
                ))
            }
        }
    }
    bpm.pmse = pmse.ok_or_else(|| BgError::invalid("missing signature element"))?;
    assemble_bpm(&bpm)
}

/// Serialize a Boot Policy Manifest.
pub fn assemble_bpm(bpm: &BootPolicyManifest) -> BgResult<AssembledManifest> {
    validate_bpm(bpm)?;

    let mut body = Vec::new();
    for element in bpm.elements() {
        body.extend_from_slice(&encode_element(&element)?);
    }
    let pmse_size = element_size(&Element::Signature(bpm.pmse.clone()))?;
    let signed_region_end = BPMH_SIZE + body.len() - pmse_size + STRUCT_INFO_SIZE;
    let key_signature_offset = u16::try_from(signed_region_end)
        .map_err(|_| BgError::invalid("boot policy manifest exceeds 64 KiB"))?;

    let mut bytes = encode_bpmh(&bpm.header, key_signature_offset);
    bytes.extend_from_slice(&body);
    log::trace!(
        "assembled BPM: {} bytes, signed region ends at {signed_region_end:#x}",
        bytes.len()
    );
    Ok(AssembledManifest {
        bytes,
        signed_region_end,
    })
}

/// Parse a Boot Policy Manifest.
///
/// Input cut for external signing yields an unpopulated signature element.
/// The cut may end where the key/signature pair would begin or before the
/// signature element's structure header; either way the header's key
/// signature offset must agree with it.
pub fn disassemble_bpm(bytes: &[u8], options: DisassembleOptions) -> BgResult<BootPolicyManifest> {
    let (header, key_signature_offset) = decode_bpmh(bytes)?;
    let mut bpm = BootPolicyManifest {
        header,
        ..Default::default()
    };

    let mut cursor = BPMH_SIZE;
    let mut pmse = None;
    let mut pmse_offset = 0;
    while cursor < bytes.len() {
        if pmse.is_some() {
            return Err(BgError::invalid(format!(
                "data at offset {cursor} follows the signature element"
            )));
        }
        let info = peek_struct_info(bytes, cursor)?;
        if info.id == PMSE_STRUCTURE_ID && bytes.len() == cursor + STRUCT_INFO_SIZE {
            pmse = Some(SignatureElement::default());
            pmse_offset = cursor;
            break;
        }
        let (element, used) = decode_element(bytes, cursor)?;
        match element {
            Element::Ibb(ibb) => {
                if options.strict_order && bpm.txt.is_some() {
                    return Err(BgError::invalid(format!(
                        "IBB element at offset {cursor} follows the TXT element"
                    )));
                }
                bpm.ibb.push(ibb);
            }
            Element::Txt(txt) => {
                if bpm.txt.replace(txt).is_some() {
                    return Err(BgError::invalid("more than one TXT element"));
                }
            }
            Element::Signature(sig) => {
                pmse = Some(sig);
                pmse_offset = cursor;
            }
            Element::KeyManifestBody(_) => {
                return Err(BgError::invalid(format!(
                    "key manifest body at offset {cursor} inside a boot policy manifest"
                )));
            }
        }
        cursor += used;
    }

    // Cut at the start of the signature element, where the header says it
    // would begin.
    if pmse.is_none() && usize::from(key_signature_offset) == cursor + STRUCT_INFO_SIZE {
        pmse = Some(SignatureElement::default());
        pmse_offset = cursor;
    }
    bpm.pmse = pmse.ok_or_else(|| BgError::invalid("missing signature element"))?;
    if usize::from(key_signature_offset) != pmse_offset + STRUCT_INFO_SIZE {
        return Err(BgError::invalid(format!(
            "header key signature offset {key_signature_offset:#x} does not match \
             signature element at {pmse_offset:#x}"
        )));
    }
    validate_bpm(&bpm)?;
    Ok(bpm)
}

/// Serialize a Key Manifest.
pub fn assemble_km(km: &KeyManifest) -> BgResult<AssembledManifest> {
    let mut bytes = encode_element(&Element::KeyManifestBody(km.body.clone()))?;
    let signed_region_end = bytes.len();
    bytes.extend_from_slice(&encode_key_signature(&km.key_signature)?);
    Ok(AssembledManifest {
        bytes,
        signed_region_end,
    })
}

/// Parse a Key Manifest. Input cut at the signed region end yields an
/// unpopulated key signature.
pub fn disassemble_km(bytes: &[u8]) -> BgResult<KeyManifest> {
    let info = peek_struct_info(bytes, 0)?;
    if info.id != bg_prov_types::layout::KM_STRUCTURE_ID {
        return Err(BgError::UnsupportedElement(info.id, 0));
    }
    let (element, used) = decode_element(bytes, 0)?;
    let Element::KeyManifestBody(body) = element else {
        return Err(BgError::invalid("expected a key manifest body"));
    };
    let key_signature = if used == bytes.len() {
        SignatureElement::default()
    } else {
        decode_key_signature(&bytes[used..], used)?
    };
    Ok(KeyManifest {
        body,
        key_signature,
    })
}

/// Signed region end recorded in a BPM header.
pub fn bpm_signed_region_end(bytes: &[u8]) -> BgResult<usize> {
    let (_, key_signature_offset) = decode_bpmh(bytes)?;
    Ok(usize::from(key_signature_offset))
}

/// Signed region end of a Key Manifest, the size of its body element.
pub fn km_signed_region_end(bytes: &[u8]) -> BgResult<usize> {
    Ok(usize::from(peek_struct_info(bytes, 0)?.element_size.get()))
}

/// Return the manifest bytes with the key/signature pair removed.
pub fn truncate(signed: &[u8], signed_region_end: usize) -> BgResult<&[u8]> {
    signed
        .get(..signed_region_end)
        .ok_or(BgError::OffsetOutOfRange {
            offset: signed_region_end as u64,
            len: signed.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment() -> IbbSegment {
        IbbSegment {
            flags: 0,
            base: 0x1000,
            size: 0x2000,
        }
    }

    fn sample_bpm() -> BootPolicyManifest {
        BootPolicyManifest {
            header: BpmHeader {
                revision: 1,
                svn: 2,
                acm_svn_auth: 3,
                nem_data_stack: 0x10,
            },
            ibb: vec![IbbElement {
                entry_point: 0xFFFF_FFF0,
                digest_list: DigestList(vec![Digest::new(Algorithm::SHA256, vec![1; 32])]),
                segments: vec![segment()],
                ..Default::default()
            }],
            txt: Some(TxtElement::default()),
            pmse: SignatureElement::default(),
        }
    }

    fn signed_pmse() -> SignatureElement {
        let mut pmse = SignatureElement::default();
        pmse.bind_key(KeyKind::Rsa, 2048, vec![0x11; 4 + 256]).unwrap();
        pmse.signature.data = vec![0x22; 256];
        pmse
    }

    #[test]
    fn test_bpm_round_trip() {
        let mut bpm = sample_bpm();
        bpm.pmse = signed_pmse();
        let assembled = assemble_bpm(&bpm).unwrap();
        let parsed = disassemble_bpm(&assembled.bytes, DisassembleOptions::default()).unwrap();
        assert_eq!(parsed, bpm);
        assert_eq!(assemble_bpm(&parsed).unwrap(), assembled);
    }

    #[test]
    fn test_bpm_header_records_signature_offset() {
        let assembled = assemble_bpm(&sample_bpm()).unwrap();
        let recorded = u16::from_le_bytes([assembled.bytes[12], assembled.bytes[13]]);
        assert_eq!(usize::from(recorded), assembled.signed_region_end);
        assert_eq!(
            &assembled.bytes[assembled.signed_region_end - STRUCT_INFO_SIZE..][..8],
            b"__PMSG__"
        );
    }

    #[test]
    fn test_assemble_from_elements() {
        let bpm = sample_bpm();
        let from_elements = assemble(&bpm.header, &bpm.elements()).unwrap();
        assert_eq!(from_elements, assemble_bpm(&bpm).unwrap());
    }

    #[test]
    fn test_assemble_rejects_bad_order() {
        let bpm = sample_bpm();
        let mut elements = bpm.elements();
        elements.swap(0, 1);
        assert!(matches!(
            assemble(&bpm.header, &elements),
            Err(BgError::InvalidManifest(_))
        ));

        let mut elements = bpm.elements();
        elements.push(Element::Signature(SignatureElement::default()));
        assert!(matches!(
            assemble(&bpm.header, &elements),
            Err(BgError::InvalidManifest(_))
        ));

        let elements = vec![Element::Signature(SignatureElement::default())];
        assert!(matches!(
            assemble(&bpm.header, &elements),
            Err(BgError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_invariants() {
        let mut bpm = sample_bpm();
        bpm.header.nem_data_stack = 0;
        assert!(matches!(assemble_bpm(&bpm), Err(BgError::InvalidManifest(_))));

        let mut bpm = sample_bpm();
        bpm.ibb[0].segments.clear();
        assert!(matches!(assemble_bpm(&bpm), Err(BgError::InvalidManifest(_))));

        let mut bpm = sample_bpm();
        bpm.ibb[0].set_number = 1;
        assert!(matches!(assemble_bpm(&bpm), Err(BgError::InvalidManifest(_))));
    }

    #[test]
    fn test_truncated_bpm_disassembles() {
        let mut bpm = sample_bpm();
        bpm.pmse = signed_pmse();
        let assembled = assemble_bpm(&bpm).unwrap();
        let cut = truncate(&assembled.bytes, assembled.signed_region_end).unwrap();
        assert!(assembled.bytes.starts_with(cut));
        assert!(cut.len() < assembled.bytes.len());

        let parsed = disassemble_bpm(cut, DisassembleOptions::default()).unwrap();
        assert_eq!(parsed.header, bpm.header);
        assert_eq!(parsed.ibb, bpm.ibb);
        assert_eq!(parsed.txt, bpm.txt);
        assert!(!parsed.pmse.key.is_populated());
    }

    #[test]
    fn test_truncate_out_of_range() {
        assert!(matches!(
            truncate(&[0u8; 4], 5),
            Err(BgError::OffsetOutOfRange { offset: 5, len: 4 })
        ));
        assert_eq!(truncate(&[1u8, 2, 3], 3).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_signature_must_be_last() {
        let bpm = sample_bpm();
        let assembled = assemble_bpm(&bpm).unwrap();
        let mut bytes = assembled.bytes.clone();
        bytes.extend_from_slice(&encode_element(&Element::Txt(TxtElement::default())).unwrap());
        assert!(matches!(
            disassemble_bpm(&bytes, DisassembleOptions::default()),
            Err(BgError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_missing_signature_element() {
        let bpm = sample_bpm();
        let assembled = assemble_bpm(&bpm).unwrap();
        let body_end = assembled.signed_region_end - STRUCT_INFO_SIZE;
        let mut bytes = encode_bpmh(&bpm.header, (body_end + 0x40) as u16);
        bytes.extend_from_slice(&assembled.bytes[BPMH_SIZE..body_end]);
        assert!(matches!(
            disassemble_bpm(&bytes, DisassembleOptions::default()),
            Err(BgError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_bpm_cut_before_signature_header() {
        let mut bpm = sample_bpm();
        bpm.pmse = signed_pmse();
        let assembled = assemble_bpm(&bpm).unwrap();
        let cut = &assembled.bytes[..assembled.signed_region_end - STRUCT_INFO_SIZE];

        for options in [
            DisassembleOptions::default(),
            DisassembleOptions { strict_order: true },
        ] {
            let parsed = disassemble_bpm(cut, options).unwrap();
            assert_eq!(parsed.ibb, bpm.ibb);
            assert_eq!(parsed.txt, bpm.txt);
            assert_eq!(parsed.pmse, SignatureElement::default());
        }
        assert_eq!(bpm_signed_region_end(cut).unwrap(), assembled.signed_region_end);

        // Any other cut point still fails.
        assert!(disassemble_bpm(&cut[..cut.len() - 1], DisassembleOptions::default()).is_err());
    }

    #[test]
    fn test_duplicate_digest_algorithms() {
        let mut bpm = sample_bpm();
        bpm.ibb[0]
            .digest_list
            .0
            .push(Digest::new(Algorithm::SHA256, vec![2; 32]));
        assert!(matches!(
            assemble_bpm(&bpm),
            Err(BgError::DuplicateAlgorithm(0x000B))
        ));

        let mut bpm = sample_bpm();
        bpm.txt = Some(TxtElement {
            digest_list: DigestList(vec![
                Digest::new(Algorithm::SHA1, vec![3; 20]),
                Digest::new(Algorithm::SHA1, vec![4; 20]),
            ]),
            ..Default::default()
        });
        assert!(matches!(
            assemble_bpm(&bpm),
            Err(BgError::DuplicateAlgorithm(0x0004))
        ));
    }

    #[test]
    fn test_disassemble_rejects_duplicate_digest_algorithms() {
        let mut bpm = sample_bpm();
        bpm.ibb[0]
            .digest_list
            .0
            .push(Digest::new(Algorithm::SHA384, vec![0xB2; 48]));
        let mut bytes = assemble_bpm(&bpm).unwrap().bytes;

        // Retag the SHA384 entry as a second SHA256 entry.
        let data = bytes.windows(48).position(|w| w == [0xB2; 48]).unwrap();
        bytes[data - 4..data - 2].copy_from_slice(&Algorithm::SHA256.0.to_le_bytes());
        assert!(matches!(
            disassemble_bpm(&bytes, DisassembleOptions::default()),
            Err(BgError::DuplicateAlgorithm(0x000B))
        ));
    }

    #[test]
    fn test_strict_order_option() {
        let bpm = sample_bpm();
        let ibb = encode_element(&Element::Ibb(bpm.ibb[0].clone())).unwrap();
        let txt = encode_element(&Element::Txt(TxtElement::default())).unwrap();
        let pmse = encode_element(&Element::Signature(SignatureElement::default())).unwrap();
        let offset = (BPMH_SIZE + txt.len() + ibb.len() + STRUCT_INFO_SIZE) as u16;
        let mut bytes = encode_bpmh(&bpm.header, offset);
        bytes.extend_from_slice(&txt);
        bytes.extend_from_slice(&ibb);
        bytes.extend_from_slice(&pmse);

        let lenient = disassemble_bpm(&bytes, DisassembleOptions::default()).unwrap();
        assert_eq!(lenient.ibb, bpm.ibb);
        assert!(matches!(
            disassemble_bpm(
                &bytes,
                DisassembleOptions {
                    strict_order: true
                }
            ),
            Err(BgError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_unknown_element_in_bpm() {
        let bpm = sample_bpm();
        let mut bytes = assemble_bpm(&bpm).unwrap().bytes;
        bytes[BPMH_SIZE..BPMH_SIZE + 8].copy_from_slice(b"__PCDS__");
        assert!(matches!(
            disassemble_bpm(&bytes, DisassembleOptions::default()),
            Err(BgError::UnsupportedElement(_, offset)) if offset == BPMH_SIZE
        ));
    }

    #[test]
    fn test_km_round_trip_and_cut() {
        let km = KeyManifest {
            body: KeyManifestBody {
                revision: 1,
                km_svn: 1,
                km_id: 0x0F,
                pub_key_hash_alg: Algorithm::SHA256,
                hashes: vec![KeyHash {
                    usage: KeyUsage::BPM_SIGNING,
                    digest: Digest::new(Algorithm::SHA256, vec![9; 32]),
                }],
            },
            key_signature: signed_pmse(),
        };
        let assembled = assemble_km(&km).unwrap();
        assert_eq!(disassemble_km(&assembled.bytes).unwrap(), km);

        let cut = truncate(&assembled.bytes, assembled.signed_region_end).unwrap();
        let parsed = disassemble_km(cut).unwrap();
        assert_eq!(parsed.body, km.body);
        assert_eq!(parsed.key_signature, SignatureElement::default());
    }

    #[test]
    fn test_km_rejects_bpm_input() {
        let bytes = assemble_bpm(&sample_bpm()).unwrap().bytes;
        assert!(matches!(
            disassemble_km(&bytes),
            Err(BgError::UnsupportedElement(_, 0))
        ));
    }
}
