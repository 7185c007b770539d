/*++

Licensed under the Apache-2.0 license.

File Name:

   element.rs

Abstract:

    Element codec: encodes and decodes individual manifest elements and the
    hash, key and signature structures nested in them.

--*/

use bg_prov_types::layout::*;
use bg_prov_types::*;
use zerocopy::byteorder::little_endian::{U16, U32, U64};

use crate::codec::{len_u16, Reader, Writer};

pub const STRUCT_INFO_SIZE: usize = core::mem::size_of::<StructInfo>();

/// Size of the Boot Policy Manifest header element.
pub const BPMH_SIZE: usize = STRUCT_INFO_SIZE + core::mem::size_of::<BpmhFields>();

fn put_digest(w: &mut Writer, digest: &Digest) -> BgResult<()> {
    w.u16(digest.alg.0);
    w.u16(len_u16(digest.bytes.len(), "hash buffer")?);
    w.bytes(&digest.bytes);
    Ok(())
}

fn get_digest(r: &mut Reader) -> BgResult<Digest> {
    let alg = Algorithm(r.u16()?);
    let len = usize::from(r.u16()?);
    Ok(Digest::new(alg, r.take(len)?.to_vec()))
}

fn put_digest_list(w: &mut Writer, list: &DigestList) -> BgResult<()> {
    let size: usize = 4 + list.0.iter().map(|d| 4 + d.bytes.len()).sum::<usize>();
    w.u16(len_u16(size, "digest list")?);
    w.u16(len_u16(list.0.len(), "digest count")?);
    for digest in &list.0 {
        put_digest(w, digest)?;
    }
    Ok(())
}

fn get_digest_list(r: &mut Reader) -> BgResult<DigestList> {
    let start = r.offset();
    let size = usize::from(r.u16()?);
    let count = r.u16()?;
    let mut list = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        list.push(get_digest(r)?);
    }
    if r.offset() - start != size {
        return Err(BgError::invalid(format!(
            "digest list at offset {start} declares {size} bytes but holds {}",
            r.offset() - start
        )));
    }
    Ok(DigestList(list))
}

fn put_key(w: &mut Writer, key: &Key) -> BgResult<()> {
    let expected = Key::data_len(key.alg, key.key_size)?;
    if key.data.len() != expected {
        return Err(BgError::invalid(format!(
            "key material is {} bytes, {expected} expected",
            key.data.len()
        )));
    }
    w.u16(key.alg.0);
    w.u8(KEY_SIGNATURE_VERSION);
    w.u16(key.key_size);
    w.bytes(&key.data);
    Ok(())
}

fn get_key(r: &mut Reader) -> BgResult<Key> {
    let alg = Algorithm(r.u16()?);
    expect_version(r, KEY_SIGNATURE_VERSION, "key")?;
    let key_size = r.u16()?;
    let data = r.take(Key::data_len(alg, key_size)?)?.to_vec();
    Ok(Key {
        alg,
        key_size,
        data,
    })
}

fn put_signature(w: &mut Writer, sig: &Signature) -> BgResult<()> {
    let expected = Signature::data_len(sig.scheme, sig.key_size)?;
    if sig.data.len() != expected {
        return Err(BgError::invalid(format!(
            "signature is {} bytes, {expected} expected",
            sig.data.len()
        )));
    }
    w.u16(sig.scheme.0);
    w.u8(KEY_SIGNATURE_VERSION);
    w.u16(sig.key_size);
    w.u16(sig.hash_alg.0);
    w.bytes(&sig.data);
    Ok(())
}

fn get_signature(r: &mut Reader) -> BgResult<Signature> {
    let scheme = Algorithm(r.u16()?);
    expect_version(r, KEY_SIGNATURE_VERSION, "signature")?;
    let key_size = r.u16()?;
    let hash_alg = Algorithm(r.u16()?);
    let data = r.take(Signature::data_len(scheme, key_size)?)?.to_vec();
    Ok(Signature {
        scheme,
        key_size,
        hash_alg,
        data,
    })
}

fn expect_version(r: &mut Reader, version: u8, what: &str) -> BgResult<()> {
    let offset = r.offset();
    let found = r.u8()?;
    if found != version {
        return Err(BgError::invalid(format!(
            "{what} version {found:#04x} at offset {offset}, expected {version:#04x}"
        )));
    }
    Ok(())
}

/// Encode a key/signature pair without any element framing, as it is
/// stored at the end of a Key Manifest.
pub fn encode_key_signature(element: &SignatureElement) -> BgResult<Vec<u8>> {
    let mut w = Writer::new();
    put_key_signature(&mut w, element)?;
    Ok(w.into_inner())
}

/// Decode an unframed key/signature pair occupying all of `bytes`.
///
/// `base` is the absolute offset of `bytes` within its manifest.
pub fn decode_key_signature(bytes: &[u8], base: usize) -> BgResult<SignatureElement> {
    let mut r = Reader::new(bytes, base);
    let element = get_key_signature(&mut r)?;
    r.finish("key signature")?;
    Ok(element)
}

fn put_key_signature(w: &mut Writer, element: &SignatureElement) -> BgResult<()> {
    w.u8(KEY_SIGNATURE_VERSION);
    put_key(w, &element.key)?;
    put_signature(w, &element.signature)
}

fn get_key_signature(r: &mut Reader) -> BgResult<SignatureElement> {
    expect_version(r, KEY_SIGNATURE_VERSION, "key signature")?;
    let key = get_key(r)?;
    let signature = get_signature(r)?;
    Ok(SignatureElement { key, signature })
}

fn put_ibb(w: &mut Writer, ibb: &IbbElement) -> BgResult<()> {
    w.put(&IbbFixedFields {
        reserved0: 0,
        set_number: ibb.set_number,
        reserved1: 0,
        pbet_value: ibb.pbet_value,
        flags: U32::new(ibb.flags),
        ibb_mchbar: U64::new(ibb.ibb_mchbar),
        vtd_bar: U64::new(ibb.vtd_bar),
        dma_prot_base0: U32::new(ibb.dma_prot_base0),
        dma_prot_limit0: U32::new(ibb.dma_prot_limit0),
        dma_prot_base1: U64::new(ibb.dma_prot_base1),
        dma_prot_limit1: U64::new(ibb.dma_prot_limit1),
    });
    put_digest(w, &ibb.post_ibb_hash)?;
    w.u32(ibb.entry_point);
    put_digest_list(w, &ibb.digest_list)?;
    put_digest(w, &ibb.obb_hash)?;
    w.zeros(3);
    let count = u8::try_from(ibb.segments.len())
        .map_err(|_| BgError::invalid("more than 255 IBB segments"))?;
    w.u8(count);
    for seg in &ibb.segments {
        w.put(&IbbSegmentFields {
            reserved: [0; 2],
            flags: U16::new(seg.flags),
            base: U32::new(seg.base),
            size: U32::new(seg.size),
        });
    }
    Ok(())
}

fn get_ibb(r: &mut Reader) -> BgResult<IbbElement> {
    let fixed: IbbFixedFields = r.read()?;
    if fixed.reserved0 != 0 || fixed.reserved1 != 0 {
        return Err(BgError::invalid("IBB element reserved bytes are not zero"));
    }
    let post_ibb_hash = get_digest(r)?;
    let entry_point = r.u32()?;
    let digest_list = get_digest_list(r)?;
    let obb_hash = get_digest(r)?;
    r.reserved(3, "IBB reserved2")?;
    let count = r.u8()?;
    let mut segments = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let seg: IbbSegmentFields = r.read()?;
        if seg.reserved != [0; 2] {
            return Err(BgError::invalid("IBB segment reserved bytes are not zero"));
        }
        segments.push(IbbSegment {
            flags: seg.flags.get(),
            base: seg.base.get(),
            size: seg.size.get(),
        });
    }
    Ok(IbbElement {
        set_number: fixed.set_number,
        pbet_value: fixed.pbet_value,
        flags: fixed.flags.get(),
        ibb_mchbar: fixed.ibb_mchbar.get(),
        vtd_bar: fixed.vtd_bar.get(),
        dma_prot_base0: fixed.dma_prot_base0.get(),
        dma_prot_limit0: fixed.dma_prot_limit0.get(),
        dma_prot_base1: fixed.dma_prot_base1.get(),
        dma_prot_limit1: fixed.dma_prot_limit1.get(),
        post_ibb_hash,
        entry_point,
        digest_list,
        obb_hash,
        segments,
    })
}

fn put_txt(w: &mut Writer, txt: &TxtElement) -> BgResult<()> {
    w.put(&TxtFixedFields {
        reserved0: 0,
        set_number: txt.set_number,
        sinit_min_svn_auth: txt.sinit_min_svn_auth,
        reserved1: 0,
        control_flags: U32::new(txt.control_flags),
        pwr_down_interval: U16::new(txt.pwr_down_interval),
        ptt_cmos_offset0: txt.ptt_cmos_offset0,
        ptt_cmos_offset1: txt.ptt_cmos_offset1,
        acpi_base_offset: U16::new(txt.acpi_base_offset),
        reserved2: [0; 2],
        pwrm_base_offset: U32::new(txt.pwrm_base_offset),
    });
    put_digest_list(w, &txt.digest_list)?;
    w.zeros(3);
    // Segment count, always zero for the TXT element
    w.u8(0);
    Ok(())
}

fn get_txt(r: &mut Reader) -> BgResult<TxtElement> {
    let fixed: TxtFixedFields = r.read()?;
    if fixed.reserved0 != 0 || fixed.reserved1 != 0 || fixed.reserved2 != [0; 2] {
        return Err(BgError::invalid("TXT element reserved bytes are not zero"));
    }
    let digest_list = get_digest_list(r)?;
    r.reserved(3, "TXT reserved3")?;
    if r.u8()? != 0 {
        return Err(BgError::invalid("TXT element segment count must be zero"));
    }
    Ok(TxtElement {
        set_number: fixed.set_number,
        sinit_min_svn_auth: fixed.sinit_min_svn_auth,
        control_flags: fixed.control_flags.get(),
        pwr_down_interval: fixed.pwr_down_interval.get(),
        ptt_cmos_offset0: fixed.ptt_cmos_offset0,
        ptt_cmos_offset1: fixed.ptt_cmos_offset1,
        acpi_base_offset: fixed.acpi_base_offset.get(),
        pwrm_base_offset: fixed.pwrm_base_offset.get(),
        digest_list,
    })
}

/// Encodes the key manifest body. Its signature offset field equals the
/// body size, since the key signature directly follows it.
fn put_km_body(w: &mut Writer, body: &KeyManifestBody, element_size: u16) -> BgResult<()> {
    w.put(&KmFixedFields {
        key_manifest_signature_offset: U16::new(element_size),
        reserved: [0; 3],
        revision: body.revision,
        km_svn: body.km_svn,
        km_id: body.km_id,
        pub_key_hash_alg: U16::new(body.pub_key_hash_alg.0),
    });
    w.u16(len_u16(body.hashes.len(), "key hash count")?);
    for hash in &body.hashes {
        w.u64(hash.usage.bits());
        put_digest(w, &hash.digest)?;
    }
    Ok(())
}

fn get_km_body(r: &mut Reader, element_size: u16) -> BgResult<KeyManifestBody> {
    let fixed: KmFixedFields = r.read()?;
    if fixed.reserved != [0; 3] {
        return Err(BgError::invalid("key manifest reserved bytes are not zero"));
    }
    if fixed.key_manifest_signature_offset.get() != element_size {
        return Err(BgError::invalid(format!(
            "key manifest signature offset {:#x} does not match body size {element_size:#x}",
            fixed.key_manifest_signature_offset.get()
        )));
    }
    let count = r.u16()?;
    let mut hashes = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let usage = KeyUsage::from_bits_retain(r.u64()?);
        let digest = get_digest(r)?;
        hashes.push(KeyHash { usage, digest });
    }
    Ok(KeyManifestBody {
        revision: fixed.revision,
        km_svn: fixed.km_svn,
        km_id: fixed.km_id,
        pub_key_hash_alg: Algorithm(fixed.pub_key_hash_alg.get()),
        hashes,
    })
}

fn element_version(id: &StructureId) -> Option<u8> {
    match *id {
        IBB_STRUCTURE_ID => Some(IBB_VERSION),
        TXT_STRUCTURE_ID => Some(TXT_VERSION),
        PMSE_STRUCTURE_ID => Some(PMSE_VERSION),
        KM_STRUCTURE_ID => Some(KM_VERSION),
        _ => None,
    }
}

/// Encode one element including its structure header.
pub fn encode_element(element: &Element) -> BgResult<Vec<u8>> {
    let id = element.structure_id();
    let mut body = Writer::new();
    match element {
        Element::Ibb(ibb) => put_ibb(&mut body, ibb)?,
        Element::Txt(txt) => put_txt(&mut body, txt)?,
        Element::Signature(sig) => put_key_signature(&mut body, sig)?,
        Element::KeyManifestBody(km) => {
            // The body size does not depend on the offset value itself.
            let mut probe = Writer::new();
            put_km_body(&mut probe, km, 0)?;
            let size = len_u16(STRUCT_INFO_SIZE + probe.len(), "key manifest body")?;
            put_km_body(&mut body, km, size)?;
        }
    }
    let body = body.into_inner();
    let element_size = len_u16(STRUCT_INFO_SIZE + body.len(), "element size")?;

    let mut w = Writer::new();
    w.put(&StructInfo {
        id,
        version: element_version(&id).unwrap_or_default(),
        variable0: 0,
        element_size: U16::new(element_size),
    });
    w.bytes(&body);
    Ok(w.into_inner())
}

/// Encoded size of one element.
pub fn element_size(element: &Element) -> BgResult<usize> {
    Ok(encode_element(element)?.len())
}

/// Read the structure header at `cursor` without consuming anything.
pub fn peek_struct_info(bytes: &[u8], cursor: usize) -> BgResult<StructInfo> {
    let mut r = Reader::new(bytes.get(cursor..).unwrap_or_default(), cursor);
    r.read()
}

/// Decode the element starting at `cursor`.
///
/// Returns the element and the number of bytes it occupies, which is always
/// the size declared in its structure header.
pub fn decode_element(bytes: &[u8], cursor: usize) -> BgResult<(Element, usize)> {
    let info = peek_struct_info(bytes, cursor)?;
    let Some(version) = element_version(&info.id) else {
        return Err(BgError::UnsupportedElement(info.id, cursor));
    };
    if info.version != version {
        return Err(BgError::invalid(format!(
            "element {} at offset {cursor} has version {:#04x}, expected {version:#04x}",
            String::from_utf8_lossy(&info.id),
            info.version
        )));
    }
    let size = usize::from(info.element_size.get());
    if size < STRUCT_INFO_SIZE {
        return Err(BgError::invalid(format!(
            "element at offset {cursor} declares size {size}"
        )));
    }

    let mut outer = Reader::new(&bytes[cursor..], cursor);
    outer.take(STRUCT_INFO_SIZE)?;
    let body = outer.take(size - STRUCT_INFO_SIZE)?;
    let mut r = Reader::new(body, cursor + STRUCT_INFO_SIZE);

    let element = match info.id {
        IBB_STRUCTURE_ID => Element::Ibb(get_ibb(&mut r)?),
        TXT_STRUCTURE_ID => Element::Txt(get_txt(&mut r)?),
        PMSE_STRUCTURE_ID => Element::Signature(get_key_signature(&mut r)?),
        _ => Element::KeyManifestBody(get_km_body(&mut r, info.element_size.get())?),
    };
    r.finish(&String::from_utf8_lossy(&info.id))?;
    Ok((element, size))
}

/// Encode the Boot Policy Manifest header element.
pub(crate) fn encode_bpmh(header: &BpmHeader, key_signature_offset: u16) -> Vec<u8> {
    let mut w = Writer::new();
    w.put(&StructInfo {
        id: BPMH_STRUCTURE_ID,
        version: BPMH_VERSION,
        variable0: BPMH_HEADER_STRUCT_VERSION,
        element_size: U16::new(BPMH_SIZE as u16),
    });
    w.put(&BpmhFields {
        key_signature_offset: U16::new(key_signature_offset),
        bpm_revision: header.revision,
        bpm_svn: header.svn,
        acm_svn_auth: header.acm_svn_auth,
        reserved0: 0,
        nem_data_stack: U16::new(header.nem_data_stack),
    });
    w.into_inner()
}

/// Decode the Boot Policy Manifest header element.
///
/// Returns the header and the key signature offset it records.
pub(crate) fn decode_bpmh(bytes: &[u8]) -> BgResult<(BpmHeader, u16)> {
    let mut r = Reader::new(bytes, 0);
    let info: StructInfo = r.read()?;
    if info.id != BPMH_STRUCTURE_ID {
        return match element_version(&info.id) {
            Some(_) => Err(BgError::invalid("manifest does not start with a BPM header")),
            None => Err(BgError::UnsupportedElement(info.id, 0)),
        };
    }
    if info.version != BPMH_VERSION || usize::from(info.element_size.get()) != BPMH_SIZE {
        return Err(BgError::invalid(format!(
            "unsupported BPM header version {:#04x} size {}",
            info.version,
            info.element_size.get()
        )));
    }
    let fields: BpmhFields = r.read()?;
    if fields.reserved0 != 0 {
        return Err(BgError::invalid("BPM header reserved byte is not zero"));
    }
    let header = BpmHeader {
        revision: fields.bpm_revision,
        svn: fields.bpm_svn,
        acm_svn_auth: fields.acm_svn_auth,
        nem_data_stack: fields.nem_data_stack.get(),
    };
    Ok((header, fields.key_signature_offset.get()))
}
