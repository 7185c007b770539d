/*++

Licensed under the Apache-2.0 license.

File Name:

   lib.rs

Abstract:

    Firmware Interface Table access: locating the table in a BIOS image,
    extracting the Boot Guard blobs it points at and stitching new ones in.

--*/

use core::ops::Range;

use bg_prov_types::{BgError, BgResult};
use zerocopy::byteorder::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// The FIT pointer lives this many bytes below the end of the image.
pub const FIT_POINTER_OFFSET: usize = 0x40;

pub const FIT_SIGNATURE: [u8; 8] = *b"_FIT_   ";

pub const FIT_ENTRY_SIZE: usize = 16;

pub const FIT_ENTRY_VERSION: u16 = 0x0100;

const CHECKSUM_VALID: u8 = 0x80;

const FOUR_GIB: u64 = 0x1_0000_0000;

/// Offset of the module size, in dwords, inside an ACM header.
const ACM_SIZE_OFFSET: usize = 0x18;

const ACM_ALIGN: u64 = 0x1000;
const MANIFEST_ALIGN: u64 = 0x10;

const ERASED: u8 = 0xFF;

/// FIT entry types used by Boot Guard provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitEntryType {
    Header = 0x00,
    Microcode = 0x01,
    StartupAcm = 0x02,
    BiosModule = 0x07,
    KeyManifest = 0x0B,
    BootPolicyManifest = 0x0C,
    Unused = 0x7F,
}

impl From<FitEntryType> for u8 {
    fn from(value: FitEntryType) -> Self {
        value as u8
    }
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Debug, Default, Clone, Copy)]
struct RawFitEntry {
    address: U64,
    size: [u8; 3],
    reserved: u8,
    version: U16,
    type_cv: u8,
    checksum: u8,
}

/// One decoded FIT entry. The first entry of a table is the header, whose
/// `address` holds the signature and whose `size` is the entry count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitEntry {
    pub address: u64,

    /// 24-bit size field
    pub size: u32,

    pub version: u16,

    /// 7-bit entry type
    pub entry_type: u8,

    pub checksum_valid: bool,

    pub checksum: u8,
}

impl FitEntry {
    fn new(entry_type: FitEntryType, address: u64, size: u32) -> Self {
        Self {
            address,
            size,
            version: FIT_ENTRY_VERSION,
            entry_type: entry_type.into(),
            checksum_valid: false,
            checksum: 0,
        }
    }

    pub fn is(&self, entry_type: FitEntryType) -> bool {
        self.entry_type == u8::from(entry_type)
    }

    fn from_raw(raw: &RawFitEntry) -> Self {
        let [s0, s1, s2] = raw.size;
        Self {
            address: raw.address.get(),
            size: u32::from_le_bytes([s0, s1, s2, 0]),
            version: raw.version.get(),
            entry_type: raw.type_cv & !CHECKSUM_VALID,
            checksum_valid: raw.type_cv & CHECKSUM_VALID != 0,
            checksum: raw.checksum,
        }
    }

    fn to_raw(&self) -> RawFitEntry {
        let [s0, s1, s2, _] = self.size.to_le_bytes();
        RawFitEntry {
            address: U64::new(self.address),
            size: [s0, s1, s2],
            reserved: 0,
            version: U16::new(self.version),
            type_cv: (self.entry_type & !CHECKSUM_VALID)
                | if self.checksum_valid { CHECKSUM_VALID } else { 0 },
            checksum: self.checksum,
        }
    }
}

/// Map a physical address to an image offset. The image is mapped so that
/// its last byte sits at `0xFFFF_FFFF`.
pub fn phys_to_offset(image_len: usize, addr: u64) -> BgResult<usize> {
    let len = image_len as u64;
    if len > FOUR_GIB || addr >= FOUR_GIB || addr < FOUR_GIB - len {
        return Err(BgError::OffsetOutOfRange {
            offset: addr,
            len: image_len,
        });
    }
    Ok((addr - (FOUR_GIB - len)) as usize)
}

/// Inverse of [`phys_to_offset`].
pub fn offset_to_phys(image_len: usize, offset: usize) -> BgResult<u64> {
    let len = image_len as u64;
    if len > FOUR_GIB || offset >= image_len {
        return Err(BgError::OffsetOutOfRange {
            offset: offset as u64,
            len: image_len,
        });
    }
    Ok(FOUR_GIB - len + offset as u64)
}

struct FitTable {
    offset: usize,
    header: FitEntry,
    entries: Vec<FitEntry>,
}

impl FitTable {
    fn byte_len(&self) -> usize {
        (self.entries.len() + 1) * FIT_ENTRY_SIZE
    }

    fn find(&self, entry_type: FitEntryType) -> Option<usize> {
        self.entries.iter().position(|e| e.is(entry_type))
    }
}

fn read_entry(image: &[u8], offset: usize) -> Option<FitEntry> {
    let bytes = image.get(offset..)?;
    let (raw, _) = RawFitEntry::read_from_prefix(bytes).ok()?;
    Some(FitEntry::from_raw(&raw))
}

fn locate(image: &[u8]) -> BgResult<FitTable> {
    let pointer_offset = image
        .len()
        .checked_sub(FIT_POINTER_OFFSET)
        .ok_or_else(|| BgError::FitNotFound(format!("image of {} bytes is too small", image.len())))?;
    let (pointer, _) = U64::read_from_prefix(&image[pointer_offset..])
        .map_err(|_| BgError::FitNotFound("FIT pointer is truncated".into()))?;
    let pointer = pointer.get();
    let offset = phys_to_offset(image.len(), pointer)
        .map_err(|_| BgError::FitNotFound(format!("FIT pointer {pointer:#x} is outside the image")))?;

    let header = read_entry(image, offset)
        .ok_or_else(|| BgError::FitNotFound(format!("FIT header at {offset:#x} is truncated")))?;
    if header.address.to_le_bytes() != FIT_SIGNATURE || !header.is(FitEntryType::Header) {
        return Err(BgError::FitNotFound(format!(
            "no FIT signature at offset {offset:#x}"
        )));
    }
    let count = header.size as usize;
    if count == 0 || offset + count * FIT_ENTRY_SIZE > pointer_offset {
        return Err(BgError::FitNotFound(format!(
            "FIT header at {offset:#x} declares {count} entries"
        )));
    }
    let entries = (1..count)
        .filter_map(|i| read_entry(image, offset + i * FIT_ENTRY_SIZE))
        .collect();
    log::debug!("FIT at offset {offset:#x} with {count} entries");
    Ok(FitTable {
        offset,
        header,
        entries,
    })
}

/// List the FIT entries of a BIOS image, header first.
pub fn entries(image: &[u8]) -> BgResult<Vec<FitEntry>> {
    let table = locate(image)?;
    let mut all = vec![table.header];
    all.extend(table.entries);
    Ok(all)
}

/// Boot Guard blobs referenced from a FIT.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FitPayloads<'a> {
    pub acm: Option<&'a [u8]>,
    pub km: Option<&'a [u8]>,
    pub bpm: Option<&'a [u8]>,
}

fn acm_len(image: &[u8], offset: usize) -> BgResult<usize> {
    let size_offset = offset + ACM_SIZE_OFFSET;
    let dwords = image
        .get(size_offset..size_offset + 4)
        .ok_or(BgError::OffsetOutOfRange {
            offset: size_offset as u64,
            len: image.len(),
        })?;
    let dwords = u32::from_le_bytes([dwords[0], dwords[1], dwords[2], dwords[3]]);
    Ok(dwords as usize * 4)
}

/// Image range occupied by the blob an entry points at.
fn payload_range(image: &[u8], entry: &FitEntry) -> BgResult<Range<usize>> {
    let offset = phys_to_offset(image.len(), entry.address)?;
    let len = if entry.is(FitEntryType::StartupAcm) {
        acm_len(image, offset)?
    } else {
        entry.size as usize
    };
    if offset + len > image.len() {
        return Err(BgError::OffsetOutOfRange {
            offset: (offset + len) as u64,
            len: image.len(),
        });
    }
    Ok(offset..offset + len)
}

/// Extract the ACM, KM and BPM a BIOS image's FIT points at.
pub fn extract(image: &[u8]) -> BgResult<FitPayloads<'_>> {
    let table = locate(image)?;
    Ok(FitPayloads {
        acm: find_payload(image, &table, FitEntryType::StartupAcm)?,
        km: find_payload(image, &table, FitEntryType::KeyManifest)?,
        bpm: find_payload(image, &table, FitEntryType::BootPolicyManifest)?,
    })
}

fn find_payload<'a>(
    image: &'a [u8],
    table: &FitTable,
    entry_type: FitEntryType,
) -> BgResult<Option<&'a [u8]>> {
    match table.find(entry_type) {
        Some(i) => Ok(Some(&image[payload_range(image, &table.entries[i])?])),
        None => Ok(None),
    }
}

/// Lowest offset whose physical address is `align` aligned and that starts
/// `len` erased bytes clear of every excluded range.
fn find_free(image: &[u8], len: usize, align: u64, excluded: &[Range<usize>]) -> BgResult<usize> {
    let limit = image.len() - FIT_POINTER_OFFSET;
    let base = FOUR_GIB - image.len() as u64;
    let mut start = 0;
    loop {
        let candidate = ((base + start as u64).next_multiple_of(align) - base) as usize;
        let end = candidate + len;
        if end > limit {
            return Err(BgError::NoSpace(len));
        }
        if let Some(range) = excluded.iter().find(|r| r.start < end && candidate < r.end) {
            start = range.end;
            continue;
        }
        match image[candidate..end].iter().rposition(|b| *b != ERASED) {
            Some(pos) => start = candidate + pos + 1,
            None => return Ok(candidate),
        }
    }
}

/// Insert or replace the FIT entries pointing at an ACM, a BPM and a KM.
///
/// Empty payloads are left alone. A payload replacing an existing blob is
/// written over it when it fits, otherwise the old blob is erased and the
/// payload goes to the lowest aligned erased region. The input image is
/// never modified; the stitched copy is returned.
pub fn stitch(image: &[u8], acm: &[u8], bpm: &[u8], km: &[u8]) -> BgResult<Vec<u8>> {
    if acm.is_empty() && bpm.is_empty() && km.is_empty() {
        return Err(BgError::NoPayload);
    }
    let mut table = locate(image)?;
    let mut out = image.to_vec();

    let payloads = [
        (FitEntryType::StartupAcm, acm, ACM_ALIGN),
        (FitEntryType::KeyManifest, km, MANIFEST_ALIGN),
        (FitEntryType::BootPolicyManifest, bpm, MANIFEST_ALIGN),
    ];

    // New entries reuse unused slots first, then grow the table in place.
    let inserts = payloads
        .iter()
        .filter(|(ty, payload, _)| !payload.is_empty() && table.find(*ty).is_none())
        .count();
    let unused = table.entries.iter().filter(|e| e.is(FitEntryType::Unused)).count();
    let growth = inserts.saturating_sub(unused) * FIT_ENTRY_SIZE;
    let table_end = table.offset + table.byte_len();
    if growth > 0
        && out
            .get(table_end..table_end + growth)
            .filter(|_| table_end + growth <= out.len() - FIT_POINTER_OFFSET)
            .map_or(true, |tail| tail.iter().any(|b| *b != ERASED))
    {
        return Err(BgError::NoSpace(growth));
    }
    let mut excluded = vec![table.offset..table_end + growth];

    for (entry_type, payload, align) in payloads {
        if payload.is_empty() {
            continue;
        }
        let size = if entry_type == FitEntryType::StartupAcm {
            0
        } else {
            u32::try_from(payload.len())
                .ok()
                .filter(|len| *len < 1 << 24)
                .ok_or_else(|| BgError::invalid("payload does not fit a 24-bit FIT size"))?
        };

        let existing = table.find(entry_type);
        let old_range = match existing {
            Some(i) => match payload_range(&out, &table.entries[i]) {
                Ok(range) => Some(range),
                Err(err) => {
                    log::warn!("ignoring blob of stale {entry_type:?} entry: {err}");
                    None
                }
            },
            None => None,
        };

        let offset = match old_range {
            Some(old) if payload.len() <= old.len() => {
                out[old.clone()].fill(ERASED);
                old.start
            }
            Some(old) => {
                out[old].fill(ERASED);
                find_free(&out, payload.len(), align, &excluded)?
            }
            None => find_free(&out, payload.len(), align, &excluded)?,
        };
        out[offset..offset + payload.len()].copy_from_slice(payload);
        excluded.push(offset..offset + payload.len());

        let entry = FitEntry::new(entry_type, offset_to_phys(out.len(), offset)?, size);
        log::info!(
            "{entry_type:?}: {} bytes at offset {offset:#x} (physical {:#x})",
            payload.len(),
            entry.address
        );
        match existing {
            Some(i) => table.entries[i] = entry,
            None => match table.find(FitEntryType::Unused) {
                Some(i) => table.entries[i] = entry,
                None => table.entries.push(entry),
            },
        }
    }

    table.entries.sort_by_key(|e| e.entry_type);
    write_table(&mut out, &mut table);
    Ok(out)
}

fn write_table(image: &mut [u8], table: &mut FitTable) {
    table.header.size = (table.entries.len() + 1) as u32;
    table.header.checksum = 0;

    let mut bytes = Vec::with_capacity(table.byte_len());
    bytes.extend_from_slice(table.header.to_raw().as_bytes());
    for entry in &table.entries {
        bytes.extend_from_slice(entry.to_raw().as_bytes());
    }
    if table.header.checksum_valid {
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        table.header.checksum = 0u8.wrapping_sub(sum);
        bytes[FIT_ENTRY_SIZE - 1] = table.header.checksum;
    }
    image[table.offset..table.offset + bytes.len()].copy_from_slice(&bytes);
}
