/*++

Licensed under the Apache-2.0 license.

File Name:

   lib.rs

Abstract:

    Data structures for Boot Guard Key Manifests and Boot Policy Manifests.

--*/

mod algorithm;
mod error;
pub mod layout;

pub use algorithm::Algorithm;
pub use error::{BgError, BgResult};
pub use layout::StructureId;

use bitflags::bitflags;
use serde_derive::{Deserialize, Serialize};

/// Default power down interval, in 5 second units.
pub const DEFAULT_PWR_DOWN_INTERVAL: u16 = 0x28;
pub const DEFAULT_PTT_CMOS_OFFSET0: u8 = 126;
pub const DEFAULT_PTT_CMOS_OFFSET1: u8 = 127;
pub const DEFAULT_ACPI_BASE_OFFSET: u16 = 0x400;
pub const DEFAULT_PWRM_BASE_OFFSET: u32 = 0xFE00_0000;

/// IBB segment flag: the segment is not covered by the IBB digest.
pub const IBB_SEGMENT_FLAG_NOT_HASHED: u16 = 1 << 0;

/// Algorithm identifier and raw hash bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    pub alg: Algorithm,
    pub bytes: Vec<u8>,
}

impl Digest {
    pub fn new(alg: Algorithm, bytes: Vec<u8>) -> Self {
        Self { alg, bytes }
    }

    /// Placeholder for an algorithm whose digest has not been computed yet.
    pub fn empty(alg: Algorithm) -> Self {
        Self {
            alg,
            bytes: Vec::new(),
        }
    }
}

impl Default for Digest {
    fn default() -> Self {
        Digest::empty(Algorithm::NULL)
    }
}

/// Ordered list of digests, one per configured algorithm.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DigestList(pub Vec<Digest>);

impl DigestList {
    /// Create a list with one uncomputed entry per algorithm.
    pub fn with_algorithms(algs: &[Algorithm]) -> BgResult<Self> {
        let list = DigestList(algs.iter().map(|alg| Digest::empty(*alg)).collect());
        list.check_unique()?;
        Ok(list)
    }

    pub fn algorithms(&self) -> Vec<Algorithm> {
        self.0.iter().map(|d| d.alg).collect()
    }

    pub fn get(&self, alg: Algorithm) -> Option<&Digest> {
        self.0.iter().find(|d| d.alg == alg)
    }

    pub fn check_unique(&self) -> BgResult<()> {
        for (i, digest) in self.0.iter().enumerate() {
            if self.0[..i].iter().any(|d| d.alg == digest.alg) {
                return Err(BgError::DuplicateAlgorithm(digest.alg.0));
            }
        }
        Ok(())
    }
}

/// Header of a Boot Policy Manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BpmHeader {
    pub revision: u8,
    pub svn: u8,
    pub acm_svn_auth: u8,
    /// Data region needed by the IBB, in 4K pages. Must not be zero.
    pub nem_data_stack: u16,
}

impl Default for BpmHeader {
    fn default() -> Self {
        Self {
            revision: 0,
            svn: 0,
            acm_svn_auth: 0,
            nem_data_stack: 1,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IbbSegment {
    pub flags: u16,
    pub base: u32,
    pub size: u32,
}

impl IbbSegment {
    pub fn is_hashed(&self) -> bool {
        self.flags & IBB_SEGMENT_FLAG_NOT_HASHED == 0
    }
}

/// Initial Boot Block element (`__IBBS__`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IbbElement {
    /// Zero for the startup IBB set.
    pub set_number: u8,
    pub pbet_value: u8,
    pub flags: u32,
    pub ibb_mchbar: u64,
    pub vtd_bar: u64,
    pub dma_prot_base0: u32,
    pub dma_prot_limit0: u32,
    pub dma_prot_base1: u64,
    pub dma_prot_limit1: u64,
    pub post_ibb_hash: Digest,
    pub entry_point: u32,
    pub digest_list: DigestList,
    pub obb_hash: Digest,
    pub segments: Vec<IbbSegment>,
}

impl Default for IbbElement {
    fn default() -> Self {
        Self {
            set_number: 0,
            pbet_value: 0,
            flags: 0,
            ibb_mchbar: 0,
            vtd_bar: 0,
            dma_prot_base0: 0,
            dma_prot_limit0: 0,
            dma_prot_base1: 0,
            dma_prot_limit1: 0,
            post_ibb_hash: Digest::default(),
            entry_point: 0,
            digest_list: DigestList::default(),
            obb_hash: Digest::default(),
            segments: Vec::new(),
        }
    }
}

/// Trusted Execution Technology element (`__TXTS__`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtElement {
    pub set_number: u8,
    pub sinit_min_svn_auth: u8,
    pub control_flags: u32,
    /// Power down interval in 5 second units.
    pub pwr_down_interval: u16,
    pub ptt_cmos_offset0: u8,
    pub ptt_cmos_offset1: u8,
    pub acpi_base_offset: u16,
    pub pwrm_base_offset: u32,
    pub digest_list: DigestList,
}

impl Default for TxtElement {
    fn default() -> Self {
        Self {
            set_number: 0,
            sinit_min_svn_auth: 0,
            control_flags: 0,
            pwr_down_interval: DEFAULT_PWR_DOWN_INTERVAL,
            ptt_cmos_offset0: DEFAULT_PTT_CMOS_OFFSET0,
            ptt_cmos_offset1: DEFAULT_PTT_CMOS_OFFSET1,
            acpi_base_offset: DEFAULT_ACPI_BASE_OFFSET,
            pwrm_base_offset: DEFAULT_PWRM_BASE_OFFSET,
            digest_list: DigestList::default(),
        }
    }
}

/// Kind of key material bound into a signature element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    Ecc,
}

impl KeyKind {
    pub fn algorithm(self) -> Algorithm {
        match self {
            KeyKind::Rsa => Algorithm::RSA,
            KeyKind::Ecc => Algorithm::ECC,
        }
    }

    pub fn signature_scheme(self) -> Algorithm {
        match self {
            KeyKind::Rsa => Algorithm::RSASSA,
            KeyKind::Ecc => Algorithm::ECDSA,
        }
    }

    /// Hash algorithm used when signing with a key of `bits` bits.
    pub fn signature_hash(self, bits: u16) -> Algorithm {
        match self {
            KeyKind::Rsa if bits <= 2048 => Algorithm::SHA256,
            KeyKind::Ecc if bits <= 256 => Algorithm::SHA256,
            _ => Algorithm::SHA384,
        }
    }
}

/// Public key descriptor.
///
/// RSA material is a 4 byte little-endian exponent followed by the
/// little-endian modulus. EC material is the little-endian X then Y
/// coordinates.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Key {
    pub alg: Algorithm,
    /// Key size in bits
    pub key_size: u16,
    pub data: Vec<u8>,
}

impl Key {
    pub fn is_populated(&self) -> bool {
        self.alg != Algorithm::UNSET
    }

    pub fn kind(&self) -> Option<KeyKind> {
        match self.alg {
            Algorithm::RSA => Some(KeyKind::Rsa),
            Algorithm::ECC | Algorithm::SM2 => Some(KeyKind::Ecc),
            _ => None,
        }
    }

    /// Length of the key material implied by the algorithm and size.
    pub fn data_len(alg: Algorithm, key_size: u16) -> BgResult<usize> {
        let bytes = usize::from(key_size).div_ceil(8);
        match alg {
            Algorithm::UNSET => Ok(0),
            Algorithm::RSA => Ok(4 + bytes),
            Algorithm::ECC | Algorithm::SM2 => Ok(2 * bytes),
            other => Err(BgError::UnsupportedAlgorithm(other.0)),
        }
    }
}

/// Signature descriptor.
///
/// RSA signatures are stored little-endian; EC signatures are the
/// little-endian R then S values.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Signature {
    pub scheme: Algorithm,
    /// Size of the signing key in bits
    pub key_size: u16,
    pub hash_alg: Algorithm,
    pub data: Vec<u8>,
}

impl Signature {
    pub fn data_len(scheme: Algorithm, key_size: u16) -> BgResult<usize> {
        let bytes = usize::from(key_size).div_ceil(8);
        match scheme {
            Algorithm::UNSET => Ok(0),
            Algorithm::RSASSA | Algorithm::RSAPSS => Ok(bytes),
            Algorithm::ECDSA | Algorithm::SM2 => Ok(2 * bytes),
            other => Err(BgError::UnsupportedAlgorithm(other.0)),
        }
    }
}

/// Key and signature pair terminating a manifest (PMSE in a BPM).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SignatureElement {
    pub key: Key,
    pub signature: Signature,
}

impl SignatureElement {
    /// Bind a public key and size the signature descriptor for it.
    ///
    /// The signature buffer is zero filled at its final length so the
    /// encoded size of the element does not change when it is signed.
    pub fn bind_key(&mut self, kind: KeyKind, key_size: u16, data: Vec<u8>) -> BgResult<()> {
        let expected = Key::data_len(kind.algorithm(), key_size)?;
        if data.len() != expected {
            return Err(BgError::invalid(format!(
                "key material is {} bytes, {expected} expected for a {key_size}-bit key",
                data.len()
            )));
        }
        let scheme = kind.signature_scheme();
        self.key = Key {
            alg: kind.algorithm(),
            key_size,
            data,
        };
        self.signature = Signature {
            scheme,
            key_size,
            hash_alg: kind.signature_hash(key_size),
            data: vec![0u8; Signature::data_len(scheme, key_size)?],
        };
        Ok(())
    }

    pub fn is_signed(&self) -> bool {
        self.signature.scheme != Algorithm::UNSET && self.signature.data.iter().any(|b| *b != 0)
    }
}

bitflags! {
    /// Usage classes a key manifest hash entry applies to.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct KeyUsage: u64 {
        const BPM_SIGNING = 1 << 0;
        const FIT_PATCH_MANIFEST_SIGNING = 1 << 1;
        const ACM_MANIFEST_SIGNING = 1 << 2;
        const SDEV_SIGNING = 1 << 3;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHash {
    pub usage: KeyUsage,
    pub digest: Digest,
}

/// Key Manifest body (`__KEYM__`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyManifestBody {
    pub revision: u8,
    pub km_svn: u8,
    pub km_id: u8,
    pub pub_key_hash_alg: Algorithm,
    pub hashes: Vec<KeyHash>,
}

impl Default for KeyManifestBody {
    fn default() -> Self {
        Self {
            revision: 0,
            km_svn: 0,
            km_id: 0,
            pub_key_hash_alg: Algorithm::SHA256,
            hashes: Vec::new(),
        }
    }
}

impl KeyManifestBody {
    /// Rejects two entries sharing a usage and an algorithm.
    pub fn check_unique(&self) -> BgResult<()> {
        for (i, entry) in self.hashes.iter().enumerate() {
            if self.hashes[..i]
                .iter()
                .any(|h| h.usage == entry.usage && h.digest.alg == entry.digest.alg)
            {
                return Err(BgError::DuplicateAlgorithm(entry.digest.alg.0));
            }
        }
        Ok(())
    }
}

/// One manifest element, tagged by its structure identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Ibb(IbbElement),
    Txt(TxtElement),
    Signature(SignatureElement),
    KeyManifestBody(KeyManifestBody),
}

impl Element {
    pub fn structure_id(&self) -> StructureId {
        match self {
            Element::Ibb(_) => layout::IBB_STRUCTURE_ID,
            Element::Txt(_) => layout::TXT_STRUCTURE_ID,
            Element::Signature(_) => layout::PMSE_STRUCTURE_ID,
            Element::KeyManifestBody(_) => layout::KM_STRUCTURE_ID,
        }
    }
}

/// Boot Policy Manifest.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootPolicyManifest {
    pub header: BpmHeader,
    pub ibb: Vec<IbbElement>,
    pub txt: Option<TxtElement>,
    pub pmse: SignatureElement,
}

impl BootPolicyManifest {
    /// Elements in their canonical byte order.
    pub fn elements(&self) -> Vec<Element> {
        let mut elements: Vec<Element> = self.ibb.iter().cloned().map(Element::Ibb).collect();
        elements.extend(self.txt.iter().cloned().map(Element::Txt));
        elements.push(Element::Signature(self.pmse.clone()));
        elements
    }
}

/// Key Manifest.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyManifest {
    pub body: KeyManifestBody,
    pub key_signature: SignatureElement,
}
