/*++

Licensed under the Apache-2.0 license.

File Name:

   digest.rs

Abstract:

    Recursive digest engine binding manifest digests to the bytes they
    commit to.

--*/

use bg_prov_fit::phys_to_offset;
use bg_prov_types::*;

use crate::{check_hash_algorithm, ManifestCrypto};

/// Memory that IBB segments describe.
pub trait IbbMemory {
    /// Bytes of the physical range `base..base + size`
    fn read(&self, base: u32, size: u32) -> BgResult<&[u8]>;
}

/// BIOS image mapped so that its last byte sits at `0xFFFF_FFFF`.
pub struct MappedImage<'a> {
    image: &'a [u8],
}

impl<'a> MappedImage<'a> {
    pub fn new(image: &'a [u8]) -> Self {
        Self { image }
    }
}

impl IbbMemory for MappedImage<'_> {
    fn read(&self, base: u32, size: u32) -> BgResult<&[u8]> {
        let offset = phys_to_offset(self.image.len(), base.into())?;
        self.image
            .get(offset..offset + size as usize)
            .ok_or(BgError::OffsetOutOfRange {
                offset: u64::from(base) + u64::from(size),
                len: self.image.len(),
            })
    }
}

/// One digest the engine computes, in the order it must be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestNode {
    /// Digest list of the IBB element at this index, over its hashed segments
    IbbSegments(usize),

    /// Key manifest hash entry at this index, over the BPM signing key
    BpmKeyHash(usize),
}

/// Computes manifest digests with a caller supplied algorithm set.
pub struct DigestEngine<'a, C: ManifestCrypto> {
    crypto: &'a C,
    algorithms: Vec<Algorithm>,
}

impl<'a, C: ManifestCrypto> DigestEngine<'a, C> {
    /// Create an engine producing one IBB digest per algorithm, in order.
    ///
    /// With no algorithms the engine keeps the algorithms each IBB digest
    /// list already names.
    pub fn new(crypto: &'a C, algorithms: &[Algorithm]) -> BgResult<Self> {
        DigestList::with_algorithms(algorithms)?;
        for alg in algorithms {
            check_hash_algorithm(*alg)?;
        }
        Ok(Self {
            crypto,
            algorithms: algorithms.to_vec(),
        })
    }

    /// Dependency order of every digest a rehash recomputes. Leaves that
    /// commit to external memory come first, then the key manifest entries
    /// that commit to the boot policy manifest.
    pub fn plan(bpm: &BootPolicyManifest, km: Option<&KeyManifest>) -> Vec<DigestNode> {
        let mut plan: Vec<DigestNode> = (0..bpm.ibb.len()).map(DigestNode::IbbSegments).collect();
        if let Some(km) = km {
            plan.extend(
                km.body
                    .hashes
                    .iter()
                    .enumerate()
                    .filter(|(_, h)| h.usage.contains(KeyUsage::BPM_SIGNING))
                    .map(|(i, _)| DigestNode::BpmKeyHash(i)),
            );
        }
        plan
    }

    /// Recompute every digest of the BPM and, when given, the key manifest
    /// entries committing to the BPM signing key.
    pub fn rehash(
        &self,
        bpm: &mut BootPolicyManifest,
        mut km: Option<&mut KeyManifest>,
        memory: &dyn IbbMemory,
    ) -> BgResult<()> {
        for node in Self::plan(bpm, km.as_deref()) {
            match node {
                DigestNode::IbbSegments(i) => {
                    bpm.ibb[i].digest_list = self.ibb_digests(&bpm.ibb[i], memory)?;
                }
                DigestNode::BpmKeyHash(i) => {
                    if let Some(km) = km.as_deref_mut() {
                        self.bpm_key_hash(&mut km.body.hashes[i], &bpm.pmse.key)?;
                    }
                }
            }
            log::debug!("rehashed {node:?}");
        }
        if let Some(km) = km {
            km.body.check_unique()?;
        }
        Ok(())
    }

    pub fn rehash_bpm(&self, bpm: &mut BootPolicyManifest, memory: &dyn IbbMemory) -> BgResult<()> {
        self.rehash(bpm, None, memory)
    }

    /// Recompute the key manifest entries committing to `bpm_key`.
    pub fn rehash_km(&self, km: &mut KeyManifest, bpm_key: &Key) -> BgResult<()> {
        km.body.check_unique()?;
        for entry in km
            .body
            .hashes
            .iter_mut()
            .filter(|h| h.usage.contains(KeyUsage::BPM_SIGNING))
        {
            self.bpm_key_hash(entry, bpm_key)?;
        }
        Ok(())
    }

    pub fn digest(&self, alg: Algorithm, data: &[u8]) -> BgResult<Digest> {
        check_hash_algorithm(alg)?;
        let bytes = self.crypto.digest(alg, data)?;
        if Some(bytes.len()) != alg.digest_size() {
            return Err(BgError::Crypto(anyhow::anyhow!(
                "{alg} digest of {} bytes",
                bytes.len()
            )));
        }
        Ok(Digest::new(alg, bytes))
    }

    fn ibb_digests(&self, ibb: &IbbElement, memory: &dyn IbbMemory) -> BgResult<DigestList> {
        let algorithms = if self.algorithms.is_empty() {
            ibb.digest_list.check_unique()?;
            ibb.digest_list.algorithms()
        } else {
            self.algorithms.clone()
        };

        let mut content = Vec::new();
        for segment in ibb.segments.iter().filter(|s| s.is_hashed()) {
            content.extend_from_slice(memory.read(segment.base, segment.size)?);
        }
        let digests = algorithms
            .iter()
            .map(|alg| self.digest(*alg, &content))
            .collect::<BgResult<Vec<_>>>()?;
        Ok(DigestList(digests))
    }

    fn bpm_key_hash(&self, entry: &mut KeyHash, bpm_key: &Key) -> BgResult<()> {
        if !bpm_key.is_populated() {
            return Err(BgError::invalid(
                "BPM signing key must be bound before hashing it into the key manifest",
            ));
        }
        entry.digest = self.digest(entry.digest.alg, &bpm_key.data)?;
        Ok(())
    }
}
