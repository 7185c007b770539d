/*++

Licensed under the Apache-2.0 license.

File Name:

   config.rs

Abstract:

    TOML configuration of Key Manifests and Boot Policy Manifests, and the
    field overrides applied on top of it.

--*/

use std::path::Path;

use anyhow::Context;
use bg_prov_serde::{disassemble_bpm, disassemble_km, validate_bpm, DisassembleOptions};
use bg_prov_types::*;
use serde_derive::{Deserialize, Serialize};

/// Algorithm and hex encoded digest. An empty digest is a placeholder the
/// digest engine fills in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    pub alg: Algorithm,

    pub digest: String,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self::placeholder(Algorithm::NULL)
    }
}

impl DigestConfig {
    fn placeholder(alg: Algorithm) -> Self {
        Self {
            alg,
            digest: String::new(),
        }
    }

    fn from_digest(digest: &Digest) -> Self {
        Self {
            alg: digest.alg,
            digest: hex::encode(&digest.bytes),
        }
    }

    fn to_digest(&self) -> BgResult<Digest> {
        let bytes = hex::decode(&self.digest)
            .map_err(|e| BgError::Config(format!("{} digest {:?}: {e}", self.alg, self.digest)))?;
        if !bytes.is_empty() && alg_size_mismatch(self.alg, bytes.len()) {
            return Err(BgError::Config(format!(
                "{} digest of {} bytes",
                self.alg,
                bytes.len()
            )));
        }
        Ok(Digest::new(self.alg, bytes))
    }
}

fn alg_size_mismatch(alg: Algorithm, len: usize) -> bool {
    alg.digest_size().is_some_and(|size| size != len)
}

fn digest_list(configs: &[DigestConfig]) -> BgResult<DigestList> {
    let list = DigestList(
        configs
            .iter()
            .map(DigestConfig::to_digest)
            .collect::<BgResult<_>>()?,
    );
    list.check_unique()?;
    Ok(list)
}

fn digest_configs(list: &DigestList) -> Vec<DigestConfig> {
    list.0.iter().map(DigestConfig::from_digest).collect()
}

/// 64-bit register values as `0x` prefixed hex strings. TOML integers are
/// signed 64-bit and cannot hold the upper half of the range. Integers are
/// still accepted on input.
mod hex_u64 {
    use core::fmt;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(value.to_be_bytes())))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        deserializer.deserialize_any(HexU64Visitor)
    }

    struct HexU64Visitor;

    impl<'de> Visitor<'de> for HexU64Visitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a 0x prefixed hex string or an integer")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::custom(format!("negative value {v}")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            let digits = v
                .strip_prefix("0x")
                .or_else(|| v.strip_prefix("0X"))
                .filter(|d| !d.is_empty() && d.len() <= 16)
                .ok_or_else(|| E::custom(format!("{v:?} is not a 64-bit hex value")))?;
            let mut bytes = [0u8; 8];
            hex::decode_to_slice(format!("{digits:0>16}"), &mut bytes)
                .map_err(|e| E::custom(format!("{v:?}: {e}")))?;
            Ok(u64::from_be_bytes(bytes))
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    pub base: u32,

    pub size: u32,

    pub flags: u16,
}

/// Initial Boot Block configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IbbConfig {
    pub set_number: u8,

    pub pbet_value: u8,

    pub flags: u32,

    #[serde(with = "hex_u64")]
    pub mchbar: u64,

    #[serde(with = "hex_u64")]
    pub vtd_bar: u64,

    pub dma_prot_base0: u32,

    pub dma_prot_limit0: u32,

    #[serde(with = "hex_u64")]
    pub dma_prot_base1: u64,

    #[serde(with = "hex_u64")]
    pub dma_prot_limit1: u64,

    pub entry_point: u32,

    pub post_ibb_hash: DigestConfig,

    pub obb_hash: DigestConfig,

    pub digests: Vec<DigestConfig>,

    pub segments: Vec<SegmentConfig>,
}

impl Default for IbbConfig {
    fn default() -> Self {
        Self {
            set_number: 0,
            pbet_value: 0,
            flags: 0,
            mchbar: 0,
            vtd_bar: 0,
            dma_prot_base0: 0,
            dma_prot_limit0: 0,
            dma_prot_base1: 0,
            dma_prot_limit1: 0,
            entry_point: 0,
            post_ibb_hash: DigestConfig::default(),
            obb_hash: DigestConfig::default(),
            digests: vec![DigestConfig::placeholder(Algorithm::SHA256)],
            segments: vec![SegmentConfig::default()],
        }
    }
}

impl IbbConfig {
    fn build(&self) -> BgResult<IbbElement> {
        Ok(IbbElement {
            set_number: self.set_number,
            pbet_value: self.pbet_value,
            flags: self.flags,
            ibb_mchbar: self.mchbar,
            vtd_bar: self.vtd_bar,
            dma_prot_base0: self.dma_prot_base0,
            dma_prot_limit0: self.dma_prot_limit0,
            dma_prot_base1: self.dma_prot_base1,
            dma_prot_limit1: self.dma_prot_limit1,
            post_ibb_hash: self.post_ibb_hash.to_digest()?,
            entry_point: self.entry_point,
            digest_list: digest_list(&self.digests)?,
            obb_hash: self.obb_hash.to_digest()?,
            segments: self
                .segments
                .iter()
                .map(|s| IbbSegment {
                    flags: s.flags,
                    base: s.base,
                    size: s.size,
                })
                .collect(),
        })
    }

    fn from_element(ibb: &IbbElement) -> Self {
        Self {
            set_number: ibb.set_number,
            pbet_value: ibb.pbet_value,
            flags: ibb.flags,
            mchbar: ibb.ibb_mchbar,
            vtd_bar: ibb.vtd_bar,
            dma_prot_base0: ibb.dma_prot_base0,
            dma_prot_limit0: ibb.dma_prot_limit0,
            dma_prot_base1: ibb.dma_prot_base1,
            dma_prot_limit1: ibb.dma_prot_limit1,
            entry_point: ibb.entry_point,
            post_ibb_hash: DigestConfig::from_digest(&ibb.post_ibb_hash),
            obb_hash: DigestConfig::from_digest(&ibb.obb_hash),
            digests: digest_configs(&ibb.digest_list),
            segments: ibb
                .segments
                .iter()
                .map(|s| SegmentConfig {
                    base: s.base,
                    size: s.size,
                    flags: s.flags,
                })
                .collect(),
        }
    }
}

/// TXT element configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxtConfig {
    pub set_number: u8,

    pub sinit_min_svn_auth: u8,

    pub control_flags: u32,

    /// In 5 second units
    pub pwr_down_interval: u16,

    pub ptt_cmos_offset0: u8,

    pub ptt_cmos_offset1: u8,

    pub acpi_base_offset: u16,

    pub pwrm_base_offset: u32,

    pub digests: Vec<DigestConfig>,
}

impl Default for TxtConfig {
    fn default() -> Self {
        Self::from_element(&TxtElement::default())
    }
}

impl TxtConfig {
    fn build(&self) -> BgResult<TxtElement> {
        Ok(TxtElement {
            set_number: self.set_number,
            sinit_min_svn_auth: self.sinit_min_svn_auth,
            control_flags: self.control_flags,
            pwr_down_interval: self.pwr_down_interval,
            ptt_cmos_offset0: self.ptt_cmos_offset0,
            ptt_cmos_offset1: self.ptt_cmos_offset1,
            acpi_base_offset: self.acpi_base_offset,
            pwrm_base_offset: self.pwrm_base_offset,
            digest_list: digest_list(&self.digests)?,
        })
    }

    fn from_element(txt: &TxtElement) -> Self {
        Self {
            set_number: txt.set_number,
            sinit_min_svn_auth: txt.sinit_min_svn_auth,
            control_flags: txt.control_flags,
            pwr_down_interval: txt.pwr_down_interval,
            ptt_cmos_offset0: txt.ptt_cmos_offset0,
            ptt_cmos_offset1: txt.ptt_cmos_offset1,
            acpi_base_offset: txt.acpi_base_offset,
            pwrm_base_offset: txt.pwrm_base_offset,
            digests: digest_configs(&txt.digest_list),
        }
    }
}

/// Boot Policy Manifest configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootPolicyConfig {
    pub revision: u8,

    pub svn: u8,

    pub acm_svn_auth: u8,

    /// Data region needed by the IBB, in 4K pages
    pub nem_data_stack: u16,

    pub ibb: Vec<IbbConfig>,

    pub txt: Option<TxtConfig>,
}

impl Default for BootPolicyConfig {
    fn default() -> Self {
        Self {
            revision: 0,
            svn: 0,
            acm_svn_auth: 0,
            nem_data_stack: 1,
            ibb: vec![IbbConfig::default()],
            txt: Some(TxtConfig::default()),
        }
    }
}

impl BootPolicyConfig {
    fn from_manifest(bpm: &BootPolicyManifest) -> Self {
        Self {
            revision: bpm.header.revision,
            svn: bpm.header.svn,
            acm_svn_auth: bpm.header.acm_svn_auth,
            nem_data_stack: bpm.header.nem_data_stack,
            ibb: bpm.ibb.iter().map(IbbConfig::from_element).collect(),
            txt: bpm.txt.as_ref().map(TxtConfig::from_element),
        }
    }

    /// Startup IBB, created when the configuration has none.
    fn startup_ibb(&mut self) -> &mut IbbConfig {
        let index = match self.ibb.iter().position(|ibb| ibb.set_number == 0) {
            Some(index) => index,
            None => {
                self.ibb.push(IbbConfig::default());
                self.ibb.len() - 1
            }
        };
        &mut self.ibb[index]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyHashConfig {
    pub usage: KeyUsage,

    pub alg: Algorithm,

    pub digest: String,
}

impl Default for KeyHashConfig {
    fn default() -> Self {
        Self {
            usage: KeyUsage::BPM_SIGNING,
            alg: Algorithm::SHA256,
            digest: String::new(),
        }
    }
}

/// Key Manifest configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyManifestConfig {
    pub revision: u8,

    pub svn: u8,

    pub id: u8,

    /// Algorithm of the OEM public key digest
    pub pub_key_hash_alg: Algorithm,

    /// Adds a BPM signing key entry with this algorithm, filled in when
    /// the manifests are rehashed
    pub bpm_key_hash_alg: Option<Algorithm>,

    pub hashes: Vec<KeyHashConfig>,
}

impl Default for KeyManifestConfig {
    fn default() -> Self {
        Self {
            revision: 0,
            svn: 0,
            id: 0,
            pub_key_hash_alg: Algorithm::SHA256,
            bpm_key_hash_alg: Some(Algorithm::SHA256),
            hashes: Vec::new(),
        }
    }
}

impl KeyManifestConfig {
    fn from_manifest(km: &KeyManifest) -> Self {
        Self {
            revision: km.body.revision,
            svn: km.body.km_svn,
            id: km.body.km_id,
            pub_key_hash_alg: km.body.pub_key_hash_alg,
            bpm_key_hash_alg: None,
            hashes: km
                .body
                .hashes
                .iter()
                .map(|h| KeyHashConfig {
                    usage: h.usage,
                    alg: h.digest.alg,
                    digest: hex::encode(&h.digest.bytes),
                })
                .collect(),
        }
    }
}

/// Full provisioning configuration
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootGuardOptions {
    pub key_manifest: KeyManifestConfig,

    pub boot_policy_manifest: BootPolicyConfig,
}

impl BootGuardOptions {
    /// Default configuration, a starting point for a platform config file.
    pub fn template() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read the config file {}", path.display()))?;

        let config = Self::from_toml(&config_str)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(config)
    }

    pub fn from_toml(s: &str) -> BgResult<Self> {
        toml::from_str(s).map_err(|e| BgError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> BgResult<String> {
        toml::to_string(self).map_err(|e| BgError::Config(e.to_string()))
    }

    /// Reconstruct the configuration of decoded manifests. A missing
    /// manifest keeps its default configuration.
    pub fn from_manifests(km: Option<&KeyManifest>, bpm: Option<&BootPolicyManifest>) -> Self {
        Self {
            key_manifest: km.map(KeyManifestConfig::from_manifest).unwrap_or_default(),
            boot_policy_manifest: bpm.map(BootPolicyConfig::from_manifest).unwrap_or_default(),
        }
    }

    /// Configuration of the KM and BPM a BIOS image's FIT points at.
    pub fn from_bios_image(image: &[u8]) -> BgResult<Self> {
        let payloads = bg_prov_fit::extract(image)?;
        if payloads.km.is_none() && payloads.bpm.is_none() {
            return Err(BgError::invalid("image has neither a key manifest nor a boot policy manifest"));
        }
        let km = payloads.km.map(disassemble_km).transpose()?;
        let bpm = payloads
            .bpm
            .map(|bytes| disassemble_bpm(bytes, DisassembleOptions::default()))
            .transpose()?;
        Ok(Self::from_manifests(km.as_ref(), bpm.as_ref()))
    }

    /// Build the unsigned Boot Policy Manifest.
    pub fn build_bpm(&self) -> BgResult<BootPolicyManifest> {
        let config = &self.boot_policy_manifest;
        let bpm = BootPolicyManifest {
            header: BpmHeader {
                revision: config.revision,
                svn: config.svn,
                acm_svn_auth: config.acm_svn_auth,
                nem_data_stack: config.nem_data_stack,
            },
            ibb: config
                .ibb
                .iter()
                .map(IbbConfig::build)
                .collect::<BgResult<_>>()?,
            txt: config.txt.as_ref().map(TxtConfig::build).transpose()?,
            pmse: SignatureElement::default(),
        };
        validate_bpm(&bpm)?;
        Ok(bpm)
    }

    /// Build the unsigned Key Manifest.
    pub fn build_km(&self) -> BgResult<KeyManifest> {
        let config = &self.key_manifest;
        let mut hashes = config
            .hashes
            .iter()
            .map(|h| {
                let digest = DigestConfig {
                    alg: h.alg,
                    digest: h.digest.clone(),
                }
                .to_digest()?;
                Ok(KeyHash {
                    usage: h.usage,
                    digest,
                })
            })
            .collect::<BgResult<Vec<_>>>()?;
        if let Some(alg) = config.bpm_key_hash_alg {
            let present = hashes
                .iter()
                .any(|h| h.usage.contains(KeyUsage::BPM_SIGNING) && h.digest.alg == alg);
            if !present {
                hashes.push(KeyHash {
                    usage: KeyUsage::BPM_SIGNING,
                    digest: Digest::empty(alg),
                });
            }
        }
        let body = KeyManifestBody {
            revision: config.revision,
            km_svn: config.svn,
            km_id: config.id,
            pub_key_hash_alg: config.pub_key_hash_alg,
            hashes,
        };
        body.check_unique()?;
        Ok(KeyManifest {
            body,
            key_signature: SignatureElement::default(),
        })
    }
}

/// Boot Policy Manifest fields set from the command line. Only `Some`
/// fields are applied.
#[derive(Debug, Default, Clone)]
pub struct BpmOverrides {
    pub revision: Option<u8>,
    pub svn: Option<u8>,
    pub acm_svn_auth: Option<u8>,
    pub nem_data_stack: Option<u16>,

    pub pbet_value: Option<u8>,
    pub ibb_flags: Option<u32>,
    pub mchbar: Option<u64>,
    pub vtd_bar: Option<u64>,
    pub dma_prot_base0: Option<u32>,
    pub dma_prot_limit0: Option<u32>,
    pub dma_prot_base1: Option<u64>,
    pub dma_prot_limit1: Option<u64>,
    pub entry_point: Option<u32>,
    pub ibb_hash: Option<Vec<Algorithm>>,
    pub segment_base: Option<u32>,
    pub segment_size: Option<u32>,
    pub segment_flags: Option<u16>,

    pub sinit_min_svn_auth: Option<u8>,
    pub txt_flags: Option<u32>,
    pub pwr_down_interval: Option<u16>,
    pub acpi_base_offset: Option<u16>,
    pub pwrm_base_offset: Option<u32>,
    pub ptt_cmos_offset0: Option<u8>,
    pub ptt_cmos_offset1: Option<u8>,
}

fn set<T: Clone>(field: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *field = value.clone();
    }
}

impl BpmOverrides {
    fn touches_ibb(&self) -> bool {
        self.pbet_value.is_some()
            || self.ibb_flags.is_some()
            || self.mchbar.is_some()
            || self.vtd_bar.is_some()
            || self.dma_prot_base0.is_some()
            || self.dma_prot_limit0.is_some()
            || self.dma_prot_base1.is_some()
            || self.dma_prot_limit1.is_some()
            || self.entry_point.is_some()
            || self.ibb_hash.is_some()
            || self.touches_segment()
    }

    fn touches_segment(&self) -> bool {
        self.segment_base.is_some() || self.segment_size.is_some() || self.segment_flags.is_some()
    }

    fn touches_txt(&self) -> bool {
        self.sinit_min_svn_auth.is_some()
            || self.txt_flags.is_some()
            || self.pwr_down_interval.is_some()
            || self.acpi_base_offset.is_some()
            || self.pwrm_base_offset.is_some()
            || self.ptt_cmos_offset0.is_some()
            || self.ptt_cmos_offset1.is_some()
    }

    /// Apply the overrides. IBB fields go to the startup IBB and segment
    /// fields to its first segment; either is created only when an override
    /// touches it.
    pub fn apply(&self, config: &mut BootPolicyConfig) -> BgResult<()> {
        if let Some(algorithms) = &self.ibb_hash {
            DigestList::with_algorithms(algorithms)?;
        }
        set(&mut config.revision, &self.revision);
        set(&mut config.svn, &self.svn);
        set(&mut config.acm_svn_auth, &self.acm_svn_auth);
        set(&mut config.nem_data_stack, &self.nem_data_stack);

        if self.touches_ibb() {
            let ibb = config.startup_ibb();
            set(&mut ibb.pbet_value, &self.pbet_value);
            set(&mut ibb.flags, &self.ibb_flags);
            set(&mut ibb.mchbar, &self.mchbar);
            set(&mut ibb.vtd_bar, &self.vtd_bar);
            set(&mut ibb.dma_prot_base0, &self.dma_prot_base0);
            set(&mut ibb.dma_prot_limit0, &self.dma_prot_limit0);
            set(&mut ibb.dma_prot_base1, &self.dma_prot_base1);
            set(&mut ibb.dma_prot_limit1, &self.dma_prot_limit1);
            set(&mut ibb.entry_point, &self.entry_point);
            if let Some(algorithms) = &self.ibb_hash {
                ibb.digests = algorithms
                    .iter()
                    .map(|alg| DigestConfig::placeholder(*alg))
                    .collect();
            }
            if self.touches_segment() {
                if ibb.segments.is_empty() {
                    ibb.segments.push(SegmentConfig::default());
                }
                let segment = &mut ibb.segments[0];
                set(&mut segment.base, &self.segment_base);
                set(&mut segment.size, &self.segment_size);
                set(&mut segment.flags, &self.segment_flags);
            }
        }

        if self.touches_txt() {
            let txt = config.txt.get_or_insert_with(TxtConfig::default);
            set(&mut txt.sinit_min_svn_auth, &self.sinit_min_svn_auth);
            set(&mut txt.control_flags, &self.txt_flags);
            set(&mut txt.pwr_down_interval, &self.pwr_down_interval);
            set(&mut txt.acpi_base_offset, &self.acpi_base_offset);
            set(&mut txt.pwrm_base_offset, &self.pwrm_base_offset);
            set(&mut txt.ptt_cmos_offset0, &self.ptt_cmos_offset0);
            set(&mut txt.ptt_cmos_offset1, &self.ptt_cmos_offset1);
        }
        Ok(())
    }
}

/// Key Manifest fields set from the command line.
#[derive(Debug, Default, Clone)]
pub struct KmOverrides {
    pub revision: Option<u8>,
    pub svn: Option<u8>,
    pub id: Option<u8>,
    pub pub_key_hash_alg: Option<Algorithm>,
    pub hashes: Option<Vec<KeyHashConfig>>,
    pub bpm_key_hash_alg: Option<Algorithm>,
}

impl KmOverrides {
    pub fn apply(&self, config: &mut KeyManifestConfig) {
        set(&mut config.revision, &self.revision);
        set(&mut config.svn, &self.svn);
        set(&mut config.id, &self.id);
        set(&mut config.pub_key_hash_alg, &self.pub_key_hash_alg);
        set(&mut config.hashes, &self.hashes);
        if self.bpm_key_hash_alg.is_some() {
            config.bpm_key_hash_alg = self.bpm_key_hash_alg;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bg_prov_serde::{assemble_bpm, assemble_km};

    #[test]
    fn test_template_builds() {
        let options = BootGuardOptions::template();
        let bpm = options.build_bpm().unwrap();
        assert_eq!(bpm.ibb.len(), 1);
        assert_eq!(bpm.ibb[0].digest_list.algorithms(), vec![Algorithm::SHA256]);
        assert_eq!(bpm.txt, Some(TxtElement::default()));
        assert!(assemble_bpm(&bpm).is_ok());

        let km = options.build_km().unwrap();
        assert_eq!(km.body.hashes.len(), 1);
        assert_eq!(km.body.hashes[0].usage, KeyUsage::BPM_SIGNING);
        assert!(assemble_km(&km).is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut options = BootGuardOptions::template();
        options.key_manifest.hashes.push(KeyHashConfig {
            usage: KeyUsage::ACM_MANIFEST_SIGNING | KeyUsage::SDEV_SIGNING,
            alg: Algorithm::SHA384,
            digest: hex::encode([0xAB; 48]),
        });
        options.boot_policy_manifest.ibb[0].segments[0] = SegmentConfig {
            base: 0xFFFF_0000,
            size: 0x1_0000,
            flags: 0,
        };
        let text = options.to_toml().unwrap();
        assert!(text.contains("SHA384"));
        assert_eq!(BootGuardOptions::from_toml(&text).unwrap(), options);
    }

    #[test]
    fn test_full_width_values_round_trip() {
        let mut options = BootGuardOptions::template();
        let ibb = &mut options.boot_policy_manifest.ibb[0];
        ibb.mchbar = u64::MAX;
        ibb.vtd_bar = 0xFED9_0000;
        ibb.dma_prot_limit1 = 0xFFFF_FFFF_FFFF_F000;
        options.key_manifest.hashes.push(KeyHashConfig {
            usage: KeyUsage::from_bits_retain(u64::MAX),
            ..Default::default()
        });

        let text = options.to_toml().unwrap();
        assert!(text.contains(r#"mchbar = "0xffffffffffffffff""#));
        assert!(text.contains(r#"dma_prot_limit1 = "0xfffffffffffff000""#));
        assert_eq!(BootGuardOptions::from_toml(&text).unwrap(), options);

        // Configuration read back from a manifest exports as well.
        let bpm = options.build_bpm().unwrap();
        let exported = BootGuardOptions::from_manifests(None, Some(&bpm))
            .to_toml()
            .unwrap();
        let imported = BootGuardOptions::from_toml(&exported).unwrap();
        assert_eq!(imported.build_bpm().unwrap(), bpm);
    }

    #[test]
    fn test_hex_value_forms() {
        let text = r#"
            [[boot_policy_manifest.ibb]]
            mchbar = 0xFED10000
            vtd_bar = "0xfed91000"
            dma_prot_base1 = "0X1"
            segments = [{ base = 0xFFF00000, size = 0x100000 }]
        "#;
        let ibb = &BootGuardOptions::from_toml(text).unwrap().boot_policy_manifest.ibb[0];
        assert_eq!(ibb.mchbar, 0xFED1_0000);
        assert_eq!(ibb.vtd_bar, 0xFED9_1000);
        assert_eq!(ibb.dma_prot_base1, 1);

        for bad in [r#""fed10000""#, r#""0x""#, r#""0x1ffffffffffffffff""#, "-1"] {
            let text = format!("[[boot_policy_manifest.ibb]]\nmchbar = {bad}\n");
            assert!(matches!(
                BootGuardOptions::from_toml(&text),
                Err(BgError::Config(_))
            ));
        }
    }

    #[test]
    fn test_partial_config() {
        let text = r#"
            [key_manifest]
            id = 15
            pub_key_hash_alg = "TPM_ALG_SHA384"

            [boot_policy_manifest]
            svn = 2
            nem_data_stack = 8

            [[boot_policy_manifest.ibb]]
            entry_point = 0xFFFFFFF0
            digests = [{ alg = "SHA256" }, { alg = "0x000c" }]
            segments = [{ base = 0xFFF00000, size = 0x100000 }]
        "#;
        let options = BootGuardOptions::from_toml(text).unwrap();
        assert_eq!(options.key_manifest.id, 15);
        assert_eq!(options.key_manifest.pub_key_hash_alg, Algorithm::SHA384);
        assert_eq!(options.boot_policy_manifest.txt, Some(TxtConfig::default()));

        let bpm = options.build_bpm().unwrap();
        assert_eq!(bpm.header.svn, 2);
        assert_eq!(bpm.ibb[0].entry_point, 0xFFFF_FFF0);
        assert_eq!(
            bpm.ibb[0].digest_list.algorithms(),
            vec![Algorithm::SHA256, Algorithm::SHA384]
        );
        assert_eq!(bpm.ibb[0].segments[0].size, 0x10_0000);
    }

    #[test]
    fn test_config_errors() {
        let mut options = BootGuardOptions::template();
        options.boot_policy_manifest.ibb[0].digests[0].digest = "zz".into();
        assert!(matches!(options.build_bpm(), Err(BgError::Config(_))));

        options.boot_policy_manifest.ibb[0].digests[0].digest = "abcd".into();
        assert!(matches!(options.build_bpm(), Err(BgError::Config(_))));

        let mut options = BootGuardOptions::template();
        options.boot_policy_manifest.ibb[0].digests.push(DigestConfig::placeholder(Algorithm::SHA256));
        assert!(matches!(
            options.build_bpm(),
            Err(BgError::DuplicateAlgorithm(0x0B))
        ));

        let mut options = BootGuardOptions::template();
        options.boot_policy_manifest.nem_data_stack = 0;
        assert!(matches!(options.build_bpm(), Err(BgError::InvalidManifest(_))));

        assert!(matches!(
            BootGuardOptions::from_toml("key_manifest = 3"),
            Err(BgError::Config(_))
        ));
    }

    #[test]
    fn test_overrides_apply_only_set_fields() {
        let mut config = BootPolicyConfig::default();
        let before = config.clone();
        BpmOverrides::default().apply(&mut config).unwrap();
        assert_eq!(config, before);

        let overrides = BpmOverrides {
            svn: Some(5),
            entry_point: Some(0xFFFF_FFF0),
            ibb_hash: Some(vec![Algorithm::SHA1, Algorithm::SHA512]),
            segment_base: Some(0x1000),
            segment_size: Some(0x2000),
            pwr_down_interval: Some(3),
            ..Default::default()
        };
        overrides.apply(&mut config).unwrap();
        assert_eq!(config.svn, 5);
        assert_eq!(config.revision, before.revision);
        assert_eq!(config.ibb[0].entry_point, 0xFFFF_FFF0);
        assert_eq!(config.ibb[0].digests.len(), 2);
        assert_eq!(
            config.ibb[0].segments[0],
            SegmentConfig {
                base: 0x1000,
                size: 0x2000,
                flags: 0
            }
        );
        let txt = config.txt.as_ref().unwrap();
        assert_eq!(txt.pwr_down_interval, 3);
        assert_eq!(txt.acpi_base_offset, DEFAULT_ACPI_BASE_OFFSET);

        let mut empty = BootPolicyConfig {
            ibb: vec![],
            ..Default::default()
        };
        BpmOverrides {
            svn: Some(1),
            nem_data_stack: Some(2),
            ..Default::default()
        }
        .apply(&mut empty)
        .unwrap();
        assert_eq!(empty.svn, 1);
        assert!(empty.ibb.is_empty());
        let options = BootGuardOptions {
            boot_policy_manifest: empty.clone(),
            ..Default::default()
        };
        assert!(matches!(
            options.build_bpm(),
            Err(BgError::InvalidManifest(_))
        ));

        BpmOverrides {
            segment_flags: Some(0),
            ..Default::default()
        }
        .apply(&mut empty)
        .unwrap();
        assert_eq!(empty.ibb.len(), 1);

        let duplicate = BpmOverrides {
            ibb_hash: Some(vec![Algorithm::SHA256, Algorithm::SHA256]),
            ..Default::default()
        };
        assert!(matches!(
            duplicate.apply(&mut config),
            Err(BgError::DuplicateAlgorithm(_))
        ));
    }

    #[test]
    fn test_overrides_create_missing_parts() {
        let mut config = BootPolicyConfig {
            ibb: vec![],
            txt: None,
            ..Default::default()
        };
        BpmOverrides {
            ptt_cmos_offset0: Some(100),
            ..Default::default()
        }
        .apply(&mut config)
        .unwrap();
        assert_eq!(config.ibb.len(), 1);
        assert_eq!(config.txt.as_ref().unwrap().ptt_cmos_offset0, 100);
    }

    #[test]
    fn test_km_overrides() {
        let mut config = KeyManifestConfig::default();
        KmOverrides {
            id: Some(3),
            bpm_key_hash_alg: Some(Algorithm::SHA384),
            ..Default::default()
        }
        .apply(&mut config);
        assert_eq!(config.id, 3);
        assert_eq!(config.revision, 0);
        assert_eq!(config.bpm_key_hash_alg, Some(Algorithm::SHA384));
    }

    #[test]
    fn test_from_manifests_round_trip() {
        let mut options = BootGuardOptions::template();
        options.key_manifest.bpm_key_hash_alg = None;
        options.key_manifest.hashes.push(KeyHashConfig::default());
        options.boot_policy_manifest.ibb[0].digests[0].digest = hex::encode([0x11; 32]);

        let km = options.build_km().unwrap();
        let bpm = options.build_bpm().unwrap();
        assert_eq!(
            BootGuardOptions::from_manifests(Some(&km), Some(&bpm)),
            options
        );

        let defaults = BootGuardOptions::from_manifests(None, None);
        assert_eq!(defaults, BootGuardOptions::default());
    }
}
