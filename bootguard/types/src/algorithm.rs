/*++

Licensed under the Apache-2.0 license.

File Name:

   algorithm.rs

Abstract:

    TPM 2.0 algorithm identifiers used by Boot Guard manifests.

--*/

use core::fmt;
use core::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// TPM algorithm identifier as stored in manifests.
///
/// Unknown identifiers are preserved so that decoding and re-encoding a
/// manifest never rewrites a field the tool does not understand.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Algorithm(pub u16);

impl Algorithm {
    /// Unpopulated field
    pub const UNSET: Algorithm = Algorithm(0x0000);
    pub const RSA: Algorithm = Algorithm(0x0001);
    pub const SHA1: Algorithm = Algorithm(0x0004);
    pub const SHA256: Algorithm = Algorithm(0x000B);
    pub const SHA384: Algorithm = Algorithm(0x000C);
    pub const SHA512: Algorithm = Algorithm(0x000D);
    pub const NULL: Algorithm = Algorithm(0x0010);
    pub const SM3: Algorithm = Algorithm(0x0012);
    pub const RSASSA: Algorithm = Algorithm(0x0014);
    pub const RSAPSS: Algorithm = Algorithm(0x0016);
    pub const ECDSA: Algorithm = Algorithm(0x0018);
    pub const SM2: Algorithm = Algorithm(0x001B);
    pub const ECC: Algorithm = Algorithm(0x0023);

    const NAMES: [(Algorithm, &'static str); 13] = [
        (Algorithm::UNSET, "UNSET"),
        (Algorithm::RSA, "RSA"),
        (Algorithm::SHA1, "SHA1"),
        (Algorithm::SHA256, "SHA256"),
        (Algorithm::SHA384, "SHA384"),
        (Algorithm::SHA512, "SHA512"),
        (Algorithm::NULL, "NULL"),
        (Algorithm::SM3, "SM3"),
        (Algorithm::RSASSA, "RSASSA"),
        (Algorithm::RSAPSS, "RSAPSS"),
        (Algorithm::ECDSA, "ECDSA"),
        (Algorithm::SM2, "SM2"),
        (Algorithm::ECC, "ECC"),
    ];

    /// Digest size in bytes for hash algorithms.
    pub fn digest_size(self) -> Option<usize> {
        match self {
            Algorithm::SHA1 => Some(20),
            Algorithm::SHA256 | Algorithm::SM3 => Some(32),
            Algorithm::SHA384 => Some(48),
            Algorithm::SHA512 => Some(64),
            _ => None,
        }
    }

    pub fn is_hash(self) -> bool {
        self.digest_size().is_some()
    }

    pub fn name(self) -> Option<&'static str> {
        Self::NAMES
            .iter()
            .find(|(alg, _)| *alg == self)
            .map(|(_, name)| *name)
    }
}

impl From<u16> for Algorithm {
    fn from(value: u16) -> Self {
        Algorithm(value)
    }
}

impl From<Algorithm> for u16 {
    fn from(value: Algorithm) -> Self {
        value.0
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{:#06x}", self.0),
        }
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let upper = upper.strip_prefix("TPM_ALG_").unwrap_or(&upper);
        let normalized = upper.replace(['-', '_'], "");
        if let Some((alg, _)) = Self::NAMES.iter().find(|(_, name)| *name == normalized) {
            return Ok(*alg);
        }
        let parsed = match upper.strip_prefix("0X") {
            Some(hex) => u16::from_str_radix(hex, 16),
            None => upper.parse::<u16>(),
        };
        parsed
            .map(Algorithm)
            .map_err(|_| format!("unknown algorithm {s:?}"))
    }
}

impl Serialize for Algorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.name() {
            Some(name) => serializer.serialize_str(name),
            None => serializer.serialize_u16(self.0),
        }
    }
}

struct AlgorithmVisitor;

impl<'de> Visitor<'de> for AlgorithmVisitor {
    type Value = Algorithm;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an algorithm name or a 16-bit identifier")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Algorithm, E> {
        u16::try_from(v)
            .map(Algorithm)
            .map_err(|_| E::custom(format!("algorithm identifier {v} out of range")))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Algorithm, E> {
        u16::try_from(v)
            .map(Algorithm)
            .map_err(|_| E::custom(format!("algorithm identifier {v} out of range")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Algorithm, E> {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for Algorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(AlgorithmVisitor)
    }
}
