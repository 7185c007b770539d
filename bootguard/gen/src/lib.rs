/*++

Licensed under the Apache-2.0 license.

File Name:

   lib.rs

Abstract:

    Boot Guard manifest generator: digest engine, signer and configuration.

--*/

mod config;
mod digest;
mod signer;

pub use config::{
    BootGuardOptions, BootPolicyConfig, BpmOverrides, DigestConfig, IbbConfig, KeyHashConfig,
    KeyManifestConfig, KmOverrides, SegmentConfig, TxtConfig,
};
pub use digest::{DigestEngine, DigestNode, IbbMemory, MappedImage};
pub use signer::{km_pubkey_hash, ManifestSigner};

use bg_prov_types::*;

/// Public half of a signing key, in manifest byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub kind: KeyKind,

    /// Key size in bits
    pub key_size: u16,

    /// Key material as stored in a key descriptor
    pub data: Vec<u8>,
}

impl PublicKey {
    pub fn to_key(&self) -> Key {
        Key {
            alg: self.kind.algorithm(),
            key_size: self.key_size,
            data: self.data.clone(),
        }
    }
}

/// Cryptographic primitives needed to rehash and sign manifests.
pub trait ManifestCrypto {
    /// Already decrypted private signing key
    type PrivateKey;

    /// Calculate a digest with a hash algorithm
    fn digest(&self, alg: Algorithm, data: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Derive the public key descriptor of a private key
    fn public_key(&self, key: &Self::PrivateKey) -> anyhow::Result<PublicKey>;

    /// Sign `data` with `hash_alg`, returning the signature in manifest
    /// byte order
    fn sign(&self, key: &Self::PrivateKey, hash_alg: Algorithm, data: &[u8])
        -> anyhow::Result<Vec<u8>>;

    /// Verify a manifest signature against a manifest key descriptor
    fn verify(&self, key: &Key, signature: &Signature, data: &[u8]) -> anyhow::Result<bool>;
}

/// Hash algorithms the digest engine can compute.
pub fn check_hash_algorithm(alg: Algorithm) -> BgResult<()> {
    match alg {
        Algorithm::SHA1 | Algorithm::SHA256 | Algorithm::SHA384 | Algorithm::SHA512 => Ok(()),
        other => Err(BgError::UnsupportedAlgorithm(other.0)),
    }
}
