/*++

Licensed under the Apache-2.0 license.

File Name:

   signer.rs

Abstract:

    Signing and verification of the signed prefix of KM and BPM manifests.

--*/

use bg_prov_serde::*;
use bg_prov_types::*;

use crate::{check_hash_algorithm, ManifestCrypto, PublicKey};

/// Signs manifest prefixes with a private key.
///
/// The signer never mutates a manifest. It returns signature elements the
/// caller embeds before reassembling.
pub struct ManifestSigner<'a, C: ManifestCrypto> {
    crypto: &'a C,
}

impl<'a, C: ManifestCrypto> ManifestSigner<'a, C> {
    pub fn new(crypto: &'a C) -> Self {
        Self { crypto }
    }

    /// Bind the public half of `key` into `element`.
    ///
    /// An element that already carries a key must carry this one.
    pub fn bind(&self, element: &mut SignatureElement, key: &C::PrivateKey) -> BgResult<PublicKey> {
        let public = self.crypto.public_key(key)?;
        self.bind_public(element, &public)?;
        Ok(public)
    }

    /// Bind a public key into `element`, sizing its signature descriptor.
    pub fn bind_public(&self, element: &mut SignatureElement, public: &PublicKey) -> BgResult<()> {
        if element.key.is_populated() {
            check_bound(&element.key, public)?;
        }
        element.bind_key(public.kind, public.key_size, public.data.clone())
    }

    /// Sign the bytes before a manifest's signed region end.
    ///
    /// `bound` is the signature element the prefix was assembled with; the
    /// signing key must match the public key bound into it.
    pub fn sign(
        &self,
        prefix: &[u8],
        key: &C::PrivateKey,
        bound: &SignatureElement,
    ) -> BgResult<SignatureElement> {
        if !bound.key.is_populated() {
            return Err(BgError::invalid(
                "a public key must be bound before the manifest is signed",
            ));
        }
        let public = self.crypto.public_key(key)?;
        check_bound(&bound.key, &public)?;

        let hash_alg = public.kind.signature_hash(public.key_size);
        check_hash_algorithm(hash_alg)?;
        let scheme = public.kind.signature_scheme();
        let data = self.crypto.sign(key, hash_alg, prefix)?;
        let expected = Signature::data_len(scheme, public.key_size)?;
        if data.len() != expected {
            return Err(BgError::Crypto(anyhow::anyhow!(
                "signature is {} bytes, {expected} expected",
                data.len()
            )));
        }
        log::debug!(
            "signed {} byte prefix with {:?}-{} over {hash_alg}",
            prefix.len(),
            public.kind,
            public.key_size
        );

        Ok(SignatureElement {
            key: bound.key.clone(),
            signature: Signature {
                scheme,
                key_size: public.key_size,
                hash_alg,
                data,
            },
        })
    }

    /// Bind `key`, then sign and reassemble the BPM.
    pub fn sign_bpm(
        &self,
        bpm: &mut BootPolicyManifest,
        key: &C::PrivateKey,
    ) -> BgResult<AssembledManifest> {
        self.bind(&mut bpm.pmse, key)?;
        let unsigned = assemble_bpm(bpm)?;
        bpm.pmse = self.sign(unsigned.signed_prefix(), key, &bpm.pmse)?;
        let signed = assemble_bpm(bpm)?;
        check_prefix(&unsigned, &signed)?;
        Ok(signed)
    }

    /// Bind `key`, then sign and reassemble the KM.
    pub fn sign_km(&self, km: &mut KeyManifest, key: &C::PrivateKey) -> BgResult<AssembledManifest> {
        self.bind(&mut km.key_signature, key)?;
        let unsigned = assemble_km(km)?;
        km.key_signature = self.sign(unsigned.signed_prefix(), key, &km.key_signature)?;
        let signed = assemble_km(km)?;
        check_prefix(&unsigned, &signed)?;
        Ok(signed)
    }

    /// Verify a serialized BPM against the key it embeds. Unsigned
    /// manifests do not verify.
    pub fn verify_bpm(&self, bytes: &[u8]) -> BgResult<bool> {
        let bpm = disassemble_bpm(bytes, DisassembleOptions::default())?;
        if !is_verifiable(&bpm.pmse) {
            return Ok(false);
        }
        let prefix = truncate(bytes, bpm_signed_region_end(bytes)?)?;
        Ok(self.crypto.verify(&bpm.pmse.key, &bpm.pmse.signature, prefix)?)
    }

    /// Verify a serialized KM against the key it embeds.
    pub fn verify_km(&self, bytes: &[u8]) -> BgResult<bool> {
        let km = disassemble_km(bytes)?;
        if !is_verifiable(&km.key_signature) {
            return Ok(false);
        }
        let prefix = truncate(bytes, km_signed_region_end(bytes)?)?;
        Ok(self
            .crypto
            .verify(&km.key_signature.key, &km.key_signature.signature, prefix)?)
    }
}

fn is_verifiable(element: &SignatureElement) -> bool {
    element.key.is_populated() && element.is_signed()
}

fn check_bound(bound: &Key, public: &PublicKey) -> BgResult<()> {
    let actual = public.kind.algorithm();
    if bound.alg != actual {
        return Err(BgError::KeyAlgorithmMismatch {
            expected: bound.alg.0,
            actual: actual.0,
        });
    }
    if bound.key_size != public.key_size || bound.data != public.data {
        return Err(BgError::invalid(
            "signing key does not match the public key bound into the manifest",
        ));
    }
    Ok(())
}

fn check_prefix(unsigned: &AssembledManifest, signed: &AssembledManifest) -> BgResult<()> {
    if unsigned.signed_prefix() != signed.signed_prefix() {
        return Err(BgError::invalid("signed region changed while signing"));
    }
    Ok(())
}

/// Digest of a key manifest's own public key material, as provisioned into
/// the platform fuses.
pub fn km_pubkey_hash<C: ManifestCrypto>(
    crypto: &C,
    km: &KeyManifest,
    alg: Algorithm,
) -> BgResult<Digest> {
    let key = &km.key_signature.key;
    if !key.is_populated() {
        return Err(BgError::invalid("key manifest has no public key bound"));
    }
    check_hash_algorithm(alg)?;
    Ok(Digest::new(alg, crypto.digest(alg, &key.data)?))
}
