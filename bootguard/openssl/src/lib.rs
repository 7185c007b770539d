/*++

Licensed under the Apache-2.0 license.

File Name:

   lib.rs

Abstract:

    OpenSSL backed hashing, signing and verification of Boot Guard manifests.

--*/

use anyhow::{bail, Context};
use bg_prov_gen::{ManifestCrypto, PublicKey};
use bg_prov_types::{Algorithm, Key, KeyKind, Signature};
use openssl::bn::{BigNum, BigNumContext, BigNumRef};
use openssl::ec::{EcGroup, EcGroupRef, EcKey, EcPoint};
use openssl::ecdsa::EcdsaSig;
use openssl::hash::{hash, MessageDigest};
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};

/// RSA public exponent width in a key descriptor
const RSA_EXPONENT_SIZE: usize = 4;

#[derive(Default)]
pub struct OsslCrypto {}

fn message_digest(alg: Algorithm) -> anyhow::Result<MessageDigest> {
    Ok(match alg {
        Algorithm::SHA1 => MessageDigest::sha1(),
        Algorithm::SHA256 => MessageDigest::sha256(),
        Algorithm::SHA384 => MessageDigest::sha384(),
        Algorithm::SHA512 => MessageDigest::sha512(),
        other => bail!("hash algorithm {other} is not supported"),
    })
}

fn curve(bits: u16) -> anyhow::Result<Nid> {
    Ok(match bits {
        224 => Nid::SECP224R1,
        256 => Nid::X9_62_PRIME256V1,
        384 => Nid::SECP384R1,
        521 => Nid::SECP521R1,
        other => bail!("no curve with {other}-bit keys"),
    })
}

/// Big-endian `value` as a little-endian buffer of `len` bytes.
fn to_le(value: &BigNumRef, len: usize) -> anyhow::Result<Vec<u8>> {
    let mut bytes = value.to_vec_padded(len as i32)?;
    bytes.reverse();
    Ok(bytes)
}

fn from_le(bytes: &[u8]) -> anyhow::Result<BigNum> {
    let mut be = bytes.to_vec();
    be.reverse();
    Ok(BigNum::from_slice(&be)?)
}

fn coordinate_len(group: &EcGroupRef) -> usize {
    (group.degree() as usize).div_ceil(8)
}

fn rsa_public_key(key: &Key) -> anyhow::Result<PKey<openssl::pkey::Public>> {
    if key.data.len() <= RSA_EXPONENT_SIZE {
        bail!("RSA key material of {} bytes", key.data.len());
    }
    let (exponent, modulus) = key.data.split_at(RSA_EXPONENT_SIZE);
    let rsa = Rsa::from_public_components(from_le(modulus)?, from_le(exponent)?)?;
    Ok(PKey::from_rsa(rsa)?)
}

fn ec_public_key(key: &Key) -> anyhow::Result<EcKey<openssl::pkey::Public>> {
    let group = EcGroup::from_curve_name(curve(key.key_size)?)?;
    let len = coordinate_len(&group);
    if key.data.len() != 2 * len {
        bail!("EC key material of {} bytes", key.data.len());
    }
    let (x, y) = key.data.split_at(len);
    let mut ctx = BigNumContext::new()?;
    let mut point = EcPoint::new(&group)?;
    point.set_affine_coordinates_gfp(&group, &*from_le(x)?, &*from_le(y)?, &mut ctx)?;
    Ok(EcKey::from_public_key(&group, &point)?)
}

impl ManifestCrypto for OsslCrypto {
    type PrivateKey = PKey<Private>;

    fn digest(&self, alg: Algorithm, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(hash(message_digest(alg)?, data)?.to_vec())
    }

    fn public_key(&self, key: &PKey<Private>) -> anyhow::Result<PublicKey> {
        match key.id() {
            Id::RSA => {
                let rsa = key.rsa()?;
                let size = rsa.size() as usize;
                let mut data = to_le(rsa.e(), RSA_EXPONENT_SIZE)?;
                data.extend_from_slice(&to_le(rsa.n(), size)?);
                Ok(PublicKey {
                    kind: KeyKind::Rsa,
                    key_size: u16::try_from(size * 8).context("RSA key too large")?,
                    data,
                })
            }
            Id::EC => {
                let ec = key.ec_key()?;
                let group = ec.group();
                let len = coordinate_len(group);
                let mut ctx = BigNumContext::new()?;
                let mut x = BigNum::new()?;
                let mut y = BigNum::new()?;
                ec.public_key()
                    .affine_coordinates_gfp(group, &mut x, &mut y, &mut ctx)?;
                let mut data = to_le(&x, len)?;
                data.extend_from_slice(&to_le(&y, len)?);
                Ok(PublicKey {
                    kind: KeyKind::Ecc,
                    key_size: group.degree() as u16,
                    data,
                })
            }
            other => bail!("unsupported signing key type {other:?}"),
        }
    }

    fn sign(
        &self,
        key: &PKey<Private>,
        hash_alg: Algorithm,
        data: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        let md = message_digest(hash_alg)?;
        match key.id() {
            Id::RSA => {
                let mut signer = Signer::new(md, key)?;
                let mut signature = signer.sign_oneshot_to_vec(data)?;
                signature.reverse();
                Ok(signature)
            }
            Id::EC => {
                let ec = key.ec_key()?;
                let len = coordinate_len(ec.group());
                let digest = hash(md, data)?;
                let sig = EcdsaSig::sign(&digest, &ec)?;
                let mut signature = to_le(sig.r(), len)?;
                signature.extend_from_slice(&to_le(sig.s(), len)?);
                Ok(signature)
            }
            other => bail!("unsupported signing key type {other:?}"),
        }
    }

    fn verify(&self, key: &Key, signature: &Signature, data: &[u8]) -> anyhow::Result<bool> {
        let md = message_digest(signature.hash_alg)?;
        match (key.kind(), signature.scheme) {
            (Some(KeyKind::Rsa), Algorithm::RSASSA) => {
                let public = rsa_public_key(key)?;
                let mut be = signature.data.clone();
                be.reverse();
                let mut verifier = Verifier::new(md, &public)?;
                Ok(verifier.verify_oneshot(&be, data)?)
            }
            (Some(KeyKind::Ecc), Algorithm::ECDSA) => {
                let public = ec_public_key(key)?;
                let len = coordinate_len(public.group());
                if signature.data.len() != 2 * len {
                    return Ok(false);
                }
                let (r, s) = signature.data.split_at(len);
                let sig = EcdsaSig::from_private_components(from_le(r)?, from_le(s)?)?;
                Ok(sig.verify(&hash(md, data)?, &public)?)
            }
            (_, scheme) => bail!("cannot verify {scheme} signatures with {} keys", key.alg),
        }
    }
}
