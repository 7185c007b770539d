/*++

Licensed under the Apache-2.0 license.

File Name:

   error.rs

Abstract:

    Error kinds reported by the Boot Guard provisioning core.

--*/

use thiserror::Error;

use crate::StructureId;

pub type BgResult<T> = Result<T, BgError>;

/// Errors reported while encoding, decoding, hashing, signing or stitching
/// Boot Guard structures.
#[derive(Debug, Error)]
pub enum BgError {
    #[error("input truncated: {needed} bytes needed at offset {offset}, {available} available")]
    TruncatedInput {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unsupported element {:?} at offset {}", String::from_utf8_lossy(.0), .1)]
    UnsupportedElement(StructureId, usize),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("algorithm {0:#06x} appears more than once in a digest list")]
    DuplicateAlgorithm(u16),

    #[error("key algorithm mismatch: manifest expects {expected:#06x}, signing key is {actual:#06x}")]
    KeyAlgorithmMismatch { expected: u16, actual: u16 },

    #[error("offset {offset:#x} is out of range for a buffer of {len:#x} bytes")]
    OffsetOutOfRange { offset: u64, len: usize },

    #[error("at least one of ACM, KM or BPM must be provided")]
    NoPayload,

    #[error("firmware interface table not found: {0}")]
    FitNotFound(String),

    #[error("no free region of {0:#x} bytes left in the image")]
    NoSpace(usize),

    #[error("algorithm {0:#06x} is not supported here")]
    UnsupportedAlgorithm(u16),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Crypto(#[from] anyhow::Error),
}

impl BgError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        BgError::InvalidManifest(msg.into())
    }
}
