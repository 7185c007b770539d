/*++

Licensed under the Apache-2.0 license.

File Name:

   codec.rs

Abstract:

    Little-endian cursor primitives shared by the element codec and the
    manifest assembler.

--*/

use bg_prov_types::{BgError, BgResult};
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Bounds-checked reader over a byte slice.
///
/// `base` is the absolute offset of `buf[0]` in the manifest so errors
/// report positions the caller can find in the enclosing buffer.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8], base: usize) -> Self {
        Self { buf, pos: 0, base }
    }

    /// Absolute offset of the next unread byte.
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, len: usize) -> BgResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(BgError::TruncatedInput {
                offset: self.offset(),
                needed: len,
                available: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..][..len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read<T: FromBytes>(&mut self) -> BgResult<T> {
        let offset = self.offset();
        let bytes = self.take(core::mem::size_of::<T>())?;
        T::read_from_bytes(bytes)
            .map_err(|_| BgError::invalid(format!("unreadable structure at offset {offset}")))
    }

    pub fn u8(&mut self) -> BgResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> BgResult<u16> {
        let mut le = [0u8; 2];
        le.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(le))
    }

    pub fn u32(&mut self) -> BgResult<u32> {
        let mut le = [0u8; 4];
        le.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(le))
    }

    pub fn u64(&mut self) -> BgResult<u64> {
        let mut le = [0u8; 8];
        le.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(le))
    }

    /// Reserved bytes must be zero, otherwise re-encoding would not be
    /// byte identical.
    pub fn reserved(&mut self, len: usize, what: &str) -> BgResult<()> {
        let offset = self.offset();
        if self.take(len)?.iter().any(|b| *b != 0) {
            return Err(BgError::invalid(format!(
                "reserved field {what} at offset {offset} is not zero"
            )));
        }
        Ok(())
    }

    /// Fails unless every byte of the slice was consumed.
    pub fn finish(&self, what: &str) -> BgResult<()> {
        if self.remaining() != 0 {
            return Err(BgError::invalid(format!(
                "{what} has {} undeclared trailing bytes at offset {}",
                self.remaining(),
                self.offset()
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn put<T: IntoBytes + Immutable>(&mut self, value: &T) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn zeros(&mut self, len: usize) {
        self.buf.resize(self.buf.len() + len, 0);
    }

    pub fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Narrow a length into a 16-bit size or count field.
pub(crate) fn len_u16(len: usize, what: &str) -> BgResult<u16> {
    u16::try_from(len).map_err(|_| BgError::invalid(format!("{what} of {len} exceeds 16 bits")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_reports_truncation() {
        let bytes = [1u8, 2, 3];
        let mut reader = Reader::new(&bytes, 0x10);
        assert_eq!(reader.u16().unwrap(), 0x0201);
        match reader.u32() {
            Err(BgError::TruncatedInput {
                offset,
                needed,
                available,
            }) => {
                assert_eq!(offset, 0x12);
                assert_eq!(needed, 4);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_reserved_must_be_zero() {
        let bytes = [0u8, 0, 1];
        let mut reader = Reader::new(&bytes, 0);
        assert!(reader.reserved(2, "r0").is_ok());
        assert!(matches!(
            reader.reserved(1, "r1"),
            Err(BgError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_writer_little_endian() {
        let mut writer = Writer::new();
        writer.u16(0x1234);
        writer.u32(0xAABBCCDD);
        writer.zeros(2);
        assert_eq!(
            writer.into_inner(),
            vec![0x34, 0x12, 0xDD, 0xCC, 0xBB, 0xAA, 0, 0]
        );
    }
}
