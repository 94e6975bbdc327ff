//! Little-endian wire serialization.
//!
//! [`Serializer`] appends to an owned buffer; [`Unserializer`] consumes from
//! a borrowed slice. Every `get_*` either consumes exactly what it returns
//! or, on failure, leaves the cursor untouched. Length prefixes are 64-bit
//! little-endian so the format does not depend on the host's pointer width.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The remaining buffer is smaller than the value requires.
    #[error("truncated input")]
    Truncated,

    /// A length prefix or string payload is not representable.
    #[error("malformed field: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Default)]
pub struct Serializer {
    buf: BytesMut,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    /// Collection sizes travel as 64-bit values.
    pub fn put_usize(&mut self, v: usize) {
        self.put_u64(v as u64);
    }

    /// Raw bytes with no length prefix; the length is fixed by the schema.
    pub fn put_raw(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Length-prefixed byte vector.
    pub fn put_bytes(&mut self, data: &[u8]) {
        self.put_usize(data.len());
        self.buf.put_slice(data);
    }

    /// Length-prefixed UTF-8 string.
    pub fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }
}

pub struct Unserializer<'a> {
    buf: &'a [u8],
}

impl<'a> Unserializer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        let raw = self.take(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        let raw = self.take(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(raw);
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn get_usize(&mut self) -> Result<usize, CodecError> {
        let v = self.get_u64()?;
        usize::try_from(v).map_err(|_| CodecError::Malformed("size exceeds address space"))
    }

    /// Exactly `n` raw bytes.
    pub fn get_raw(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let raw = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(raw);
        Ok(out)
    }

    /// Length-prefixed byte vector. Fails without consuming if the prefix
    /// promises more data than the buffer holds.
    pub fn get_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        if self.buf.len() < 8 {
            return Err(CodecError::Truncated);
        }
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.buf[..8]);
        let len = usize::try_from(u64::from_le_bytes(prefix))
            .map_err(|_| CodecError::Malformed("size exceeds address space"))?;
        if self.buf.len() - 8 < len {
            return Err(CodecError::Truncated);
        }
        self.take(8)?;
        Ok(self.take(len)?.to_vec())
    }

    /// Length-prefixed UTF-8 string.
    pub fn get_str(&mut self) -> Result<String, CodecError> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes).map_err(|_| CodecError::Malformed("invalid utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_round_trip_little_endian() {
        let mut s = Serializer::new();
        s.put_u8(0xab);
        s.put_u16(0x1234);
        s.put_u32(0xdead_beef);
        s.put_u64(0x0102_0304_0506_0708);

        assert_eq!(s.as_slice()[1..3], [0x34, 0x12]);

        let data = s.into_bytes();
        let mut u = Unserializer::new(&data);
        assert_eq!(u.get_u8().unwrap(), 0xab);
        assert_eq!(u.get_u16().unwrap(), 0x1234);
        assert_eq!(u.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(u.get_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(u.remaining(), 0);
    }

    #[test]
    fn bytes_and_strings_round_trip() {
        let mut s = Serializer::new();
        s.put_bytes(&[1, 2, 3]);
        s.put_str("node");

        let data = s.into_bytes();
        let mut u = Unserializer::new(&data);
        assert_eq!(u.get_bytes().unwrap(), vec![1, 2, 3]);
        assert_eq!(u.get_str().unwrap(), "node");
    }

    #[test]
    fn truncated_integer_fails_without_consuming() {
        let mut u = Unserializer::new(&[1, 2]);
        assert_eq!(u.get_u32(), Err(CodecError::Truncated));
        assert_eq!(u.remaining(), 2);
        assert_eq!(u.get_u16().unwrap(), 0x0201);
    }

    #[test]
    fn byte_vector_with_lying_prefix_fails_without_consuming() {
        let mut s = Serializer::new();
        s.put_u64(100); // promises 100 bytes
        s.put_raw(&[0; 4]);

        let data = s.into_bytes();
        let mut u = Unserializer::new(&data);
        assert_eq!(u.get_bytes(), Err(CodecError::Truncated));
        assert_eq!(u.remaining(), 12);
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let mut s = Serializer::new();
        s.put_bytes(&[0xff, 0xfe]);
        let data = s.into_bytes();
        let mut u = Unserializer::new(&data);
        assert!(matches!(u.get_str(), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn raw_bytes_have_no_prefix() {
        let mut s = Serializer::new();
        s.put_raw(&[9, 9]);
        assert_eq!(s.len(), 2);
    }
}
