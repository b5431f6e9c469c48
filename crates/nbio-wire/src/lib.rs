//! # nbio-wire
//!
//! Wire-encoding helpers for services built on the nbio transport. The
//! transport itself moves opaque byte streams; these helpers define the
//! payload layer: fixed-width integer packing, length-prefixed strings
//! and homogeneous lists, and a checksummed packet header.
//!
//! Multi-byte integers are big-endian on the wire; little-endian
//! variants exist for peers that require them.
//!
//! ```
//! use nbio_wire::{Wire, WireReader, WireWriter};
//!
//! let mut w = WireWriter::new();
//! 0xBEEFu16.encode(&mut w);
//! "hello".to_string().encode(&mut w);
//!
//! let bytes = w.into_vec();
//! let mut r = WireReader::new(&bytes);
//! assert_eq!(u16::decode(&mut r).unwrap(), 0xBEEF);
//! assert_eq!(String::decode(&mut r).unwrap(), "hello");
//! ```

pub mod checksum;

pub use checksum::{adler32, Adler32};

use core::fmt;

/// Result type for decoding
pub type WireResult<T> = Result<T, WireError>;

/// Errors surfaced while decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes available than the field needs
    Truncated { needed: usize, available: usize },

    /// Length-prefixed string was not valid UTF-8
    BadString,

    /// Stored checksum does not match the recomputed one
    ChecksumMismatch { stored: u32, computed: u32 },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated { needed, available } => {
                write!(f, "truncated: needed {} bytes, {} available", needed, available)
            }
            WireError::BadString => write!(f, "string field is not valid UTF-8"),
            WireError::ChecksumMismatch { stored, computed } => write!(
                f,
                "checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            ),
        }
    }
}

impl std::error::Error for WireError {}

// ── Writer ────────────────────────────────────────────────────────

/// Growable byte sink for encoding.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn append_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn append_u16_be(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn append_u32_be(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn append_u64_be(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn append_u16_le(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn append_u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn append_u64_le(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Overwrite a previously written big-endian u32 (checksum
    /// patching).
    pub fn patch_u32_be(&mut self, offset: usize, v: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&v.to_be_bytes());
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

// ── Reader ────────────────────────────────────────────────────────

/// Cursor over an encoded byte slice.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16_be(&mut self) -> WireResult<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32_be(&mut self) -> WireResult<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64_be(&mut self) -> WireResult<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_u16_le(&mut self) -> WireResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32_le(&mut self) -> WireResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64_le(&mut self) -> WireResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> WireResult<&'a [u8]> {
        self.take(n)
    }
}

// ── Wire trait ────────────────────────────────────────────────────

/// A type with a fixed wire representation.
pub trait Wire: Sized {
    fn encode(&self, w: &mut WireWriter);
    fn decode(r: &mut WireReader<'_>) -> WireResult<Self>;
    fn encoded_size(&self) -> usize;
}

impl Wire for u8 {
    fn encode(&self, w: &mut WireWriter) {
        w.append_u8(*self);
    }
    fn decode(r: &mut WireReader<'_>) -> WireResult<Self> {
        r.read_u8()
    }
    fn encoded_size(&self) -> usize {
        1
    }
}

impl Wire for u16 {
    fn encode(&self, w: &mut WireWriter) {
        w.append_u16_be(*self);
    }
    fn decode(r: &mut WireReader<'_>) -> WireResult<Self> {
        r.read_u16_be()
    }
    fn encoded_size(&self) -> usize {
        2
    }
}

impl Wire for u32 {
    fn encode(&self, w: &mut WireWriter) {
        w.append_u32_be(*self);
    }
    fn decode(r: &mut WireReader<'_>) -> WireResult<Self> {
        r.read_u32_be()
    }
    fn encoded_size(&self) -> usize {
        4
    }
}

impl Wire for u64 {
    fn encode(&self, w: &mut WireWriter) {
        w.append_u64_be(*self);
    }
    fn decode(r: &mut WireReader<'_>) -> WireResult<Self> {
        r.read_u64_be()
    }
    fn encoded_size(&self) -> usize {
        8
    }
}

/// Strings carry a 4-byte big-endian length prefix, then raw UTF-8.
impl Wire for String {
    fn encode(&self, w: &mut WireWriter) {
        w.append_u32_be(self.len() as u32);
        w.append_bytes(self.as_bytes());
    }

    fn decode(r: &mut WireReader<'_>) -> WireResult<Self> {
        let len = r.read_u32_be()? as usize;
        let bytes = r.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::BadString)
    }

    fn encoded_size(&self) -> usize {
        4 + self.len()
    }
}

/// Homogeneous lists carry a 4-byte big-endian count prefix, then the
/// items back to back.
impl<T: Wire> Wire for Vec<T> {
    fn encode(&self, w: &mut WireWriter) {
        w.append_u32_be(self.len() as u32);
        for item in self {
            item.encode(w);
        }
    }

    fn decode(r: &mut WireReader<'_>) -> WireResult<Self> {
        let count = r.read_u32_be()? as usize;
        let mut items = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            items.push(T::decode(r)?);
        }
        Ok(items)
    }

    fn encoded_size(&self) -> usize {
        4 + self.iter().map(Wire::encoded_size).sum::<usize>()
    }
}

// ── Packet header ─────────────────────────────────────────────────

/// Leading header of every packet:
/// `{u8 opcode, u8 version, u16 size, u32 checksum}`.
///
/// The checksum covers the header bytes with the checksum field zeroed
/// while computing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub opcode: u8,
    pub version: u8,
    pub size: u16,
    pub checksum: u32,
}

impl PacketHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// Byte offset of the checksum field.
    const CHECKSUM_OFFSET: usize = 4;

    pub fn new(opcode: u8, version: u8, size: u16) -> Self {
        Self {
            opcode,
            version,
            size,
            checksum: 0,
        }
    }

    /// The checksum of this header with its checksum field zeroed.
    fn computed_checksum(&self) -> u32 {
        let mut w = WireWriter::with_capacity(Self::SIZE);
        Self {
            checksum: 0,
            ..*self
        }
        .encode(&mut w);
        adler32(w.as_slice())
    }

    /// Fill in the checksum field.
    pub fn seal(&mut self) {
        self.checksum = self.computed_checksum();
    }

    /// Recompute and compare against the stored checksum.
    pub fn verify(&self) -> WireResult<()> {
        let computed = self.computed_checksum();
        if computed != self.checksum {
            return Err(WireError::ChecksumMismatch {
                stored: self.checksum,
                computed,
            });
        }
        Ok(())
    }

    /// Patch the checksum field of an already-encoded header in `w` at
    /// `header_offset`.
    pub fn patch_checksum(w: &mut WireWriter, header_offset: usize, checksum: u32) {
        w.patch_u32_be(header_offset + Self::CHECKSUM_OFFSET, checksum);
    }
}

impl Wire for PacketHeader {
    fn encode(&self, w: &mut WireWriter) {
        w.append_u8(self.opcode);
        w.append_u8(self.version);
        w.append_u16_be(self.size);
        w.append_u32_be(self.checksum);
    }

    fn decode(r: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self {
            opcode: r.read_u8()?,
            version: r.read_u8()?,
            size: r.read_u16_be()?,
            checksum: r.read_u32_be()?,
        })
    }

    fn encoded_size(&self) -> usize {
        Self::SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_read() {
        let bytes = [0u8; 3];
        let mut r = WireReader::new(&bytes);
        assert_eq!(
            u32::decode(&mut r),
            Err(WireError::Truncated {
                needed: 4,
                available: 3
            })
        );
    }

    #[test]
    fn test_string_layout() {
        let mut w = WireWriter::new();
        "abc".to_string().encode(&mut w);
        // 4-byte big-endian length, then the bytes.
        assert_eq!(w.as_slice(), &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_list_of_ints() {
        let list: Vec<u16> = vec![1, 2, 515];
        let mut w = WireWriter::new();
        list.encode(&mut w);
        assert_eq!(w.len(), list.encoded_size());
        assert_eq!(w.as_slice(), &[0, 0, 0, 3, 0, 1, 0, 2, 2, 3]);

        let mut r = WireReader::new(w.as_slice());
        assert_eq!(Vec::<u16>::decode(&mut r).unwrap(), list);
    }

    #[test]
    fn test_list_of_strings() {
        let list = vec!["x".to_string(), "yz".to_string()];
        let mut w = WireWriter::new();
        list.encode(&mut w);

        let mut r = WireReader::new(w.as_slice());
        assert_eq!(Vec::<String>::decode(&mut r).unwrap(), list);
    }

    #[test]
    fn test_endianness_variants() {
        let mut w = WireWriter::new();
        w.append_u32_be(0x01020304);
        w.append_u32_le(0x01020304);
        assert_eq!(w.as_slice(), &[1, 2, 3, 4, 4, 3, 2, 1]);
    }

    #[test]
    fn test_header_seal_verify() {
        let mut hdr = PacketHeader::new(7, 1, 512);
        hdr.seal();
        assert!(hdr.verify().is_ok());

        // Round trip through bytes.
        let mut w = WireWriter::new();
        hdr.encode(&mut w);
        assert_eq!(w.len(), PacketHeader::SIZE);

        let mut r = WireReader::new(w.as_slice());
        let decoded = PacketHeader::decode(&mut r).unwrap();
        assert_eq!(decoded, hdr);
        assert!(decoded.verify().is_ok());
    }

    #[test]
    fn test_header_tamper_detected() {
        let mut hdr = PacketHeader::new(7, 1, 512);
        hdr.seal();

        let mut tampered = hdr;
        tampered.size = 513;
        assert!(matches!(
            tampered.verify(),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_patch_checksum_in_buffer() {
        let mut hdr = PacketHeader::new(3, 0, 64);
        hdr.seal();

        // Encode unsealed, then patch in place as a sender would after
        // computing over the zeroed field.
        let unsealed = PacketHeader::new(3, 0, 64);
        let mut w = WireWriter::new();
        unsealed.encode(&mut w);
        PacketHeader::patch_checksum(&mut w, 0, hdr.checksum);

        let mut r = WireReader::new(w.as_slice());
        let decoded = PacketHeader::decode(&mut r).unwrap();
        assert!(decoded.verify().is_ok());
        assert_eq!(decoded.checksum, hdr.checksum);
    }
}
