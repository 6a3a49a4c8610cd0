// Copyright (c) Sienna Satterwhite, FelixDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! On-disk record formats.
//!
//! A data file is laid out as:
//!
//! ```text
//! [file header][entries ...][padding, if any][footer index][file footer]
//! ```
//!
//! A file that carries a valid footer is complete: every entry in the data
//! region appears in the footer index and vice versa. A file without one is
//! assumed crashed mid-write and goes through recovery.

use bitflags::bitflags;
use crc::{
    Crc,
    Table,
    CRC_32_ISCSI,
};

use crate::errs::{
    Result,
    StorageError::InvalidFormat,
};

/// Fixed-size file header: kind byte, reserved bytes, timestamp.
pub(crate) const FILE_HEADER_SIZE: u64 = 16;
/// Fixed-size file footer at the very end of a complete file.
pub(crate) const FILE_FOOTER_SIZE: u64 = 32;
/// Fixed-size footer index record: hashed key + entry offset.
pub(crate) const FOOTER_INDEX_ENTRY_SIZE: u64 = 12;
/// Upper bound on an encoded entry header.
pub(crate) const ENTRY_HEADER_MAX_SIZE: usize = 40;

/// `"MEOW"`, little-endian. Stored as 64 bits with the upper half zero;
/// only the low 32 bits are verified.
pub const MAGIC_NUMBER: u32 = 0x4d45_4f57;

pub(crate) const CRC32C: Crc<u32, Table<16>> = Crc::<u32, Table<16>>::new(&CRC_32_ISCSI);

/// CRC32 with the Castagnoli polynomial.
pub fn crc32c(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

const CRC32C_POLY_REFLECTED: u32 = 0x82f6_3b78;

fn gf2_matrix_times(mat: &[u32; 32], mut vec: u32) -> u32 {
    let mut sum = 0;
    let mut i = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u32; 32], mat: &[u32; 32]) {
    for n in 0..32 {
        square[n] = gf2_matrix_times(mat, mat[n]);
    }
}

/// Combine two CRC32C digests: given `crc1` over some bytes `A` and `crc2`
/// over some bytes `B` of length `len2`, returns the CRC32C of `A ‖ B`.
pub fn crc32c_combine(crc1: u32, crc2: u32, len2: u64) -> u32 {
    if len2 == 0 {
        return crc1;
    }

    let mut even = [0u32; 32];
    let mut odd = [0u32; 32];

    // operator for one zero bit
    odd[0] = CRC32C_POLY_REFLECTED;
    let mut row = 1u32;
    for item in odd.iter_mut().skip(1) {
        *item = row;
        row <<= 1;
    }

    // operators for two and four zero bits
    gf2_matrix_square(&mut even, &odd);
    gf2_matrix_square(&mut odd, &even);

    let mut crc1 = crc1;
    let mut len2 = len2;
    loop {
        gf2_matrix_square(&mut even, &odd);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&even, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }

        gf2_matrix_square(&mut odd, &even);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&odd, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }

    crc1 ^ crc2
}

/// Pack a file id and an in-file offset into a single index location.
#[inline]
pub(crate) fn pack_location(fileid: u32, offset: u32) -> u64 {
    ((fileid as u64) << 32) | offset as u64
}

#[inline]
pub(crate) fn location_fileid(location: u64) -> u32 {
    (location >> 32) as u32
}

#[inline]
pub(crate) fn location_offset(location: u64) -> u32 {
    (location & 0xffff_ffff) as u32
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileKind {
    UncompactedLog = 0,
    CompactedLog = 1,
    CompactedLarge = 2,
}

impl FileKind {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            | 0 => Ok(FileKind::UncompactedLog),
            | 1 => Ok(FileKind::CompactedLog),
            | 2 => Ok(FileKind::CompactedLarge),
            | _ => Err(InvalidFormat(format!("unknown file kind {}", v))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FileHeader {
    pub(crate) kind: FileKind,
    pub(crate) timestamp: u64,
}

impl FileHeader {
    pub(crate) fn encode_into(&self, buf: &mut [u8]) {
        buf[..FILE_HEADER_SIZE as usize].fill(0);
        buf[0] = self.kind as u8;
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_HEADER_SIZE as usize {
            return Err(InvalidFormat("file header too short".into()));
        }
        let kind = FileKind::from_u8(buf[0])?;
        let timestamp = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        Ok(FileHeader { kind, timestamp })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct FooterFlags: u8 {
        const HAS_PADDING_IN_VALUES = 1 << 0;
        const HAS_INVALID_ENTRIES   = 1 << 1;
        const IS_LARGE              = 1 << 2;
        const IS_COMPACTED          = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FileFooter {
    pub(crate) kind: FileKind,
    pub(crate) flags: FooterFlags,
    pub(crate) num_entries: u64,
    pub(crate) offset_index: u64,
    pub(crate) magic: u64,
    pub(crate) crc32: u32,
}

impl FileFooter {
    pub(crate) fn encode_into(&self, buf: &mut [u8]) {
        buf[0] = self.kind as u8;
        buf[1] = self.flags.bits();
        buf[2..4].fill(0);
        buf[4..12].copy_from_slice(&self.num_entries.to_le_bytes());
        buf[12..20].copy_from_slice(&self.offset_index.to_le_bytes());
        buf[20..28].copy_from_slice(&self.magic.to_le_bytes());
        buf[28..32].copy_from_slice(&self.crc32.to_le_bytes());
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_FOOTER_SIZE as usize {
            return Err(InvalidFormat("file footer too short".into()));
        }
        let kind = FileKind::from_u8(buf[0])?;
        let flags = FooterFlags::from_bits_truncate(buf[1]);
        let num_entries = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        let offset_index = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        let magic = u64::from_le_bytes(buf[20..28].try_into().unwrap());
        let crc32 = u32::from_le_bytes(buf[28..32].try_into().unwrap());
        Ok(FileFooter {
            kind,
            flags,
            num_entries,
            offset_index,
            magic,
            crc32,
        })
    }

    pub(crate) fn has_valid_magic(&self) -> bool {
        (self.magic & 0xffff_ffff) as u32 == MAGIC_NUMBER
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FooterIndexEntry {
    pub(crate) hashed_key: u64,
    pub(crate) offset_entry: u32,
}

impl FooterIndexEntry {
    pub(crate) fn encode_into(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.hashed_key.to_le_bytes());
        buf[8..12].copy_from_slice(&self.offset_entry.to_le_bytes());
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FOOTER_INDEX_ENTRY_SIZE as usize {
            return Err(InvalidFormat("footer index entry too short".into()));
        }
        Ok(FooterIndexEntry {
            hashed_key: u64::from_le_bytes(buf[..8].try_into().unwrap()),
            offset_entry: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryType {
    Put = 0,
    Remove = 1,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryShape {
    Full = 0,
    First = 1,
    Middle = 2,
    Last = 3,
}

const ENTRY_FLAG_TYPE: u8 = 1 << 0;
const ENTRY_FLAG_SHAPE_MASK: u8 = 0b110;
const ENTRY_FLAG_HAS_PADDING: u8 = 1 << 3;

/// Header of a single on-disk entry, followed by the key bytes and the
/// value bytes. The leading 4 bytes are the entry CRC32C; its coverage is
/// the rest of the header, the key, and the stored value bytes.
///
/// Sizes are varint-packed. Headers of streamed entries are rewritten in
/// place when the last chunk lands, and the compressed size is the only
/// field that can change between the two encodes, so those headers use
/// [`EntryHeader::encode_into_padded`], which pins the compressed-size
/// varint to a fixed width.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryHeader {
    pub(crate) crc32: u32,
    pub(crate) entry_type: EntryType,
    pub(crate) shape: EntryShape,
    pub(crate) has_padding: bool,
    pub(crate) hashed_key: u64,
    pub(crate) size_key: u32,
    pub(crate) size_value: u64,
    pub(crate) size_value_compressed: u64,
}

impl EntryHeader {
    /// Encode into `buf`, returning the encoded length.
    pub(crate) fn encode_into(&self, buf: &mut [u8]) -> usize {
        self.encode(buf, false)
    }

    /// Encode with the compressed-size varint pinned to a fixed width, for
    /// headers that will be rewritten in place on finalize.
    pub(crate) fn encode_into_padded(&self, buf: &mut [u8]) -> usize {
        self.encode(buf, true)
    }

    fn encode(&self, buf: &mut [u8], pad_compressed_size: bool) -> usize {
        buf[..4].copy_from_slice(&self.crc32.to_le_bytes());
        let mut flags = 0u8;
        if self.entry_type == EntryType::Remove {
            flags |= ENTRY_FLAG_TYPE;
        }
        flags |= (self.shape as u8) << 1;
        if self.has_padding {
            flags |= ENTRY_FLAG_HAS_PADDING;
        }
        buf[4] = flags;
        buf[5..13].copy_from_slice(&self.hashed_key.to_le_bytes());
        let mut pos = 13;
        pos = put_varint(buf, pos, self.size_key as u64);
        pos = put_varint(buf, pos, self.size_value);
        if pad_compressed_size && self.size_value_compressed < (1 << 35) {
            pos = put_varint_fixed(buf, pos, self.size_value_compressed);
        } else {
            pos = put_varint(buf, pos, self.size_value_compressed);
        }
        pos
    }

    /// Decode from `buf`, returning the header and its encoded length.
    pub(crate) fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 13 {
            return Err(InvalidFormat("entry header too short".into()));
        }
        let crc32 = u32::from_le_bytes(buf[..4].try_into().unwrap());
        let flags = buf[4];
        let entry_type = if flags & ENTRY_FLAG_TYPE != 0 {
            EntryType::Remove
        } else {
            EntryType::Put
        };
        let shape = match (flags & ENTRY_FLAG_SHAPE_MASK) >> 1 {
            | 0 => EntryShape::Full,
            | 1 => EntryShape::First,
            | 2 => EntryShape::Middle,
            | _ => EntryShape::Last,
        };
        let has_padding = flags & ENTRY_FLAG_HAS_PADDING != 0;
        let hashed_key = u64::from_le_bytes(buf[5..13].try_into().unwrap());
        let mut pos = 13;
        let size_key = get_varint(buf, &mut pos)?;
        if size_key > u32::MAX as u64 {
            return Err(InvalidFormat("entry key size out of range".into()));
        }
        let size_value = get_varint(buf, &mut pos)?;
        let size_value_compressed = get_varint(buf, &mut pos)?;
        Ok((
            EntryHeader {
                crc32,
                entry_type,
                shape,
                has_padding,
                hashed_key,
                size_key: size_key as u32,
                size_value,
                size_value_compressed,
            },
            pos,
        ))
    }

    pub(crate) fn is_remove(&self) -> bool {
        self.entry_type == EntryType::Remove
    }

    pub(crate) fn is_full_shape(&self) -> bool {
        self.shape == EntryShape::Full
    }

    /// Bytes the value actually occupies in the entry payload.
    pub(crate) fn value_used(&self) -> u64 {
        if self.size_value_compressed > 0 {
            self.size_value_compressed
        } else {
            self.size_value
        }
    }

    /// Bytes reserved for the value on disk, padding included.
    pub(crate) fn value_offset(&self) -> u64 {
        if self.has_padding {
            self.size_value
        } else {
            self.value_used()
        }
    }
}

fn put_varint(buf: &mut [u8], mut pos: usize, mut v: u64) -> usize {
    while v >= 0x80 {
        buf[pos] = (v as u8) | 0x80;
        v >>= 7;
        pos += 1;
    }
    buf[pos] = v as u8;
    pos + 1
}

/// Varint pinned to five bytes (values below 2^35), so a later in-place
/// re-encode with a different value cannot change the header length.
fn put_varint_fixed(buf: &mut [u8], mut pos: usize, mut v: u64) -> usize {
    for _ in 0..4 {
        buf[pos] = (v as u8) | 0x80;
        v >>= 7;
        pos += 1;
    }
    buf[pos] = v as u8;
    pos + 1
}

fn get_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if *pos >= buf.len() || shift > 63 {
            return Err(InvalidFormat("truncated varint".into()));
        }
        let byte = buf[*pos];
        *pos += 1;
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_header_roundtrip() {
        let header = FileHeader {
            kind: FileKind::CompactedLog,
            timestamp: 42,
        };
        let mut buf = [0u8; FILE_HEADER_SIZE as usize];
        header.encode_into(&mut buf);
        let decoded = FileHeader::decode(&buf).unwrap();
        assert_eq!(decoded.kind, FileKind::CompactedLog);
        assert_eq!(decoded.timestamp, 42);
    }

    #[test]
    fn test_file_header_rejects_unknown_kind() {
        let mut buf = [0u8; FILE_HEADER_SIZE as usize];
        buf[0] = 7;
        assert!(FileHeader::decode(&buf).is_err());
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = FileFooter {
            kind: FileKind::UncompactedLog,
            flags: FooterFlags::HAS_INVALID_ENTRIES,
            num_entries: 100,
            offset_index: 65536,
            magic: MAGIC_NUMBER as u64,
            crc32: 0xdeadbeef,
        };
        let mut buf = [0u8; FILE_FOOTER_SIZE as usize];
        footer.encode_into(&mut buf);
        let decoded = FileFooter::decode(&buf).unwrap();
        assert_eq!(decoded.num_entries, 100);
        assert_eq!(decoded.offset_index, 65536);
        assert_eq!(decoded.crc32, 0xdeadbeef);
        assert!(decoded.flags.contains(FooterFlags::HAS_INVALID_ENTRIES));
        assert!(decoded.has_valid_magic());
    }

    #[test]
    fn test_magic_checks_low_half_only() {
        let footer = FileFooter {
            kind: FileKind::UncompactedLog,
            flags: FooterFlags::empty(),
            num_entries: 0,
            offset_index: 0,
            magic: MAGIC_NUMBER as u64 | (0xffff_ffff << 32),
            crc32: 0,
        };
        assert!(footer.has_valid_magic());

        let bad = FileFooter {
            magic: 0x4d45_4f56,
            ..footer
        };
        assert!(!bad.has_valid_magic());
    }

    #[test]
    fn test_entry_header_roundtrip() {
        let header = EntryHeader {
            crc32: 0x1234_5678,
            entry_type: EntryType::Put,
            shape: EntryShape::Full,
            has_padding: true,
            hashed_key: 0xfeed_beef_cafe_f00d,
            size_key: 300,
            size_value: 1 << 20,
            size_value_compressed: 12345,
        };
        let mut buf = [0u8; ENTRY_HEADER_MAX_SIZE];
        let len = header.encode_into(&mut buf);
        let (decoded, decoded_len) = EntryHeader::decode(&buf).unwrap();
        assert_eq!(len, decoded_len);
        assert_eq!(decoded.crc32, header.crc32);
        assert_eq!(decoded.entry_type, EntryType::Put);
        assert_eq!(decoded.shape, EntryShape::Full);
        assert!(decoded.has_padding);
        assert_eq!(decoded.hashed_key, header.hashed_key);
        assert_eq!(decoded.size_key, 300);
        assert_eq!(decoded.size_value, 1 << 20);
        assert_eq!(decoded.size_value_compressed, 12345);
    }

    #[test]
    fn test_padded_header_length_stable_on_finalize() {
        // re-encoding with a different compressed size must not change the
        // header length, since the header is rewritten in place
        let mut header = EntryHeader {
            crc32: 0,
            entry_type: EntryType::Put,
            shape: EntryShape::Full,
            has_padding: false,
            hashed_key: 1,
            size_key: 8,
            size_value: 1 << 20,
            size_value_compressed: 0,
        };
        let mut buf = [0u8; ENTRY_HEADER_MAX_SIZE];
        let len_initial = header.encode_into_padded(&mut buf);
        header.size_value_compressed = (1 << 20) - 17;
        header.crc32 = 0xabcd_ef01;
        header.has_padding = true;
        let len_final = header.encode_into_padded(&mut buf);
        assert_eq!(len_initial, len_final);
    }

    #[test]
    fn test_padded_header_decodes_like_canonical() {
        let header = EntryHeader {
            crc32: 3,
            entry_type: EntryType::Put,
            shape: EntryShape::Full,
            has_padding: true,
            hashed_key: 4,
            size_key: 8,
            size_value: 4096,
            size_value_compressed: 0,
        };
        let mut buf = [0u8; ENTRY_HEADER_MAX_SIZE];
        let len = header.encode_into_padded(&mut buf);
        let (decoded, decoded_len) = EntryHeader::decode(&buf).unwrap();
        assert_eq!(decoded_len, len);
        assert_eq!(decoded.size_value, 4096);
        assert_eq!(decoded.size_value_compressed, 0);
    }

    #[test]
    fn test_small_entry_header_is_compact() {
        // 100 entries with 8-byte keys and 16-byte values have to fit in a
        // 4 KiB file together with its header
        let header = EntryHeader {
            crc32: 0,
            entry_type: EntryType::Put,
            shape: EntryShape::Full,
            has_padding: false,
            hashed_key: u64::MAX,
            size_key: 8,
            size_value: 16,
            size_value_compressed: 0,
        };
        let mut buf = [0u8; ENTRY_HEADER_MAX_SIZE];
        assert_eq!(header.encode_into(&mut buf), 16);
    }

    #[test]
    fn test_entry_remove_roundtrip() {
        let header = EntryHeader {
            crc32: 9,
            entry_type: EntryType::Remove,
            shape: EntryShape::Full,
            has_padding: false,
            hashed_key: 2,
            size_key: 1,
            size_value: 0,
            size_value_compressed: 0,
        };
        let mut buf = [0u8; ENTRY_HEADER_MAX_SIZE];
        header.encode_into(&mut buf);
        let (decoded, _) = EntryHeader::decode(&buf).unwrap();
        assert!(decoded.is_remove());
        assert_eq!(decoded.value_used(), 0);
    }

    #[test]
    fn test_entry_value_sizes() {
        let mut header = EntryHeader {
            crc32: 0,
            entry_type: EntryType::Put,
            shape: EntryShape::Full,
            has_padding: false,
            hashed_key: 0,
            size_key: 4,
            size_value: 1000,
            size_value_compressed: 0,
        };
        assert_eq!(header.value_used(), 1000);
        assert_eq!(header.value_offset(), 1000);

        header.size_value_compressed = 600;
        assert_eq!(header.value_used(), 600);
        assert_eq!(header.value_offset(), 600);

        header.has_padding = true;
        assert_eq!(header.value_used(), 600);
        assert_eq!(header.value_offset(), 1000);
    }

    #[test]
    fn test_entry_decode_truncated() {
        let header = EntryHeader {
            crc32: 0,
            entry_type: EntryType::Put,
            shape: EntryShape::Full,
            has_padding: false,
            hashed_key: 77,
            size_key: 8,
            size_value: 16,
            size_value_compressed: 0,
        };
        let mut buf = [0u8; ENTRY_HEADER_MAX_SIZE];
        let len = header.encode_into(&mut buf);
        assert!(EntryHeader::decode(&buf[..len - 5]).is_err());
        assert!(EntryHeader::decode(&buf[..4]).is_err());
    }

    #[test]
    fn test_varint_roundtrip() {
        let mut buf = [0u8; 10];
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let len = put_varint(&mut buf, 0, v);
            let mut pos = 0;
            assert_eq!(get_varint(&buf[..len], &mut pos).unwrap(), v);
            assert_eq!(pos, len);
        }
    }

    #[test]
    fn test_location_packing() {
        let location = pack_location(0xabcd, 0x1234);
        assert_eq!(location_fileid(location), 0xabcd);
        assert_eq!(location_offset(location), 0x1234);
    }

    #[test]
    fn test_crc32c_combine_matches_whole() {
        let a = b"the quick brown fox";
        let b = b" jumps over the lazy dog";
        let mut whole = Vec::from(&a[..]);
        whole.extend_from_slice(b);
        assert_eq!(
            crc32c_combine(crc32c(a), crc32c(b), b.len() as u64),
            crc32c(&whole)
        );
    }

    #[test]
    fn test_crc32c_combine_empty_tail() {
        let a = crc32c(b"payload");
        assert_eq!(crc32c_combine(a, 0, 0), a);
    }
}
