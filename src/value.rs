// Copyright (c) Sienna Satterwhite, FelixDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::sync::Arc;

use getset::CopyGetters;
use memmap2::Mmap;

use crate::format::{
    crc32c,
    crc32c_combine,
};

/// A value handed back by a lookup: a view into the memory-mapped data
/// file, plus enough metadata for the caller to verify the checksum and
/// decompress.
#[derive(Debug, CopyGetters)]
pub struct ValueRef {
    mmap: Arc<Mmap>,
    /// Offset of the stored value bytes within the file.
    #[get_copy = "pub"]
    offset: usize,
    /// Logical (uncompressed) value size.
    #[get_copy = "pub"]
    size: u64,
    /// Compressed size; zero when the value is stored uncompressed.
    #[get_copy = "pub"]
    size_compressed: u64,
    /// The entry CRC32C as stored in the entry header. Covers the header
    /// (minus the checksum itself), the key, and the stored value bytes.
    #[get_copy = "pub"]
    crc32: u32,
    /// CRC32C over the header (minus the checksum) and the key, so the
    /// caller can fold in a digest of the value bytes alone.
    #[get_copy = "pub"]
    crc32_header_key: u32,
}

impl ValueRef {
    pub(crate) fn new(
        mmap: Arc<Mmap>,
        offset: usize,
        size: u64,
        size_compressed: u64,
        crc32: u32,
        crc32_header_key: u32,
    ) -> Self {
        ValueRef {
            mmap,
            offset,
            size,
            size_compressed,
            crc32,
            crc32_header_key,
        }
    }

    /// The stored value bytes. Compressed when [`ValueRef::is_compressed`]
    /// says so; the caller decompresses to [`ValueRef::size`] bytes.
    pub fn data(&self) -> &[u8] {
        let stored = if self.size_compressed > 0 {
            self.size_compressed
        } else {
            self.size
        };
        &self.mmap[self.offset..self.offset + stored as usize]
    }

    pub fn is_compressed(&self) -> bool {
        self.size_compressed > 0
    }

    /// Check the stored entry checksum against the mapped bytes.
    pub fn verify(&self) -> bool {
        let data = self.data();
        crc32c_combine(self.crc32_header_key, crc32c(data), data.len() as u64) == self.crc32
    }
}

/// Internal view of the key bytes of an on-disk entry.
#[derive(Debug)]
pub(crate) struct KeyRef {
    mmap: Arc<Mmap>,
    offset: usize,
    len: usize,
}

impl KeyRef {
    pub(crate) fn new(mmap: Arc<Mmap>, offset: usize, len: usize) -> Self {
        KeyRef { mmap, offset, len }
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.mmap[self.offset..self.offset + self.len]
    }
}
