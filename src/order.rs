// Copyright (c) Sienna Satterwhite, FelixDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use bytes::Bytes;

use crate::format::CRC32C;

/// Identifies the producer of a stream of chunked orders. Two simultaneous
/// streams for the same key from different writers must not collide, so
/// in-flight chunk state is keyed by `(writer, key)`.
pub type WriterId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Put,
    Remove,
}

/// A write intent delivered to the engine: a Put or Remove, either whole or
/// as one chunk of a streamed value.
///
/// `crc32` is the CRC32C over the key and the full stored value; for a
/// chunked stream the producer accumulates it across chunks and supplies
/// the final digest with the last chunk.
#[derive(Debug, Clone)]
pub struct Order {
    pub writer: WriterId,
    pub order_type: OrderType,
    pub key: Bytes,
    pub chunk: Bytes,
    pub offset_chunk: u64,
    pub size_value: u64,
    pub size_value_compressed: u64,
    pub crc32: u32,
}

impl Order {
    /// A whole-value put.
    pub fn put(writer: WriterId, key: Bytes, value: Bytes) -> Self {
        let mut digest = CRC32C.digest();
        digest.update(&key);
        digest.update(&value);
        let crc32 = digest.finalize();
        Order {
            writer,
            order_type: OrderType::Put,
            size_value: value.len() as u64,
            size_value_compressed: 0,
            key,
            chunk: value,
            offset_chunk: 0,
            crc32,
        }
    }

    /// One chunk of a streamed put. `crc32` only has to be final on the
    /// last chunk.
    pub fn put_chunk(
        writer: WriterId,
        key: Bytes,
        chunk: Bytes,
        offset_chunk: u64,
        size_value: u64,
        size_value_compressed: u64,
        crc32: u32,
    ) -> Self {
        Order {
            writer,
            order_type: OrderType::Put,
            key,
            chunk,
            offset_chunk,
            size_value,
            size_value_compressed,
            crc32,
        }
    }

    pub fn remove(writer: WriterId, key: Bytes) -> Self {
        Order {
            writer,
            order_type: OrderType::Remove,
            key,
            chunk: Bytes::new(),
            offset_chunk: 0,
            size_value: 0,
            size_value_compressed: 0,
            crc32: 0,
        }
    }

    /// Total bytes the stored value occupies.
    pub fn value_total(&self) -> u64 {
        if self.size_value_compressed > 0 {
            self.size_value_compressed
        } else {
            self.size_value
        }
    }

    pub fn is_first_chunk(&self) -> bool {
        self.offset_chunk == 0
    }

    pub fn is_last_chunk(&self) -> bool {
        self.offset_chunk + self.chunk.len() as u64 >= self.value_total()
    }

    pub fn is_self_contained(&self) -> bool {
        self.is_first_chunk() && self.is_last_chunk()
    }
}
