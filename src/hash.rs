// Copyright (c) Sienna Satterwhite, FelixDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use xxhash_rust::{
    xxh3::xxh3_64,
    xxh64::xxh64,
};

/// Which digest is used to hash raw keys into the index. The hash only
/// drives bucketing; raw keys are compared byte-for-byte at read time, so
/// collisions are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Xxh3,
    Xxh64,
}

pub(crate) fn hashed_key(kind: HashKind, data: &[u8]) -> u64 {
    match kind {
        | HashKind::Xxh3 => xxh3_64(data),
        | HashKind::Xxh64 => xxh64(data, 0),
    }
}
