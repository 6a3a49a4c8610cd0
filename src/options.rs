// Copyright (c) Sienna Satterwhite, FelixDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::time::Duration;

use crate::hash::HashKind;

/// Soft cap on the size of a single data file. Entries whose key and value
/// together exceed it get a dedicated large file instead.
pub const DEFAULT_BLOCK_SIZE: u64 = 64 << 20;
pub const DEFAULT_LOCKS_DIRNAME: &str = "locks";
pub const DEFAULT_COMPACTION_PREFIX: &str = "compaction_";
pub const DEFAULT_COMPACTION_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// The set of database options recognized by the storage core.
#[derive(Clone, Debug)]
pub struct DbOptions {
    /// Create the database directory (and its locks subdirectory) when it
    /// does not exist yet.
    pub create_if_missing: bool,
    /// The digest used to hash raw keys into the index.
    pub hash_kind: HashKind,
    /// Per-file soft size cap. This is a soft limit: the file that crosses
    /// it is completed and a fresh one is opened.
    pub block_size: u64,
    /// Whether values are stored compressed. Compression itself happens
    /// above the storage core; this flag only drives padding bookkeeping
    /// for streamed values.
    pub compression_enabled: bool,
    /// Name of the subdirectory holding snapshot pin files.
    pub locks_dirname: String,
    /// Filename prefix for compaction outputs still being written.
    pub compaction_prefix: String,
    /// How often the compaction thread polls for a pending trigger.
    pub compaction_poll_interval: Duration,
}

impl DbOptions {
    pub fn new() -> Self {
        Self {
            create_if_missing: true,
            hash_kind: HashKind::Xxh3,
            block_size: DEFAULT_BLOCK_SIZE,
            compression_enabled: false,
            locks_dirname: DEFAULT_LOCKS_DIRNAME.to_string(),
            compaction_prefix: DEFAULT_COMPACTION_PREFIX.to_string(),
            compaction_poll_interval: DEFAULT_COMPACTION_POLL_INTERVAL,
        }
    }

    pub fn create_if_missing(&mut self, create_if_missing: bool) -> &mut Self {
        self.create_if_missing = create_if_missing;
        self
    }

    pub fn hash_kind(&mut self, hash_kind: HashKind) -> &mut Self {
        self.hash_kind = hash_kind;
        self
    }

    pub fn block_size(&mut self, block_size: u64) -> &mut Self {
        self.block_size = block_size;
        self
    }

    pub fn compression_enabled(&mut self, compression_enabled: bool) -> &mut Self {
        self.compression_enabled = compression_enabled;
        self
    }

    pub fn compaction_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.compaction_poll_interval = interval;
        self
    }
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = DbOptions::default();
        assert!(opts.create_if_missing);
        assert_eq!(opts.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(opts.locks_dirname, "locks");
        assert_eq!(opts.compaction_prefix, "compaction_");
    }

    #[test]
    fn test_builder_chain() {
        let opts = DbOptions::new()
            .block_size(4096)
            .compression_enabled(true)
            .clone();
        assert_eq!(opts.block_size, 4096);
        assert!(opts.compression_enabled);
    }
}
