// Copyright (c) Sienna Satterwhite, FelixDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Per-file bookkeeping while the process runs. Rebuilt from disk at
/// startup by the load routine; owns no I/O.
#[derive(Debug, Default)]
struct FileResource {
    size: u64,
    is_large: bool,
    is_compacted: bool,
    has_padding_in_values: bool,
    /// In-flight multi-chunk writers. While this is non-zero the file must
    /// not receive its footer: a crash then leaves the file footer-less,
    /// which forces recovery to re-verify every entry.
    writers: u32,
    /// Footer index accumulated while the file is open, consumed when the
    /// footer is written.
    pending_index: Vec<(u64, u32)>,
}

/// Thread-safe table of per-file metadata, keyed by file id.
#[derive(Debug, Default)]
pub(crate) struct ResourceTable {
    files: Mutex<BTreeMap<u32, FileResource>>,
}

impl ResourceTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Last known on-disk extent of the file.
    pub(crate) fn size(&self, fileid: u32) -> u64 {
        let files = self.files.lock();
        files.get(&fileid).map(|f| f.size).unwrap_or(0)
    }

    pub(crate) fn set_size(&self, fileid: u32, size: u64) {
        let mut files = self.files.lock();
        files.entry(fileid).or_default().size = size;
    }

    /// Atomic add-and-get on the in-flight writer count, so the caller can
    /// compare the result to zero without a second lock.
    pub(crate) fn writers_delta(&self, fileid: u32, delta: i64) -> u32 {
        let mut files = self.files.lock();
        let resource = files.entry(fileid).or_default();
        resource.writers = (resource.writers as i64 + delta).max(0) as u32;
        resource.writers
    }

    pub(crate) fn writers(&self, fileid: u32) -> u32 {
        let files = self.files.lock();
        files.get(&fileid).map(|f| f.writers).unwrap_or(0)
    }

    pub(crate) fn add_index(&self, fileid: u32, hashed_key: u64, offset: u32) {
        let mut files = self.files.lock();
        files
            .entry(fileid)
            .or_default()
            .pending_index
            .push((hashed_key, offset));
    }

    pub(crate) fn index_entries(&self, fileid: u32) -> Vec<(u64, u32)> {
        let files = self.files.lock();
        files
            .get(&fileid)
            .map(|f| f.pending_index.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_large(&self, fileid: u32) {
        self.files.lock().entry(fileid).or_default().is_large = true;
    }

    pub(crate) fn is_large(&self, fileid: u32) -> bool {
        let files = self.files.lock();
        files.get(&fileid).map(|f| f.is_large).unwrap_or(false)
    }

    pub(crate) fn set_compacted(&self, fileid: u32) {
        self.files.lock().entry(fileid).or_default().is_compacted = true;
    }

    pub(crate) fn is_compacted(&self, fileid: u32) -> bool {
        let files = self.files.lock();
        files.get(&fileid).map(|f| f.is_compacted).unwrap_or(false)
    }

    pub(crate) fn set_has_padding(&self, fileid: u32, flag: bool) {
        let mut files = self.files.lock();
        files.entry(fileid).or_default().has_padding_in_values = flag;
    }

    pub(crate) fn has_padding(&self, fileid: u32) -> bool {
        let files = self.files.lock();
        files
            .get(&fileid)
            .map(|f| f.has_padding_in_values)
            .unwrap_or(false)
    }

    /// Clear the open-file state once the footer has been written: writer
    /// count, pending footer index, padding flag. Size and kind flags stay.
    pub(crate) fn reset(&self, fileid: u32) {
        let mut files = self.files.lock();
        if let Some(resource) = files.get_mut(&fileid) {
            resource.writers = 0;
            resource.pending_index.clear();
            resource.has_padding_in_values = false;
        }
    }

    /// Drop all bookkeeping for a deleted file.
    pub(crate) fn remove(&self, fileid: u32) {
        self.files.lock().remove(&fileid);
    }
}
