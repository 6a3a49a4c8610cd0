// Copyright (c) Sienna Satterwhite, FelixDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::collections::BTreeMap;

/// Multimap from hashed key to entry locations. Within a bucket the
/// insertion order is preserved, so the newest location for a bucket is the
/// last one; readers traverse buckets in reverse.
///
/// Collisions are expected and harmless: raw keys are compared against the
/// on-disk entry at read time.
#[derive(Debug, Default)]
pub(crate) struct LocationIndex {
    buckets: BTreeMap<u64, Vec<u64>>,
}

impl LocationIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, hashed_key: u64, location: u64) {
        self.buckets.entry(hashed_key).or_default().push(location);
    }

    pub(crate) fn bucket(&self, hashed_key: u64) -> &[u64] {
        self.buckets
            .get(&hashed_key)
            .map(|locations| locations.as_slice())
            .unwrap_or(&[])
    }

    pub(crate) fn bucket_cloned(&self, hashed_key: u64) -> Vec<u64> {
        self.bucket(hashed_key).to_vec()
    }

    pub(crate) fn remove_bucket(&mut self, hashed_key: u64) -> Option<Vec<u64>> {
        self.buckets.remove(&hashed_key)
    }

    /// Fold `other` into this index, appending each of its buckets after
    /// the existing locations (its contents are newer).
    pub(crate) fn merge(&mut self, other: LocationIndex) {
        for (hashed_key, locations) in other.buckets {
            self.buckets.entry(hashed_key).or_default().extend(locations);
        }
    }

    pub(crate) fn hashes(&self) -> impl Iterator<Item = u64> + '_ {
        self.buckets.keys().copied()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u64, &Vec<u64>)> {
        self.buckets.iter().map(|(hash, locations)| (*hash, locations))
    }

    /// Total number of indexed locations.
    pub(crate) fn len(&self) -> usize {
        self.buckets.values().map(|locations| locations.len()).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
