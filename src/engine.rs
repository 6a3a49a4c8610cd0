// Copyright (c) Sienna Satterwhite, FelixDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! The storage engine shell: owns the live index and its compaction
//! shadow, the reader/writer discipline, the worker threads, and the
//! snapshot bookkeeping.
//!
//! Writes travel through three rendezvous hops:
//!
//! ```text
//! caller -> [flush_buffer] -> order writer -> [update_index] ->
//!     index updater -> [clear_buffer] -> caller
//! ```
//!
//! so a batch is on disk and indexed by the time the caller returns.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
        HashSet,
    },
    fs::{
        self,
        File,
    },
    io,
    path::{
        Path,
        PathBuf,
    },
    sync::{
        atomic::{
            AtomicBool,
            Ordering::SeqCst,
        },
        Arc,
    },
    thread::{
        self,
        JoinHandle,
    },
};

use bytes::Bytes;
use crossbeam_channel::{
    bounded,
    Receiver,
    RecvTimeoutError,
    Sender,
};
use memmap2::Mmap;
use parking_lot::{
    Condvar,
    Mutex,
    MutexGuard,
};
use tracing::{
    debug,
    error,
    trace,
    warn,
};

use crate::{
    errs::{
        Result,
        StorageError::{
            self,
            Io,
            NotFound,
            RemoveOrder,
        },
    },
    events::Rendezvous,
    format::{
        crc32c,
        location_fileid,
        location_offset,
        pack_location,
        EntryHeader,
        FileFooter,
        FileHeader,
        FileKind,
        FILE_FOOTER_SIZE,
        FILE_HEADER_SIZE,
    },
    hash::hashed_key,
    index::LocationIndex,
    logfile::{
        remove_files_with_prefix,
        LogFileManager,
    },
    options::DbOptions,
    order::Order,
    resources::ResourceTable,
    value::{
        KeyRef,
        ValueRef,
    },
};

/// How many index buckets the compaction swap rewrites per writer-lock
/// hold, so readers keep making progress while the swap runs.
const SWAP_BUCKETS_PER_LOCK: usize = 10;

#[derive(Default)]
struct Indexes {
    live: LocationIndex,
    /// Writes that arrive while a compaction runs land here, and get
    /// folded into the live index when the compaction finishes. Readers
    /// consult it first, so reads never go dark.
    shadow: LocationIndex,
}

#[derive(Default)]
struct SnapshotRegistry {
    sequence: u32,
    /// Per live snapshot, the files whose deletion it delays.
    fileids: BTreeMap<u32, BTreeSet<u32>>,
    /// How many live snapshots still pin each file pending deletion.
    unused_refs: BTreeMap<u32, u32>,
}

pub(crate) struct EngineInner {
    opts: DbOptions,
    db_path: PathBuf,
    read_only: bool,

    manager: Mutex<LogFileManager>,
    manager_compaction: Mutex<LogFileManager>,
    resources: Arc<ResourceTable>,

    indexes: Mutex<Indexes>,
    compaction_in_progress: Mutex<bool>,

    // writer-priority reader/writer discipline: a writer parks on the
    // condvar until the reader count drains, and new readers serialize
    // behind it through the write mutex
    write_mutex: Mutex<()>,
    num_readers: Mutex<u32>,
    cv_readers: Condvar,

    flush_buffer: Rendezvous<Vec<Order>>,
    update_index: Rendezvous<Vec<(u64, u64)>>,
    clear_buffer: Rendezvous<u32>,
    /// Serializes batch submissions, so at most one batch is in flight.
    pipeline: Mutex<()>,
    last_write_error: Mutex<Option<StorageError>>,

    pending_compaction: Mutex<Option<(u32, u32)>>,
    snapshots: Mutex<SnapshotRegistry>,

    stop_requested: AtomicBool,
    is_closed: Mutex<bool>,
}

struct ReadGuard<'a> {
    inner: &'a EngineInner,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        *self.inner.num_readers.lock() -= 1;
        self.inner.cv_readers.notify_one();
    }
}

/// A persistent, crash-tolerant log-structured key-value store.
pub struct StorageEngine {
    inner: Arc<EngineInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
}

impl StorageEngine {
    /// Open (and load) the database at `path`, spawning the worker
    /// threads.
    pub fn open(opts: DbOptions, path: impl AsRef<Path>) -> Result<Self> {
        Self::open_internal(opts, path.as_ref(), false, None, 0)
    }

    /// Open a read-only instance: no directory cleanup, no recovery
    /// writes, no worker threads. This is the snapshot consumer:
    /// `fileids_ignore` holds the files the snapshot must not see, and
    /// `fileid_end` bounds the load to files that existed when the
    /// snapshot was taken (zero means unbounded).
    pub fn open_read_only(
        opts: DbOptions,
        path: impl AsRef<Path>,
        fileids_ignore: BTreeSet<u32>,
        fileid_end: u32,
    ) -> Result<Self> {
        Self::open_internal(opts, path.as_ref(), true, Some(fileids_ignore), fileid_end)
    }

    fn open_internal(
        opts: DbOptions,
        path: &Path,
        read_only: bool,
        fileids_ignore: Option<BTreeSet<u32>>,
        fileid_end: u32,
    ) -> Result<Self> {
        debug!(path = %path.display(), read_only, "opening storage engine");
        let mut manager = LogFileManager::new(
            opts.clone(),
            path,
            "",
            FileKind::UncompactedLog,
            read_only,
        );
        let mut index = LocationIndex::new();
        manager.load_database(&mut index, fileids_ignore.as_ref(), fileid_end)?;
        let resources = manager.resources();

        let manager_compaction = LogFileManager::new(
            opts.clone(),
            path,
            &opts.compaction_prefix,
            FileKind::CompactedLog,
            read_only,
        );

        let inner = Arc::new(EngineInner {
            opts,
            db_path: path.to_path_buf(),
            read_only,
            manager: Mutex::new(manager),
            manager_compaction: Mutex::new(manager_compaction),
            resources,
            indexes: Mutex::new(Indexes {
                live: index,
                shadow: LocationIndex::new(),
            }),
            compaction_in_progress: Mutex::new(false),
            write_mutex: Mutex::new(()),
            num_readers: Mutex::new(0),
            cv_readers: Condvar::new(),
            flush_buffer: Rendezvous::new(),
            update_index: Rendezvous::new(),
            clear_buffer: Rendezvous::new(),
            pipeline: Mutex::new(()),
            last_write_error: Mutex::new(None),
            pending_compaction: Mutex::new(None),
            snapshots: Mutex::new(SnapshotRegistry::default()),
            stop_requested: AtomicBool::new(false),
            is_closed: Mutex::new(false),
        });

        let engine = StorageEngine {
            inner,
            threads: Mutex::new(Vec::new()),
            stop_tx: Mutex::new(None),
        };
        if !read_only {
            engine.spawn_workers();
        }
        Ok(engine)
    }

    fn spawn_workers(&self) {
        let mut threads = self.threads.lock();

        let inner = Arc::clone(&self.inner);
        threads.push(thread::spawn(move || data_loop(inner)));

        let inner = Arc::clone(&self.inner);
        threads.push(thread::spawn(move || index_loop(inner)));

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let inner = Arc::clone(&self.inner);
        threads.push(thread::spawn(move || compaction_loop(inner, stop_rx)));
        *self.stop_tx.lock() = Some(stop_tx);
    }

    /// Store `value` under `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.apply(vec![Order::put(
            0,
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
        )])
    }

    /// Tombstone every stored version of `key`.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.apply(vec![Order::remove(0, Bytes::copy_from_slice(key))])
    }

    /// Push a batch of orders through the write pipeline. Returns once the
    /// batch is on disk and indexed.
    pub fn apply(&self, orders: Vec<Order>) -> Result<()> {
        if self.inner.read_only {
            return Err(Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "engine is read-only",
            )));
        }
        let _pipeline = self.inner.pipeline.lock();
        if self.inner.stop_requested.load(SeqCst) {
            return Err(Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "engine is closed",
            )));
        }

        self.inner.flush_buffer.start_and_block_until_done(orders);
        let _ = self.inner.clear_buffer.wait();
        self.inner.clear_buffer.done();

        match self.inner.last_write_error.lock().take() {
            | Some(e) => Err(e),
            | None => Ok(()),
        }
    }

    /// Look up the newest value stored under `key`. A tombstoned, damaged,
    /// or never-written key is uniformly `NotFound`.
    pub fn get(&self, key: &[u8]) -> Result<ValueRef> {
        match self.inner.get(key) {
            | Err(RemoveOrder) => Err(NotFound),
            | other => other,
        }
    }

    /// Compact all live entries in files `[fileid_start, fileid_end]` into
    /// fresh files and delete the inputs (or leave them pinned for live
    /// snapshots).
    pub fn compact(&self, fileid_start: u32, fileid_end: u32) -> Result<()> {
        if self.inner.read_only {
            return Err(Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "engine is read-only",
            )));
        }
        self.inner.compaction(fileid_start, fileid_end)
    }

    /// Queue a compaction for the background thread's next poll.
    pub fn trigger_compaction(&self, fileid_start: u32, fileid_end: u32) {
        *self.inner.pending_compaction.lock() = Some((fileid_start, fileid_end));
    }

    /// Complete the current data file so everything written so far sits in
    /// footered files. Snapshot consumers call this before snapshotting.
    pub fn flush_current_file(&self) -> Result<()> {
        if self.inner.read_only {
            return Ok(());
        }
        let _write = self.inner.write_guard();
        let mut manager = self.inner.manager.lock();
        manager.flush_current_file(true, 0)?;
        Ok(())
    }

    /// The id of the most recently allocated data file.
    pub fn fileid_sequence(&self) -> u32 {
        self.inner.manager.lock().fileid_sequence()
    }

    /// Register a snapshot: returns its id and the set of file ids the
    /// snapshot consumer must ignore (files that are already scheduled for
    /// deletion and only survive for older snapshots).
    pub fn new_snapshot(&self) -> (u32, BTreeSet<u32>) {
        let mut snapshots = self.inner.snapshots.lock();
        snapshots.sequence += 1;
        let snapshot_id = snapshots.sequence;
        let fileids_ignore: BTreeSet<u32> = snapshots.unused_refs.keys().copied().collect();
        snapshots.fileids.insert(snapshot_id, BTreeSet::new());
        debug!(snapshot_id, "snapshot registered");
        (snapshot_id, fileids_ignore)
    }

    /// Release a snapshot, deleting any pinned file nobody else pins.
    pub fn release_snapshot(&self, snapshot_id: u32) -> Result<()> {
        self.inner.release_snapshot(snapshot_id)
    }

    /// Release every live snapshot.
    pub fn release_all_snapshots(&self) -> Result<()> {
        let ids: Vec<u32> = self.inner.snapshots.lock().fileids.keys().copied().collect();
        for snapshot_id in ids {
            let _ = self.inner.release_snapshot(snapshot_id);
        }
        Ok(())
    }

    /// Shut the engine down: drain readers, complete the current file,
    /// stop and join the workers, release snapshots. Idempotent.
    pub fn close(&self) {
        let mut is_closed = self.inner.is_closed.lock();
        if *is_closed {
            return;
        }
        *is_closed = true;

        if self.inner.read_only {
            return;
        }

        // no batch may be in flight while the workers wind down
        let _pipeline = self.inner.pipeline.lock();
        self.inner.stop_requested.store(true, SeqCst);

        {
            let _write = self.inner.write_guard();
            self.inner.manager.lock().close();
        }

        self.inner.flush_buffer.notify_waiters();
        self.inner.update_index.notify_waiters();
        *self.stop_tx.lock() = None;

        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }

        let _ = self.release_all_snapshots();
        debug!("storage engine closed");
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.close();
    }
}

fn data_loop(inner: Arc<EngineInner>) {
    loop {
        let Some(orders) = inner.flush_buffer.wait() else {
            return;
        };
        if inner.stop_requested.load(SeqCst) {
            inner.flush_buffer.done();
            return;
        }
        trace!(num_orders = orders.len(), "write batch received");

        let result = {
            let _write = inner.write_guard();
            let mut manager = inner.manager.lock();
            manager.write_orders(&orders)
        };
        inner.flush_buffer.done();

        let map_index = match result {
            | Ok(map_index) => map_index,
            | Err(e) => {
                error!("write batch failed: {e}");
                *inner.last_write_error.lock() = Some(e);
                Vec::new()
            },
        };
        inner.update_index.start_and_block_until_done(map_index);
    }
}

fn index_loop(inner: Arc<EngineInner>) {
    loop {
        let Some(updates) = inner.update_index.wait() else {
            return;
        };
        if inner.stop_requested.load(SeqCst) {
            inner.update_index.done();
            return;
        }

        {
            let mut indexes = inner.indexes.lock();
            let to_shadow = *inner.compaction_in_progress.lock();
            let target = if to_shadow {
                &mut indexes.shadow
            } else {
                &mut indexes.live
            };
            for (hashed_key, location) in updates {
                target.insert(hashed_key, location);
            }
        }
        inner.update_index.done();
        inner.clear_buffer.start_and_block_until_done(1);
    }
}

fn compaction_loop(inner: Arc<EngineInner>, stop_rx: Receiver<()>) {
    loop {
        match stop_rx.recv_timeout(inner.opts.compaction_poll_interval) {
            | Err(RecvTimeoutError::Timeout) => {
                let pending = inner.pending_compaction.lock().take();
                if let Some((fileid_start, fileid_end)) = pending {
                    if let Err(e) = inner.compaction(fileid_start, fileid_end) {
                        error!(fileid_start, fileid_end, "compaction failed: {e}");
                    }
                }
            },
            | _ => return,
        }
    }
}

impl EngineInner {
    fn write_guard(&self) -> MutexGuard<'_, ()> {
        let guard = self.write_mutex.lock();
        let mut num_readers = self.num_readers.lock();
        while *num_readers > 0 {
            self.cv_readers.wait(&mut num_readers);
        }
        guard
    }

    fn read_guard(&self) -> ReadGuard<'_> {
        // passing through the write mutex orders new readers behind any
        // pending writer; without it a stream of readers starves the
        // writer indefinitely
        let write = self.write_mutex.lock();
        *self.num_readers.lock() += 1;
        drop(write);
        ReadGuard { inner: self }
    }

    fn data_filepath(&self, fileid: u32) -> PathBuf {
        self.db_path.join(format!("{:08X}", fileid))
    }

    fn lock_filepath(&self, fileid: u32) -> PathBuf {
        self.db_path
            .join(&self.opts.locks_dirname)
            .join(format!("{:08X}", fileid))
    }

    fn get(&self, key: &[u8]) -> Result<ValueRef> {
        let _read = self.read_guard();

        let in_compaction = *self.compaction_in_progress.lock();
        if in_compaction {
            // the shadow holds anything written since the compaction
            // started; a hit or a tombstone there is definitive
            match self.get_with_index(true, key) {
                | Err(NotFound) => {},
                | other => return other,
            }
        }
        self.get_with_index(false, key)
    }

    fn get_with_index(&self, shadow: bool, key: &[u8]) -> Result<ValueRef> {
        let hkey = hashed_key(self.opts.hash_kind, key);
        let bucket = {
            let indexes = self.indexes.lock();
            let index = if shadow {
                &indexes.shadow
            } else {
                &indexes.live
            };
            index.bucket_cloned(hkey)
        };

        // newest to oldest
        for &location in bucket.iter().rev() {
            let (entry_key, value) = match self.read_entry(location) {
                | Ok((entry_key, value, _)) => (entry_key, value),
                | Err(e) => {
                    warn!(location, "skipping unreadable entry: {e}");
                    continue;
                },
            };
            if entry_key.data() == key {
                return match value {
                    | Some(value) => Ok(value),
                    | None => Err(RemoveOrder),
                };
            }
        }
        Err(NotFound)
    }

    /// Read the entry at `location` through a fresh mapping of its file.
    /// The value is `None` for a remove entry.
    fn read_entry(&self, location: u64) -> Result<(KeyRef, Option<ValueRef>, EntryHeader)> {
        let fileid = location_fileid(location);
        let offset = location_offset(location) as usize;
        let path = self.data_filepath(fileid);

        let file = match File::open(&path) {
            | Ok(file) => file,
            | Err(e) => return Err(Io(e)),
        };
        let mmap = match unsafe { Mmap::map(&file) } {
            | Ok(mmap) => Arc::new(mmap),
            | Err(e) => return Err(Io(e)),
        };

        if offset >= mmap.len() {
            return Err(StorageError::InvalidFormat(
                "entry offset beyond end of file".into(),
            ));
        }
        let (entry, size_header) = EntryHeader::decode(&mmap[offset..])?;
        if !entry.is_full_shape() {
            return Err(StorageError::InvalidFormat(
                "only full entries are readable".into(),
            ));
        }
        let offset_key = offset + size_header;
        let offset_value = offset_key + entry.size_key as usize;
        let value_end = offset_value + entry.value_used() as usize;
        if value_end > mmap.len() {
            return Err(StorageError::InvalidFormat(
                "entry extends beyond end of file".into(),
            ));
        }

        let crc32_header_key = crc32c(&mmap[offset + 4..offset_value]);
        let entry_key = KeyRef::new(Arc::clone(&mmap), offset_key, entry.size_key as usize);
        if entry.is_remove() {
            return Ok((entry_key, None, entry));
        }
        let value = ValueRef::new(
            mmap,
            offset_value,
            entry.size_value,
            entry.size_value_compressed,
            entry.crc32,
            crc32_header_key,
        );
        Ok((entry_key, Some(value), entry))
    }

    fn release_snapshot(&self, snapshot_id: u32) -> Result<()> {
        let mut snapshots = self.snapshots.lock();
        let Some(fileids) = snapshots.fileids.remove(&snapshot_id) else {
            return Err(Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no snapshot with the given id",
            )));
        };

        for fileid in fileids {
            let Some(refs) = snapshots.unused_refs.get_mut(&fileid) else {
                continue;
            };
            if *refs <= 1 {
                snapshots.unused_refs.remove(&fileid);
                debug!(fileid, "removing file released by last snapshot");
                if let Err(e) = fs::remove_file(self.data_filepath(fileid)) {
                    error!(fileid, "could not remove data file: {e}");
                }
                if let Err(e) = fs::remove_file(self.lock_filepath(fileid)) {
                    error!(fileid, "could not remove lock file: {e}");
                }
                self.resources.remove(fileid);
            } else {
                *refs -= 1;
            }
        }
        Ok(())
    }

    /// Rewrite all live entries found in files `[fileid_start,
    /// fileid_end]` into fresh compacted files, swap them into the live
    /// index, and delete (or pin) the inputs.
    fn compaction(&self, fileid_start: u32, fileid_end: u32) -> Result<()> {
        let result = self.compaction_steps(fileid_start, fileid_end);
        if result.is_err() {
            // fold whatever accumulated in the shadow so reads and writes
            // come back to a single index
            let _write = self.write_guard();
            let mut indexes = self.indexes.lock();
            let shadow = std::mem::take(&mut indexes.shadow);
            indexes.live.merge(shadow);
            *self.compaction_in_progress.lock() = false;
        }
        result
    }

    fn compaction_steps(&self, fileid_start: u32, fileid_end: u32) -> Result<()> {
        debug!(fileid_start, fileid_end, "compaction started");

        // files created after this point are beyond the compacted range,
        // and the open file has no footer yet, so both stay untouched
        let fileid_end = fileid_end.min(self.manager.lock().fileid_sequence());
        let current_fileid = self.manager.lock().current_fileid();

        // 1. mark in progress, clean up leftovers of crashed compactions
        *self.compaction_in_progress.lock() = true;
        remove_files_with_prefix(&self.db_path, &self.opts.compaction_prefix)?;
        self.manager_compaction.lock().set_fileid_sequence(0);

        // 2. load the footer index of every file in range
        let mut index_inputs = LocationIndex::new();
        let entries = match fs::read_dir(&self.db_path) {
            | Ok(entries) => entries,
            | Err(e) => return Err(Io(e)),
        };
        for dir_entry in entries.flatten() {
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&self.opts.compaction_prefix) {
                continue;
            }
            let Some(fileid) = LogFileManager::parse_fileid(&name) else {
                continue;
            };
            if fileid < fileid_start
                || fileid > fileid_end
                || Some(fileid) == current_fileid
                || self.resources.is_compacted(fileid)
            {
                continue;
            }
            let metadata = match dir_entry.metadata() {
                | Ok(metadata) => metadata,
                | Err(_) => continue,
            };
            if !metadata.is_file() || metadata.len() <= FILE_HEADER_SIZE {
                continue;
            }
            let file = match File::open(dir_entry.path()) {
                | Ok(file) => file,
                | Err(_) => continue,
            };
            let mmap = match unsafe { Mmap::map(&file) } {
                | Ok(mmap) => mmap,
                | Err(_) => continue,
            };
            match LogFileManager::load_file(&mmap, fileid, &mut index_inputs) {
                | Ok(_) => {},
                | Err(e) => warn!(fileid, "could not load compaction input ({e}), skipping"),
            }
        }

        // 3. every live location whose hash appears in the inputs is a
        // candidate
        let candidates: Vec<(u64, u64)> = {
            let indexes = self.indexes.lock();
            let mut candidates = Vec::new();
            for hkey in index_inputs.hashes() {
                for &location in indexes.live.bucket(hkey) {
                    candidates.push((hkey, location));
                }
            }
            candidates
        };

        // 4. classify, newest first: the first sighting of a raw key is
        // kept (unless it is a tombstone), everything older is deleted
        let mut fileids_compaction: BTreeSet<u32> = BTreeSet::new();
        let mut fileids_large_keep: BTreeSet<u32> = BTreeSet::new();
        let mut locations_delete: BTreeSet<u64> = BTreeSet::new();
        let mut hashes_classified: BTreeSet<u64> = BTreeSet::new();
        let mut keys_encountered: HashSet<Bytes> = HashSet::new();
        let mut regular_keep = LocationIndex::new();
        let mut large_keep: Vec<(u64, u64)> = Vec::new();

        for &(hkey, location) in candidates.iter().rev() {
            let fileid = location_fileid(location);
            if fileid > fileid_end || Some(fileid) == current_fileid {
                // this location is not rewritten, but it is still the
                // newest sighting of its key: any in-range version seen
                // after it is stale, so the key must be marked
                match self.read_entry(location) {
                    | Ok((entry_key, _, _)) => {
                        keys_encountered.insert(Bytes::copy_from_slice(entry_key.data()));
                    },
                    | Err(e) => warn!(location, "unreadable out-of-range candidate: {e}"),
                }
                continue;
            }
            fileids_compaction.insert(fileid);
            hashes_classified.insert(hkey);
            match self.read_entry(location) {
                | Ok((entry_key, value, _)) => {
                    let raw_key = Bytes::copy_from_slice(entry_key.data());
                    if keys_encountered.insert(raw_key) {
                        if self.resources.is_large(fileid) {
                            large_keep.push((hkey, location));
                            fileids_large_keep.insert(fileid);
                        } else if value.is_some() {
                            regular_keep.insert(hkey, location);
                        } else {
                            // remove orders do not survive compaction
                            locations_delete.insert(location);
                        }
                    } else {
                        locations_delete.insert(location);
                    }
                },
                | Err(e) => {
                    warn!(location, "unreadable candidate entry ({e}), dropping it");
                    locations_delete.insert(location);
                },
            }
        }
        drop(keys_encountered);

        // 5. cluster colliding keys on their smallest location, so every
        // version of a colliding bucket is rewritten alongside its head
        let mut clusters: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        let mut locations_secondary: BTreeSet<u64> = BTreeSet::new();
        for (_, bucket) in regular_keep.iter() {
            let mut locations = bucket.clone();
            locations.sort_unstable();
            for &location in &locations[1..] {
                locations_secondary.insert(location);
            }
            clusters.insert(locations[0], locations);
        }

        // 6. map every input file that is not a pinned large file
        let mut mmaps: BTreeMap<u32, Mmap> = BTreeMap::new();
        for &fileid in &fileids_compaction {
            if fileids_large_keep.contains(&fileid) {
                continue;
            }
            let path = self.data_filepath(fileid);
            let file = match File::open(&path) {
                | Ok(file) => file,
                | Err(e) => {
                    error!(fileid, "could not open compaction input: {e}");
                    continue;
                },
            };
            match unsafe { Mmap::map(&file) } {
                | Ok(mmap) => {
                    mmaps.insert(fileid, mmap);
                },
                | Err(e) => error!(fileid, "could not map compaction input: {e}"),
            }
        }
        fileids_compaction.retain(|fileid| {
            mmaps.contains_key(fileid) || fileids_large_keep.contains(fileid)
        });

        // 7. build the order list from the surviving entries
        let mut orders: Vec<Order> = Vec::new();
        let mut timestamp_max = 0u64;
        for (&fileid, mmap) in &mmaps {
            if self.resources.is_large(fileid) {
                continue;
            }
            let header = match FileHeader::decode(&mmap[..]) {
                | Ok(header) => header,
                | Err(e) => {
                    warn!(fileid, "unreadable file header during compaction: {e}");
                    continue;
                },
            };
            timestamp_max = timestamp_max.max(header.timestamp);

            // the footer gives the authoritative end of the entry region;
            // without a valid one, fall back to the file size
            let filesize = mmap.len() as u64;
            let offset_end = if filesize >= FILE_HEADER_SIZE + FILE_FOOTER_SIZE {
                match FileFooter::decode(&mmap[(filesize - FILE_FOOTER_SIZE) as usize..]) {
                    | Ok(footer)
                        if footer.has_valid_magic()
                            && footer.offset_index >= FILE_HEADER_SIZE
                            && footer.offset_index <= filesize - 4
                            && crc32c(
                                &mmap[footer.offset_index as usize..(filesize - 4) as usize],
                            ) == footer.crc32 =>
                    {
                        footer.offset_index
                    },
                    | _ => filesize,
                }
            } else {
                filesize
            };

            let mut offset = FILE_HEADER_SIZE as usize;
            while (offset as u64) < offset_end {
                let (entry, size_header) = match EntryHeader::decode(&mmap[offset..]) {
                    | Ok(decoded) => decoded,
                    | Err(_) => break,
                };
                if entry.size_key == 0 {
                    break;
                }
                let advance =
                    size_header + entry.size_key as usize + entry.value_offset() as usize;
                if offset + advance > mmap.len() {
                    break;
                }
                let location = pack_location(fileid, offset as u32);
                if locations_delete.contains(&location)
                    || locations_secondary.contains(&location)
                {
                    offset += advance;
                    continue;
                }

                let members = match clusters.get(&location) {
                    | Some(members) => members.clone(),
                    | None => vec![location],
                };
                for member in members {
                    let member_fileid = location_fileid(member);
                    let member_offset = location_offset(member) as usize;
                    let Some(member_mmap) = mmaps.get(&member_fileid) else {
                        continue;
                    };
                    // decode the member's header from the member's own
                    // file; entry encodings may differ between files
                    let (member_entry, member_size_header) =
                        match EntryHeader::decode(&member_mmap[member_offset..]) {
                            | Ok(decoded) => decoded,
                            | Err(e) => {
                                warn!(member, "unreadable cluster member: {e}");
                                continue;
                            },
                        };
                    let key_start = member_offset + member_size_header;
                    let key_end = key_start + member_entry.size_key as usize;
                    let value_end = key_end + member_entry.value_used() as usize;
                    if value_end > member_mmap.len() {
                        warn!(member, "cluster member extends beyond its file");
                        continue;
                    }
                    // checksums are not verified here: a corrupt entry
                    // simply replicates and the reader keeps catching it
                    orders.push(Order::put_chunk(
                        0,
                        Bytes::copy_from_slice(&member_mmap[key_start..key_end]),
                        Bytes::copy_from_slice(&member_mmap[key_end..value_end]),
                        0,
                        member_entry.size_value,
                        member_entry.size_value_compressed,
                        crc32c(&member_mmap[key_start..value_end]),
                    ));
                }
                offset += advance;
            }
        }
        drop(clusters);
        drop(locations_delete);
        drop(locations_secondary);

        // 8. write the compacted orders through the compaction manager,
        // with the timestamp pinned to the newest input
        let (map_index, num_files_compacted) = {
            let mut manager = self.manager_compaction.lock();
            manager.lock_timestamp_sequence(timestamp_max);
            let map_index = manager.write_orders(&orders)?;
            manager.close_current_file()?;
            (map_index, manager.fileid_sequence())
        };
        drop(orders);
        drop(mmaps);

        // 9. reserve ids for the outputs in the live sequence
        let offset_fileid = self
            .manager
            .lock()
            .increment_fileid_sequence(num_files_compacted)
            - num_files_compacted;

        // 10. move the outputs to their final names
        let compaction_resources = self.manager_compaction.lock().resources();
        for fileid in 1..=num_files_compacted {
            let fileid_new = fileid + offset_fileid;
            let from = self.manager_compaction.lock().filepath(fileid);
            let to = self.data_filepath(fileid_new);
            trace!(from = %from.display(), to = %to.display(), "renaming compaction output");
            match fs::rename(&from, &to) {
                | Ok(_) => {},
                | Err(e) => {
                    error!(from = %from.display(), "could not rename compaction output: {e}");
                    return Err(Io(e));
                },
            }
            self.resources
                .set_size(fileid_new, compaction_resources.size(fileid));
            self.resources.set_compacted(fileid_new);
            compaction_resources.remove(fileid);
        }

        // 11. shift the returned locations to the renamed files, then add
        // the pinned large locations unchanged
        let mut grouped: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for (hkey, location) in map_index {
            let fileid_new = location_fileid(location) + offset_fileid;
            grouped
                .entry(hkey)
                .or_default()
                .push(pack_location(fileid_new, location_offset(location)));
        }
        for (hkey, location) in large_keep {
            grouped.entry(hkey).or_default().push(location);
        }
        // buckets whose every in-range location was dropped (tombstoned or
        // superseded) still need the stale locations swept out, so they go
        // through the swap with nothing to insert
        for hkey in hashes_classified {
            grouped.entry(hkey).or_default();
        }

        // 12. swap into the live index, throttled so readers interleave;
        // locations beyond the compacted range (or in the still-open
        // current file, which took no part in the compaction) must survive
        // the bucket rewrite
        let mut write_guard = None;
        let mut buckets_under_lock = 0;
        for (hkey, locations) in &grouped {
            if write_guard.is_none() {
                write_guard = Some(self.write_guard());
            }
            {
                let mut indexes = self.indexes.lock();
                let existing = indexes.live.remove_bucket(*hkey).unwrap_or_default();
                let locations_after: Vec<u64> = existing
                    .into_iter()
                    .filter(|&location| {
                        location_fileid(location) > fileid_end
                            || Some(location_fileid(location)) == current_fileid
                    })
                    .collect();
                for &location in locations {
                    indexes.live.insert(*hkey, location);
                }
                for location in locations_after {
                    indexes.live.insert(*hkey, location);
                }
            }
            buckets_under_lock += 1;
            if buckets_under_lock >= SWAP_BUCKETS_PER_LOCK {
                write_guard = None;
                buckets_under_lock = 0;
            }
        }
        drop(write_guard);

        // 13. fold the shadow index into the live one and leave the
        // compaction state
        {
            let _write = self.write_guard();
            let mut indexes = self.indexes.lock();
            let shadow = std::mem::take(&mut indexes.shadow);
            indexes.live.merge(shadow);
            *self.compaction_in_progress.lock() = false;
        }

        // 14. delete the inputs, or pin them for every live snapshot
        {
            let mut snapshots = self.snapshots.lock();
            let num_snapshots = snapshots.fileids.len() as u32;
            for &fileid in &fileids_compaction {
                if fileids_large_keep.contains(&fileid) {
                    continue;
                }
                if num_snapshots == 0 {
                    trace!(fileid, "removing compacted input");
                    if let Err(e) = fs::remove_file(self.data_filepath(fileid)) {
                        error!(fileid, "could not remove compacted input: {e}");
                    }
                    self.resources.remove(fileid);
                } else {
                    for pinned in snapshots.fileids.values_mut() {
                        pinned.insert(fileid);
                    }
                    *snapshots.unused_refs.entry(fileid).or_insert(0) += num_snapshots;
                    match File::create(self.lock_filepath(fileid)) {
                        | Ok(_) => {},
                        | Err(e) => error!(fileid, "could not create lock file: {e}"),
                    }
                }
            }
        }

        debug!(
            fileid_start,
            fileid_end,
            num_files_compacted,
            "compaction finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;

    use tempfile::tempdir;

    use super::*;
    use crate::format::CRC32C;

    fn small_options() -> DbOptions {
        DbOptions::new().block_size(4096).clone()
    }

    fn open_engine(path: &Path, opts: DbOptions) -> StorageEngine {
        StorageEngine::open(opts, path).expect("open engine")
    }

    fn count_data_files(path: &Path) -> usize {
        fs::read_dir(path)
            .unwrap()
            .flatten()
            .filter(|entry| entry.metadata().map(|m| m.is_file()).unwrap_or(false))
            .filter(|entry| {
                LogFileManager::parse_fileid(&entry.file_name().to_string_lossy()).is_some()
            })
            .count()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path(), small_options());

        engine.put(b"alpha", b"one").unwrap();
        engine.put(b"beta", b"two").unwrap();
        assert_eq!(engine.get(b"alpha").unwrap().data(), b"one");
        assert_eq!(engine.get(b"beta").unwrap().data(), b"two");
        assert!(engine.get(b"alpha").unwrap().verify());
    }

    #[test]
    fn test_get_missing_key() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path(), small_options());
        assert!(matches!(engine.get(b"nope"), Err(NotFound)));
    }

    #[test]
    fn test_last_write_wins() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path(), small_options());

        engine.put(b"k", b"v1").unwrap();
        engine.put(b"k", b"v2").unwrap();
        assert_eq!(engine.get(b"k").unwrap().data(), b"v2");
    }

    #[test]
    fn test_tombstone() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path(), small_options());

        engine.put(b"k", b"v").unwrap();
        engine.remove(b"k").unwrap();
        assert!(matches!(engine.get(b"k"), Err(NotFound)));
    }

    #[test]
    fn test_empty_value() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path(), small_options());
        engine.put(b"k", b"").unwrap();
        assert_eq!(engine.get(b"k").unwrap().data(), b"");
    }

    #[test]
    fn test_durability_across_restart() {
        let dir = tempdir().unwrap();
        {
            let engine = open_engine(dir.path(), small_options());
            engine.put(b"alpha", b"one").unwrap();
            engine.put(b"beta", b"two").unwrap();
            engine.remove(b"beta").unwrap();
            engine.close();
        }

        let engine = open_engine(dir.path(), small_options());
        assert_eq!(engine.get(b"alpha").unwrap().data(), b"one");
        assert!(matches!(engine.get(b"beta"), Err(NotFound)));
    }

    #[test]
    fn test_hundred_small_entries_fit_one_file() {
        let dir = tempdir().unwrap();
        {
            let engine = open_engine(dir.path(), small_options());
            for i in 0..100u32 {
                let key = format!("k{:07}", i);
                let value = format!("v{:015}", i);
                engine.put(key.as_bytes(), value.as_bytes()).unwrap();
            }
            engine.close();
        }

        assert_eq!(count_data_files(dir.path()), 1);

        let file = File::open(dir.path().join(format!("{:08X}", 1))).unwrap();
        let mmap = unsafe { Mmap::map(&file) }.unwrap();
        let footer =
            FileFooter::decode(&mmap[mmap.len() - FILE_FOOTER_SIZE as usize..]).unwrap();
        assert!(footer.has_valid_magic());
        assert_eq!(footer.num_entries, 100);

        let engine = open_engine(dir.path(), small_options());
        for i in 0..100u32 {
            let key = format!("k{:07}", i);
            let value = format!("v{:015}", i);
            assert_eq!(engine.get(key.as_bytes()).unwrap().data(), value.as_bytes());
        }
    }

    #[test]
    fn test_large_entry_dedicated_file() {
        let dir = tempdir().unwrap();
        let opts = DbOptions::new().block_size(256).clone();
        let value = vec![42u8; 10 << 10];
        {
            let engine = open_engine(dir.path(), opts.clone());
            engine.put(b"big", &value).unwrap();
            assert_eq!(engine.get(b"big").unwrap().data(), &value[..]);
            engine.close();
        }
        assert_eq!(count_data_files(dir.path()), 1);

        let engine = open_engine(dir.path(), opts);
        let read = engine.get(b"big").unwrap();
        assert_eq!(read.data(), &value[..]);
        assert!(read.verify());
    }

    #[test]
    fn test_chunked_stream_reassembles() {
        let dir = tempdir().unwrap();
        let opts = DbOptions::new().block_size(4 << 20).clone();
        let engine = open_engine(dir.path(), opts);

        let key = Bytes::from_static(b"streamed");
        let value: Vec<u8> = (0..(1usize << 20)).map(|i| (i % 251) as u8).collect();
        let mut digest = CRC32C.digest();
        digest.update(&key);
        digest.update(&value);
        let crc32_full = digest.finalize();

        let orders: Vec<Order> = value
            .chunks(64 << 10)
            .enumerate()
            .map(|(i, chunk)| {
                Order::put_chunk(
                    7,
                    key.clone(),
                    Bytes::copy_from_slice(chunk),
                    (i * (64 << 10)) as u64,
                    value.len() as u64,
                    0,
                    crc32_full,
                )
            })
            .collect();
        assert_eq!(orders.len(), 16);
        engine.apply(orders).unwrap();

        let read = engine.get(&key).unwrap();
        assert_eq!(read.data(), &value[..]);
        assert!(read.verify());
    }

    #[test]
    fn test_half_written_stream_is_invisible_after_restart() {
        let dir = tempdir().unwrap();
        let opts = DbOptions::new().block_size(4 << 20).clone();
        let key = Bytes::from_static(b"half");
        let value = vec![9u8; 256 << 10];
        {
            let engine = open_engine(dir.path(), opts.clone());
            let orders: Vec<Order> = value
                .chunks(32 << 10)
                .take(4)
                .enumerate()
                .map(|(i, chunk)| {
                    Order::put_chunk(
                        3,
                        key.clone(),
                        Bytes::copy_from_slice(chunk),
                        (i * (32 << 10)) as u64,
                        value.len() as u64,
                        0,
                        0,
                    )
                })
                .collect();
            engine.apply(orders).unwrap();
            engine.close();
        }

        // the entry header was never finalized, so recovery drops it
        let engine = open_engine(dir.path(), opts);
        assert!(matches!(engine.get(&key), Err(NotFound)));
    }

    #[test]
    fn test_concurrent_streams_for_same_key() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path(), small_options());
        let key = Bytes::from_static(b"k");

        let crc_of = |value: &[u8]| {
            let mut digest = CRC32C.digest();
            digest.update(&key);
            digest.update(value);
            digest.finalize()
        };

        // two writers stream the same key, interleaved in one batch
        let orders = vec![
            Order::put_chunk(1, key.clone(), Bytes::from_static(b"AAAA"), 0, 8, 0, 0),
            Order::put_chunk(2, key.clone(), Bytes::from_static(b"BBBB"), 0, 8, 0, 0),
            Order::put_chunk(
                1,
                key.clone(),
                Bytes::from_static(b"aaaa"),
                4,
                8,
                0,
                crc_of(b"AAAAaaaa"),
            ),
            Order::put_chunk(
                2,
                key.clone(),
                Bytes::from_static(b"bbbb"),
                4,
                8,
                0,
                crc_of(b"BBBBbbbb"),
            ),
        ];
        engine.apply(orders).unwrap();

        // the stream that completed last wins, and both reassembled intact
        let read = engine.get(&key).unwrap();
        assert_eq!(read.data(), b"BBBBbbbb");
        assert!(read.verify());
    }

    #[test]
    fn test_compaction_keeps_newest_version() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path(), small_options());

        engine.put(b"a", b"1").unwrap();
        engine.put(b"a", b"2").unwrap();
        engine.put(b"a", b"3").unwrap();
        engine.remove(b"a").unwrap();
        engine.put(b"a", b"4").unwrap();
        assert_eq!(engine.get(b"a").unwrap().data(), b"4");

        engine.flush_current_file().unwrap();
        let fileid_end = engine.fileid_sequence();
        engine.compact(1, fileid_end).unwrap();

        assert_eq!(engine.get(b"a").unwrap().data(), b"4");
        let hkey = hashed_key(engine.inner.opts.hash_kind, b"a");
        assert_eq!(engine.inner.indexes.lock().live.bucket(hkey).len(), 1);
    }

    #[test]
    fn test_compaction_drops_tombstoned_keys() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path(), small_options());

        engine.put(b"dead", b"v").unwrap();
        engine.remove(b"dead").unwrap();
        engine.put(b"live", b"v").unwrap();
        engine.flush_current_file().unwrap();
        engine.compact(1, engine.fileid_sequence()).unwrap();

        assert!(matches!(engine.get(b"dead"), Err(NotFound)));
        assert_eq!(engine.get(b"live").unwrap().data(), b"v");

        // the tombstoned bucket was swept, not left dangling
        let hkey = hashed_key(engine.inner.opts.hash_kind, b"dead");
        assert!(engine.inner.indexes.lock().live.bucket(hkey).is_empty());

        // and the state survives a restart
        engine.close();
        drop(engine);
        let engine = open_engine(dir.path(), small_options());
        assert!(matches!(engine.get(b"dead"), Err(NotFound)));
        let hkey = hashed_key(engine.inner.opts.hash_kind, b"dead");
        assert!(engine.inner.indexes.lock().live.bucket(hkey).is_empty());
    }

    #[test]
    fn test_compaction_shrinks_file_count() {
        let dir = tempdir().unwrap();
        let opts = DbOptions::new().block_size(256).clone();
        let engine = open_engine(dir.path(), opts);

        // many versions spread over several small files
        for round in 0..4 {
            for i in 0..8u32 {
                let key = format!("key-{i}");
                let value = format!("value-{round}-{i}");
                engine.put(key.as_bytes(), value.as_bytes()).unwrap();
            }
        }
        engine.flush_current_file().unwrap();
        let files_before = count_data_files(dir.path());
        assert!(files_before > 1);

        engine.compact(1, engine.fileid_sequence()).unwrap();
        let files_after = count_data_files(dir.path());
        assert!(files_after < files_before);

        for i in 0..8u32 {
            let key = format!("key-{i}");
            let value = format!("value-3-{i}");
            assert_eq!(engine.get(key.as_bytes()).unwrap().data(), value.as_bytes());
        }
    }

    #[test]
    fn test_compaction_is_idempotent() {
        let dir = tempdir().unwrap();
        let opts = DbOptions::new().block_size(256).clone();
        let engine = open_engine(dir.path(), opts);

        for i in 0..8u32 {
            engine
                .put(format!("key-{i}").as_bytes(), format!("value-{i}").as_bytes())
                .unwrap();
        }
        engine.flush_current_file().unwrap();

        engine.compact(1, engine.fileid_sequence()).unwrap();
        let files_first = count_data_files(dir.path());

        engine.compact(1, engine.fileid_sequence()).unwrap();
        let files_second = count_data_files(dir.path());
        assert_eq!(files_first, files_second);

        for i in 0..8u32 {
            assert_eq!(
                engine.get(format!("key-{i}").as_bytes()).unwrap().data(),
                format!("value-{i}").as_bytes()
            );
        }
    }

    #[test]
    fn test_compaction_pins_large_entries() {
        let dir = tempdir().unwrap();
        let opts = DbOptions::new().block_size(256).clone();
        let engine = open_engine(dir.path(), opts);

        let large_value = vec![1u8; 4 << 10];
        engine.put(b"k", b"small").unwrap();
        engine.put(b"k", &large_value).unwrap();
        engine.flush_current_file().unwrap();

        engine.compact(1, engine.fileid_sequence()).unwrap();
        assert_eq!(engine.get(b"k").unwrap().data(), &large_value[..]);

        let hkey = hashed_key(engine.inner.opts.hash_kind, b"k");
        assert_eq!(engine.inner.indexes.lock().live.bucket(hkey).len(), 1);
    }

    #[test]
    fn test_reads_survive_concurrent_compaction() {
        let dir = tempdir().unwrap();
        let engine = StdArc::new(open_engine(dir.path(), small_options()));

        for i in 0..16u32 {
            engine
                .put(format!("key-{i}").as_bytes(), format!("value-{i}").as_bytes())
                .unwrap();
        }
        engine.flush_current_file().unwrap();
        let fileid_end = engine.fileid_sequence();

        let compactor = {
            let engine = StdArc::clone(&engine);
            thread::spawn(move || engine.compact(1, fileid_end))
        };

        // reads never go dark while the compaction runs
        for _ in 0..500 {
            assert_eq!(engine.get(b"key-7").unwrap().data(), b"value-7");
        }
        compactor.join().unwrap().unwrap();
        assert_eq!(engine.get(b"key-7").unwrap().data(), b"value-7");
    }

    #[test]
    fn test_writes_during_compaction_survive() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path(), small_options());

        engine.put(b"old", b"1").unwrap();
        engine.flush_current_file().unwrap();
        let fileid_end = engine.fileid_sequence();

        // a newer version written after the range was chosen but before
        // the compaction ran: the bucket swap must not lose it, and the
        // superseded in-range version must not be rewritten forward
        engine.put(b"old", b"2").unwrap();
        engine.compact(1, fileid_end).unwrap();
        assert_eq!(engine.get(b"old").unwrap().data(), b"2");

        let hkey = hashed_key(engine.inner.opts.hash_kind, b"old");
        assert_eq!(engine.inner.indexes.lock().live.bucket(hkey).len(), 1);
    }

    #[test]
    fn test_snapshot_pins_and_release_deletes() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path(), small_options());

        engine.put(b"k1", b"old-1").unwrap();
        engine.put(b"k2", b"old-2").unwrap();
        engine.flush_current_file().unwrap();
        let fileid_end = engine.fileid_sequence();

        let (snapshot_id, fileids_ignore) = engine.new_snapshot();
        assert!(fileids_ignore.is_empty());

        // newer writes and a compaction that would delete the input file
        engine.put(b"k1", b"new-1").unwrap();
        engine.compact(1, fileid_end).unwrap();

        let pinned = dir.path().join(format!("{:08X}", 1));
        let lock = dir.path().join("locks").join(format!("{:08X}", 1));
        assert!(pinned.exists());
        assert!(lock.exists());

        // the snapshot consumer sees the pre-compaction state
        {
            let snapshot = StorageEngine::open_read_only(
                small_options(),
                dir.path(),
                fileids_ignore,
                fileid_end,
            )
            .unwrap();
            assert_eq!(snapshot.get(b"k1").unwrap().data(), b"old-1");
            assert_eq!(snapshot.get(b"k2").unwrap().data(), b"old-2");
        }

        // the live engine has moved on
        assert_eq!(engine.get(b"k1").unwrap().data(), b"new-1");

        engine.release_snapshot(snapshot_id).unwrap();
        assert!(!pinned.exists());
        assert!(!lock.exists());
    }

    #[test]
    fn test_release_unknown_snapshot_errors() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path(), small_options());
        assert!(engine.release_snapshot(99).is_err());
    }

    #[test]
    fn test_read_only_engine_rejects_writes() {
        let dir = tempdir().unwrap();
        {
            let engine = open_engine(dir.path(), small_options());
            engine.put(b"k", b"v").unwrap();
            engine.close();
        }

        let engine =
            StorageEngine::open_read_only(small_options(), dir.path(), BTreeSet::new(), 0)
                .unwrap();
        assert_eq!(engine.get(b"k").unwrap().data(), b"v");
        assert!(engine.put(b"x", b"y").is_err());
        assert!(engine.compact(1, 1).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path(), small_options());
        engine.put(b"k", b"v").unwrap();
        engine.close();
        engine.close();
        assert!(engine.put(b"x", b"y").is_err());
    }

    #[test]
    fn test_background_compaction_trigger() {
        let dir = tempdir().unwrap();
        let opts = DbOptions::new()
            .block_size(4096)
            .compaction_poll_interval(std::time::Duration::from_millis(10))
            .clone();
        let engine = open_engine(dir.path(), opts);

        engine.put(b"a", b"1").unwrap();
        engine.put(b"a", b"2").unwrap();
        engine.flush_current_file().unwrap();
        engine.trigger_compaction(1, engine.fileid_sequence());

        let hkey = hashed_key(engine.inner.opts.hash_kind, b"a");
        for _ in 0..200 {
            if engine.inner.indexes.lock().live.bucket(hkey).len() == 1 {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(engine.inner.indexes.lock().live.bucket(hkey).len(), 1);
        assert_eq!(engine.get(b"a").unwrap().data(), b"2");
    }
}
