// Copyright (c) Sienna Satterwhite, FelixDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! The log-file manager: formats, appends to, closes, and recovers data
//! files. Two instances run per engine, one for the live write path and
//! one for compaction output, parameterized by filename prefix and default
//! file kind.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
        HashMap,
    },
    fs::{
        self,
        File,
        OpenOptions,
    },
    os::unix::fs::FileExt,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use bytes::Bytes;
use memmap2::Mmap;
use parking_lot::Mutex;
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
            InvalidFormat,
            Io,
        },
    },
    format::{
        crc32c,
        crc32c_combine,
        location_fileid,
        location_offset,
        pack_location,
        EntryHeader,
        EntryShape,
        EntryType,
        FileFooter,
        FileHeader,
        FileKind,
        FooterFlags,
        FooterIndexEntry,
        CRC32C,
        ENTRY_HEADER_MAX_SIZE,
        FILE_FOOTER_SIZE,
        FILE_HEADER_SIZE,
        FOOTER_INDEX_ENTRY_SIZE,
        MAGIC_NUMBER,
    },
    hash::hashed_key,
    index::LocationIndex,
    options::DbOptions,
    order::{
        Order,
        OrderType,
        WriterId,
    },
    resources::ResourceTable,
};

/// Delete every regular file in `dir` whose name starts with `prefix`.
pub(crate) fn remove_files_with_prefix(dir: &Path, prefix: &str) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        | Ok(entries) => entries,
        | Err(e) => return Err(Io(e)),
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(prefix) {
            continue;
        }
        let is_file = entry.metadata().map(|m| m.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        if let Err(e) = fs::remove_file(entry.path()) {
            warn!(file = %name, "could not remove file: {e}");
        }
    }
    Ok(())
}

struct TimestampSequence {
    value: u64,
    locked: bool,
}

struct CurrentFile {
    file: File,
    fileid: u32,
    /// First byte of the scratch buffer not yet flushed to disk.
    offset_start: u64,
    /// One past the last byte staged in the scratch buffer. Also the
    /// file-absolute write position, since the buffer mirrors the file
    /// from offset zero.
    offset_end: u64,
    buffer_has_items: bool,
}

pub(crate) struct LogFileManager {
    opts: DbOptions,
    db_path: PathBuf,
    locks_path: PathBuf,
    prefix: String,
    default_kind: FileKind,
    read_only: bool,
    resources: Arc<ResourceTable>,

    seq_fileid: Mutex<u32>,
    seq_timestamp: Mutex<TimestampSequence>,

    current: Option<CurrentFile>,
    buffer_data: Vec<u8>,
    buffer_index: Vec<u8>,

    /// In-flight chunk streams, keyed by `(writer, key)` so two writers
    /// streaming the same key stay untangled.
    chunk_locations: HashMap<(WriterId, Bytes), u64>,
    chunk_header_sizes: HashMap<(WriterId, Bytes), u32>,

    is_closed: bool,
}

impl LogFileManager {
    pub(crate) fn new(
        opts: DbOptions,
        db_path: &Path,
        prefix: &str,
        default_kind: FileKind,
        read_only: bool,
    ) -> Self {
        let locks_path = db_path.join(&opts.locks_dirname);
        let buffer_size = 2 * opts.block_size as usize + ENTRY_HEADER_MAX_SIZE;
        let (buffer_data, buffer_index) = if read_only {
            (Vec::new(), Vec::new())
        } else {
            (vec![0u8; buffer_size], vec![0u8; buffer_size])
        };
        LogFileManager {
            opts,
            db_path: db_path.to_path_buf(),
            locks_path,
            prefix: prefix.to_string(),
            default_kind,
            read_only,
            resources: Arc::new(ResourceTable::new()),
            seq_fileid: Mutex::new(0),
            seq_timestamp: Mutex::new(TimestampSequence {
                value: 0,
                locked: false,
            }),
            current: None,
            buffer_data,
            buffer_index,
            chunk_locations: HashMap::new(),
            chunk_header_sizes: HashMap::new(),
            is_closed: false,
        }
    }

    pub(crate) fn resources(&self) -> Arc<ResourceTable> {
        Arc::clone(&self.resources)
    }

    pub(crate) fn filepath(&self, fileid: u32) -> PathBuf {
        self.db_path.join(format!("{}{:08X}", self.prefix, fileid))
    }

    pub(crate) fn lock_filepath(&self, fileid: u32) -> PathBuf {
        self.locks_path.join(format!("{:08X}", fileid))
    }

    /// Parse a data filename into a file id. Case-insensitive.
    pub(crate) fn parse_fileid(name: &str) -> Option<u32> {
        u32::from_str_radix(name, 16).ok()
    }

    pub(crate) fn current_fileid(&self) -> Option<u32> {
        self.current.as_ref().map(|current| current.fileid)
    }

    // File id sequence helpers

    pub(crate) fn fileid_sequence(&self) -> u32 {
        *self.seq_fileid.lock()
    }

    pub(crate) fn set_fileid_sequence(&self, seq: u32) {
        *self.seq_fileid.lock() = seq;
    }

    pub(crate) fn increment_fileid_sequence(&self, inc: u32) -> u32 {
        let mut seq = self.seq_fileid.lock();
        *seq += inc;
        *seq
    }

    // Timestamp sequence helpers

    pub(crate) fn set_timestamp_sequence(&self, value: u64) {
        let mut seq = self.seq_timestamp.lock();
        if !seq.locked {
            seq.value = value;
        }
    }

    pub(crate) fn increment_timestamp_sequence(&self, inc: u64) -> u64 {
        let mut seq = self.seq_timestamp.lock();
        if !seq.locked {
            seq.value += inc;
        }
        seq.value
    }

    /// Pin the timestamp sequence to a fixed value. Every file written
    /// while pinned carries this timestamp, which is how compaction makes
    /// its outputs sort before files written after its inputs.
    pub(crate) fn lock_timestamp_sequence(&self, value: u64) {
        let mut seq = self.seq_timestamp.lock();
        seq.locked = true;
        seq.value = value;
    }

    fn open_new_file(&mut self) -> Result<()> {
        let fileid = self.increment_fileid_sequence(1);
        let timestamp = self.increment_timestamp_sequence(1);
        let path = self.filepath(fileid);
        let file = match OpenOptions::new().write(true).create(true).open(&path) {
            | Ok(file) => file,
            | Err(e) => {
                error!(path = %path.display(), "could not open data file: {e}");
                return Err(Io(e));
            },
        };

        let header = FileHeader {
            kind: self.default_kind,
            timestamp,
        };
        header.encode_into(&mut self.buffer_data[..FILE_HEADER_SIZE as usize]);

        debug!(fileid, path = %path.display(), "opened data file");
        self.current = Some(CurrentFile {
            file,
            fileid,
            offset_start: 0,
            offset_end: FILE_HEADER_SIZE,
            buffer_has_items: false,
        });
        Ok(())
    }

    /// Flush the staged buffer span to the current file. `padding`
    /// reserves that many extra bytes on disk for a streamed value. A
    /// flush that pushes the file past the block size, or that is forced
    /// while the file holds any payload, completes the file.
    ///
    /// Returns the id of the file that was flushed.
    pub(crate) fn flush_current_file(&mut self, force_new_file: bool, padding: u64) -> Result<u32> {
        let Some(current) = self.current.as_mut() else {
            return Ok(0);
        };
        let fileid_out = current.fileid;

        if current.buffer_has_items {
            let span =
                &self.buffer_data[current.offset_start as usize..current.offset_end as usize];
            match current.file.write_all_at(span, current.offset_start) {
                | Ok(_) => {},
                | Err(e) => warn!(fileid = current.fileid, "write failed: {e}"),
            }
            self.resources.set_size(current.fileid, current.offset_end);
            current.offset_start = current.offset_end;
            current.buffer_has_items = false;
            trace!(
                fileid = current.fileid,
                offset_end = current.offset_end,
                "flushed buffer"
            );
        }

        if padding > 0 {
            current.offset_end += padding;
            current.offset_start = current.offset_end;
            self.resources.set_size(current.fileid, current.offset_end);
            match current.file.set_len(current.offset_end) {
                | Ok(_) => {},
                | Err(e) => warn!(fileid = current.fileid, "could not reserve padding: {e}"),
            }
        }

        let offset_end = current.offset_end;
        if offset_end >= self.opts.block_size || (force_new_file && offset_end > FILE_HEADER_SIZE) {
            self.resources.set_size(fileid_out, offset_end);
            self.close_current_file()?;
        }
        Ok(fileid_out)
    }

    /// Close the current file. If no multi-chunk writers are still in
    /// flight this writes the footer; otherwise the footer is deferred to
    /// the last writer draining. A file into which nothing was ever
    /// flushed is deleted instead.
    pub(crate) fn close_current_file(&mut self) -> Result<()> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };
        trace!(fileid = current.fileid, "closing data file");

        let size = self.resources.size(current.fileid);
        if size == 0 {
            drop(current.file);
            if let Err(e) = fs::remove_file(self.filepath(current.fileid)) {
                warn!(fileid = current.fileid, "could not remove empty file: {e}");
            }
            self.resources.remove(current.fileid);
            return Ok(());
        }

        if self.resources.writers(current.fileid) == 0 {
            let entries = self.resources.index_entries(current.fileid);
            let size_footer = self.write_footer(
                &current.file,
                &entries,
                self.default_kind,
                self.resources.has_padding(current.fileid),
                false,
            )?;
            self.resources.set_size(current.fileid, size + size_footer);
            self.resources.reset(current.fileid);
        }
        Ok(())
    }

    /// Encode the footer index and footer into the scratch buffer, CRC the
    /// whole span, and append it at the end of `file`. This is the only
    /// path that emits a complete file.
    fn write_footer(
        &mut self,
        file: &File,
        entries: &[(u64, u32)],
        kind: FileKind,
        has_padding_in_values: bool,
        has_invalid_entries: bool,
    ) -> Result<u64> {
        let mut offset = 0usize;
        for (hashed_key, offset_entry) in entries {
            let record = FooterIndexEntry {
                hashed_key: *hashed_key,
                offset_entry: *offset_entry,
            };
            record.encode_into(&mut self.buffer_index[offset..]);
            offset += FOOTER_INDEX_ENTRY_SIZE as usize;
        }

        let position = match file.metadata() {
            | Ok(metadata) => metadata.len(),
            | Err(e) => return Err(Io(e)),
        };

        let mut flags = FooterFlags::empty();
        if has_padding_in_values {
            flags |= FooterFlags::HAS_PADDING_IN_VALUES;
        }
        if has_invalid_entries {
            flags |= FooterFlags::HAS_INVALID_ENTRIES;
        }
        match kind {
            | FileKind::CompactedLarge => {
                flags |= FooterFlags::IS_LARGE | FooterFlags::IS_COMPACTED
            },
            | FileKind::CompactedLog => flags |= FooterFlags::IS_COMPACTED,
            | FileKind::UncompactedLog => {},
        }

        let footer = FileFooter {
            kind,
            flags,
            num_entries: entries.len() as u64,
            offset_index: position,
            magic: MAGIC_NUMBER as u64,
            crc32: 0,
        };
        footer.encode_into(&mut self.buffer_index[offset..]);
        offset += FILE_FOOTER_SIZE as usize;

        let crc = crc32c(&self.buffer_index[..offset - 4]);
        self.buffer_index[offset - 4..offset].copy_from_slice(&crc.to_le_bytes());

        match file.write_all_at(&self.buffer_index[..offset], position) {
            | Ok(_) => {},
            | Err(e) => return Err(Io(e)),
        }
        trace!(
            offset_index = position,
            num_entries = entries.len(),
            "wrote footer"
        );
        Ok(offset as u64)
    }

    /// Process a batch of orders in order, returning the
    /// `(hashed key, location)` pairs of every completed entry.
    pub(crate) fn write_orders(&mut self, orders: &[Order]) -> Result<Vec<(u64, u64)>> {
        let mut map_index = Vec::new();

        for order in orders {
            if self.current.is_none() {
                self.open_new_file()?;
            }
            let offset_end = self
                .current
                .as_ref()
                .map(|current| current.offset_end)
                .unwrap_or(0);
            if offset_end >= self.opts.block_size {
                self.flush_current_file(true, 0)?;
                if self.current.is_none() {
                    self.open_new_file()?;
                }
            }

            let hkey = hashed_key(self.opts.hash_kind, &order.key);
            let is_large = order.key.len() as u64 + order.size_value > self.opts.block_size;
            let stream_key = (order.writer, order.key.clone());

            let location = if is_large && order.is_first_chunk() {
                self.write_first_chunk_large_order(order, hkey)?
            } else if order.offset_chunk != 0 {
                match self.chunk_locations.get(&stream_key).copied() {
                    | Some(location) => {
                        self.write_chunk(order, hkey, location, is_large)?;
                        location
                    },
                    | None => {
                        error!("no recorded first-chunk location for this stream, dropping chunk");
                        0
                    },
                }
            } else {
                self.write_small_or_first_chunk(order, hkey)?
            };

            if order.is_self_contained() || order.is_last_chunk() {
                if location != 0 {
                    map_index.push((hkey, location));
                } else {
                    error!("order completed without a location, not indexing it");
                }
                self.chunk_locations.remove(&stream_key);
                self.chunk_header_sizes.remove(&stream_key);
            } else if order.is_first_chunk()
                && location != 0
                && order.order_type != OrderType::Remove
            {
                self.chunk_locations.insert(stream_key, location);
            }
        }

        self.flush_current_file(false, 0)?;
        Ok(map_index)
    }

    /// First chunk of an entry too large for a regular file: give it a
    /// dedicated file of kind `CompactedLarge`, sized upfront to the full
    /// logical entry.
    fn write_first_chunk_large_order(&mut self, order: &Order, hkey: u64) -> Result<u64> {
        let fileid = self.increment_fileid_sequence(1);
        let timestamp = self.increment_timestamp_sequence(1);
        let path = self.filepath(fileid);
        let file = match OpenOptions::new().write(true).create(true).open(&path) {
            | Ok(file) => file,
            | Err(e) => {
                error!(path = %path.display(), "could not open large file: {e}");
                return Err(Io(e));
            },
        };

        let mut header_buf = [0u8; FILE_HEADER_SIZE as usize];
        FileHeader {
            kind: FileKind::CompactedLarge,
            timestamp,
        }
        .encode_into(&mut header_buf);
        match file.write_all_at(&header_buf, 0) {
            | Ok(_) => {},
            | Err(e) => warn!(fileid, "write failed: {e}"),
        }

        let mut entry = EntryHeader {
            crc32: 0,
            entry_type: match order.order_type {
                | OrderType::Put => EntryType::Put,
                | OrderType::Remove => EntryType::Remove,
            },
            shape: EntryShape::Full,
            has_padding: false,
            hashed_key: hkey,
            size_key: order.key.len() as u32,
            size_value: order.size_value,
            size_value_compressed: order.size_value_compressed,
        };
        let mut entry_buf = [0u8; ENTRY_HEADER_MAX_SIZE];
        let size_header = if order.is_self_contained() {
            entry.encode_into(&mut entry_buf)
        } else {
            entry.encode_into_padded(&mut entry_buf)
        };

        if order.is_self_contained() {
            let mut digest = CRC32C.digest();
            digest.update(&entry_buf[4..size_header]);
            digest.update(&order.key);
            digest.update(&order.chunk);
            entry.crc32 = digest.finalize();
            entry.encode_into(&mut entry_buf);
        }

        let offset_key = FILE_HEADER_SIZE + size_header as u64;
        let offset_value = offset_key + order.key.len() as u64;
        match file.write_all_at(&entry_buf[..size_header], FILE_HEADER_SIZE) {
            | Ok(_) => {},
            | Err(e) => warn!(fileid, "write failed: {e}"),
        }
        match file.write_all_at(&order.key, offset_key) {
            | Ok(_) => {},
            | Err(e) => warn!(fileid, "write failed: {e}"),
        }
        match file.write_all_at(&order.chunk, offset_value) {
            | Ok(_) => {},
            | Err(e) => warn!(fileid, "write failed: {e}"),
        }

        let reserved = if order.is_self_contained() {
            order.chunk.len() as u64
        } else {
            order.size_value
        };
        let filesize = offset_value + reserved;
        match file.set_len(filesize) {
            | Ok(_) => {},
            | Err(e) => warn!(fileid, "could not size large file: {e}"),
        }
        self.resources.set_size(fileid, filesize);
        self.resources
            .add_index(fileid, hkey, FILE_HEADER_SIZE as u32);
        debug!(fileid, filesize, "wrote first chunk of large entry");

        if order.is_self_contained() {
            let entries = self.resources.index_entries(fileid);
            let size_footer =
                self.write_footer(&file, &entries, FileKind::CompactedLarge, false, false)?;
            self.resources.set_size(fileid, filesize + size_footer);
            self.resources.set_large(fileid);
            self.resources.reset(fileid);
        } else {
            self.chunk_header_sizes
                .insert((order.writer, order.key.clone()), size_header as u32);
            self.resources.writers_delta(fileid, 1);
        }

        Ok(pack_location(fileid, FILE_HEADER_SIZE as u32))
    }

    /// A non-first chunk: positioned write into the reserved region of the
    /// entry recorded at the stream's first chunk. The last chunk rewrites
    /// the entry header with the final compressed size and checksum, and
    /// drains the file's writer count.
    fn write_chunk(
        &mut self,
        order: &Order,
        hkey: u64,
        location: u64,
        is_large: bool,
    ) -> Result<()> {
        let fileid = location_fileid(location);
        let offset_file = location_offset(location) as u64;
        let path = self.filepath(fileid);
        let file = match OpenOptions::new().write(true).open(&path) {
            | Ok(file) => file,
            | Err(e) => {
                error!(path = %path.display(), "could not open file for chunk: {e}");
                return Err(Io(e));
            },
        };

        let stream_key = (order.writer, order.key.clone());
        let mut entry = EntryHeader {
            crc32: 0,
            entry_type: EntryType::Put,
            shape: EntryShape::Full,
            has_padding: false,
            hashed_key: hkey,
            size_key: order.key.len() as u32,
            size_value: order.size_value,
            size_value_compressed: order.size_value_compressed,
        };
        let mut entry_buf = [0u8; ENTRY_HEADER_MAX_SIZE];
        let size_header = match self.chunk_header_sizes.get(&stream_key).copied() {
            | Some(size) => size,
            | None => {
                // the encoding is deterministic for a given key and
                // logical size, so the size can be recomputed
                warn!("missing in-flight header size, recomputing");
                entry.encode_into_padded(&mut entry_buf) as u32
            },
        };

        let offset_chunk = offset_file + size_header as u64 + order.key.len() as u64;
        match file.write_all_at(&order.chunk, offset_chunk + order.offset_chunk) {
            | Ok(_) => {},
            | Err(e) => warn!(fileid, "chunk write failed: {e}"),
        }

        if order.is_last_chunk() {
            if !is_large && self.opts.compression_enabled {
                entry.has_padding = true;
                self.resources.set_has_padding(fileid, true);
            }
            let size_header_new = entry.encode_into_padded(&mut entry_buf);
            let crc32_header = crc32c(&entry_buf[4..size_header_new]);
            entry.crc32 = crc32c_combine(
                crc32_header,
                order.crc32,
                order.key.len() as u64 + entry.value_used(),
            );
            let size_header_final = entry.encode_into_padded(&mut entry_buf);
            if size_header_final as u32 != size_header {
                error!(
                    initial = size_header,
                    reencoded = size_header_final,
                    "entry header changed size on finalize, the entry is corrupted"
                );
            }
            match file.write_all_at(&entry_buf[..size_header_final], offset_file) {
                | Ok(_) => {},
                | Err(e) => warn!(fileid, "header rewrite failed: {e}"),
            }

            if is_large && self.opts.compression_enabled {
                let filesize =
                    offset_chunk + order.size_value_compressed;
                self.resources.set_size(fileid, filesize);
                match file.set_len(filesize) {
                    | Ok(_) => {},
                    | Err(e) => warn!(fileid, "could not trim large file: {e}"),
                }
            }

            let writers = self.resources.writers_delta(fileid, -1);
            let is_current = self.current_fileid() == Some(fileid);
            if !is_current && writers == 0 {
                let kind = if is_large {
                    FileKind::CompactedLarge
                } else {
                    self.default_kind
                };
                let entries = self.resources.index_entries(fileid);
                let size_footer = self.write_footer(
                    &file,
                    &entries,
                    kind,
                    self.resources.has_padding(fileid),
                    false,
                )?;
                let filesize = self.resources.size(fileid) + size_footer;
                self.resources.set_size(fileid, filesize);
                if is_large {
                    self.resources.set_large(fileid);
                }
                self.resources.reset(fileid);
            }
        }

        Ok(())
    }

    /// Append a small or self-contained entry, or the first chunk of a
    /// streamed one, to the staging buffer of the current file.
    fn write_small_or_first_chunk(&mut self, order: &Order, hkey: u64) -> Result<u64> {
        let (fileid, offset_entry) = match self.current.as_ref() {
            | Some(current) => (current.fileid, current.offset_end),
            | None => return Ok(0),
        };
        let offset = offset_entry as usize;

        let entry = match order.order_type {
            | OrderType::Put => EntryHeader {
                crc32: order.crc32,
                entry_type: EntryType::Put,
                shape: EntryShape::Full,
                has_padding: !order.is_self_contained(),
                hashed_key: hkey,
                size_key: order.key.len() as u32,
                size_value: order.size_value,
                size_value_compressed: order.size_value_compressed,
            },
            | OrderType::Remove => EntryHeader {
                crc32: 0,
                entry_type: EntryType::Remove,
                shape: EntryShape::Full,
                has_padding: false,
                hashed_key: hkey,
                size_key: order.key.len() as u32,
                size_value: 0,
                size_value_compressed: 0,
            },
        };
        if entry.has_padding {
            self.resources.set_has_padding(fileid, true);
        }

        let streamed = order.order_type == OrderType::Put && !order.is_self_contained();
        let size_header = if streamed {
            entry.encode_into_padded(&mut self.buffer_data[offset..])
        } else {
            entry.encode_into(&mut self.buffer_data[offset..])
        };
        let offset_key = offset + size_header;
        let offset_value = offset_key + order.key.len();
        self.buffer_data[offset_key..offset_value].copy_from_slice(&order.key);
        let end = offset_value + order.chunk.len();
        self.buffer_data[offset_value..end].copy_from_slice(&order.chunk);

        // a self-contained entry (and every remove) has all its covered
        // bytes in the buffer, so the checksum is patched in directly
        if order.is_self_contained() {
            let crc = crc32c(&self.buffer_data[offset + 4..end]);
            self.buffer_data[offset..offset + 4].copy_from_slice(&crc.to_le_bytes());
        }

        self.resources.add_index(fileid, hkey, offset_entry as u32);
        let location = pack_location(fileid, offset_entry as u32);

        if let Some(current) = self.current.as_mut() {
            current.offset_end = end as u64;
            current.buffer_has_items = true;
        }

        if order.order_type == OrderType::Put && !order.is_self_contained() {
            self.chunk_header_sizes
                .insert((order.writer, order.key.clone()), size_header as u32);
            self.resources.writers_delta(fileid, 1);
            let padding = order.size_value.saturating_sub(order.chunk.len() as u64);
            self.flush_current_file(false, padding)?;
        }

        trace!(fileid, offset_entry, "staged entry");
        Ok(location)
    }

    /// Load the whole database directory: clean up leftovers from crashed
    /// compactions and snapshots, then load every data file in global
    /// `(timestamp, fileid)` order, recovering or deleting files without a
    /// valid footer.
    pub(crate) fn load_database(
        &mut self,
        index: &mut LocationIndex,
        fileids_ignore: Option<&BTreeSet<u32>>,
        fileid_end: u32,
    ) -> Result<()> {
        if !self.db_path.exists() {
            if !self.opts.create_if_missing {
                return Err(Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "database directory does not exist",
                )));
            }
            match fs::create_dir_all(&self.db_path) {
                | Ok(_) => {},
                | Err(e) => return Err(Io(e)),
            }
        } else if !self.db_path.is_dir() {
            return Err(Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "a non-directory exists at the database path",
            )));
        }
        if !self.locks_path.exists() && !self.read_only {
            match fs::create_dir_all(&self.locks_path) {
                | Ok(_) => {},
                | Err(e) => return Err(Io(e)),
            }
        }

        if !self.read_only {
            remove_files_with_prefix(&self.db_path, &self.opts.compaction_prefix)?;
            self.remove_locked_files()?;
        }

        // Sort the files by (timestamp, fileid) so puts and removes are
        // applied in the right order: compaction outputs have larger file
        // ids than files written after their inputs, but carry the
        // timestamp of their oldest input, so file ids alone cannot order
        // entries across a compaction.
        let mut load_order: BTreeMap<String, u32> = BTreeMap::new();
        let mut fileid_max = 0u32;
        let mut timestamp_max = 0u64;

        let entries = match fs::read_dir(&self.db_path) {
            | Ok(entries) => entries,
            | Err(e) => return Err(Io(e)),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.opts.compaction_prefix.is_empty()
                && name.starts_with(&self.opts.compaction_prefix)
            {
                continue;
            }
            let Some(fileid) = Self::parse_fileid(&name) else {
                continue;
            };
            let metadata = match entry.metadata() {
                | Ok(metadata) => metadata,
                | Err(_) => continue,
            };
            if !metadata.is_file() {
                continue;
            }
            if let Some(ignore) = fileids_ignore {
                if ignore.contains(&fileid) {
                    trace!(fileid, "skipping ignored file");
                    continue;
                }
            }
            if fileid_end != 0 && fileid > fileid_end {
                trace!(fileid, fileid_end, "skipping file beyond load bound");
                continue;
            }
            if metadata.len() <= FILE_HEADER_SIZE {
                trace!(fileid, "file holds a header or less, skipping");
                continue;
            }

            let file = match File::open(entry.path()) {
                | Ok(file) => file,
                | Err(_) => continue,
            };
            let mmap = match unsafe { Mmap::map(&file) } {
                | Ok(mmap) => mmap,
                | Err(e) => {
                    warn!(fileid, "could not map file: {e}");
                    continue;
                },
            };
            let header = match FileHeader::decode(&mmap) {
                | Ok(header) => header,
                | Err(_) => {
                    trace!(fileid, "invalid file header, skipping");
                    continue;
                },
            };
            load_order.insert(format!("{:016X}-{:08X}", header.timestamp, fileid), fileid);
            fileid_max = fileid_max.max(fileid);
            timestamp_max = timestamp_max.max(header.timestamp);
        }

        for fileid in load_order.values().copied() {
            let path = self.filepath(fileid);
            let file = match File::open(&path) {
                | Ok(file) => file,
                | Err(_) => continue,
            };
            let mmap = match unsafe { Mmap::map(&file) } {
                | Ok(mmap) => mmap,
                | Err(_) => continue,
            };

            let loaded = Self::load_file(&mmap, fileid, index);
            match loaded {
                | Ok((filesize, is_large, is_compacted)) => {
                    self.resources.set_size(fileid, filesize);
                    if is_large {
                        self.resources.set_large(fileid);
                    }
                    if is_compacted {
                        self.resources.set_compacted(fileid);
                    }
                },
                | Err(e) if !self.read_only => {
                    warn!(path = %path.display(), "could not load file ({e}), entering recovery");
                    drop(mmap);
                    drop(file);
                    match self.recover_file(&path, fileid, index) {
                        | Ok(_) => {},
                        | Err(e) => {
                            warn!(path = %path.display(), "recovery failed: {e}");
                            if let Err(e) = fs::remove_file(&path) {
                                error!(path = %path.display(), "could not remove file: {e}");
                            }
                        },
                    }
                },
                | Err(e) => {
                    trace!(fileid, "skipping unloadable file in read-only mode: {e}");
                },
            }
        }

        if fileid_max > 0 {
            self.set_fileid_sequence(fileid_max);
            self.set_timestamp_sequence(timestamp_max);
        }
        debug!(
            fileid_max,
            timestamp_max,
            entries = index.len(),
            "database loaded"
        );
        Ok(())
    }

    /// Load a complete file through its footer: verify magic and checksum,
    /// then insert every footer-index record. Returns the file size and
    /// its large/compacted flags.
    pub(crate) fn load_file(
        mmap: &Mmap,
        fileid: u32,
        index: &mut LocationIndex,
    ) -> Result<(u64, bool, bool)> {
        let filesize = mmap.len() as u64;
        if filesize < FILE_HEADER_SIZE + FILE_FOOTER_SIZE {
            return Err(InvalidFormat("file too small for a footer".into()));
        }

        let footer = FileFooter::decode(&mmap[(filesize - FILE_FOOTER_SIZE) as usize..])?;
        if !footer.has_valid_magic() {
            return Err(InvalidFormat("bad footer magic".into()));
        }
        if footer.offset_index < FILE_HEADER_SIZE
            || footer.offset_index > filesize - FILE_FOOTER_SIZE
        {
            return Err(InvalidFormat("footer index offset out of bounds".into()));
        }
        let crc32_computed =
            crc32c(&mmap[footer.offset_index as usize..(filesize - 4) as usize]);
        if crc32_computed != footer.crc32 {
            return Err(InvalidFormat("footer checksum mismatch".into()));
        }

        let mut offset = footer.offset_index as usize;
        let index_end = (filesize - FILE_FOOTER_SIZE) as usize;
        for _ in 0..footer.num_entries {
            if offset + FOOTER_INDEX_ENTRY_SIZE as usize > index_end {
                return Err(InvalidFormat("truncated footer index".into()));
            }
            let record = FooterIndexEntry::decode(&mmap[offset..])?;
            index.insert(
                record.hashed_key,
                pack_location(fileid, record.offset_entry),
            );
            offset += FOOTER_INDEX_ENTRY_SIZE as usize;
        }

        Ok((
            filesize,
            footer.flags.contains(FooterFlags::IS_LARGE),
            footer.flags.contains(FooterFlags::IS_COMPACTED),
        ))
    }

    /// Recover a file without a valid footer: scan entries forward,
    /// checksum each, index the valid ones, truncate at the first
    /// malformed or truncated entry, and append a fresh footer. Large
    /// files hold a single entry and cannot be partially recovered.
    fn recover_file(
        &mut self,
        path: &Path,
        fileid: u32,
        index: &mut LocationIndex,
    ) -> Result<()> {
        let file = match File::open(path) {
            | Ok(file) => file,
            | Err(e) => return Err(Io(e)),
        };
        let mmap = match unsafe { Mmap::map(&file) } {
            | Ok(mmap) => mmap,
            | Err(e) => return Err(Io(e)),
        };

        let header = FileHeader::decode(&mmap)?;
        if header.kind == FileKind::CompactedLarge {
            return Err(InvalidFormat("large files are not recoverable".into()));
        }

        let filesize = mmap.len();
        let mut offset = FILE_HEADER_SIZE as usize;
        let mut footer_index: Vec<(u64, u32)> = Vec::new();
        let mut has_padding_in_values = false;
        let mut has_invalid_entries = false;

        loop {
            if offset >= filesize {
                break;
            }
            let (entry, size_header) = match EntryHeader::decode(&mmap[offset..]) {
                | Ok(decoded) => decoded,
                | Err(_) => break,
            };
            if entry.size_key == 0 {
                break;
            }
            let end_used =
                offset + size_header + entry.size_key as usize + entry.value_used() as usize;
            let end_disk =
                offset + size_header + entry.size_key as usize + entry.value_offset() as usize;
            if end_used > filesize || end_disk > filesize {
                break;
            }

            let crc32_computed = crc32c(&mmap[offset + 4..end_used]);
            if crc32_computed == entry.crc32 {
                footer_index.push((entry.hashed_key, offset as u32));
                index.insert(entry.hashed_key, pack_location(fileid, offset as u32));
            } else {
                trace!(
                    fileid,
                    offset,
                    stored = entry.crc32,
                    computed = crc32_computed,
                    "dropping entry with bad checksum"
                );
                has_invalid_entries = true;
            }
            if entry.has_padding {
                has_padding_in_values = true;
            }
            offset = end_disk;
        }

        if offset <= FILE_HEADER_SIZE as usize {
            return Err(InvalidFormat("no recoverable entries".into()));
        }

        drop(mmap);
        drop(file);
        let file = match OpenOptions::new().write(true).open(path) {
            | Ok(file) => file,
            | Err(e) => return Err(Io(e)),
        };
        match file.set_len(offset as u64) {
            | Ok(_) => {},
            | Err(e) => return Err(Io(e)),
        }
        let recovered = footer_index.len();
        let size_footer = self.write_footer(
            &file,
            &footer_index,
            header.kind,
            has_padding_in_values,
            has_invalid_entries,
        )?;
        self.resources.set_size(fileid, offset as u64 + size_footer);
        debug!(fileid, recovered, has_invalid_entries, "recovered file");
        Ok(())
    }

    /// A file id present under the locks directory belonged to a snapshot
    /// of a previous run that never got released; its data file is stale
    /// and goes away along with the lock itself.
    fn remove_locked_files(&mut self) -> Result<()> {
        let entries = match fs::read_dir(&self.locks_path) {
            | Ok(entries) => entries,
            | Err(e) => return Err(Io(e)),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(fileid) = Self::parse_fileid(&name) {
                if let Err(e) = fs::remove_file(self.filepath(fileid)) {
                    warn!(fileid, "could not remove locked data file: {e}");
                }
            }
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!(file = %name, "could not remove lock file: {e}");
            }
        }
        Ok(())
    }

    /// Flush and complete the current file. Idempotent; a no-op for
    /// read-only instances.
    pub(crate) fn close(&mut self) {
        if self.read_only || self.is_closed {
            return;
        }
        self.is_closed = true;
        if let Err(e) = self.flush_current_file(false, 0) {
            warn!("flush on close failed: {e}");
        }
        if let Err(e) = self.close_current_file() {
            warn!("close of current file failed: {e}");
        }
    }
}
