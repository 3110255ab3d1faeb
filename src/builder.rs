//! Table construction.
//!
//! A table is built by feeding strictly ascending key/value pairs to a
//! [`TableBuilder`] and calling `finish`. The resulting file layout:
//!
//! ```text
//! +-------------------+
//! | Data Block 1      |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Data Block N      |
//! +-------------------+
//! | Filter Block      |  (present iff a filter policy is configured)
//! +-------------------+
//! | Metaindex Block   |
//! +-------------------+
//! | Index Block       |
//! +-------------------+
//! | Footer            |  (fixed 48 bytes)
//! +-------------------+
//! ```
//!
//! Every block except the footer is framed as
//! `payload | compression type (1 byte) | masked crc32c (4 bytes, LE)`.

use std::io::Write;
use std::mem;

use byteorder::{ByteOrder, LittleEndian};
use snap::raw::{max_compress_len, Encoder};

use crate::block::BlockBuilder;
use crate::config::{CompressionType, Options};
use crate::errinput;
use crate::error::{Error, Result};
use crate::filter::FilterBlockBuilder;
use crate::format::{block_crc, mask_crc, BlockHandle, Footer, BLOCK_TRAILER_SIZE};

/// The index block stores one full key per entry so that lookups binary
/// search it without prefix reconstruction. Index blocks are small relative
/// to the data they cover, so the space cost is negligible.
const INDEX_RESTART_INTERVAL: usize = 1;

/// Streams sorted key/value pairs into an immutable, indexed table file.
///
/// Single-threaded and not reentrant. The first failure from the underlying
/// writer is sticky: every later operation is a no-op returning that error.
/// Out-of-order keys and use after `finish`/`abandon` are contract
/// violations and panic.
pub struct TableBuilder<W: Write> {
    options: Options,
    file: W,
    /// Bytes appended so far. Advanced only after a full framed block lands.
    offset: u64,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter_block: Option<FilterBlockBuilder>,
    last_key: Vec<u8>,
    num_entries: u64,
    closed: bool,
    status: Option<Error>,
    /// Handle of the last flushed data block, awaiting its index entry.
    pending_handle: BlockHandle,
    /// True iff a data block was flushed and no later key has arrived yet.
    /// Implies the in-progress data block is empty.
    pending_index_entry: bool,
    /// Scratch buffer reused across compressed block emissions.
    compressed_output: Vec<u8>,
}

impl<W: Write> TableBuilder<W> {
    pub fn new(options: Options, file: W) -> Self {
        let mut filter_block = options
            .filter_policy
            .clone()
            .map(FilterBlockBuilder::new);
        if let Some(filter) = filter_block.as_mut() {
            filter.start_block(0);
        }

        Self {
            data_block: BlockBuilder::new(options.block_restart_interval),
            index_block: BlockBuilder::new(INDEX_RESTART_INTERVAL),
            filter_block,
            options,
            file,
            offset: 0,
            last_key: Vec::new(),
            num_entries: 0,
            closed: false,
            status: None,
            pending_handle: BlockHandle::default(),
            pending_index_entry: false,
            compressed_output: Vec::new(),
        }
    }

    /// Replace the options mid-build. The comparator must not change. The
    /// index block keeps its restart interval of 1 regardless of the caller's
    /// setting.
    pub fn change_options(&mut self, options: Options) -> Result<()> {
        if options.comparator.name() != self.options.comparator.name() {
            return errinput!("cannot change comparator while building a table");
        }
        self.data_block
            .set_restart_interval(options.block_restart_interval);
        self.options = options;
        Ok(())
    }

    /// Append an entry. `key` must be strictly greater than every key added
    /// before it under the configured comparator.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        assert!(!self.closed);
        self.check_status()?;
        if self.num_entries > 0 {
            assert!(
                self.options
                    .comparator
                    .compare(key, &self.last_key)
                    .is_gt(),
                "keys must be added in strictly ascending order"
            );
        }

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            // Now that the first key of the next block is known, the previous
            // block's index entry can use the shortest separating key. E.g.
            // "the r" separates "the quick brown fox" from "the who".
            self.options
                .comparator
                .find_shortest_separator(&mut self.last_key, key);
            self.index_block
                .add_entry(&self.last_key, &self.pending_handle.encode());
            self.pending_index_entry = false;
        }

        if let Some(filter) = self.filter_block.as_mut() {
            filter.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add_entry(key, value);

        if self.data_block.size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Write the in-progress data block out. No-op when it is empty.
    pub fn flush(&mut self) -> Result<()> {
        assert!(!self.closed);
        self.check_status()?;
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        let block = mem::replace(
            &mut self.data_block,
            BlockBuilder::new(self.options.block_restart_interval),
        );
        self.pending_handle = self.write_block(block.finish())?;
        self.pending_index_entry = true;
        if let Err(e) = self.file.flush() {
            return self.fail(e.into());
        }

        if let Some(filter) = self.filter_block.as_mut() {
            filter.start_block(self.offset);
        }
        Ok(())
    }

    /// Finalize the table: flush the last data block, then emit the filter,
    /// metaindex, and index blocks followed by the footer.
    pub fn finish(&mut self) -> Result<()> {
        let flushed = self.flush();
        assert!(!self.closed);
        self.closed = true;
        flushed?;

        // Filter block, stored raw.
        let mut filter_entry = None;
        if let Some(filter) = self.filter_block.take() {
            let key = format!("filter.{}", filter.policy_name());
            let contents = filter.finish();
            let handle = self.write_raw_block(&contents, CompressionType::None)?;
            filter_entry = Some((key, handle));
        }

        // Metaindex block referencing the filter block.
        let mut metaindex_block = BlockBuilder::new(self.options.block_restart_interval);
        if let Some((key, handle)) = filter_entry {
            metaindex_block.add_entry(key.as_bytes(), &handle.encode());
        }
        let metaindex_handle = self.write_block(metaindex_block.finish())?;

        // Index block. The final data block has no successor key, so its
        // separator comes from the short-successor helper instead.
        if self.pending_index_entry {
            self.options
                .comparator
                .find_short_successor(&mut self.last_key);
            self.index_block
                .add_entry(&self.last_key, &self.pending_handle.encode());
            self.pending_index_entry = false;
        }
        let index_block = mem::replace(
            &mut self.index_block,
            BlockBuilder::new(INDEX_RESTART_INTERVAL),
        );
        let index_handle = self.write_block(index_block.finish())?;

        let footer = Footer::new(metaindex_handle, index_handle).encode();
        if let Err(e) = self.file.write_all(&footer) {
            return self.fail(e.into());
        }
        self.offset += footer.len() as u64;

        tracing::debug!(
            entries = self.num_entries,
            size = self.offset,
            "finished table"
        );
        Ok(())
    }

    /// Close the builder without finalizing. The bytes written so far do not
    /// form a readable table and should be discarded.
    pub fn abandon(&mut self) {
        assert!(!self.closed);
        self.closed = true;
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes appended so far; after `finish`, the final file size.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    pub fn status(&self) -> Result<()> {
        self.check_status()
    }

    /// Frame and append finished block contents, compressing when configured
    /// and worthwhile: the compressed form is kept only when it saves more
    /// than an eighth of the raw size.
    fn write_block(&mut self, raw: Vec<u8>) -> Result<BlockHandle> {
        let mut block_type = self.options.compression;

        if block_type == CompressionType::Snappy {
            self.compressed_output.resize(max_compress_len(raw.len()), 0);
            match Encoder::new().compress(&raw, &mut self.compressed_output) {
                Ok(compressed_len) if compressed_len < raw.len() - raw.len() / 8 => {
                    self.compressed_output.truncate(compressed_len);
                }
                // Compression did not pay for itself; store raw.
                _ => block_type = CompressionType::None,
            }
        }

        let handle = if block_type == CompressionType::Snappy {
            let compressed = mem::take(&mut self.compressed_output);
            let handle = self.write_raw_block(&compressed, block_type);
            self.compressed_output = compressed;
            handle
        } else {
            self.write_raw_block(&raw, block_type)
        };
        self.compressed_output.clear();
        handle
    }

    /// Append `payload | type | masked crc`. The offset only advances once
    /// the whole framed block is written, so a failure mid-block leaves the
    /// offset pointing at the last complete block.
    fn write_raw_block(
        &mut self,
        payload: &[u8],
        block_type: CompressionType,
    ) -> Result<BlockHandle> {
        self.check_status()?;
        let handle = BlockHandle::new(self.offset, payload.len() as u64);

        if let Err(e) = self.file.write_all(payload) {
            return self.fail(e.into());
        }

        let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
        trailer[0] = block_type as u8;
        let crc = block_crc(payload, block_type as u8);
        LittleEndian::write_u32(&mut trailer[1..], mask_crc(crc));
        if let Err(e) = self.file.write_all(&trailer) {
            return self.fail(e.into());
        }

        self.offset += payload.len() as u64 + BLOCK_TRAILER_SIZE as u64;
        Ok(handle)
    }

    fn check_status(&self) -> Result<()> {
        match &self.status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Record the first failure; later operations keep returning it.
    fn fail<T>(&mut self, error: Error) -> Result<T> {
        if self.status.is_none() {
            self.status = Some(error.clone());
        }
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::comparator::{BytewiseComparator, Comparator};
    use crate::filter::BloomFilterPolicy;
    use crate::format::{unmask_crc, FOOTER_SIZE};
    use crate::iterator::Cursor;
    use rand::{Rng, RngCore};
    use std::sync::Arc;

    fn options() -> Options {
        Options::new().compression(CompressionType::None)
    }

    /// A framed block's decompressed contents.
    fn block_contents(file: &[u8], handle: &BlockHandle) -> Vec<u8> {
        let payload = &file[handle.offset as usize..(handle.offset + handle.size) as usize];
        match block_type(file, handle) {
            t if t == CompressionType::None as u8 => payload.to_vec(),
            t if t == CompressionType::Snappy as u8 => snap::raw::Decoder::new()
                .decompress_vec(payload)
                .unwrap(),
            t => panic!("unknown compression type {t}"),
        }
    }

    /// Decode the index block of a finished in-memory table, returning its
    /// (separator, handle) entries.
    fn index_entries(file: &[u8]) -> Vec<(Vec<u8>, BlockHandle)> {
        let footer = Footer::decode(&file[file.len() - FOOTER_SIZE..]).unwrap();
        let block = Arc::new(Block::new(block_contents(file, &footer.index_handle)).unwrap());

        let mut entries = Vec::new();
        let mut iter = block.iter(Arc::new(BytewiseComparator));
        iter.seek_to_first();
        while iter.valid() {
            let (h, _) = BlockHandle::decode(iter.value()).unwrap();
            entries.push((iter.key().to_vec(), h));
            iter.next();
        }
        entries
    }

    /// Compression type byte of the framed block at `handle`.
    fn block_type(file: &[u8], handle: &BlockHandle) -> u8 {
        file[(handle.offset + handle.size) as usize]
    }

    #[test]
    fn test_empty_table() {
        let mut file = Vec::new();
        let mut builder = TableBuilder::new(options(), &mut file);
        builder.finish().unwrap();

        assert_eq!(builder.num_entries(), 0);
        let size = builder.file_size();
        assert_eq!(size as usize, file.len());

        // Metaindex and index blocks plus the footer, nothing else.
        let footer = Footer::decode(&file[file.len() - FOOTER_SIZE..]).unwrap();
        assert_eq!(footer.metaindex_handle.offset, 0);
        assert!(index_entries(&file).is_empty());
    }

    #[test]
    fn test_single_key() {
        let mut file = Vec::new();
        let mut builder = TableBuilder::new(options(), &mut file);
        builder.add(b"apple", b"1").unwrap();
        builder.finish().unwrap();
        assert_eq!(builder.num_entries(), 1);

        let entries = index_entries(&file);
        assert_eq!(entries.len(), 1);

        // The sole index key is the short successor of the last key.
        let mut successor = b"apple".to_vec();
        BytewiseComparator.find_short_successor(&mut successor);
        assert_eq!(entries[0].0, successor);
        assert_eq!(entries[0].1.offset, 0);
    }

    #[test]
    fn test_short_separator_between_blocks() {
        let mut file = Vec::new();
        // Tiny block size: every add flushes the previous block.
        let mut builder = TableBuilder::new(options().block_size(1), &mut file);
        builder.add(b"the quick brown fox", b"A").unwrap();
        builder.add(b"the who", b"B").unwrap();
        builder.finish().unwrap();

        let entries = index_entries(&file);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, b"the r");
        assert!(entries[0].0.as_slice() < b"the who".as_slice());
    }

    #[test]
    fn test_one_index_entry_per_block() {
        let mut file = Vec::new();
        let mut builder = TableBuilder::new(options().block_size(64), &mut file);
        for i in 0..100u32 {
            let key = format!("key_{i:05}");
            let value = format!("value_{i:05}");
            builder.add(key.as_bytes(), value.as_bytes()).unwrap();
        }
        builder.finish().unwrap();

        let entries = index_entries(&file);
        assert!(entries.len() > 1);

        // Handles tile the data section: each block starts where the
        // previous one's frame ended.
        let mut expected_offset = 0u64;
        for (_, handle) in &entries {
            assert_eq!(handle.offset, expected_offset);
            expected_offset = handle.offset + handle.size + BLOCK_TRAILER_SIZE as u64;
        }

        // Separators are strictly ascending.
        for pair in entries.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
    }

    #[test]
    fn test_compression_accepted_for_compressible_data() {
        let mut file = Vec::new();
        let options = Options::new().compression(CompressionType::Snappy);
        let mut builder = TableBuilder::new(options, &mut file);
        for i in 0..50u32 {
            let key = format!("key_{i:05}");
            builder.add(key.as_bytes(), &[b'x'; 256]).unwrap();
        }
        builder.finish().unwrap();

        let entries = index_entries(&file);
        for (_, handle) in &entries {
            assert_eq!(block_type(&file, handle), CompressionType::Snappy as u8);
        }
    }

    #[test]
    fn test_compression_rejected_for_incompressible_data() {
        let mut rng = rand::thread_rng();
        let mut file = Vec::new();
        let options = Options::new()
            .compression(CompressionType::Snappy)
            .block_size(512);
        let mut builder = TableBuilder::new(options, &mut file);
        for i in 0..100u32 {
            let key = format!("key_{i:05}");
            let mut value = vec![0u8; 128];
            rng.fill_bytes(&mut value);
            builder.add(key.as_bytes(), &value).unwrap();
        }
        builder.finish().unwrap();

        let entries = index_entries(&file);
        assert!(entries.len() > 1);
        for (_, handle) in &entries {
            assert_eq!(block_type(&file, handle), CompressionType::None as u8);
        }
    }

    #[test]
    fn test_block_crc_verifies() {
        let mut file = Vec::new();
        let mut builder = TableBuilder::new(options(), &mut file);
        builder.add(b"key", b"value").unwrap();
        builder.finish().unwrap();

        let entries = index_entries(&file);
        let handle = entries[0].1;
        let payload = &file[handle.offset as usize..(handle.offset + handle.size) as usize];
        let block_type = block_type(&file, &handle);
        let stored = unmask_crc(LittleEndian::read_u32(
            &file[(handle.offset + handle.size + 1) as usize..],
        ));
        assert_eq!(stored, block_crc(payload, block_type));
    }

    #[test]
    #[should_panic(expected = "ascending order")]
    fn test_out_of_order_add_panics() {
        let mut file = Vec::new();
        let mut builder = TableBuilder::new(options(), &mut file);
        builder.add(b"b", b"1").unwrap();
        builder.add(b"a", b"2").unwrap();
    }

    #[test]
    #[should_panic]
    fn test_duplicate_key_panics() {
        let mut file = Vec::new();
        let mut builder = TableBuilder::new(options(), &mut file);
        builder.add(b"a", b"1").unwrap();
        builder.add(b"a", b"2").unwrap();
    }

    #[test]
    fn test_abandon_writes_no_footer() {
        let mut file = Vec::new();
        let mut builder = TableBuilder::new(options().block_size(64), &mut file);
        for i in 0..50u32 {
            let key = format!("key_{i:05}");
            builder.add(key.as_bytes(), b"value").unwrap();
        }
        builder.abandon();

        let size = builder.file_size() as usize;
        assert_eq!(file.len(), size);
        // Whatever was flushed, no footer followed it.
        assert!(file.len() < FOOTER_SIZE || Footer::decode(&file[file.len() - FOOTER_SIZE..]).is_err());
    }

    #[test]
    #[should_panic]
    fn test_add_after_abandon_panics() {
        let mut file = Vec::new();
        let mut builder = TableBuilder::new(options(), &mut file);
        builder.add(b"a", b"1").unwrap();
        builder.abandon();
        let _ = builder.add(b"b", b"2");
    }

    #[test]
    #[should_panic]
    fn test_finish_twice_panics() {
        let mut file = Vec::new();
        let mut builder = TableBuilder::new(options(), &mut file);
        builder.finish().unwrap();
        let _ = builder.finish();
    }

    #[test]
    fn test_change_options_rejects_new_comparator() {
        struct ReverseComparator;
        impl Comparator for ReverseComparator {
            fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
                b.cmp(a)
            }
            fn name(&self) -> &'static str {
                "reverse"
            }
            fn find_shortest_separator(&self, _start: &mut Vec<u8>, _limit: &[u8]) {}
            fn find_short_successor(&self, _key: &mut Vec<u8>) {}
        }

        let mut file = Vec::new();
        let mut builder = TableBuilder::new(options(), &mut file);
        builder.add(b"a", b"1").unwrap();

        let changed = Options::new().comparator(Arc::new(ReverseComparator));
        assert!(builder.change_options(changed).is_err());

        // Same comparator: accepted, build continues.
        builder.change_options(options().block_size(128)).unwrap();
        builder.add(b"b", b"2").unwrap();
        builder.finish().unwrap();
    }

    #[test]
    fn test_sticky_write_failure() {
        /// Fails every write after the first `allow` bytes.
        struct FailingWriter {
            allow: usize,
            written: usize,
        }
        impl Write for FailingWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                if self.written + buf.len() > self.allow {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "disk full",
                    ));
                }
                self.written += buf.len();
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        // The first framed block (27-byte payload plus 5-byte trailer) fits;
        // nothing after it does.
        let writer = FailingWriter {
            allow: 32,
            written: 0,
        };
        let mut builder = TableBuilder::new(options().block_size(1), writer);
        builder.add(b"a", b"some value").unwrap();
        assert_eq!(builder.file_size(), 32);

        // The second add flushes another block and hits the failure.
        let err = builder.add(b"b", b"other value").unwrap_err();
        assert!(matches!(&err, Error::IO(_)));

        // The failure is sticky and the offset never advanced past the last
        // complete block.
        assert!(builder.status().is_err());
        assert_eq!(builder.file_size(), 32);
        assert_eq!(builder.add(b"c", b"v"), Err(err));
    }

    #[test]
    fn test_filter_block_in_metaindex() {
        let mut file = Vec::new();
        let options = options().filter_policy(Arc::new(BloomFilterPolicy::default()));
        let mut builder = TableBuilder::new(options, &mut file);
        builder.add(b"apple", b"1").unwrap();
        builder.add(b"banana", b"2").unwrap();
        builder.finish().unwrap();

        let footer = Footer::decode(&file[file.len() - FOOTER_SIZE..]).unwrap();
        let handle = footer.metaindex_handle;
        let contents =
            file[handle.offset as usize..(handle.offset + handle.size) as usize].to_vec();
        let block = Arc::new(Block::new(contents).unwrap());
        let mut iter = block.iter(Arc::new(BytewiseComparator));
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"filter.bloom.xxh3");

        let (filter_handle, _) = BlockHandle::decode(iter.value()).unwrap();
        // The filter block sits right after the data blocks and is stored raw.
        assert_eq!(block_type(&file, &filter_handle), CompressionType::None as u8);
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_random_block_sizes_roundtrip_offsets() {
        // Handles must always satisfy offset + size + trailer <= file size.
        let mut rng = rand::thread_rng();
        let mut file = Vec::new();
        let mut builder = TableBuilder::new(options().block_size(128), &mut file);
        for i in 0..200u32 {
            let key = format!("key_{i:06}");
            let len = rng.gen_range(0..200);
            builder.add(key.as_bytes(), &vec![b'v'; len]).unwrap();
        }
        builder.finish().unwrap();

        for (_, handle) in index_entries(&file) {
            assert!(handle.offset + handle.size + BLOCK_TRAILER_SIZE as u64 <= file.len() as u64);
        }
    }
}
