//! Reading finished tables.
//!
//! Opening a table decodes the footer, loads the index and metaindex blocks,
//! and wires up the filter block if the configured policy matches the one the
//! table was built with. Data blocks are fetched lazily, one per index entry,
//! through the two-level iterator's block-reader callback.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use snap::raw::Decoder;

use crate::block::Block;
use crate::comparator::BytewiseComparator;
use crate::config::{CompressionType, Options, ReadOptions};
use crate::errdata;
use crate::error::Result;
use crate::filter::FilterBlockReader;
use crate::format::{
    block_crc, unmask_crc, BlockHandle, Footer, BLOCK_TRAILER_SIZE, FOOTER_SIZE,
};
use crate::iterator::{BlockReaderFn, Cursor, TwoLevelIterator};

/// Positioned reads from an immutable source.
pub trait RandomAccess {
    /// Fill `buf` from `offset`. Short reads are errors.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

impl RandomAccess for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let offset = offset as usize;
        if offset + buf.len() > self.len() {
            return errdata!("read of {} bytes at {offset} is out of bounds", buf.len());
        }
        buf.copy_from_slice(&self[offset..offset + buf.len()]);
        Ok(())
    }
}

impl RandomAccess for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.as_slice().read_at(offset, buf)
    }
}

impl RandomAccess for std::fs::File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        Ok(self.read_exact_at(buf, offset)?)
    }
}

/// Read a framed block's payload, verify its trailer, and decompress it.
fn read_block_contents(
    file: &dyn RandomAccess,
    handle: &BlockHandle,
    options: &ReadOptions,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; handle.size as usize + BLOCK_TRAILER_SIZE];
    file.read_at(handle.offset, &mut buf)?;

    let payload_len = handle.size as usize;
    let block_type = buf[payload_len];
    if options.verify_checksums {
        let stored = unmask_crc(LittleEndian::read_u32(&buf[payload_len + 1..]));
        let actual = block_crc(&buf[..payload_len], block_type);
        if stored != actual {
            return errdata!("block checksum mismatch at offset {}", handle.offset);
        }
    }

    buf.truncate(payload_len);
    match CompressionType::from_u8(block_type) {
        Some(CompressionType::None) => Ok(buf),
        Some(CompressionType::Snappy) => Ok(Decoder::new().decompress_vec(&buf)?),
        None => errdata!("unknown compression type {block_type}"),
    }
}

fn read_block(
    file: &dyn RandomAccess,
    handle: &BlockHandle,
    options: &ReadOptions,
) -> Result<Arc<Block>> {
    let contents = read_block_contents(file, handle, options)?;
    Ok(Arc::new(Block::new(contents)?))
}

/// An open, immutable table.
pub struct Table {
    file: Arc<dyn RandomAccess>,
    options: Options,
    index_block: Arc<Block>,
    filter: Option<FilterBlockReader>,
}

impl Table {
    /// Open a table from `file`, whose total length is `size`.
    pub fn open(options: Options, file: Arc<dyn RandomAccess>, size: u64) -> Result<Self> {
        if size < FOOTER_SIZE as u64 {
            return errdata!("table of {size} bytes is too short for a footer");
        }

        let mut footer_buf = [0u8; FOOTER_SIZE];
        file.read_at(size - FOOTER_SIZE as u64, &mut footer_buf)?;
        let footer = Footer::decode(&footer_buf)?;

        let read_options = ReadOptions::default();
        let index_block = read_block(file.as_ref(), &footer.index_handle, &read_options)?;

        // The metaindex names the filter block, if any, under "filter.<name>".
        // Its keys are internal strings, ordered bytewise no matter which
        // comparator the table's own keys use.
        let mut filter = None;
        if let Some(policy) = options.filter_policy.clone() {
            let metaindex_block =
                read_block(file.as_ref(), &footer.metaindex_handle, &read_options)?;
            let key = format!("filter.{}", policy.name());
            let mut iter = metaindex_block.iter(Arc::new(BytewiseComparator));
            iter.seek(key.as_bytes());
            if iter.valid() && iter.key() == key.as_bytes() {
                let (handle, _) = BlockHandle::decode(iter.value())?;
                let contents = read_block_contents(file.as_ref(), &handle, &read_options)?;
                filter = Some(FilterBlockReader::new(policy, contents));
            }
        }

        tracing::debug!(size, "opened table");
        Ok(Self {
            file,
            options,
            index_block,
            filter,
        })
    }

    /// A cursor over every entry in the table. Data blocks are fetched,
    /// verified, and decompressed as the cursor reaches them.
    pub fn iter(&self, read_options: ReadOptions) -> TwoLevelIterator<'_> {
        let file = Arc::clone(&self.file);
        let comparator = self.options.comparator.clone();
        let reader: BlockReaderFn<'_> = Box::new(move |options, handle_bytes| {
            let (handle, _) = BlockHandle::decode(handle_bytes)?;
            let block = read_block(file.as_ref(), &handle, options)?;
            Ok(Box::new(block.iter(comparator.clone())))
        });

        let index_iter = Arc::clone(&self.index_block).iter(self.options.comparator.clone());
        TwoLevelIterator::new(Box::new(index_iter), reader, read_options)
    }

    /// Point lookup. Returns the value stored under exactly `key`.
    pub fn get(&self, key: &[u8], read_options: &ReadOptions) -> Result<Option<Vec<u8>>> {
        let mut index_iter = Arc::clone(&self.index_block).iter(self.options.comparator.clone());
        index_iter.seek(key);
        if !index_iter.valid() {
            return Ok(None);
        }

        let (handle, _) = BlockHandle::decode(index_iter.value())?;
        if let Some(filter) = &self.filter {
            if !filter.key_may_match(handle.offset, key) {
                return Ok(None);
            }
        }

        let block = read_block(self.file.as_ref(), &handle, read_options)?;
        let mut iter = block.iter(self.options.comparator.clone());
        iter.seek(key);
        if iter.valid() && self.options.comparator.compare(iter.key(), key).is_eq() {
            return Ok(Some(iter.value().to_vec()));
        }
        Ok(None)
    }
}
