//! Prefix-compressed key/value blocks with restart points.
//!
//! Entries within a block share key prefixes with their predecessor. Every
//! `restart_interval` entries a full key is written and its offset recorded
//! in a trailing restart array, which makes binary search possible without
//! decoding the whole block.
//!
//! Block layout:
//!
//! ```text
//! entry:    | shared (u16) | unshared (u16) | value len (u32) | key suffix | value |
//! trailer:  | restart offsets (u32 each) | restart count (u32) |
//! ```
//!
//! All integers are little-endian.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::comparator::Comparator;
use crate::errdata;
use crate::error::{Error, Result};
use crate::iterator::Cursor;

const ENTRY_HEADER_SIZE: usize = 8;

/// Accumulates sorted entries into a serialized block.
pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    counter: usize,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        assert!(restart_interval >= 1);
        Self {
            restart_interval,
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            counter: 0,
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Append an entry. Keys must arrive in ascending order under the
    /// comparator the block will be read with; the caller enforces this.
    pub fn add_entry(&mut self, key: &[u8], value: &[u8]) {
        let shared_prefix_len = if self.counter % self.restart_interval == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        } else {
            self.shared_prefix_length(&self.last_key, key)
        };

        let unshared_key_len = key.len() - shared_prefix_len;

        self.buffer
            .write_u16::<LittleEndian>(shared_prefix_len as u16)
            .unwrap();
        self.buffer
            .write_u16::<LittleEndian>(unshared_key_len as u16)
            .unwrap();
        self.buffer
            .write_u32::<LittleEndian>(value.len() as u32)
            .unwrap();
        self.buffer.extend_from_slice(&key[shared_prefix_len..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
        self.entry_count += 1;
    }

    /// Serialized size of the block as it stands, trailer included.
    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + self.restart_positions.len() * 4 + 4
    }

    /// Appends the restart trailer and returns the block contents.
    pub fn finish(mut self) -> Vec<u8> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<LittleEndian>(*pos).unwrap();
        }
        self.buffer
            .write_u32::<LittleEndian>(self.restart_positions.len() as u32)
            .unwrap();
        self.buffer
    }

    /// Restart interval for entries added from now on.
    pub fn set_restart_interval(&mut self, interval: usize) {
        assert!(interval >= 1);
        self.restart_interval = interval;
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    fn shared_prefix_length(&self, a: &[u8], b: &[u8]) -> usize {
        a.iter().zip(b.iter()).take_while(|&(a, b)| a == b).count()
    }
}

/// An immutable, decoded block.
pub struct Block {
    data: Vec<u8>,
    restart_positions: Vec<u32>,
}

impl Block {
    pub fn new(contents: Vec<u8>) -> Result<Self> {
        let len = contents.len();
        if len < 4 {
            return errdata!("block of {len} bytes is too short for a restart count");
        }

        let num_restarts = LittleEndian::read_u32(&contents[len - 4..]) as usize;
        let restart_array_size = num_restarts * 4;
        if len - 4 < restart_array_size {
            return errdata!("block restart array of {num_restarts} entries exceeds block size");
        }

        let restart_array_offset = len - 4 - restart_array_size;
        let mut restart_positions = Vec::with_capacity(num_restarts);
        for i in 0..num_restarts {
            let pos = LittleEndian::read_u32(&contents[restart_array_offset + i * 4..]);
            if pos as usize > restart_array_offset {
                return errdata!("block restart point {pos} is out of bounds");
            }
            restart_positions.push(pos);
        }

        let mut data = contents;
        data.truncate(restart_array_offset);
        Ok(Self {
            data,
            restart_positions,
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn iter(self: Arc<Self>, comparator: Arc<dyn Comparator>) -> BlockIterator {
        BlockIterator::new(self, comparator)
    }
}

/// A positional cursor over one block. Starts out invalid; callers position
/// it with one of the seek operations.
pub struct BlockIterator {
    block: Arc<Block>,
    comparator: Arc<dyn Comparator>,
    /// Offset of the current entry in the block's entry region.
    current: usize,
    /// Offset at which the next entry parse begins.
    next_offset: usize,
    restart_index: usize,
    key: Vec<u8>,
    value_start: usize,
    value_len: usize,
    valid: bool,
    status: Option<Error>,
}

impl BlockIterator {
    pub fn new(block: Arc<Block>, comparator: Arc<dyn Comparator>) -> Self {
        let end = block.data.len();
        Self {
            block,
            comparator,
            current: end,
            next_offset: end,
            restart_index: 0,
            key: Vec::new(),
            value_start: 0,
            value_len: 0,
            valid: false,
            status: None,
        }
    }

    fn num_restarts(&self) -> usize {
        self.block.restart_positions.len()
    }

    fn restart_point(&self, index: usize) -> usize {
        self.block.restart_positions[index] as usize
    }

    fn seek_to_restart_point(&mut self, index: usize) {
        self.restart_index = index;
        self.key.clear();
        self.valid = false;
        self.next_offset = self.restart_point(index);
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.current = self.block.data.len();
        self.next_offset = self.block.data.len();
    }

    fn corruption_error(&mut self) {
        self.status = Some(Error::InvalidData("bad entry in block".to_string()));
        self.key.clear();
        self.invalidate();
    }

    /// Decode the entry at `next_offset` and make it current. Returns false
    /// at the end of the block or on corruption.
    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_offset;
        let data = &self.block.data;
        if self.current >= data.len() {
            self.invalidate();
            return false;
        }

        if data.len() - self.current < ENTRY_HEADER_SIZE {
            self.corruption_error();
            return false;
        }
        let shared = LittleEndian::read_u16(&data[self.current..]) as usize;
        let unshared = LittleEndian::read_u16(&data[self.current + 2..]) as usize;
        let value_len = LittleEndian::read_u32(&data[self.current + 4..]) as usize;

        let key_start = self.current + ENTRY_HEADER_SIZE;
        if shared > self.key.len() || key_start + unshared + value_len > data.len() {
            self.corruption_error();
            return false;
        }

        self.key.truncate(shared);
        self.key.extend_from_slice(&data[key_start..key_start + unshared]);
        self.value_start = key_start + unshared;
        self.value_len = value_len;
        self.next_offset = self.value_start + value_len;

        while self.restart_index + 1 < self.num_restarts()
            && self.restart_point(self.restart_index + 1) <= self.current
        {
            self.restart_index += 1;
        }

        self.valid = true;
        true
    }

    /// Full (unshared) key stored at a restart point.
    fn key_at_restart(&self, index: usize) -> Result<&[u8]> {
        let data = &self.block.data;
        let offset = self.restart_point(index);
        if data.len() - offset < ENTRY_HEADER_SIZE {
            return errdata!("bad restart entry in block");
        }
        let shared = LittleEndian::read_u16(&data[offset..]) as usize;
        let unshared = LittleEndian::read_u16(&data[offset + 2..]) as usize;
        if shared != 0 || offset + ENTRY_HEADER_SIZE + unshared > data.len() {
            return errdata!("bad restart entry in block");
        }
        Ok(&data[offset + ENTRY_HEADER_SIZE..offset + ENTRY_HEADER_SIZE + unshared])
    }
}

impl Cursor for BlockIterator {
    fn valid(&self) -> bool {
        self.valid
    }

    fn seek_to_first(&mut self) {
        if self.num_restarts() == 0 {
            self.invalidate();
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    fn seek_to_last(&mut self) {
        if self.num_restarts() == 0 {
            self.invalidate();
            return;
        }
        self.seek_to_restart_point(self.num_restarts() - 1);
        while self.parse_next_key() && self.next_offset < self.block.data.len() {}
    }

    fn seek(&mut self, target: &[u8]) {
        if self.num_restarts() == 0 {
            self.invalidate();
            return;
        }

        // Binary search for the last restart point with a key < target.
        let mut left = 0;
        let mut right = self.num_restarts() - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let ordering = match self.key_at_restart(mid) {
                Ok(key) => self.comparator.compare(key, target),
                Err(_) => {
                    self.corruption_error();
                    return;
                }
            };
            match ordering {
                Ordering::Less => left = mid,
                _ => right = mid - 1,
            }
        }

        // Linear scan forward to the first key >= target.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.comparator.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        assert!(self.valid);
        self.parse_next_key();
    }

    fn prev(&mut self) {
        assert!(self.valid);

        // Back up to the restart point strictly before the current entry,
        // then walk forward until the entry just before it.
        let original = self.current;
        while self.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                self.key.clear();
                self.invalidate();
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_key() && self.next_offset < original {}
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid);
        &self.key
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid);
        &self.block.data[self.value_start..self.value_start + self.value_len]
    }

    fn status(&self) -> Result<()> {
        match &self.status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
