//! Filter policies and the filter block side index.
//!
//! A filter block holds one digest per 2KB range of data-block start offsets.
//! Readers look up the digest for the block they are about to fetch and skip
//! the fetch when the key definitely is not present.
//!
//! Filter block layout:
//!
//! ```text
//! +---------------------+
//! | filter 0            |
//! | filter 1            |
//! | ...                 |
//! +---------------------+
//! | offset of filter 0  |  (u32 each, little-endian)
//! | offset of filter 1  |
//! | ...                 |
//! +---------------------+
//! | offset array start  |  (u32)
//! | base lg             |  (u8)
//! +---------------------+
//! ```

use byteorder::{ByteOrder, LittleEndian};
use xxhash_rust::xxh3::xxh3_128;

/// Every data block whose start offset falls in the same 2^FILTER_BASE_LG
/// byte range shares a filter.
const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Builds and probes per-block key digests.
pub trait FilterPolicy: Send + Sync {
    /// A stable name, recorded in the metaindex block as `"filter." + name`.
    /// Changing the digest format must change the name.
    fn name(&self) -> &'static str;

    /// Serialize a digest over `keys` into `dst`.
    fn create_filter(&self, keys: &[Vec<u8>], dst: &mut Vec<u8>);

    /// Whether `key` may be present in the set `filter` was built from.
    /// False positives are allowed, false negatives are not.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Bloom filter with double hashing over a split 128-bit xxh3 hash.
///
/// Sizing follows the usual math: `k = bits_per_key * ln(2)` probes. 10 bits
/// per key gives roughly a 1% false positive rate.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    num_probes: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        let num_probes = ((bits_per_key as f64) * 0.69).round() as usize;
        Self {
            bits_per_key,
            num_probes: num_probes.clamp(1, 30),
        }
    }

    fn hash_key(key: &[u8]) -> (u64, u64) {
        let hash = xxh3_128(key);
        (hash as u64, (hash >> 64) as u64)
    }
}

impl Default for BloomFilterPolicy {
    fn default() -> Self {
        Self::new(10)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "bloom.xxh3"
    }

    fn create_filter(&self, keys: &[Vec<u8>], dst: &mut Vec<u8>) {
        let num_bits = (keys.len() * self.bits_per_key).max(64);
        let num_bytes = num_bits.div_ceil(8);
        let num_bits = num_bytes * 8;

        let start = dst.len();
        dst.resize(start + num_bytes, 0);

        for key in keys {
            let (h1, h2) = Self::hash_key(key);
            for i in 0..self.num_probes {
                let pos = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits as u64) as usize;
                dst[start + pos / 8] |= 1 << (pos % 8);
            }
        }

        // Probe count travels with the digest so readers stay compatible
        // when bits_per_key changes.
        dst.push(self.num_probes as u8);
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return false;
        }

        let num_probes = filter[filter.len() - 1] as usize;
        if num_probes > 30 {
            // Reserved for future encodings; treat as a potential match.
            return true;
        }

        let bits = &filter[..filter.len() - 1];
        let num_bits = (bits.len() * 8) as u64;

        let (h1, h2) = Self::hash_key(key);
        for i in 0..num_probes {
            let pos = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits) as usize;
            if bits[pos / 8] & (1 << (pos % 8)) == 0 {
                return false;
            }
        }
        true
    }
}

/// Accumulates per-data-block digests during a table build.
///
/// The table builder calls `start_block` with the file offset at which each
/// new data block begins accumulating and `add_key` for every key added.
pub struct FilterBlockBuilder {
    policy: std::sync::Arc<dyn FilterPolicy>,
    keys: Vec<Vec<u8>>,
    filter_offsets: Vec<u32>,
    result: Vec<u8>,
}

impl FilterBlockBuilder {
    pub fn new(policy: std::sync::Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            keys: Vec::new(),
            filter_offsets: Vec::new(),
            result: Vec::new(),
        }
    }

    /// A new data block begins accumulating at `block_offset`. Flushes
    /// pending keys into filters covering all earlier offset ranges.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Serializes the accumulated filters. Written to the file uncompressed.
    pub fn finish(mut self) -> Vec<u8> {
        if !self.keys.is_empty() {
            self.generate_filter();
        }

        let array_offset = self.result.len() as u32;
        for offset in &self.filter_offsets {
            let mut buf = [0u8; 4];
            LittleEndian::write_u32(&mut buf, *offset);
            self.result.extend_from_slice(&buf);
        }

        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, array_offset);
        self.result.extend_from_slice(&buf);
        self.result.push(FILTER_BASE_LG);
        self.result
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.keys.is_empty() {
            return;
        }
        self.policy.create_filter(&self.keys, &mut self.result);
        self.keys.clear();
    }
}

/// Probes a serialized filter block.
pub struct FilterBlockReader {
    policy: std::sync::Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    array_offset: usize,
    num_filters: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    pub fn new(policy: std::sync::Arc<dyn FilterPolicy>, data: Vec<u8>) -> Self {
        // 4 bytes of offset array start plus 1 byte of base lg.
        if data.len() < 5 {
            return Self::empty(policy, data);
        }

        let base_lg = data[data.len() - 1];
        let array_offset = LittleEndian::read_u32(&data[data.len() - 5..]) as usize;
        if array_offset > data.len() - 5 {
            return Self::empty(policy, data);
        }

        let num_filters = (data.len() - 5 - array_offset) / 4;
        Self {
            policy,
            data,
            array_offset,
            num_filters,
            base_lg,
        }
    }

    fn empty(policy: std::sync::Arc<dyn FilterPolicy>, data: Vec<u8>) -> Self {
        Self {
            policy,
            data,
            array_offset: 0,
            num_filters: 0,
            base_lg: 0,
        }
    }

    /// Whether `key` may be present in the data block starting at
    /// `block_offset`. Malformed filters report a potential match.
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            return true;
        }

        let pos = self.array_offset + index * 4;
        let start = LittleEndian::read_u32(&self.data[pos..]) as usize;
        let limit = LittleEndian::read_u32(&self.data[pos + 4..]) as usize;
        // The last entry's limit is the start of the offset array itself.
        let limit = if index + 1 == self.num_filters {
            self.array_offset
        } else {
            limit
        };

        if start == limit {
            // Empty filter: no keys mapped to this range.
            return false;
        }
        if start > limit || limit > self.array_offset {
            return true;
        }
        self.policy.key_may_match(key, &self.data[start..limit])
    }
}
