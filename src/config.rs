use std::sync::Arc;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::filter::FilterPolicy;

/// How a block's payload is stored on disk. The discriminants are part of the
/// file format and are written into the block trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None = 0x00,
    Snappy = 0x01,
}

impl CompressionType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(CompressionType::None),
            0x01 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

/// Build-time configuration for a table.
#[derive(Clone)]
pub struct Options {
    /// Key ordering. Must stay fixed for the lifetime of a builder.
    pub comparator: Arc<dyn Comparator>,

    /// Optional filter policy. When set, a filter block is appended to the
    /// table and referenced from the metaindex block.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Target uncompressed size for a data block (default: 4KB). Blocks may
    /// run slightly over to fit the entry that crosses the threshold.
    pub block_size: usize,

    /// Number of entries between restart points in a data block (default: 16).
    /// The index block always uses an interval of 1.
    pub block_restart_interval: usize,

    /// Compression applied to data, index, and metaindex blocks. Filter
    /// blocks are always stored raw.
    pub compression: CompressionType,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparator: Arc::new(BytewiseComparator),
            filter_policy: None,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            compression: CompressionType::Snappy,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the comparator.
    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Set the filter policy.
    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    /// Set the target data block size.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the data block restart interval.
    pub fn block_restart_interval(mut self, interval: usize) -> Self {
        self.block_restart_interval = interval;
        self
    }

    /// Set the block compression type.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }
}

/// Per-read configuration.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Verify the trailer checksum of every block read (default: true).
    pub verify_checksums: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = Options::default();
        assert_eq!(options.block_size, 4096);
        assert_eq!(options.block_restart_interval, 16);
        assert_eq!(options.compression, CompressionType::Snappy);
        assert!(options.filter_policy.is_none());
        assert_eq!(options.comparator.name(), "bytewise");
    }

    #[test]
    fn test_options_builder() {
        let options = Options::new()
            .block_size(512)
            .block_restart_interval(4)
            .compression(CompressionType::None);

        assert_eq!(options.block_size, 512);
        assert_eq!(options.block_restart_interval, 4);
        assert_eq!(options.compression, CompressionType::None);
    }

    #[test]
    fn test_compression_type_roundtrip() {
        assert_eq!(CompressionType::from_u8(0x00), Some(CompressionType::None));
        assert_eq!(
            CompressionType::from_u8(0x01),
            Some(CompressionType::Snappy)
        );
        assert_eq!(CompressionType::from_u8(0x02), None);
    }
}
