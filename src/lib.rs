//! Sorted string tables: immutable on-disk files of key-ordered entries.
//!
//! A table is a sequence of prefix-compressed data blocks followed by an
//! optional filter block, a metaindex block naming it, an index block with
//! one shortest-separator entry per data block, and a fixed-size footer.
//! Every block is framed with a compression type byte and a masked CRC32C.
//!
//! [`builder::TableBuilder`] streams sorted entries into that layout;
//! [`reader::Table`] opens a finished file and serves point lookups and
//! ordered scans through [`iterator::TwoLevelIterator`].

pub mod block;
pub mod builder;
pub mod comparator;
pub mod config;
pub mod error;
pub mod filter;
pub mod format;
pub mod iterator;
pub mod merge;
pub mod reader;

pub use builder::TableBuilder;
pub use config::{CompressionType, Options, ReadOptions};
pub use error::{Error, Result};
pub use iterator::Cursor;
pub use reader::Table;
