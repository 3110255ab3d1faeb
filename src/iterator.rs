//! The cursor abstraction and the two-level iterator composing an index
//! cursor with lazily materialized data block cursors.

use crate::config::ReadOptions;
use crate::error::{Error, Result};

/// A positional cursor over sorted key/value pairs.
///
/// Every sorted source (block, table, merged view) implements this trait.
/// A freshly constructed cursor is not positioned; callers must seek first.
/// `key` and `value` may only be called while `valid` returns true. Errors
/// do not abort iteration: the cursor becomes invalid and the first failure
/// is reported through `status`.
pub trait Cursor {
    /// Whether the cursor is positioned at an entry.
    fn valid(&self) -> bool;

    /// Position at the first entry.
    fn seek_to_first(&mut self);

    /// Position at the last entry.
    fn seek_to_last(&mut self);

    /// Position at the first entry with key >= `target`.
    fn seek(&mut self, target: &[u8]);

    /// Advance to the next entry. Requires `valid()`.
    fn next(&mut self);

    /// Move to the previous entry. Requires `valid()`.
    fn prev(&mut self);

    /// Key at the current position.
    fn key(&self) -> &[u8];

    /// Value at the current position.
    fn value(&self) -> &[u8];

    /// First failure observed, if any.
    fn status(&self) -> Result<()>;
}

/// Owns an optional boxed cursor and caches its `valid` flag and key.
///
/// The two-level iterator consults `valid` and `key` far more often than it
/// moves, so the cache keeps those reads off the vtable.
pub(crate) struct CursorWrapper<'a> {
    iter: Option<Box<dyn Cursor + 'a>>,
    valid: bool,
    key: Vec<u8>,
}

impl<'a> CursorWrapper<'a> {
    pub fn new(iter: Option<Box<dyn Cursor + 'a>>) -> Self {
        let mut wrapper = Self {
            iter,
            valid: false,
            key: Vec::new(),
        };
        wrapper.update_cache();
        wrapper
    }

    /// Replace the wrapped cursor, dropping the previous one.
    pub fn set(&mut self, iter: Option<Box<dyn Cursor + 'a>>) {
        self.iter = iter;
        self.update_cache();
    }

    pub fn is_set(&self) -> bool {
        self.iter.is_some()
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> &[u8] {
        assert!(self.valid);
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        assert!(self.valid);
        self.iter.as_ref().unwrap().value()
    }

    pub fn status(&self) -> Result<()> {
        match &self.iter {
            Some(iter) => iter.status(),
            None => Ok(()),
        }
    }

    pub fn seek(&mut self, target: &[u8]) {
        self.iter.as_mut().unwrap().seek(target);
        self.update_cache();
    }

    pub fn seek_to_first(&mut self) {
        self.iter.as_mut().unwrap().seek_to_first();
        self.update_cache();
    }

    pub fn seek_to_last(&mut self) {
        self.iter.as_mut().unwrap().seek_to_last();
        self.update_cache();
    }

    pub fn next(&mut self) {
        self.iter.as_mut().unwrap().next();
        self.update_cache();
    }

    pub fn prev(&mut self) {
        self.iter.as_mut().unwrap().prev();
        self.update_cache();
    }

    fn update_cache(&mut self) {
        self.valid = self.iter.as_ref().is_some_and(|i| i.valid());
        self.key.clear();
        if self.valid {
            self.key.extend_from_slice(self.iter.as_ref().unwrap().key());
        }
    }
}

/// Materializes the data block cursor an index entry's handle refers to.
///
/// Kept as an injected closure so callers can close over table-specific
/// state (file, cache, instrumentation) without this module knowing about it.
pub type BlockReaderFn<'a> =
    Box<dyn FnMut(&ReadOptions, &[u8]) -> Result<Box<dyn Cursor + 'a>> + 'a>;

/// Composes an index cursor with the data block cursor for its current
/// entry, presenting the whole table as one flat sorted sequence.
pub struct TwoLevelIterator<'a> {
    index_iter: CursorWrapper<'a>,
    data_iter: CursorWrapper<'a>,
    block_reader: BlockReaderFn<'a>,
    options: ReadOptions,
    /// Handle bytes `data_iter` was built from. When the index cursor moves
    /// but still points at the same block, the data cursor is kept.
    data_block_handle: Vec<u8>,
    status: Option<Error>,
}

impl<'a> TwoLevelIterator<'a> {
    pub fn new(
        index_iter: Box<dyn Cursor + 'a>,
        block_reader: BlockReaderFn<'a>,
        options: ReadOptions,
    ) -> Self {
        Self {
            index_iter: CursorWrapper::new(Some(index_iter)),
            data_iter: CursorWrapper::new(None),
            block_reader,
            options,
            data_block_handle: Vec::new(),
            status: None,
        }
    }

    fn save_error(&mut self, error: Error) {
        if self.status.is_none() {
            self.status = Some(error);
        }
    }

    fn set_data_iter(&mut self, iter: Option<Box<dyn Cursor + 'a>>) {
        if self.data_iter.is_set() {
            if let Err(e) = self.data_iter.status() {
                self.save_error(e);
            }
        }
        self.data_iter.set(iter);
    }

    /// Build (or keep) the data cursor for the current index entry.
    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.set_data_iter(None);
            return;
        }

        let handle = self.index_iter.value().to_vec();
        if self.data_iter.is_set() && handle == self.data_block_handle {
            // data_iter already points at this block.
            return;
        }

        match (self.block_reader)(&self.options, &handle) {
            Ok(iter) => {
                self.data_block_handle = handle;
                self.set_data_iter(Some(iter));
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to open data block");
                self.save_error(e);
                self.data_block_handle.clear();
                self.set_data_iter(None);
            }
        }
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while !self.data_iter.is_set() || !self.data_iter.valid() {
            if !self.index_iter.valid() {
                self.set_data_iter(None);
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if self.data_iter.is_set() {
                self.data_iter.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while !self.data_iter.is_set() || !self.data_iter.valid() {
            if !self.index_iter.valid() {
                self.set_data_iter(None);
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if self.data_iter.is_set() {
                self.data_iter.seek_to_last();
            }
        }
    }
}

impl Cursor for TwoLevelIterator<'_> {
    fn valid(&self) -> bool {
        self.data_iter.valid()
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if self.data_iter.is_set() {
            self.data_iter.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if self.data_iter.is_set() {
            self.data_iter.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if self.data_iter.is_set() {
            self.data_iter.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn next(&mut self) {
        assert!(self.valid());
        self.data_iter.next();
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        assert!(self.valid());
        self.data_iter.prev();
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.value()
    }

    fn status(&self) -> Result<()> {
        self.index_iter.status()?;
        if self.data_iter.is_set() {
            self.data_iter.status()?;
        }
        match &self.status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
