//! Merges N sorted cursors into one sorted view.
//!
//! Used when a scan spans several tables: each child cursor yields its own
//! sorted sequence and the merger repeatedly surfaces the smallest (or, when
//! iterating backwards, largest) head.

use std::sync::Arc;

use crate::comparator::Comparator;
use crate::error::Result;
use crate::iterator::{Cursor, CursorWrapper};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    Forward,
    Reverse,
}

pub struct MergingIterator<'a> {
    comparator: Arc<dyn Comparator>,
    children: Vec<CursorWrapper<'a>>,
    /// Index of the child the merger is currently positioned on.
    current: Option<usize>,
    direction: Direction,
}

impl<'a> MergingIterator<'a> {
    pub fn new(comparator: Arc<dyn Comparator>, children: Vec<Box<dyn Cursor + 'a>>) -> Self {
        Self {
            comparator,
            children: children
                .into_iter()
                .map(|c| CursorWrapper::new(Some(c)))
                .collect(),
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                Some(s)
                    if self
                        .comparator
                        .compare(child.key(), self.children[s].key())
                        .is_ge() => {}
                _ => smallest = Some(i),
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match largest {
                Some(l)
                    if self
                        .comparator
                        .compare(child.key(), self.children[l].key())
                        .is_le() => {}
                _ => largest = Some(i),
            }
        }
        self.current = largest;
    }

    fn current_index(&self) -> usize {
        self.current.expect("merging iterator is not positioned")
    }
}

impl Cursor for MergingIterator<'_> {
    fn valid(&self) -> bool {
        self.current.is_some_and(|i| self.children[i].valid())
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn next(&mut self) {
        assert!(self.valid());
        let current = self.current_index();

        // After a direction switch every other child must be repositioned
        // just past the current key before it can participate again.
        if self.direction != Direction::Forward {
            let key = self.children[current].key().to_vec();
            for i in 0..self.children.len() {
                if i == current {
                    continue;
                }
                let child = &mut self.children[i];
                child.seek(&key);
                if child.valid() && self.comparator.compare(&key, child.key()).is_eq() {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        assert!(self.valid());
        let current = self.current_index();

        // Symmetric to `next`: bring every other child just before the
        // current key.
        if self.direction != Direction::Reverse {
            let key = self.children[current].key().to_vec();
            for i in 0..self.children.len() {
                if i == current {
                    continue;
                }
                let child = &mut self.children[i];
                child.seek(&key);
                if child.valid() {
                    // Child is at the first entry >= key; step back.
                    child.prev();
                } else {
                    // All of the child's entries are < key.
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        self.children[self.current_index()].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current_index()].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}
