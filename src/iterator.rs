//! Store Iterator
//!
//! Key-ordered iteration over current values. Rows are pulled from the
//! table a page at a time; after each page the range bound moves past the
//! last key returned, so the table is never loaded whole.
//!
//! Pending buffered writes are flushed when the iterator is created. Writes
//! made while iterating may or may not be seen by later pages.

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

use crate::backend::{KeyRange, LogRow};
use crate::codec::{ReadOptions, Value};
use crate::engine::inner::Core;
use crate::error::{Result, StoreError};

/// Default rows fetched per page
pub const DEFAULT_PAGE_SIZE: usize = 128;

/// Range and shaping options for an iterator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterOptions {
    /// Exclusive lower bound (wins over `gte`)
    pub gt: Option<Vec<u8>>,
    pub gte: Option<Vec<u8>>,

    /// Exclusive upper bound (wins over `lte`)
    pub lt: Option<Vec<u8>>,
    pub lte: Option<Vec<u8>>,

    /// Walk keys in descending order
    pub reverse: bool,

    /// Stop after this many entries
    pub limit: Option<usize>,

    /// Value shaping
    pub read: ReadOptions,

    /// Rows fetched per query
    pub page_size: usize,
}

impl Default for IterOptions {
    fn default() -> Self {
        Self {
            gt: None,
            gte: None,
            lt: None,
            lte: None,
            reverse: false,
            limit: None,
            read: ReadOptions::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl IterOptions {
    /// The key range these options describe
    pub fn range(&self) -> KeyRange {
        let lower = match (&self.gt, &self.gte) {
            (Some(key), _) => Bound::Excluded(key.clone()),
            (None, Some(key)) => Bound::Included(key.clone()),
            (None, None) => Bound::Unbounded,
        };
        let upper = match (&self.lt, &self.lte) {
            (Some(key), _) => Bound::Excluded(key.clone()),
            (None, Some(key)) => Bound::Included(key.clone()),
            (None, None) => Bound::Unbounded,
        };
        KeyRange { lower, upper }
    }
}

/// Iterator over `(key, value)` pairs
pub struct StoreIterator {
    core: Arc<Core>,
    range: KeyRange,
    reverse: bool,
    remaining: Option<usize>,
    read: ReadOptions,
    page_size: usize,
    page: VecDeque<LogRow>,
    exhausted: bool,
}

impl StoreIterator {
    pub(crate) fn new(core: Arc<Core>, options: IterOptions) -> Self {
        Self {
            core,
            range: options.range(),
            reverse: options.reverse,
            remaining: options.limit,
            read: options.read,
            page_size: options.page_size.max(1),
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Pull the next page and move the range past it
    fn fetch(&mut self) -> Result<()> {
        let want = match self.remaining {
            Some(remaining) => remaining.min(self.page_size),
            None => self.page_size,
        };
        let rows = self.core.scan(&self.range, self.reverse, Some(want))?;

        if rows.len() < want {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            let bound = Bound::Excluded(last.key.clone());
            if self.reverse {
                self.range.upper = bound;
            } else {
                self.range.lower = bound;
            }
        }
        self.page.extend(rows);
        Ok(())
    }
}

impl Iterator for StoreIterator {
    type Item = Result<(Vec<u8>, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.remaining == Some(0) {
                return None;
            }

            if let Some(row) = self.page.pop_front() {
                match self.core.decode(&row, &self.read) {
                    Ok(value) => {
                        if let Some(remaining) = self.remaining.as_mut() {
                            *remaining -= 1;
                        }
                        return Some(Ok((row.key, value)));
                    }
                    // Undecodable rows are skipped, like a missing key
                    Err(StoreError::NotFound) => continue,
                    Err(e) => return Some(Err(e)),
                }
            }

            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}
