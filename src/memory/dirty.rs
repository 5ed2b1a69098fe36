//! Per-byte dirty tracking for overlay caches.
//!
//! ```rust,ignore
//! use vmscope::memory::DirtyMap;
//!
//! let mut dirty = DirtyMap::new(16);
//! dirty.mark(2, 2)?;
//! dirty.mark(4, 1)?;
//! dirty.mark(10, 1)?;
//! assert_eq!(dirty.runs().collect::<Vec<_>>(), vec![2..5, 10..11]);
//! ```

use std::ops::Range;

use crate::{Error::OutOfBounds, Result};

/// A bit vector with one bit per cached byte, set when the byte was written through an overlay
/// and not yet flushed to the guest.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DirtyMap {
    /// The bits, stored as a vector of words.
    words: Vec<u64>,
    /// The number of tracked bytes.
    len: usize,
}

impl DirtyMap {
    /// Creates a clean map tracking `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// Number of tracked bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no byte is dirty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Number of dirty bytes
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Marks `count` bytes starting at `start` as dirty.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range extends past the tracked length.
    pub fn mark(&mut self, start: usize, count: usize) -> Result<()> {
        let Some(end) = start.checked_add(count) else {
            return Err(OutOfBounds);
        };
        if end > self.len {
            return Err(OutOfBounds);
        }
        for index in start..end {
            self.words[index / 64] |= 1u64 << (index % 64);
        }
        Ok(())
    }

    /// Marks `count` bytes starting at `start` clean. Bytes past the end are ignored.
    pub fn clear_range(&mut self, start: usize, count: usize) {
        let end = start.saturating_add(count).min(self.len);
        for index in start..end {
            self.words[index / 64] &= !(1u64 << (index % 64));
        }
    }

    /// Returns `true` if the byte at `index` is dirty. Indices past the end are clean.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        (self.words[index / 64] & (1u64 << (index % 64))) != 0
    }

    /// Marks every byte clean.
    pub fn clear(&mut self) {
        for word in &mut self.words {
            *word = 0;
        }
    }

    /// Returns an iterator over maximal runs of contiguous dirty bytes, in ascending order.
    pub fn runs(&self) -> DirtyRuns<'_> {
        DirtyRuns {
            map: self,
            index: 0,
        }
    }
}

impl std::fmt::Debug for DirtyMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.runs()).finish()
    }
}

/// Iterator over the dirty runs of a [`DirtyMap`].
pub struct DirtyRuns<'a> {
    map: &'a DirtyMap,
    index: usize,
}

impl Iterator for DirtyRuns<'_> {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.map.len {
            // Skip clean words in one step.
            if self.index % 64 == 0 && self.map.words[self.index / 64] == 0 {
                self.index += 64;
                continue;
            }
            if self.map.contains(self.index) {
                let start = self.index;
                while self.index < self.map.len && self.map.contains(self.index) {
                    self.index += 1;
                }
                return Some(start..self.index);
            }
            self.index += 1;
        }
        None
    }
}
