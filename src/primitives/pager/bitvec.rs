//! Growable page-number bitset.
//!
//! A transaction sizes each set to the database size at its start; setting a
//! higher page number extends the backing words.

use crate::types::PageId;

const BITS_PER_WORD: usize = 64;

/// Set of page numbers.
#[derive(Clone, Debug, Default)]
pub struct BitVec {
    size: u32,
    words: Vec<u64>,
}

impl BitVec {
    /// Empty set over pages `1..=size`.
    pub fn with_size(size: u32) -> Self {
        let words = (size as usize).div_ceil(BITS_PER_WORD);
        Self {
            size,
            words: vec![0; words],
        }
    }

    /// Nominal size given at construction.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// True if `page` is in the set.
    pub fn test(&self, page: PageId) -> bool {
        let Some((word, bit)) = position(page) else {
            return false;
        };
        self.words
            .get(word)
            .map(|w| w & (1u64 << bit) != 0)
            .unwrap_or(false)
    }

    /// Adds `page`. Page 0 is ignored.
    pub fn set(&mut self, page: PageId) {
        let Some((word, bit)) = position(page) else {
            return;
        };
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << bit;
    }

    /// Removes `page`.
    pub fn clear(&mut self, page: PageId) {
        if let Some((word, bit)) = position(page) {
            if let Some(w) = self.words.get_mut(word) {
                *w &= !(1u64 << bit);
            }
        }
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

fn position(page: PageId) -> Option<(usize, usize)> {
    if page.is_null() {
        return None;
    }
    let idx = (page.0 - 1) as usize;
    Some((idx / BITS_PER_WORD, idx % BITS_PER_WORD))
}
