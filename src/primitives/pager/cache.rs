//! Page cache: an arena of frames keyed by page number.
//!
//! Two intrusive lists thread through the arena by slot index. The LRU list
//! holds clean pages nobody references, oldest first; only those are ever
//! evicted. The dirty list holds every dirty page in the order it was first
//! dirtied, which is the order commit writes them out. Dirty pages are never
//! evicted, so `capacity` is a target rather than a hard limit.

use rustc_hash::FxHashMap;

use super::frame::{Frame, Link, PageFlags};
use crate::types::{page_hash, PageId, Result, SombraError};

/// Outcome of [`PageCache::fetch`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Fetched {
    pub slot: usize,
    /// The page was not cached; its content is zeroed and must be loaded.
    pub created: bool,
    /// An unreferenced page was evicted to make room.
    pub evicted: bool,
}

pub struct PageCache {
    page_size: usize,
    extra_size: usize,
    capacity: usize,
    evictable: bool,
    frames: Vec<Frame>,
    free: Vec<usize>,
    index: FxHashMap<PageId, usize>,
    lru_head: Option<usize>,
    lru_tail: Option<usize>,
    dirty_head: Option<usize>,
    dirty_tail: Option<usize>,
    referenced: usize,
}

#[derive(Copy, Clone)]
enum List {
    Lru,
    Dirty,
}

impl PageCache {
    pub fn new(page_size: usize, extra_size: usize, capacity: usize) -> Self {
        Self {
            page_size,
            extra_size,
            capacity: capacity.max(1),
            evictable: true,
            frames: Vec::new(),
            free: Vec::new(),
            index: FxHashMap::default(),
            lru_head: None,
            lru_tail: None,
            dirty_head: None,
            dirty_tail: None,
            referenced: 0,
        }
    }

    /// Disables eviction; the cache then holds the only copy of every page.
    pub fn set_evictable(&mut self, evictable: bool) {
        self.evictable = evictable;
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    /// Changes the page size. Only allowed while the cache is empty.
    pub fn set_page_size(&mut self, page_size: usize) -> Result<()> {
        if !self.index.is_empty() {
            return Err(SombraError::Misuse("page size changed with pages cached"));
        }
        self.page_size = page_size;
        self.frames.clear();
        self.free.clear();
        Ok(())
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of pages with a non-zero reference count.
    pub fn referenced(&self) -> usize {
        self.referenced
    }

    pub fn frame(&self, slot: usize) -> &Frame {
        &self.frames[slot]
    }

    pub fn frame_mut(&mut self, slot: usize) -> &mut Frame {
        &mut self.frames[slot]
    }

    /// Slot holding `number`, without taking a reference.
    pub fn lookup(&self, number: PageId) -> Option<usize> {
        self.index.get(&number).copied()
    }

    /// Returns the page with a new reference, creating a zeroed page if it is
    /// not cached.
    pub fn fetch(&mut self, number: PageId) -> Fetched {
        if let Some(slot) = self.lookup(number) {
            self.add_ref(slot);
            return Fetched {
                slot,
                created: false,
                evicted: false,
            };
        }
        let (slot, evicted) = self.allocate_slot();
        self.frames[slot].reset(number);
        self.frames[slot].ref_count = 1;
        self.referenced += 1;
        self.index.insert(number, slot);
        Fetched {
            slot,
            created: true,
            evicted,
        }
    }

    /// Returns a cached page with a new reference, or `NotFound` when the
    /// page is not cached.
    pub fn fetch_existing(&mut self, number: PageId) -> Result<usize> {
        let slot = self.lookup(number).ok_or(SombraError::NotFound)?;
        self.add_ref(slot);
        Ok(slot)
    }

    fn allocate_slot(&mut self) -> (usize, bool) {
        if self.index.len() >= self.capacity && self.evictable {
            if let Some(victim) = self.lru_head {
                self.discard(victim);
                if let Some(slot) = self.free.pop() {
                    return (slot, true);
                }
            }
        }
        if let Some(slot) = self.free.pop() {
            return (slot, false);
        }
        self.frames.push(Frame::new(self.page_size, self.extra_size));
        (self.frames.len() - 1, false)
    }

    pub fn add_ref(&mut self, slot: usize) {
        let frame = &mut self.frames[slot];
        if frame.ref_count == 0 {
            self.referenced += 1;
            if frame.on_lru {
                self.unlink(List::Lru, slot);
            }
        }
        self.frames[slot].ref_count += 1;
    }

    /// Drops one reference. Returns the remaining count.
    pub fn release(&mut self, slot: usize) -> u32 {
        let frame = &mut self.frames[slot];
        debug_assert!(frame.ref_count > 0, "release of unreferenced page");
        frame.ref_count = frame.ref_count.saturating_sub(1);
        let remaining = frame.ref_count;
        if remaining == 0 {
            self.referenced = self.referenced.saturating_sub(1);
            if !self.frames[slot].is_dirty() {
                self.push_back(List::Lru, slot);
            }
        }
        remaining
    }

    pub fn make_dirty(&mut self, slot: usize) {
        if self.frames[slot].is_dirty() {
            return;
        }
        if self.frames[slot].on_lru {
            self.unlink(List::Lru, slot);
        }
        self.frames[slot].flags.insert(PageFlags::DIRTY);
        self.push_back(List::Dirty, slot);
    }

    /// Clears DIRTY and NEED_SYNC and unlinks the page from the dirty list.
    pub fn make_clean(&mut self, slot: usize) {
        if !self.frames[slot].is_dirty() {
            return;
        }
        self.unlink(List::Dirty, slot);
        let frame = &mut self.frames[slot];
        frame.flags.remove(PageFlags::DIRTY | PageFlags::NEED_SYNC);
        if frame.ref_count == 0 {
            self.push_back(List::Lru, slot);
        }
    }

    /// Dirty pages, in the order they were first dirtied.
    pub fn dirty_slots(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cursor = self.dirty_head;
        while let Some(slot) = cursor {
            out.push(slot);
            cursor = self.frames[slot].dirty.next;
        }
        out
    }

    /// Every cached page, in no particular order.
    pub fn slots(&self) -> Vec<usize> {
        self.index.values().copied().collect()
    }

    /// Re-keys a page. A different page already cached under `number` is
    /// dropped first; it must not be referenced.
    pub fn move_page(&mut self, slot: usize, number: PageId) -> Result<()> {
        let old = self.frames[slot].number;
        if old == number {
            return Ok(());
        }
        if let Some(other) = self.lookup(number) {
            if self.frames[other].ref_count > 0 {
                return Err(SombraError::Misuse("move target page is referenced"));
            }
            self.discard(other);
        }
        self.index.remove(&old);
        self.index.insert(number, slot);
        self.frames[slot].number = number;
        Ok(())
    }

    /// Removes an unreferenced page, dirty or not.
    pub fn drop_page(&mut self, slot: usize) -> Result<()> {
        if self.frames[slot].ref_count > 0 {
            return Err(SombraError::Misuse("drop of referenced page"));
        }
        self.discard(slot);
        Ok(())
    }

    /// Forgets every page numbered above `max`. Referenced pages cannot be
    /// dropped, so they are zeroed and cleaned instead.
    pub fn truncate(&mut self, max: u32) {
        let doomed: Vec<usize> = self
            .index
            .iter()
            .filter(|(number, _)| number.0 > max)
            .map(|(_, slot)| *slot)
            .collect();
        for slot in doomed {
            if self.frames[slot].ref_count > 0 {
                self.make_clean(slot);
                let frame = &mut self.frames[slot];
                frame.data.fill(0);
                frame.content_hash = page_hash(&frame.data);
            } else {
                self.discard(slot);
            }
        }
    }

    /// Zeroes and cleans every page numbered above `max`, keeping the frames
    /// and their snapshots.
    pub fn zero_above(&mut self, max: u32) {
        let doomed: Vec<usize> = self
            .index
            .iter()
            .filter(|(number, _)| number.0 > max)
            .map(|(_, slot)| *slot)
            .collect();
        for slot in doomed {
            self.make_clean(slot);
            let frame = &mut self.frames[slot];
            frame.data.fill(0);
            frame.content_hash = page_hash(&frame.data);
        }
    }

    /// Drops every unreferenced page.
    pub fn clear(&mut self) {
        for slot in self.slots() {
            if self.frames[slot].ref_count == 0 {
                self.discard(slot);
            }
        }
    }

    /// Snapshots a page's current content for an in-memory rollback.
    /// Keeps an existing snapshot.
    pub fn preserve(&mut self, slot: usize, for_statement: bool) {
        let frame = &mut self.frames[slot];
        let idx = usize::from(for_statement);
        if frame.saved[idx].is_none() {
            frame.saved[idx] = Some(frame.data.clone());
        }
    }

    /// True if a snapshot exists.
    pub fn is_preserved(&self, slot: usize, for_statement: bool) -> bool {
        self.frames[slot].saved[usize::from(for_statement)].is_some()
    }

    /// Copies a snapshot back over the page. Returns false if there was none.
    pub fn restore(&mut self, slot: usize, for_statement: bool) -> bool {
        let frame = &mut self.frames[slot];
        match frame.saved[usize::from(for_statement)].take() {
            Some(saved) => {
                frame.data.copy_from_slice(&saved);
                true
            }
            None => false,
        }
    }

    /// Drops snapshots of one kind across the cache.
    pub fn discard_preserved(&mut self, for_statement: bool) {
        let idx = usize::from(for_statement);
        for frame in self.frames.iter_mut() {
            frame.saved[idx] = None;
        }
    }

    fn discard(&mut self, slot: usize) {
        if self.frames[slot].on_lru {
            self.unlink(List::Lru, slot);
        }
        if self.frames[slot].is_dirty() {
            self.unlink(List::Dirty, slot);
        }
        let number = self.frames[slot].number;
        self.index.remove(&number);
        self.frames[slot].reset(PageId(0));
        self.free.push(slot);
    }

    fn link(&mut self, list: List, slot: usize) -> &mut Link {
        match list {
            List::Lru => &mut self.frames[slot].lru,
            List::Dirty => &mut self.frames[slot].dirty,
        }
    }

    fn ends(&mut self, list: List) -> (&mut Option<usize>, &mut Option<usize>) {
        match list {
            List::Lru => (&mut self.lru_head, &mut self.lru_tail),
            List::Dirty => (&mut self.dirty_head, &mut self.dirty_tail),
        }
    }

    fn push_back(&mut self, list: List, slot: usize) {
        let tail = *self.ends(list).1;
        *self.link(list, slot) = Link {
            prev: tail,
            next: None,
        };
        match tail {
            Some(t) => self.link(list, t).next = Some(slot),
            None => *self.ends(list).0 = Some(slot),
        }
        *self.ends(list).1 = Some(slot);
        if let List::Lru = list {
            self.frames[slot].on_lru = true;
        }
    }

    fn unlink(&mut self, list: List, slot: usize) {
        let Link { prev, next } = *self.link(list, slot);
        match prev {
            Some(p) => self.link(list, p).next = next,
            None => *self.ends(list).0 = next,
        }
        match next {
            Some(n) => self.link(list, n).prev = prev,
            None => *self.ends(list).1 = prev,
        }
        *self.link(list, slot) = Link::default();
        if let List::Lru = list {
            self.frames[slot].on_lru = false;
        }
    }
}
