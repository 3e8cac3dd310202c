use bitflags::bitflags;

use crate::types::PageId;

bitflags! {
    /// Per-page bookkeeping.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct PageFlags: u16 {
        /// Modified since it was last written to the database file.
        const DIRTY = 0x0001;
        /// Pre-image is in the rollback journal.
        const IN_JOURNAL = 0x0002;
        /// Pre-image is in the statement journal.
        const IN_STATEMENT_JOURNAL = 0x0004;
        /// The journal must be synced before this page reaches the file.
        const NEED_SYNC = 0x0008;
        /// Content has not been loaded from the file yet.
        const NEED_READ = 0x0010;
        /// Content is irrelevant; commit skips it.
        const DONT_WRITE = 0x0020;
        /// Always restore on rollback even without a journal record.
        const ALWAYS_ROLLBACK = 0x0040;
    }
}

/// Index-based links for the cache's intrusive lists.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Link {
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

/// Slot in the page cache arena.
pub struct Frame {
    /// Page number held, or 0 when the slot is free.
    pub number: PageId,
    pub data: Box<[u8]>,
    /// Upper-layer metadata, zeroed when the page enters the cache.
    pub extra: Box<[u8]>,
    pub flags: PageFlags,
    pub ref_count: u32,
    /// Hash of `data` as of the last read or write of the database file.
    pub content_hash: u32,
    /// Pre-images kept in memory instead of a journal: `[transaction, statement]`.
    pub saved: [Option<Box<[u8]>>; 2],
    pub(crate) lru: Link,
    pub(crate) dirty: Link,
    pub(crate) on_lru: bool,
}

impl Frame {
    pub fn new(page_size: usize, extra_size: usize) -> Self {
        Self {
            number: PageId(0),
            data: vec![0u8; page_size].into_boxed_slice(),
            extra: vec![0u8; extra_size].into_boxed_slice(),
            flags: PageFlags::empty(),
            ref_count: 0,
            content_hash: 0,
            saved: [None, None],
            lru: Link::default(),
            dirty: Link::default(),
            on_lru: false,
        }
    }

    /// Returns the slot to its pristine state under a new page number.
    pub(crate) fn reset(&mut self, number: PageId) {
        self.number = number;
        self.data.fill(0);
        self.extra.fill(0);
        self.flags = PageFlags::empty();
        self.ref_count = 0;
        self.content_hash = 0;
        self.saved = [None, None];
        self.lru = Link::default();
        self.dirty = Link::default();
        self.on_lru = false;
    }

    pub fn is_free(&self) -> bool {
        self.number.is_null()
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PageFlags::DIRTY)
    }
}

/// Reference to a cached page, returned by the pager's acquire calls.
///
/// Each handle accounts for one reference; give it back with
/// `Pager::release`. A handle stays valid across `move_page`, which re-keys
/// the page in place.
#[derive(Debug, PartialEq, Eq)]
pub struct PageHandle {
    pub(crate) slot: usize,
}

impl PageHandle {
    pub(crate) fn new(slot: usize) -> Self {
        Self { slot }
    }
}
