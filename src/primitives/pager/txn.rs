//! Write transactions: journaling, two-phase commit, rollback and
//! statement journals.
//!
//! Nothing reaches the database file before `commit_phase_two`, so a
//! rollback only ever has to rewrite the file when phase two failed part
//! way through.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, warn};

use super::bitvec::BitVec;
use super::frame::{PageFlags, PageHandle};
use super::journal::{self, JournalHeader, JOURNAL_HEADER_LEN, RECORD_COUNT_OFFSET};
use super::pager::{pager_test_log, DbKind, JournalMode, Pager, PagerState, Synchronous};
use crate::primitives::concurrency::LockLevel;
use crate::primitives::io::{FileIo, FileSystem, FileType, MemFileSystem, OpenPermissions};
use crate::types::{page_hash, ErrorCode, PageId, Result, SombraError};

/// Bookkeeping of the open write transaction.
#[derive(Debug, Default)]
pub(crate) struct TxnState {
    pub open: bool,
    /// Some page was written.
    pub db_modified: bool,
    /// Phase two started writing the database file.
    pub db_written: bool,
    /// Phase one completed and no page was written since.
    pub synced: bool,
    /// Append offset in the rollback journal.
    pub journal_off: u64,
    /// Records in the rollback journal.
    pub n_rec: u32,
    pub nonce: u32,
    /// The journal has been synced at least once.
    pub journal_started: bool,
    pub need_sync: bool,
    /// A master journal trailer was appended.
    pub set_master: bool,
    pub commit_no_sync: bool,
    /// Pages whose pre-transaction image is journaled.
    pub in_journal: BitVec,
    pub always_rollback: BitVec,
    /// Pages above this were cut off by a truncate and read as zeros.
    pub size_floor: u32,
    pub stmt: Option<StatementState>,
}

/// Open statement (savepoint) inside a transaction.
#[derive(Debug)]
pub(crate) struct StatementState {
    /// Database size when the statement began.
    pub size: u32,
    pub n_rec: u32,
    /// Append offset in the statement journal.
    pub offset: u64,
    /// Pages whose pre-statement image can be restored.
    pub in_stmt: BitVec,
    pub in_journal_at_start: BitVec,
    pub journal_off_at_start: u64,
    pub n_rec_at_start: u32,
    pub size_floor_at_start: u32,
}

impl Pager {
    /// Opens a write transaction and takes RESERVED, or EXCLUSIVE when
    /// `exclusive` is set. Inside a transaction it only escalates.
    pub fn begin(&mut self, exclusive: bool) -> Result<()> {
        self.check_writable()?;
        self.ensure_shared_lock()?;
        if self.txn.open {
            if exclusive && self.state < PagerState::Exclusive {
                self.wait_on_lock(LockLevel::Exclusive)?;
                self.state = PagerState::Exclusive;
            }
            return Ok(());
        }
        if self.db.is_none() {
            self.state = PagerState::Exclusive;
        } else if self.state < PagerState::Reserved {
            if let Err(err) = self.wait_on_lock(LockLevel::Reserved) {
                self.unlock_if_unused();
                return Err(err);
            }
            self.state = PagerState::Reserved;
        }
        if exclusive && self.state < PagerState::Exclusive {
            if let Err(err) = self.wait_on_lock(LockLevel::Exclusive) {
                self.release_write_locks();
                return Err(err);
            }
            self.state = PagerState::Exclusive;
        }
        let orig = match self.page_count() {
            Ok(n) => n,
            Err(err) => {
                self.release_write_locks();
                return Err(err);
            }
        };
        self.db_orig_size = orig;
        self.txn = TxnState {
            open: true,
            in_journal: BitVec::with_size(orig),
            always_rollback: BitVec::with_size(orig),
            size_floor: orig,
            ..TxnState::default()
        };
        debug!(
            orig_pages = orig,
            exclusive,
            state = self.state.as_str(),
            "pager.begin"
        );
        Ok(())
    }

    fn release_write_locks(&mut self) {
        if let Some(db) = &self.db {
            if let Err(err) = db.unlock(LockLevel::Shared) {
                warn!(error = %err, "pager.unlock.failed");
            }
        }
        self.state = PagerState::Shared;
        self.unlock_if_unused();
    }

    /// Opens the rollback journal on first use and writes its header.
    fn ensure_journal(&mut self) -> Result<()> {
        if self.journal.is_some()
            || self.kind == DbKind::Memory
            || self.options.journal_mode == JournalMode::Off
        {
            return Ok(());
        }
        let file: Arc<dyn FileIo> = match (self.kind, self.options.journal_mode) {
            (_, JournalMode::Memory) => MemFileSystem::new().open_temp(FileType::MainJournal)?,
            (DbKind::Temp, _) => self.fs.open_temp(FileType::TempJournal)?,
            _ => {
                let path = self
                    .journal_path
                    .clone()
                    .ok_or(SombraError::Misuse("database has no journal path"))?;
                self.fs
                    .open(&path, FileType::MainJournal, OpenPermissions::create())?
            }
        };
        self.journal = Some(file.clone());
        if file.len()? > 0 {
            file.truncate(0)?;
        }
        let nonce = rand::random::<u32>();
        let header = JournalHeader {
            record_count: 0,
            nonce,
            initial_pages: self.db_orig_size,
            sector_size: self.sector_size as u32,
            page_size: self.page_size as u32,
        };
        let mut buf = vec![0u8; self.sector_size];
        buf[..JOURNAL_HEADER_LEN].copy_from_slice(&header.encode());
        file.write_at(0, &buf)?;
        self.txn.nonce = nonce;
        self.txn.journal_off = self.sector_size as u64;
        self.txn.n_rec = 0;
        debug!(
            journal = ?self.journal_path,
            mode = self.options.journal_mode.as_str(),
            initial_pages = self.db_orig_size,
            "pager.journal.open"
        );
        Ok(())
    }

    /// Declares the intent to modify a page.
    ///
    /// Opens a transaction if none is open, journals the page's current
    /// content the first time it is written and marks it dirty. When a disk
    /// sector spans several pages the whole sector is journaled together.
    /// A disk-full failure rolls the transaction back and leaves the pager
    /// in the sticky `Full` state.
    pub fn write(&mut self, handle: &PageHandle) -> Result<()> {
        self.check_writable()?;
        if !self.txn.open {
            self.begin(false)?;
        }
        self.check_not_synced()?;
        self.txn.synced = false;
        let result = if self.sector_size > self.page_size && self.kind != DbKind::Memory {
            self.write_sector_group(handle.slot)
        } else {
            self.write_one(handle.slot)
        };
        result.map_err(|err| self.fail_write(err))
    }

    /// Once phase one has finalized the journal the transaction can only
    /// be committed or rolled back.
    fn check_not_synced(&self) -> Result<()> {
        if self.state == PagerState::Synced {
            return Err(SombraError::Misuse("transaction already in commit"));
        }
        Ok(())
    }

    fn write_sector_group(&mut self, slot: usize) -> Result<()> {
        let number = self.cache.frame(slot).number;
        let per_sector = (self.sector_size / self.page_size) as u32;
        let first = ((number.0 - 1) & !(per_sector - 1)) + 1;
        let count = self.page_count()?;
        let n = if number.0 > count {
            number.0 - first + 1
        } else if first + per_sector - 1 > count {
            count + 1 - first
        } else {
            per_sector
        };
        let lock_page = self.lock_page();
        let mut need_sync = false;
        let mut group: SmallVec<[PageId; 8]> = SmallVec::new();
        for pg in (first..first + n).map(PageId) {
            group.push(pg);
            if pg == number {
                self.write_one(slot)?;
                need_sync |= self.cache.frame(slot).flags.contains(PageFlags::NEED_SYNC);
            } else if !self.txn.in_journal.test(pg) {
                if pg.0 == lock_page {
                    continue;
                }
                let sibling = self.acquire_page(pg, true)?;
                let written = self.write_one(sibling.slot);
                need_sync |= self
                    .cache
                    .frame(sibling.slot)
                    .flags
                    .contains(PageFlags::NEED_SYNC);
                self.release(sibling)?;
                written?;
            } else if let Some(other) = self.cache.lookup(pg) {
                need_sync |= self.cache.frame(other).flags.contains(PageFlags::NEED_SYNC);
            }
        }
        if need_sync {
            for pg in group {
                if let Some(s) = self.cache.lookup(pg) {
                    self.cache.frame_mut(s).flags.insert(PageFlags::NEED_SYNC);
                }
            }
            self.txn.need_sync = true;
        }
        Ok(())
    }

    fn write_one(&mut self, slot: usize) -> Result<()> {
        let number = self.cache.frame(slot).number;
        if self.cache.frame(slot).flags.contains(PageFlags::NEED_READ) {
            self.load_page(slot)?;
        }
        self.ensure_journal()?;
        self.cache.make_dirty(slot);
        self.cache.frame_mut(slot).flags.remove(PageFlags::DONT_WRITE);
        self.txn.db_modified = true;

        let journaling = self.journal.is_some() || self.kind == DbKind::Memory;
        let flags = self.cache.frame(slot).flags;
        if journaling && !flags.contains(PageFlags::IN_JOURNAL) {
            let mut need_sync = false;
            if number.0 <= self.db_orig_size {
                if self.kind == DbKind::Memory {
                    self.cache.preserve(slot, false);
                } else {
                    self.append_journal_record(slot)?;
                    self.txn.in_journal.set(number);
                    need_sync = !self.no_sync;
                    if let Some(stmt) = self.txn.stmt.as_mut() {
                        stmt.in_stmt.set(number);
                        self.cache
                            .frame_mut(slot)
                            .flags
                            .insert(PageFlags::IN_STATEMENT_JOURNAL);
                    }
                }
            } else {
                need_sync = !self.txn.journal_started && !self.no_sync;
            }
            let frame = self.cache.frame_mut(slot);
            if need_sync {
                frame.flags.insert(PageFlags::NEED_SYNC);
            }
            frame.flags.insert(PageFlags::IN_JOURNAL);
        }

        let needs_stmt = self
            .txn
            .stmt
            .as_ref()
            .is_some_and(|stmt| number.0 <= stmt.size && !stmt.in_stmt.test(number));
        if needs_stmt {
            if self.kind == DbKind::Memory {
                self.cache.preserve(slot, true);
            } else {
                self.append_statement_record(slot)?;
            }
            if let Some(stmt) = self.txn.stmt.as_mut() {
                stmt.in_stmt.set(number);
            }
            self.cache
                .frame_mut(slot)
                .flags
                .insert(PageFlags::IN_STATEMENT_JOURNAL);
        }

        let current = self.page_count()?;
        if number.0 > current {
            let mut size = number.0;
            if size == self.lock_page() - 1 {
                size += 1;
            }
            self.db_size = Some(size);
        }
        Ok(())
    }

    fn append_journal_record(&mut self, slot: usize) -> Result<()> {
        let journal = self
            .journal
            .clone()
            .ok_or(SombraError::Misuse("journal record without a journal"))?;
        let frame = self.cache.frame(slot);
        let mut buf = Vec::with_capacity(journal::record_len(self.page_size));
        journal::encode_record(&mut buf, frame.number, &frame.data, self.txn.nonce);
        journal.write_at(self.txn.journal_off, &buf)?;
        self.txn.journal_off += buf.len() as u64;
        self.txn.n_rec += 1;
        self.txn.need_sync = true;
        self.stats.journal_records += 1;
        pager_test_log!(
            "[pager.journal] page {} record {}",
            frame.number,
            self.txn.n_rec
        );
        Ok(())
    }

    /// Journals a page straight from the database file. Used for pages cut
    /// off by `truncate_image`, whose cached copies are already gone.
    fn journal_from_file(&mut self, number: PageId) -> Result<()> {
        let journal = self
            .journal
            .clone()
            .ok_or(SombraError::Misuse("journal record without a journal"))?;
        let db = self.db_file()?;
        let mut data = vec![0u8; self.page_size];
        db.read_at_padded(number.file_offset(self.page_size), &mut data)?;
        let mut buf = Vec::with_capacity(journal::record_len(self.page_size));
        journal::encode_record(&mut buf, number, &data, self.txn.nonce);
        journal.write_at(self.txn.journal_off, &buf)?;
        self.txn.journal_off += buf.len() as u64;
        self.txn.n_rec += 1;
        self.txn.need_sync = true;
        self.txn.in_journal.set(number);
        self.stats.journal_records += 1;
        Ok(())
    }

    fn append_statement_record(&mut self, slot: usize) -> Result<()> {
        let file = match &self.stmt_journal {
            Some(file) => file.clone(),
            None => {
                let file = if self.options.journal_mode == JournalMode::Memory {
                    MemFileSystem::new().open_temp(FileType::StatementJournal)?
                } else {
                    self.fs.open_temp(FileType::StatementJournal)?
                };
                self.stmt_journal = Some(file.clone());
                file
            }
        };
        let frame = self.cache.frame(slot);
        let mut buf = Vec::with_capacity(4 + self.page_size);
        buf.extend_from_slice(&frame.number.0.to_be_bytes());
        buf.extend_from_slice(&frame.data);
        let stmt = self
            .txn
            .stmt
            .as_mut()
            .ok_or(SombraError::Misuse("statement record without a statement"))?;
        file.write_at(stmt.offset, &buf)?;
        stmt.offset += buf.len() as u64;
        stmt.n_rec += 1;
        self.stats.statement_records += 1;
        Ok(())
    }

    /// Marks a page whose content no longer matters. Commit skips it unless
    /// it is the last page of a grown database, and rollback always
    /// restores it.
    pub fn dont_write(&mut self, handle: &PageHandle) -> Result<()> {
        if !self.txn.open {
            return Ok(());
        }
        let slot = handle.slot;
        let number = self.cache.frame(slot).number;
        self.txn.always_rollback.set(number);
        self.cache
            .frame_mut(slot)
            .flags
            .insert(PageFlags::ALWAYS_ROLLBACK);
        if !self.cache.frame(slot).is_dirty() || self.txn.stmt.is_some() {
            return Ok(());
        }
        let size = self.page_count()?;
        if number.0 == size && self.db_orig_size < size {
            return Ok(());
        }
        self.cache.make_clean(slot);
        let frame = self.cache.frame_mut(slot);
        frame.flags.insert(PageFlags::DONT_WRITE);
        frame.content_hash = page_hash(&frame.data);
        pager_test_log!("[pager.dont_write] page {}", number);
        Ok(())
    }

    /// Records a page as journaled without saving its pre-image. Its old
    /// content will not be restored by a rollback.
    pub fn dont_rollback(&mut self, handle: &PageHandle) {
        let slot = handle.slot;
        let number = self.cache.frame(slot).number;
        if !self.txn.open || self.journal.is_none() || self.kind == DbKind::Memory {
            return;
        }
        let flags = self.cache.frame(slot).flags;
        if flags.contains(PageFlags::ALWAYS_ROLLBACK) || number.0 > self.db_orig_size {
            return;
        }
        self.txn.in_journal.set(number);
        let in_stmt = match self.txn.stmt.as_mut() {
            Some(stmt) => {
                stmt.in_stmt.set(number);
                true
            }
            None => false,
        };
        let frame = self.cache.frame_mut(slot);
        frame.flags.insert(PageFlags::IN_JOURNAL);
        if in_stmt {
            frame.flags.insert(PageFlags::IN_STATEMENT_JOURNAL);
        }
        if frame.flags.contains(PageFlags::NEED_READ) {
            frame.flags.remove(PageFlags::NEED_READ);
            frame.content_hash = page_hash(&frame.data);
        }
    }

    /// Re-keys a page to `new` inside a write transaction. A page cached
    /// under `new` is discarded. Unless `is_commit`, a journal sync owed by
    /// the old number is kept by faulting that page back in as dirty.
    pub fn move_page(&mut self, handle: &PageHandle, new: PageId, is_commit: bool) -> Result<()> {
        self.check_writable()?;
        if !self.txn.open {
            return Err(SombraError::Misuse("page moved outside a transaction"));
        }
        self.check_not_synced()?;
        if new.is_null() || new.0 == self.lock_page() {
            return Err(SombraError::Invalid("page cannot be moved there"));
        }
        let slot = handle.slot;
        let old = self.cache.frame(slot).number;
        if old == new {
            return Ok(());
        }
        let needs_stmt = self.cache.frame(slot).is_dirty()
            && self
                .txn
                .stmt
                .as_ref()
                .is_some_and(|stmt| old.0 <= stmt.size && !stmt.in_stmt.test(old));
        if needs_stmt {
            if self.kind == DbKind::Memory {
                self.cache.preserve(slot, true);
            } else {
                self.append_statement_record(slot)
                    .map_err(|err| self.fail_write(err))?;
            }
            if let Some(stmt) = self.txn.stmt.as_mut() {
                stmt.in_stmt.set(old);
            }
        }

        let owes_sync = self.cache.frame(slot).flags.contains(PageFlags::NEED_SYNC) && !is_commit;
        let inherited = match self.cache.lookup(new) {
            Some(other) => self.cache.frame(other).flags & PageFlags::NEED_SYNC,
            None => PageFlags::empty(),
        };
        self.cache.move_page(slot, new)?;
        let in_journal = new.0 > self.db_orig_size || self.txn.in_journal.test(new);
        {
            let frame = self.cache.frame_mut(slot);
            frame.flags.remove(PageFlags::NEED_SYNC);
            frame.flags.insert(inherited);
            frame.flags.set(PageFlags::IN_JOURNAL, in_journal);
        }
        self.cache.make_dirty(slot);
        self.txn.db_modified = true;
        self.txn.synced = false;
        if new.0 > self.page_count()? {
            self.db_size = Some(new.0);
        }

        if owes_sync {
            match self.acquire_page(old, true) {
                Ok(refault) => {
                    self.txn.need_sync = true;
                    self.cache.make_dirty(refault.slot);
                    self.cache
                        .frame_mut(refault.slot)
                        .flags
                        .insert(PageFlags::NEED_SYNC | PageFlags::IN_JOURNAL);
                    self.release(refault)?;
                }
                Err(err) => {
                    if old.0 <= self.db_orig_size {
                        self.txn.in_journal.clear(old);
                    }
                    return Err(err);
                }
            }
        }
        debug!(from = %old, to = %new, is_commit, owes_sync, "pager.move_page");
        Ok(())
    }

    /// Shrinks the database to `pages` inside a write transaction. The file
    /// itself is truncated at commit.
    pub fn truncate_image(&mut self, pages: u32) -> Result<()> {
        self.check_writable()?;
        if !self.txn.open {
            return Err(SombraError::Misuse("truncate outside a transaction"));
        }
        self.check_not_synced()?;
        if pages > self.page_count()? {
            return Err(SombraError::Invalid("truncate cannot grow the database"));
        }
        self.ensure_journal().map_err(|err| self.fail_write(err))?;
        self.save_truncated_pages(pages)
            .map_err(|err| self.fail_write(err))?;
        self.db_size = Some(pages);
        self.txn.size_floor = self.txn.size_floor.min(pages);
        if self.kind == DbKind::Memory {
            self.cache.zero_above(pages);
        } else {
            self.cache.truncate(pages);
        }
        self.txn.db_modified = true;
        self.txn.synced = false;
        debug!(pages, "pager.truncate_image");
        Ok(())
    }

    /// Saves what a rollback needs of pages above `pages` before they are
    /// cut off. Unjournaled pages of the original image are journaled from
    /// the file, since reads past the new end see zeros. A dirty page
    /// inside an open statement gets a statement record. In-memory
    /// databases snapshot the pre-transaction image instead.
    fn save_truncated_pages(&mut self, pages: u32) -> Result<()> {
        let memory = self.kind == DbKind::Memory;
        let orig = self.db_orig_size;
        if !memory && self.journal.is_some() {
            let lock_page = self.lock_page();
            for pg in (pages + 1..=orig).map(PageId) {
                if pg.0 != lock_page && !self.txn.in_journal.test(pg) {
                    self.journal_from_file(pg)?;
                    if let Some(slot) = self.cache.lookup(pg) {
                        self.cache
                            .frame_mut(slot)
                            .flags
                            .insert(PageFlags::IN_JOURNAL);
                    }
                }
            }
        }
        for slot in self.cache.slots() {
            let frame = self.cache.frame(slot);
            let number = frame.number;
            let flags = frame.flags;
            let dirty = frame.is_dirty();
            if number.0 <= pages || flags.contains(PageFlags::NEED_READ) {
                continue;
            }
            if memory && number.0 <= orig && !flags.contains(PageFlags::IN_JOURNAL) {
                self.cache.preserve(slot, false);
                self.cache
                    .frame_mut(slot)
                    .flags
                    .insert(PageFlags::IN_JOURNAL);
            }
            let needs_stmt = self.txn.stmt.as_ref().is_some_and(|stmt| {
                number.0 <= stmt.size && !stmt.in_stmt.test(number) && (memory || dirty)
            });
            if !needs_stmt {
                continue;
            }
            if memory {
                self.cache.preserve(slot, true);
            } else {
                self.append_statement_record(slot)?;
            }
            if let Some(stmt) = self.txn.stmt.as_mut() {
                stmt.in_stmt.set(number);
            }
        }
        Ok(())
    }

    /// First half of a commit: makes the journal durable, appends the
    /// master journal name if one is given and takes EXCLUSIVE.
    ///
    /// `no_sync` skips the sync of the database file in phase two.
    pub fn commit_phase_one(&mut self, master_journal: Option<&str>, no_sync: bool) -> Result<()> {
        self.check_sticky()?;
        if !self.txn.open {
            return Err(SombraError::Misuse("commit without a transaction"));
        }
        if self.txn.synced {
            return Ok(());
        }
        self.txn.commit_no_sync = no_sync;
        if self.txn.db_modified {
            if self.kind == DbKind::Memory {
                self.state = PagerState::Synced;
            } else {
                self.prepare_commit(master_journal)
                    .map_err(|err| self.fail_write(err))?;
            }
        }
        self.txn.synced = true;
        debug!(
            records = self.txn.n_rec,
            master = ?master_journal,
            no_sync,
            "pager.commit.phase_one"
        );
        Ok(())
    }

    fn prepare_commit(&mut self, master_journal: Option<&str>) -> Result<()> {
        let size = self.page_count()?;
        if self.journal.is_some() && size < self.db_orig_size {
            let lock_page = self.lock_page();
            for pg in (size + 1..=self.db_orig_size).map(PageId) {
                if pg.0 != lock_page && !self.txn.in_journal.test(pg) {
                    self.journal_from_file(pg)?;
                }
            }
        }
        if let (Some(name), Some(journal)) = (master_journal, self.journal.clone()) {
            if !self.txn.set_master {
                let trailer = journal::encode_master_trailer(name);
                journal.write_at(self.txn.journal_off, &trailer)?;
                self.txn.journal_off += trailer.len() as u64;
                self.txn.set_master = true;
                self.txn.need_sync = true;
            }
        }
        self.sync_journal()?;
        self.wait_on_lock(LockLevel::Exclusive)?;
        self.state = PagerState::Synced;
        Ok(())
    }

    /// Makes every journal record durable and finalizes the record count.
    fn sync_journal(&mut self) -> Result<()> {
        let Some(journal) = self.journal.clone() else {
            return Ok(());
        };
        if self.txn.need_sync || !self.txn.journal_started {
            let full = !self.no_sync && self.options.synchronous == Synchronous::Full;
            if full {
                journal.sync_all()?;
            }
            journal.write_at(RECORD_COUNT_OFFSET, &self.txn.n_rec.to_be_bytes())?;
            if !self.no_sync {
                journal.sync_all()?;
            }
            self.txn.need_sync = false;
            self.txn.journal_started = true;
        }
        for slot in self.cache.dirty_slots() {
            self.cache
                .frame_mut(slot)
                .flags
                .remove(PageFlags::NEED_SYNC);
        }
        debug!(records = self.txn.n_rec, "pager.journal.sync");
        Ok(())
    }

    /// Second half of a commit: writes dirty pages in the order they were
    /// first dirtied, truncates and syncs the file, then finalizes the
    /// journal. Runs phase one first if it has not run.
    pub fn commit_phase_two(&mut self) -> Result<()> {
        self.check_sticky()?;
        if !self.txn.open {
            return Err(SombraError::Misuse("commit without a transaction"));
        }
        if !self.txn.synced {
            let no_sync = self.txn.commit_no_sync;
            self.commit_phase_one(None, no_sync)?;
        }
        if self.txn.db_modified && self.kind != DbKind::Memory {
            self.write_dirty_pages()
                .map_err(|err| self.fail_write(err))?;
        }
        let pages = self.db_size;
        self.end_transaction().map_err(|err| self.fail_write(err))?;
        debug!(pages = ?pages, "pager.commit.phase_two");
        Ok(())
    }

    /// Runs both commit phases.
    pub fn commit(&mut self) -> Result<()> {
        self.commit_phase_one(None, false)?;
        self.commit_phase_two()
    }

    fn write_dirty_pages(&mut self) -> Result<()> {
        let db = self.db_file()?;
        let size = self.page_count()?;
        let lock_page = self.lock_page();
        let page_size = self.page_size;
        self.txn.db_written = true;
        // Cut pages that were not rewritten must come back as zeros.
        let floor = u64::from(self.txn.size_floor) * page_size as u64;
        if self.txn.size_floor < size && db.len()? > floor {
            db.truncate(floor)?;
        }
        for slot in self.cache.dirty_slots() {
            let frame = self.cache.frame(slot);
            let number = frame.number;
            if number.0 > size
                || number.0 == lock_page
                || frame.flags.contains(PageFlags::DONT_WRITE)
            {
                continue;
            }
            db.write_at(number.file_offset(page_size), &frame.data)?;
            self.stats.dirty_writebacks += 1;
            pager_test_log!("[pager.commit] wrote page {}", number);
        }
        let len = u64::from(size) * page_size as u64;
        if db.len()? > len {
            db.truncate(len)?;
        }
        if !self.no_sync && !self.txn.commit_no_sync {
            db.sync_all()?;
        }
        Ok(())
    }

    /// Finalizes the journal, cleans the cache and releases write locks.
    fn end_transaction(&mut self) -> Result<()> {
        let journal = self.journal.take();
        if journal.is_some() {
            self.finalize_journal(journal, self.options.journal_mode, self.txn.set_master)?;
        }
        self.stmt_journal = None;
        for slot in self.cache.dirty_slots() {
            let frame = self.cache.frame_mut(slot);
            frame.content_hash = page_hash(&frame.data);
            self.cache.make_clean(slot);
        }
        let txn_flags = PageFlags::IN_JOURNAL
            | PageFlags::IN_STATEMENT_JOURNAL
            | PageFlags::NEED_SYNC
            | PageFlags::DONT_WRITE
            | PageFlags::ALWAYS_ROLLBACK;
        for slot in self.cache.slots() {
            self.cache.frame_mut(slot).flags.remove(txn_flags);
        }
        self.cache.discard_preserved(false);
        self.cache.discard_preserved(true);
        if self.kind == DbKind::Memory {
            if let Some(size) = self.db_size {
                self.cache.truncate(size);
            }
        }
        self.txn = TxnState::default();
        self.db_orig_size = self.db_size.unwrap_or(0);
        self.downgrade_after_txn()?;
        self.unlock_if_unused();
        Ok(())
    }

    /// Classifies a failed write. Disk-full rolls the transaction back and
    /// leaves the pager in the sticky `Full` state; I/O errors become sticky.
    pub(super) fn fail_write(&mut self, err: SombraError) -> SombraError {
        if err.code() != ErrorCode::Full {
            return self.record_error(err);
        }
        warn!(in_transaction = self.txn.open, "pager.write.full");
        if self.txn.open {
            if let Err(rollback_err) = self.rollback_transaction() {
                warn!(error = %rollback_err, "pager.rollback.failed");
                return err;
            }
        }
        self.error = Some(ErrorCode::Full);
        err
    }

    /// Undoes the open transaction, or clears a sticky error left by a
    /// failed one.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.txn.open {
            if self.error.take().is_some() {
                debug!("pager.error.cleared");
            }
            self.unlock_if_unused();
            return Ok(());
        }
        self.rollback_transaction()?;
        self.error = None;
        Ok(())
    }

    pub(super) fn rollback_transaction(&mut self) -> Result<()> {
        if !self.txn.open {
            return Ok(());
        }
        let records = self.txn.n_rec;
        let result = if self.kind == DbKind::Memory {
            self.roll_back_memory();
            self.end_transaction()
        } else {
            self.play_back_transaction()
                .and_then(|()| self.end_transaction())
        };
        match result {
            Ok(()) => {
                debug!(records, "pager.rollback");
                Ok(())
            }
            Err(err) => {
                self.abandon_transaction();
                Err(err)
            }
        }
    }

    fn roll_back_memory(&mut self) {
        for slot in self.cache.slots() {
            self.cache.restore(slot, false);
        }
        self.db_size = Some(self.db_orig_size);
        self.cache.truncate(self.db_orig_size);
    }

    fn play_back_transaction(&mut self) -> Result<()> {
        let orig = self.db_orig_size;
        let page_size = self.page_size;
        if let Some(journal) = self.journal.clone() {
            let rec_len = journal::record_len(page_size);
            let mut buf = vec![0u8; rec_len];
            let mut offset = self.sector_size as u64;
            for _ in 0..self.txn.n_rec {
                journal.read_at(offset, &mut buf)?;
                offset += rec_len as u64;
                let (page, data) = journal::decode_record(&buf, page_size, self.txn.nonce)
                    .ok_or(SombraError::Corruption("journal record failed its checksum"))?;
                self.restore_page(page, data)?;
            }
        }
        if self.txn.db_written {
            let db = self.db_file()?;
            db.truncate(u64::from(orig) * page_size as u64)?;
            if !self.no_sync {
                db.sync_all()?;
            }
        }
        self.db_size = Some(orig);
        self.cache.truncate(orig);
        self.reload_changed_pages()
    }

    /// Puts a pre-image back into the cache, and into the file if phase two
    /// already wrote it.
    fn restore_page(&mut self, page: PageId, data: &[u8]) -> Result<()> {
        if self.txn.db_written {
            self.db_file()?
                .write_at(page.file_offset(self.page_size), data)?;
        }
        if let Some(slot) = self.cache.lookup(page) {
            let frame = self.cache.frame_mut(slot);
            frame.data.copy_from_slice(data);
            frame.content_hash = page_hash(data);
            frame.flags.remove(PageFlags::NEED_READ);
            self.cache.make_clean(slot);
        }
        Ok(())
    }

    /// Pages still dirty after playback were never journaled. Referenced
    /// ones are re-read, the rest forgotten.
    fn reload_changed_pages(&mut self) -> Result<()> {
        for slot in self.cache.slots() {
            let frame = self.cache.frame(slot);
            if !frame
                .flags
                .intersects(PageFlags::DIRTY | PageFlags::DONT_WRITE)
            {
                continue;
            }
            if frame.ref_count == 0 {
                self.cache.drop_page(slot)?;
                continue;
            }
            self.cache.make_clean(slot);
            self.load_page(slot)?;
        }
        Ok(())
    }

    /// Gives up on a rollback that failed: the journal stays on disk for
    /// the next lock holder to play back and the pager turns sticky.
    fn abandon_transaction(&mut self) {
        self.journal = None;
        self.stmt_journal = None;
        for slot in self.cache.slots() {
            if self.cache.frame(slot).ref_count == 0 {
                if let Err(err) = self.cache.drop_page(slot) {
                    warn!(error = %err, "pager.cache.drop_failed");
                }
            } else {
                self.cache.make_clean(slot);
                self.cache.frame_mut(slot).flags = PageFlags::NEED_READ;
            }
        }
        self.cache.discard_preserved(false);
        self.cache.discard_preserved(true);
        self.txn = TxnState::default();
        if let Some(db) = &self.db {
            if let Err(err) = db.unlock(LockLevel::None) {
                warn!(error = %err, "pager.unlock.failed");
            }
        }
        self.state = PagerState::Unlocked;
        self.db_size = None;
        self.error = Some(ErrorCode::IoErr);
        warn!(journal = ?self.journal_path, "pager.rollback.abandoned");
    }

    /// Opens a statement inside the current transaction.
    pub fn start_statement(&mut self) -> Result<()> {
        self.check_sticky()?;
        if !self.txn.open {
            return Err(SombraError::Misuse("statement outside a transaction"));
        }
        if self.txn.stmt.is_some() {
            return Err(SombraError::Misuse("statement already open"));
        }
        self.ensure_journal().map_err(|err| self.fail_write(err))?;
        let size = self.page_count()?;
        self.txn.stmt = Some(StatementState {
            size,
            n_rec: 0,
            offset: 0,
            in_stmt: BitVec::with_size(size),
            in_journal_at_start: self.txn.in_journal.clone(),
            journal_off_at_start: self.txn.journal_off,
            n_rec_at_start: self.txn.n_rec,
            size_floor_at_start: self.txn.size_floor,
        });
        debug!(size, journal_records = self.txn.n_rec, "pager.statement.begin");
        Ok(())
    }

    /// Keeps the statement's changes and closes it.
    pub fn statement_commit(&mut self) -> Result<()> {
        let Some(stmt) = self.txn.stmt.take() else {
            return Ok(());
        };
        self.close_statement();
        debug!(records = stmt.n_rec, "pager.statement.commit");
        Ok(())
    }

    fn close_statement(&mut self) {
        self.stmt_journal = None;
        for slot in self.cache.slots() {
            self.cache
                .frame_mut(slot)
                .flags
                .remove(PageFlags::IN_STATEMENT_JOURNAL);
        }
        self.cache.discard_preserved(true);
    }

    /// Undoes every write since `start_statement` and closes the statement.
    /// Earlier writes of the transaction are kept.
    pub fn statement_rollback(&mut self) -> Result<()> {
        let Some(stmt) = self.txn.stmt.take() else {
            return Ok(());
        };
        let result = self.play_back_statement(&stmt);
        self.close_statement();
        match result {
            Ok(()) => {
                debug!(
                    records = stmt.n_rec,
                    size = stmt.size,
                    "pager.statement.rollback"
                );
                Ok(())
            }
            Err(err) => Err(self.record_error(err)),
        }
    }

    fn play_back_statement(&mut self, stmt: &StatementState) -> Result<()> {
        self.txn.size_floor = stmt.size_floor_at_start;
        if self.kind == DbKind::Memory {
            for slot in self.cache.slots() {
                self.cache.restore(slot, true);
            }
            self.db_size = Some(stmt.size);
            self.cache.zero_above(stmt.size);
            return Ok(());
        }
        let page_size = self.page_size;
        if let Some(file) = self.stmt_journal.clone() {
            let rec_len = 4 + page_size;
            let mut buf = vec![0u8; rec_len];
            for i in 0..u64::from(stmt.n_rec) {
                file.read_at(i * rec_len as u64, &mut buf)?;
                let page = PageId(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
                self.restore_statement_page(page, &buf[4..]);
            }
        }
        if let Some(journal) = self.journal.clone() {
            let rec_len = journal::record_len(page_size);
            let mut buf = vec![0u8; rec_len];
            let mut offset = stmt.journal_off_at_start;
            for _ in stmt.n_rec_at_start..self.txn.n_rec {
                journal.read_at(offset, &mut buf)?;
                offset += rec_len as u64;
                let (page, data) = journal::decode_record(&buf, page_size, self.txn.nonce)
                    .ok_or(SombraError::Corruption("journal record failed its checksum"))?;
                self.restore_page(page, data)?;
            }
            journal.truncate(stmt.journal_off_at_start)?;
        }
        self.txn.n_rec = stmt.n_rec_at_start;
        self.txn.journal_off = stmt.journal_off_at_start;
        self.txn.in_journal = stmt.in_journal_at_start.clone();
        let orig = self.db_orig_size;
        for slot in self.cache.slots() {
            let number = self.cache.frame(slot).number;
            if number.0 <= orig {
                let journaled = self.txn.in_journal.test(number);
                self.cache
                    .frame_mut(slot)
                    .flags
                    .set(PageFlags::IN_JOURNAL, journaled);
            }
        }
        self.db_size = Some(stmt.size);
        self.cache.truncate(stmt.size);
        Ok(())
    }

    /// Puts a statement pre-image back into the cache. The page stays dirty:
    /// its pre-statement content may itself be uncommitted.
    fn restore_statement_page(&mut self, page: PageId, data: &[u8]) {
        let (slot, fetched) = match self.cache.lookup(page) {
            Some(slot) => (slot, false),
            None => (self.cache.fetch(page).slot, true),
        };
        let frame = self.cache.frame_mut(slot);
        frame.data.copy_from_slice(data);
        frame.flags.remove(PageFlags::NEED_READ);
        self.cache.make_dirty(slot);
        if fetched {
            self.cache.release(slot);
        }
    }
}
