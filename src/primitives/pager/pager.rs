use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::busy::{BackoffBusyHandler, BusyHandler, NoBusyHandler};
use super::cache::PageCache;
use super::frame::{PageFlags, PageHandle};
use super::journal::{self, JournalHeader, JOURNAL_HEADER_LEN};
use super::txn::TxnState;
use crate::primitives::concurrency::{LockLevel, PENDING_BYTE};
use crate::primitives::io::{
    append_suffix, FileIo, FileSystem, FileType, OpenPermissions, DEFAULT_SECTOR_SIZE,
};
use crate::types::{page_hash, ErrorCode, PageId, Result, SombraError};

#[cfg(test)]
macro_rules! pager_test_log {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

#[cfg(not(test))]
macro_rules! pager_test_log {
    ($($arg:tt)*) => {
        if false {
            let _ = format_args!($($arg)*);
        }
    };
}

pub(super) use pager_test_log;

/// Path that opens a database held entirely in memory.
pub const MEMORY_DB_PATH: &str = ":memory:";

const MIN_PAGE_SIZE: u32 = 512;
const MAX_PAGE_SIZE: u32 = 65536;

/// Called with a page's number, content and extra bytes when its last
/// reference is released.
pub type PageDestructor = Box<dyn FnMut(PageId, &mut [u8], &mut [u8]) + Send>;

/// Configuration options for the pager.
///
/// Every field has a default, so a TOML file only needs the keys it changes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PagerOptions {
    /// Size of each page in bytes. A power of two between 512 and 65536.
    pub page_size: u32,
    /// Number of pages the cache tries to stay under.
    pub cache_pages: usize,
    /// Bytes of upper-layer metadata attached to every cached page.
    pub extra_size: usize,
    /// Durability mode for journal and database syncs.
    pub synchronous: Synchronous,
    /// What happens to the rollback journal when a transaction ends.
    pub journal_mode: JournalMode,
    /// Whether locks are released between transactions.
    pub locking_mode: LockingMode,
    /// Overrides the sector size reported by the database file.
    pub sector_size: Option<u32>,
    /// Total time a contended lock request keeps retrying. Zero fails at once.
    pub busy_timeout_ms: u64,
    /// Verifies on release that clean pages were not modified in place.
    pub check_pages: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: 1024,
            cache_pages: 2000,
            extra_size: 0,
            synchronous: Synchronous::Full,
            journal_mode: JournalMode::Delete,
            locking_mode: LockingMode::Normal,
            sector_size: None,
            busy_timeout_ms: 0,
            check_pages: false,
        }
    }
}

impl PagerOptions {
    /// Checks page size, cache size and sector size.
    pub fn validate(&self) -> Result<()> {
        if !valid_page_size(self.page_size) {
            return Err(SombraError::Invalid(
                "page size must be a power of two between 512 and 65536",
            ));
        }
        if self.cache_pages == 0 {
            return Err(SombraError::Invalid("cache must hold at least one page"));
        }
        if let Some(sector) = self.sector_size {
            if !valid_page_size(sector) {
                return Err(SombraError::Invalid(
                    "sector size must be a power of two between 512 and 65536",
                ));
            }
        }
        Ok(())
    }

    /// Parses options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: PagerOptions = toml::from_str(text).map_err(|err| {
            warn!(error = %err, "pager.options.parse_failed");
            SombraError::Invalid("malformed pager options")
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

fn valid_page_size(size: u32) -> bool {
    (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) && size.is_power_of_two()
}

/// Durability mode for journal and database syncs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Sync the journal twice and the database once per commit.
    #[default]
    Full,
    /// Sync the journal once before the database is written.
    Normal,
    /// Never sync.
    Off,
}

impl Synchronous {
    /// Lowercase name, as accepted by `from_str`.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Normal => "normal",
            Synchronous::Off => "off",
        }
    }

    /// Parses a synchronous mode from a string (case-insensitive).
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(Synchronous::Full),
            "normal" => Some(Synchronous::Normal),
            "off" => Some(Synchronous::Off),
            _ => None,
        }
    }
}

/// Fate of the rollback journal at the end of a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// Delete the journal file.
    #[default]
    Delete,
    /// Keep the file and zero its header.
    Persist,
    /// Truncate the file to zero bytes.
    Truncate,
    /// Keep the journal in memory. A crash mid-commit can corrupt the database.
    Memory,
    /// No journal. Rollback only discards cached changes.
    Off,
}

impl JournalMode {
    /// Lowercase name, as accepted by `from_str`.
    pub fn as_str(self) -> &'static str {
        match self {
            JournalMode::Delete => "delete",
            JournalMode::Persist => "persist",
            JournalMode::Truncate => "truncate",
            JournalMode::Memory => "memory",
            JournalMode::Off => "off",
        }
    }

    /// Parses a journal mode from a string (case-insensitive).
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "delete" => Some(JournalMode::Delete),
            "persist" => Some(JournalMode::Persist),
            "truncate" => Some(JournalMode::Truncate),
            "memory" => Some(JournalMode::Memory),
            "off" => Some(JournalMode::Off),
            _ => None,
        }
    }
}

/// Lock retention between transactions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockingMode {
    /// Drop to UNLOCKED once no page is referenced and no transaction is open.
    #[default]
    Normal,
    /// Keep every lock once taken.
    Exclusive,
}

impl LockingMode {
    /// Lowercase name, as accepted by `from_str`.
    pub fn as_str(self) -> &'static str {
        match self {
            LockingMode::Normal => "normal",
            LockingMode::Exclusive => "exclusive",
        }
    }

    /// Parses a locking mode from a string (case-insensitive).
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "normal" => Some(LockingMode::Normal),
            "exclusive" => Some(LockingMode::Exclusive),
            _ => None,
        }
    }
}

/// Pager lock state. `Synced` is EXCLUSIVE with the journal durable.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
pub enum PagerState {
    /// No lock. The cache is empty.
    #[default]
    Unlocked,
    /// Reading.
    Shared,
    /// A write transaction is open.
    Reserved,
    Exclusive,
    /// Phase one done, journal durable.
    Synced,
}

impl PagerState {
    /// Lowercase name used in log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            PagerState::Unlocked => "unlocked",
            PagerState::Shared => "shared",
            PagerState::Reserved => "reserved",
            PagerState::Exclusive => "exclusive",
            PagerState::Synced => "synced",
        }
    }
}

/// Statistics tracking pager operations.
#[derive(Default, Clone, Debug)]
pub struct PagerStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of page evictions from cache.
    pub evictions: u64,
    /// Number of dirty pages written back.
    pub dirty_writebacks: u64,
    /// Pre-images appended to the rollback journal.
    pub journal_records: u64,
    /// Pre-images appended to the statement journal.
    pub statement_records: u64,
    /// Hot journals rolled back at lock time.
    pub hot_journal_rollbacks: u64,
    /// Lock requests retried by the busy handler.
    pub busy_retries: u64,
}

impl fmt::Display for PagerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} evictions={} dirty_writebacks={} journal_records={} \
             statement_records={} hot_journal_rollbacks={} busy_retries={}",
            self.hits,
            self.misses,
            self.evictions,
            self.dirty_writebacks,
            self.journal_records,
            self.statement_records,
            self.hot_journal_rollbacks,
            self.busy_retries
        )
    }
}

/// Backing store of a pager.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum DbKind {
    /// Named file, journaled and locked.
    File,
    /// Scratch file, deleted on close and never synced.
    Temp,
    /// No file at all. The cache is the database.
    Memory,
}

impl DbKind {
    fn as_str(self) -> &'static str {
        match self {
            DbKind::File => "file",
            DbKind::Temp => "temp",
            DbKind::Memory => "memory",
        }
    }
}

/// Transactional page I/O over one database file.
///
/// The pager owns the page cache, the lock on the database file and the
/// rollback and statement journals. Callers acquire pages as
/// [`PageHandle`]s, call [`Pager::write`] before changing a page, and end
/// the transaction with a commit or a rollback. A pager is driven by one
/// thread at a time; share it through [`crate::SharedPager`].
pub struct Pager {
    pub(super) fs: Arc<dyn FileSystem>,
    pub(super) path: Option<PathBuf>,
    pub(super) journal_path: Option<PathBuf>,
    pub(super) db: Option<Arc<dyn FileIo>>,
    pub(super) journal: Option<Arc<dyn FileIo>>,
    pub(super) stmt_journal: Option<Arc<dyn FileIo>>,
    pub(super) cache: PageCache,
    pub(super) options: PagerOptions,
    pub(super) destructor: Option<PageDestructor>,
    pub(super) busy: Box<dyn BusyHandler>,
    pub(super) stats: PagerStats,
    pub(super) state: PagerState,
    pub(super) kind: DbKind,
    pub(super) read_only: bool,
    pub(super) no_sync: bool,
    pub(super) page_size: usize,
    pub(super) sector_size: usize,
    /// Current size in pages, cached while a lock is held.
    pub(super) db_size: Option<u32>,
    /// Size when the current transaction began.
    pub(super) db_orig_size: u32,
    pub(super) error: Option<ErrorCode>,
    pub(super) txn: TxnState,
    closed: bool,
}

impl Pager {
    /// Opens a pager with default options.
    ///
    /// `path == None` opens an anonymous temporary database and
    /// [`MEMORY_DB_PATH`] (or `FileType::MemoryDb`) one held only in memory.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        path: Option<&Path>,
        destructor: Option<PageDestructor>,
        file_type: FileType,
        permissions: OpenPermissions,
    ) -> Result<Self> {
        Self::open_with_options(
            fs,
            path,
            destructor,
            file_type,
            permissions,
            PagerOptions::default(),
        )
    }

    /// Opens a pager with explicit options. See [`Pager::open`].
    pub fn open_with_options(
        fs: Arc<dyn FileSystem>,
        path: Option<&Path>,
        destructor: Option<PageDestructor>,
        file_type: FileType,
        permissions: OpenPermissions,
        mut options: PagerOptions,
    ) -> Result<Self> {
        options.validate()?;
        let memory = file_type == FileType::MemoryDb
            || path.is_some_and(|p| p.as_os_str() == MEMORY_DB_PATH);
        let (kind, db, path) = match path {
            _ if memory => (DbKind::Memory, None, None),
            Some(p) if file_type == FileType::TempDb => {
                let perms = permissions | OpenPermissions::create() | OpenPermissions::DELETEONCLOSE;
                let file = fs.open(p, file_type, perms)?;
                (DbKind::Temp, Some(file), Some(p.to_path_buf()))
            }
            Some(p) => {
                let file = fs.open(p, file_type, permissions)?;
                (DbKind::File, Some(file), Some(p.to_path_buf()))
            }
            None => (DbKind::Temp, Some(fs.open_temp(FileType::TempDb)?), None),
        };
        if kind != DbKind::File {
            options.locking_mode = LockingMode::Exclusive;
        }
        let read_only = kind == DbKind::File
            && (permissions.contains(OpenPermissions::READONLY)
                || !permissions.contains(OpenPermissions::READWRITE));
        let no_sync = kind != DbKind::File || options.synchronous == Synchronous::Off;
        let journal_path = match kind {
            DbKind::File => path.as_deref().map(|p| append_suffix(p, "-journal")),
            _ => None,
        };
        let page_size = options.page_size as usize;
        let mut cache = PageCache::new(page_size, options.extra_size, options.cache_pages);
        if kind == DbKind::Memory {
            cache.set_evictable(false);
        }
        let busy: Box<dyn BusyHandler> = if options.busy_timeout_ms > 0 {
            Box::new(BackoffBusyHandler::new(Duration::from_millis(
                options.busy_timeout_ms,
            )))
        } else {
            Box::new(NoBusyHandler)
        };
        let mut pager = Self {
            fs,
            path,
            journal_path,
            db,
            journal: None,
            stmt_journal: None,
            cache,
            options,
            destructor,
            busy,
            stats: PagerStats::default(),
            state: PagerState::Unlocked,
            kind,
            read_only,
            no_sync,
            page_size,
            sector_size: DEFAULT_SECTOR_SIZE,
            db_size: (kind == DbKind::Memory).then_some(0),
            db_orig_size: 0,
            error: None,
            txn: TxnState::default(),
            closed: false,
        };
        pager.sector_size = pager.compute_sector_size();
        debug!(
            path = ?pager.path,
            kind = kind.as_str(),
            page_size,
            sector_size = pager.sector_size,
            read_only,
            journal_mode = pager.options.journal_mode.as_str(),
            "pager.open"
        );
        Ok(pager)
    }

    fn compute_sector_size(&self) -> usize {
        let reported = self
            .options
            .sector_size
            .map(|s| s as usize)
            .or_else(|| self.db.as_ref().map(|db| db.sector_size()))
            .unwrap_or(DEFAULT_SECTOR_SIZE);
        reported.max(self.page_size)
    }

    /// Options the pager was opened with, as changed since.
    pub fn options(&self) -> &PagerOptions {
        &self.options
    }

    /// Counters since the pager was opened.
    pub fn stats(&self) -> &PagerStats {
        &self.stats
    }

    /// Current lock state.
    pub fn state(&self) -> PagerState {
        self.state
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size as u32
    }

    /// Sector size journaling works in. Never below the page size.
    pub fn sector_size(&self) -> u32 {
        self.sector_size as u32
    }

    /// Database path, `None` for temporary and in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Path of the rollback journal, when the database has a path.
    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }

    /// True when opened without write permission.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// True for a database held entirely in the cache.
    pub fn is_memory(&self) -> bool {
        self.kind == DbKind::Memory
    }

    /// Sticky error, if a failed write left one.
    pub fn error(&self) -> Option<ErrorCode> {
        self.error
    }

    /// True while a write transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.txn.open
    }

    /// Handle to the database file, or `None` for an in-memory database.
    pub fn get_file(&self) -> Option<Arc<dyn FileIo>> {
        self.db.clone()
    }

    /// Replaces the handler consulted when a lock is contended.
    pub fn set_busy_handler(&mut self, handler: impl BusyHandler + 'static) {
        self.busy = Box::new(handler);
    }

    /// Sets how many pages the cache tries to stay under.
    pub fn set_cache_size(&mut self, pages: usize) {
        self.options.cache_pages = pages.max(1);
        self.cache.set_capacity(pages);
    }

    /// Changes the journal mode. Not allowed inside a transaction.
    pub fn set_journal_mode(&mut self, mode: JournalMode) -> Result<()> {
        if self.txn.open {
            return Err(SombraError::Misuse(
                "journal mode changed inside a transaction",
            ));
        }
        self.options.journal_mode = mode;
        Ok(())
    }

    /// Changes the page size and returns the size in effect.
    ///
    /// Only allowed while no page is referenced and no transaction is open.
    pub fn set_page_size(&mut self, page_size: u32) -> Result<u32> {
        if !valid_page_size(page_size) {
            return Err(SombraError::Invalid(
                "page size must be a power of two between 512 and 65536",
            ));
        }
        if page_size as usize == self.page_size {
            return Ok(page_size);
        }
        if self.cache.referenced() > 0 || self.txn.open {
            return Err(SombraError::Misuse(
                "page size changed with pages referenced",
            ));
        }
        if self.kind == DbKind::Memory && self.db_size != Some(0) {
            return Err(SombraError::Misuse(
                "page size of a non-empty memory database is fixed",
            ));
        }
        self.apply_page_size(page_size as usize)?;
        Ok(page_size)
    }

    pub(super) fn apply_page_size(&mut self, page_size: usize) -> Result<()> {
        self.cache.clear();
        self.cache.set_page_size(page_size)?;
        self.page_size = page_size;
        self.options.page_size = page_size as u32;
        self.sector_size = self.compute_sector_size();
        if self.kind != DbKind::Memory {
            self.db_size = None;
        }
        debug!(page_size, "pager.page_size");
        Ok(())
    }

    /// The page holding the lock bytes. It is never read, written or
    /// journaled.
    pub(super) fn lock_page(&self) -> u32 {
        (PENDING_BYTE / self.page_size as u64) as u32 + 1
    }

    /// Number of pages in the database, including pages added by the open
    /// transaction.
    pub fn page_count(&mut self) -> Result<u32> {
        self.check_readable()?;
        if let Some(n) = self.db_size {
            return Ok(n);
        }
        let n = match &self.db {
            None => 0,
            Some(db) => {
                let len = db.len()?;
                let mut n = (len / self.page_size as u64) as u32;
                if n == 0 && len != 0 {
                    n = 1;
                }
                if n != 0 && n == self.lock_page() - 1 {
                    n += 1;
                }
                n
            }
        };
        if self.state >= PagerState::Shared {
            self.db_size = Some(n);
        }
        Ok(n)
    }

    /// Copies the start of the database file into `buf`, zero-filling past
    /// the end of the file. Needs no lock. Returns the bytes actually read.
    pub fn read_file_header(&self, buf: &mut [u8]) -> Result<usize> {
        match &self.db {
            Some(db) => db.read_at_padded(0, buf),
            None => {
                buf.fill(0);
                Ok(0)
            }
        }
    }

    pub(super) fn db_file(&self) -> Result<Arc<dyn FileIo>> {
        self.db
            .clone()
            .ok_or(SombraError::Misuse("in-memory database has no file"))
    }

    pub(super) fn check_sticky(&self) -> Result<()> {
        match self.error {
            Some(code) => Err(SombraError::sticky(code)),
            None => Ok(()),
        }
    }

    /// Reads stay possible after a disk-full rollback.
    pub(super) fn check_readable(&self) -> Result<()> {
        if self.closed {
            return Err(SombraError::Misuse("pager is closed"));
        }
        match self.error {
            None | Some(ErrorCode::Full) => Ok(()),
            Some(code) => Err(SombraError::sticky(code)),
        }
    }

    pub(super) fn check_writable(&self) -> Result<()> {
        if self.closed {
            return Err(SombraError::Misuse("pager is closed"));
        }
        self.check_sticky()?;
        if self.read_only {
            return Err(SombraError::Permission("database is read-only"));
        }
        Ok(())
    }

    /// Stores sticky errors and hands the error back.
    pub(super) fn record_error(&mut self, err: SombraError) -> SombraError {
        if err.is_sticky() && self.error.is_none() {
            warn!(error = %err, code = err.code().as_str(), "pager.error.sticky");
            self.error = Some(err.code());
        }
        err
    }

    /// Retries `level` through the busy handler until it is granted or the
    /// handler gives up. Does not touch `state`.
    pub(super) fn wait_on_lock(&mut self, level: LockLevel) -> Result<()> {
        let Some(db) = self.db.clone() else {
            return Ok(());
        };
        let mut attempts = 0u32;
        while !db.lock(level)? {
            if !self.busy.on_busy(attempts) {
                debug!(
                    level = level.as_str(),
                    attempts,
                    held = db.lock_level().as_str(),
                    "pager.lock.busy"
                );
                return Err(SombraError::Busy);
            }
            attempts += 1;
            self.stats.busy_retries += 1;
        }
        Ok(())
    }

    /// Takes SHARED if no lock is held, rolling back a hot journal first.
    pub(super) fn ensure_shared_lock(&mut self) -> Result<()> {
        if self.state != PagerState::Unlocked {
            return Ok(());
        }
        let Some(db) = self.db.clone() else {
            self.state = PagerState::Shared;
            return Ok(());
        };
        self.wait_on_lock(LockLevel::Shared)?;
        self.state = PagerState::Shared;
        if let Err(err) = self.recover_if_hot(&db) {
            if let Err(unlock_err) = db.unlock(LockLevel::None) {
                warn!(error = %unlock_err, "pager.unlock.failed");
            }
            self.state = PagerState::Unlocked;
            self.db_size = None;
            return Err(err);
        }
        Ok(())
    }

    fn recover_if_hot(&mut self, db: &Arc<dyn FileIo>) -> Result<()> {
        if !self.has_hot_journal(db)? {
            return Ok(());
        }
        if self.read_only {
            return Err(SombraError::Permission(
                "hot journal found on a read-only database",
            ));
        }
        self.wait_on_lock(LockLevel::Exclusive)?;
        // Another connection may have recovered it while we waited.
        if self.has_hot_journal(db)? {
            self.rollback_hot_journal(db)?;
        }
        self.db_size = None;
        self.cache.clear();
        if self.options.locking_mode == LockingMode::Normal {
            db.unlock(LockLevel::Shared)?;
        } else {
            self.state = PagerState::Exclusive;
        }
        Ok(())
    }

    /// A journal is hot when it exists with a valid header, nobody holds
    /// RESERVED and the database is not empty.
    fn has_hot_journal(&self, db: &Arc<dyn FileIo>) -> Result<bool> {
        let Some(path) = self.journal_path.as_deref() else {
            return Ok(false);
        };
        if self.kind != DbKind::File || !self.fs.exists(path)? {
            return Ok(false);
        }
        if db.lock_level() < LockLevel::Reserved && db.check_reserved_lock()? {
            return Ok(false);
        }
        if db.len()? == 0 {
            return Ok(false);
        }
        let file = match self.fs.open(path, FileType::MainJournal, OpenPermissions::READONLY) {
            Ok(file) => file,
            Err(SombraError::NotFound) => return Ok(false),
            Err(err) => return Err(err),
        };
        Ok(JournalHeader::read_from(file.as_ref())?.is_some())
    }

    /// Plays a journal left by a dead writer back into the database file
    /// and finalizes it. Caller holds EXCLUSIVE.
    fn rollback_hot_journal(&mut self, db: &Arc<dyn FileIo>) -> Result<()> {
        let Some(path) = self.journal_path.clone() else {
            return Ok(());
        };
        let file = match self.fs.open(&path, FileType::MainJournal, OpenPermissions::READWRITE) {
            Ok(file) => file,
            Err(SombraError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        let master = journal::read_master_name(file.as_ref())?;
        let master_missing = match &master {
            Some(name) => !self.fs.exists(Path::new(name))?,
            None => false,
        };
        let mut replayed = 0;
        let mut initial_pages = None;
        if !master_missing {
            if let Some(header) = JournalHeader::read_from(file.as_ref())? {
                replayed = self.replay_journal_file(file.as_ref(), db.as_ref(), &header)?;
                initial_pages = Some(header.initial_pages);
                if header.page_size as usize != self.page_size && self.cache.referenced() == 0 {
                    self.apply_page_size(header.page_size as usize)?;
                }
            }
        }
        let mode = match self.options.journal_mode {
            JournalMode::Memory | JournalMode::Off => JournalMode::Delete,
            mode => mode,
        };
        self.finalize_journal(Some(file), mode, master.is_some())?;
        if let Some(name) = &master {
            self.delete_master_if_unused(Path::new(name))?;
        }
        self.stats.hot_journal_rollbacks += 1;
        info!(
            journal = %path.display(),
            pages = replayed,
            initial_pages = ?initial_pages,
            master = ?master,
            master_missing,
            "pager.hot_journal.playback"
        );
        Ok(())
    }

    /// Writes every verified record of a journal file into `db`, truncates
    /// `db` to the journal's initial size and syncs it. Stops at the first
    /// record that fails its checksum.
    fn replay_journal_file(
        &mut self,
        file: &dyn FileIo,
        db: &dyn FileIo,
        header: &JournalHeader,
    ) -> Result<u32> {
        let page_size = header.page_size as usize;
        let len = file.len()?;
        let rec_len = journal::record_len(page_size) as u64;
        let mut buf = vec![0u8; rec_len as usize];
        let mut offset = header.padded_len();
        let mut replayed = 0;
        for _ in 0..header.replay_count(len) {
            if offset + rec_len > len {
                break;
            }
            file.read_at(offset, &mut buf)?;
            let Some((page, data)) = journal::decode_record(&buf, page_size, header.nonce) else {
                warn!(offset, record = replayed, "pager.hot_journal.torn_record");
                break;
            };
            db.write_at(page.file_offset(page_size), data)?;
            pager_test_log!("[pager.hot_journal] restored page {}", page);
            replayed += 1;
            offset += rec_len;
        }
        db.truncate(u64::from(header.initial_pages) * page_size as u64)?;
        if !self.no_sync {
            db.sync_all()?;
        }
        Ok(replayed)
    }

    /// Ends the life of a journal file according to the journal mode.
    /// A journal that names a master is always removed or truncated.
    pub(super) fn finalize_journal(
        &mut self,
        file: Option<Arc<dyn FileIo>>,
        mode: JournalMode,
        has_master: bool,
    ) -> Result<()> {
        if self.kind != DbKind::File {
            drop(file);
            return Ok(());
        }
        let Some(path) = self.journal_path.clone() else {
            return Ok(());
        };
        match (mode, file) {
            (JournalMode::Memory | JournalMode::Off, file) => drop(file),
            (JournalMode::Persist, Some(file)) if !has_master => {
                file.write_at(0, &[0u8; JOURNAL_HEADER_LEN])?;
                if !self.no_sync {
                    file.sync_all()?;
                }
            }
            (JournalMode::Persist | JournalMode::Truncate, Some(file)) => {
                file.truncate(0)?;
                if !self.no_sync {
                    file.sync_all()?;
                }
            }
            (JournalMode::Persist | JournalMode::Truncate, None) => {}
            (JournalMode::Delete, file) => {
                drop(file);
                self.fs.delete(&path)?;
            }
        }
        debug!(
            journal = %path.display(),
            mode = mode.as_str(),
            has_master,
            "pager.journal.finalize"
        );
        Ok(())
    }

    /// Deletes a master journal once none of its children still point at it.
    fn delete_master_if_unused(&self, master: &Path) -> Result<()> {
        let children = match journal::read_master_journal(self.fs.as_ref(), master) {
            Ok(children) => children,
            Err(SombraError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        let master_name = master.to_str();
        for child in &children {
            let file = match self.fs.open(child, FileType::MainJournal, OpenPermissions::READONLY) {
                Ok(file) => file,
                Err(SombraError::NotFound) => continue,
                Err(err) => return Err(err),
            };
            if journal::read_master_name(file.as_ref())?.as_deref() == master_name {
                debug!(master = %master.display(), child = %child.display(), "pager.master_journal.in_use");
                return Ok(());
            }
        }
        self.fs.delete(master)?;
        debug!(master = %master.display(), "pager.master_journal.delete");
        Ok(())
    }

    /// Restores the lock level a transaction started from: SHARED in normal
    /// locking mode, whatever is held in exclusive mode.
    pub(super) fn downgrade_after_txn(&mut self) -> Result<()> {
        let Some(db) = self.db.clone() else {
            self.state = PagerState::Exclusive;
            return Ok(());
        };
        if self.options.locking_mode == LockingMode::Exclusive {
            self.state = match db.lock_level() {
                LockLevel::Exclusive => PagerState::Exclusive,
                LockLevel::Reserved | LockLevel::Pending => PagerState::Reserved,
                LockLevel::Shared => PagerState::Shared,
                LockLevel::None => PagerState::Unlocked,
            };
            return Ok(());
        }
        db.unlock(LockLevel::Shared)?;
        self.state = PagerState::Shared;
        Ok(())
    }

    /// Drops to UNLOCKED and forgets cached pages once nothing is referenced
    /// and no transaction is open.
    pub(super) fn unlock_if_unused(&mut self) {
        if self.cache.referenced() > 0
            || self.txn.open
            || self.kind != DbKind::File
            || self.options.locking_mode == LockingMode::Exclusive
            || self.state == PagerState::Unlocked
        {
            return;
        }
        if let Some(db) = &self.db {
            if let Err(err) = db.unlock(LockLevel::None) {
                warn!(error = %err, "pager.unlock.failed");
            }
        }
        self.state = PagerState::Unlocked;
        self.db_size = None;
        self.cache.clear();
        pager_test_log!("[pager.unlock] released all locks");
    }

    /// Returns page `number` with a new reference.
    ///
    /// With `read_content == false` a page that is not cached is handed out
    /// with `NEED_READ` set and zeroed content; it is read before its first
    /// write. The lock page and page 0 are never handed out.
    pub fn acquire_page(&mut self, number: PageId, read_content: bool) -> Result<PageHandle> {
        self.check_readable()?;
        if number.is_null() {
            return Err(SombraError::Invalid("page 0 does not exist"));
        }
        if number.0 == self.lock_page() {
            return Err(SombraError::Corruption("lock page requested"));
        }
        self.ensure_shared_lock()?;
        let fetched = self.cache.fetch(number);
        let slot = fetched.slot;
        if fetched.evicted {
            self.stats.evictions += 1;
        }
        if fetched.created {
            self.stats.misses += 1;
            let in_journal = self.txn.open && self.txn.in_journal.test(number);
            let in_stmt = self
                .txn
                .stmt
                .as_ref()
                .is_some_and(|stmt| stmt.in_stmt.test(number));
            let always = self.txn.open && self.txn.always_rollback.test(number);
            let frame = self.cache.frame_mut(slot);
            frame.flags.set(PageFlags::IN_JOURNAL, in_journal);
            frame.flags.set(PageFlags::IN_STATEMENT_JOURNAL, in_stmt);
            frame.flags.set(PageFlags::ALWAYS_ROLLBACK, always);
            frame.flags.insert(PageFlags::NEED_READ);
        } else {
            self.stats.hits += 1;
        }
        let needs_read = self.cache.frame(slot).flags.contains(PageFlags::NEED_READ);
        if needs_read && (read_content || !self.page_on_disk(number)?) {
            if let Err(err) = self.load_page(slot) {
                if self.cache.release(slot) == 0 {
                    self.cache.drop_page(slot)?;
                }
                let err = self.record_error(err);
                self.unlock_if_unused();
                return Err(err);
            }
        }
        Ok(PageHandle::new(slot))
    }

    /// Same as `acquire_page(number, true)`.
    pub fn get_page(&mut self, number: PageId) -> Result<PageHandle> {
        self.acquire_page(number, true)
    }

    /// Returns a cached, loaded page with a new reference, without touching
    /// the file.
    pub fn lookup(&mut self, number: PageId) -> Option<PageHandle> {
        if self.state == PagerState::Unlocked || self.check_readable().is_err() {
            return None;
        }
        let slot = self.cache.fetch_existing(number).ok()?;
        if self.cache.frame(slot).flags.contains(PageFlags::NEED_READ) {
            self.cache.release(slot);
            return None;
        }
        Some(PageHandle::new(slot))
    }

    fn page_on_disk(&mut self, number: PageId) -> Result<bool> {
        if self.kind == DbKind::Memory {
            return Ok(false);
        }
        if self.txn.open && number.0 > self.txn.size_floor {
            return Ok(false);
        }
        Ok(number.0 <= self.page_count()?)
    }

    /// Fills a page from the database file, zero-filling pages past its end.
    pub(super) fn load_page(&mut self, slot: usize) -> Result<()> {
        let number = self.cache.frame(slot).number;
        let on_disk = self.page_on_disk(number)?;
        let page_size = self.page_size;
        let db = self.db.clone();
        let frame = self.cache.frame_mut(slot);
        match db {
            Some(db) if on_disk => {
                db.read_at_padded(number.file_offset(page_size), &mut frame.data)?;
            }
            _ => frame.data.fill(0),
        }
        frame.content_hash = page_hash(&frame.data);
        frame.flags.remove(PageFlags::NEED_READ);
        pager_test_log!("[pager.load] page {} on_disk={}", number, on_disk);
        Ok(())
    }

    /// Takes another reference to the page behind `handle`.
    pub fn add_ref(&mut self, handle: &PageHandle) -> PageHandle {
        self.cache.add_ref(handle.slot);
        PageHandle::new(handle.slot)
    }

    /// Gives back one reference. The destructor runs when the last one goes,
    /// and the pager unlocks once no page is referenced.
    pub fn release(&mut self, handle: PageHandle) -> Result<()> {
        let slot = handle.slot;
        let verified = self.verify_clean_page(slot);
        if self.cache.release(slot) == 0 {
            if let Some(destructor) = self.destructor.as_mut() {
                let frame = self.cache.frame_mut(slot);
                destructor(frame.number, &mut frame.data, &mut frame.extra);
            }
            self.unlock_if_unused();
        }
        verified
    }

    fn verify_clean_page(&self, slot: usize) -> Result<()> {
        if !self.options.check_pages {
            return Ok(());
        }
        let frame = self.cache.frame(slot);
        if frame.flags.intersects(PageFlags::DIRTY | PageFlags::NEED_READ) {
            return Ok(());
        }
        if frame.content_hash != page_hash(&frame.data) {
            warn!(page = %frame.number, "pager.page.modified_without_write");
            return Err(SombraError::Corruption("clean page modified without write"));
        }
        Ok(())
    }

    /// Content of a page.
    pub fn page_data(&self, handle: &PageHandle) -> &[u8] {
        &self.cache.frame(handle.slot).data
    }

    /// Mutable content of a page. The page must have been passed to
    /// [`Pager::write`] in the current transaction.
    pub fn page_data_mut(&mut self, handle: &PageHandle) -> Result<&mut [u8]> {
        let frame = self.cache.frame_mut(handle.slot);
        if !frame.is_dirty() {
            return Err(SombraError::Misuse("page modified without write"));
        }
        Ok(&mut frame.data)
    }

    /// Upper-layer bytes attached to a page.
    pub fn page_extra(&self, handle: &PageHandle) -> &[u8] {
        &self.cache.frame(handle.slot).extra
    }

    /// Mutable upper-layer bytes. They are never journaled.
    pub fn page_extra_mut(&mut self, handle: &PageHandle) -> &mut [u8] {
        &mut self.cache.frame_mut(handle.slot).extra
    }

    /// Number of the page behind `handle`.
    pub fn page_number(&self, handle: &PageHandle) -> PageId {
        self.cache.frame(handle.slot).number
    }

    /// Current flags of a page.
    pub fn page_flags(&self, handle: &PageHandle) -> PageFlags {
        self.cache.frame(handle.slot).flags
    }

    /// References held on a page.
    pub fn page_ref_count(&self, handle: &PageHandle) -> u32 {
        self.cache.frame(handle.slot).ref_count
    }

    /// Pages with a non-zero reference count.
    pub fn referenced_pages(&self) -> usize {
        self.cache.referenced()
    }

    /// Pages held by the cache, referenced or not.
    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    /// Rolls back any open transaction and releases every lock.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let result = if self.txn.open {
            self.rollback_transaction()
        } else {
            Ok(())
        };
        self.closed = true;
        self.journal = None;
        self.stmt_journal = None;
        if let Some(db) = &self.db {
            if let Err(err) = db.unlock(LockLevel::None) {
                warn!(error = %err, "pager.unlock.failed");
            }
        }
        self.state = PagerState::Unlocked;
        debug!(path = ?self.path, stats = %self.stats, "pager.close");
        result
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "pager.close.failed");
        }
    }
}

impl fmt::Debug for Pager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pager")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("page_size", &self.page_size)
            .field("db_size", &self.db_size)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}
