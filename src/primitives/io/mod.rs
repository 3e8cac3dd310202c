#![forbid(unsafe_code)]

//! File service consumed by the pager: positioned I/O, sync, size, truncate
//! and the database lock levels, plus a file system to open and delete files.

use std::{
    fs::{File, OpenOptions},
    io::{self, IoSlice},
    path::{Path, PathBuf},
    sync::Arc,
};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::primitives::concurrency::{FileLock, LockLevel};
use crate::types::{Result, SombraError};

/// In-memory file system for tests and `:memory:` databases.
pub mod mem;

pub use mem::{MemFileIo, MemFileSystem};

#[cfg(test)]
macro_rules! io_test_log {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

#[cfg(not(test))]
macro_rules! io_test_log {
    ($($arg:tt)*) => {
        if false {
            let _ = format_args!($($arg)*);
        }
    };
}

/// Sector size assumed when the file cannot report one.
pub const DEFAULT_SECTOR_SIZE: usize = 512;

bitflags! {
    /// How a file is opened.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct OpenPermissions: u32 {
        /// Reads only; writes fail with `Permission`.
        const READONLY = 0x01;
        /// Reads and writes.
        const READWRITE = 0x02;
        /// Create the file if it does not exist.
        const CREATE = 0x04;
        /// Delete the file when the last handle drops.
        const DELETEONCLOSE = 0x08;
        /// Fail if the file already exists.
        const EXCLUSIVE = 0x10;
    }
}

impl OpenPermissions {
    /// Read-write, created if missing.
    pub fn create() -> Self {
        OpenPermissions::READWRITE | OpenPermissions::CREATE
    }
}

/// Role of a file, passed through to the file system.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FileType {
    /// Main database file.
    MainDb,
    /// Temporary database, deleted on close.
    TempDb,
    /// Database kept entirely in memory.
    MemoryDb,
    /// Rollback journal of a main database.
    MainJournal,
    /// Rollback journal of a temporary database.
    TempJournal,
    /// Statement (savepoint) journal.
    StatementJournal,
    /// Master journal naming the journals of a multi-file commit.
    MasterJournal,
}

impl FileType {
    /// Name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::MainDb => "main_db",
            FileType::TempDb => "temp_db",
            FileType::MemoryDb => "memory_db",
            FileType::MainJournal => "main_journal",
            FileType::TempJournal => "temp_journal",
            FileType::StatementJournal => "statement_journal",
            FileType::MasterJournal => "master_journal",
        }
    }
}

/// Trait for performing positioned file I/O operations.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes at `off`; reading past EOF is an error.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, extending the file if needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Writes multiple buffers to the file at the specified offset.
    fn writev_at(&self, mut off: u64, bufs: &[IoSlice<'_>]) -> Result<()> {
        for slice in bufs {
            if slice.is_empty() {
                continue;
            }
            self.write_at(off, slice)?;
            off = off
                .checked_add(slice.len() as u64)
                .ok_or(SombraError::Invalid("writev offset overflow"))?;
        }
        Ok(())
    }
    /// Reads up to `dst.len()` bytes at `off`, zero-filling whatever lies
    /// beyond the end of the file. Returns the number of bytes read.
    fn read_at_padded(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
        let len = self.len()?;
        let available = len.saturating_sub(off).min(dst.len() as u64) as usize;
        if available > 0 {
            self.read_at(off, &mut dst[..available])?;
        }
        dst[available..].fill(0);
        Ok(available)
    }
    /// Synchronizes all file data and metadata to disk.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to the specified length.
    fn truncate(&self, len: u64) -> Result<()>;
    /// Raises the database lock; `Ok(false)` means another connection holds
    /// a conflicting lock.
    fn lock(&self, level: LockLevel) -> Result<bool>;
    /// Lowers the database lock to SHARED or NONE.
    fn unlock(&self, level: LockLevel) -> Result<()>;
    /// Level currently held through this handle.
    fn lock_level(&self) -> LockLevel;
    /// True if some connection holds RESERVED or stronger.
    fn check_reserved_lock(&self) -> Result<bool>;
    /// Smallest unit the device writes atomically.
    fn sector_size(&self) -> usize {
        DEFAULT_SECTOR_SIZE
    }
}

/// Opens, deletes and checks for files.
pub trait FileSystem: Send + Sync + 'static {
    /// Opens `path` with the given permissions.
    fn open(
        &self,
        path: &Path,
        file_type: FileType,
        permissions: OpenPermissions,
    ) -> Result<Arc<dyn FileIo>>;
    /// Opens an anonymous read-write file that disappears once closed.
    fn open_temp(&self, file_type: FileType) -> Result<Arc<dyn FileIo>>;
    /// Removes `path`. Missing files are not an error.
    fn delete(&self, path: &Path) -> Result<()>;
    /// True if `path` exists.
    fn exists(&self, path: &Path) -> Result<bool>;
}

#[cfg(unix)]
mod stdio {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        io_test_log!("[io.read_exact] off={} len={}", off, dst.len());
        while !dst.is_empty() {
            let read = match file.read_at(dst, off) {
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        io_test_log!("[io.write_all] off={} len={}", off, src.len());
        while !src.is_empty() {
            let written = match file.write_at(src, off) {
                Ok(written) => written,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod stdio {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// Database or journal file backed by `std::fs::File`.
pub struct StdFileIo {
    file: Arc<File>,
    lock: Mutex<FileLock>,
    delete_on_close: Option<PathBuf>,
    read_only: bool,
}

impl StdFileIo {
    /// Wraps an open file.
    pub fn new(file: File) -> Result<Self> {
        let file = Arc::new(file);
        let lock = FileLock::for_file(&file)?;
        Ok(Self {
            file,
            lock: Mutex::new(lock),
            delete_on_close: None,
            read_only: false,
        })
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::new(file)
    }

    /// True if the handle rejects writes.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl Drop for StdFileIo {
    fn drop(&mut self) {
        let mut lock = self.lock.lock();
        if let Err(_err) = lock.unlock(LockLevel::None) {
            #[cfg(debug_assertions)]
            eprintln!("failed to unlock on close: {:?}", _err);
        }
        lock.park(Arc::clone(&self.file));
        if let Some(path) = self.delete_on_close.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        stdio::read_exact(&self.file, off, dst).map_err(SombraError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(SombraError::Permission("file opened read-only"));
        }
        stdio::write_all(&self.file, off, src).map_err(SombraError::from)
    }

    fn sync_all(&self) -> Result<()> {
        io_test_log!("[io.sync_all] start");
        let result = self.file.sync_all().map_err(SombraError::from);
        if let Err(err) = &result {
            io_test_log!("[io.sync_all] error: {}", err);
        }
        result
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        if self.read_only {
            return Err(SombraError::Permission("file opened read-only"));
        }
        self.file.set_len(len).map_err(SombraError::from)
    }

    fn lock(&self, level: LockLevel) -> Result<bool> {
        self.lock.lock().lock(level)
    }

    fn unlock(&self, level: LockLevel) -> Result<()> {
        self.lock.lock().unlock(level)
    }

    fn lock_level(&self) -> LockLevel {
        self.lock.lock().level()
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        self.lock.lock().check_reserved()
    }
}

/// File system over `std::fs`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn open(
        &self,
        path: &Path,
        file_type: FileType,
        permissions: OpenPermissions,
    ) -> Result<Arc<dyn FileIo>> {
        let read_only = !permissions.contains(OpenPermissions::READWRITE);
        let mut opts = OpenOptions::new();
        opts.read(true).write(!read_only);
        if permissions.contains(OpenPermissions::CREATE) && !read_only {
            if permissions.contains(OpenPermissions::EXCLUSIVE) {
                opts.create_new(true);
            } else {
                opts.create(true).truncate(false);
            }
        }
        let file = opts.open(path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => SombraError::NotFound,
            io::ErrorKind::PermissionDenied => {
                SombraError::Permission("cannot open file with requested access")
            }
            _ => SombraError::from(err),
        })?;
        tracing::trace!(
            path = %path.display(),
            file_type = file_type.as_str(),
            read_only,
            "io.open"
        );
        let mut io = StdFileIo::new(file)?;
        io.read_only = read_only;
        if permissions.contains(OpenPermissions::DELETEONCLOSE) {
            io.delete_on_close = Some(path.to_path_buf());
        }
        Ok(Arc::new(io))
    }

    fn open_temp(&self, file_type: FileType) -> Result<Arc<dyn FileIo>> {
        let file = tempfile::tempfile()?;
        tracing::trace!(file_type = file_type.as_str(), "io.open_temp");
        Ok(Arc::new(StdFileIo::new(file)?))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(path.exists())
    }
}

/// Appends `suffix` to the file name of `path` (`db` -> `db-journal`).
pub fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}
