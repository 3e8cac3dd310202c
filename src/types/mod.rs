#![forbid(unsafe_code)]

use std::fmt;
use std::io;

/// Checksums for journal records and cached pages.
pub mod checksum;

pub use checksum::{journal_checksum, page_hash, Checksum, Crc32Fast};

/// 1-based page number. Page 1 holds the file header; 0 is never a valid page.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u32);

impl PageId {
    /// Returns true for the reserved "no page" value.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Byte offset of this page inside the main database file.
    pub fn file_offset(self, page_size: usize) -> u64 {
        debug_assert!(self.0 > 0);
        u64::from(self.0 - 1) * page_size as u64
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PageId {
    fn from(value: u32) -> Self {
        PageId(value)
    }
}

impl From<PageId> for u32 {
    fn from(value: PageId) -> Self {
        value.0
    }
}

/// Error kinds the pager distinguishes. This is what gets stored as the sticky
/// error, since `SombraError` itself is not `Clone`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCode {
    /// Lock contention.
    Busy,
    /// Disk full while writing the journal or the database.
    Full,
    /// Read/write/sync failure.
    IoErr,
    /// Malformed journal or database content.
    Corrupt,
    /// Write attempted on a read-only pager.
    Perm,
    /// API called out of sequence.
    Misuse,
    /// Bad argument supplied by the caller.
    Invalid,
    /// Requested item does not exist.
    NotFound,
}

impl ErrorCode {
    /// Short lowercase name used in log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Busy => "busy",
            ErrorCode::Full => "full",
            ErrorCode::IoErr => "ioerr",
            ErrorCode::Corrupt => "corrupt",
            ErrorCode::Perm => "perm",
            ErrorCode::Misuse => "misuse",
            ErrorCode::Invalid => "invalid",
            ErrorCode::NotFound => "notfound",
        }
    }
}

/// Errors returned by the pager and its file service.
#[derive(thiserror::Error, Debug)]
pub enum SombraError {
    /// Another connection holds a conflicting lock.
    #[error("database is locked")]
    Busy,
    /// No space left for the journal or the database.
    #[error("database or disk is full")]
    Full,
    /// Failure reported by the operating system.
    #[error("IO: {0}")]
    Io(io::Error),
    /// Malformed journal or database content.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Write attempted through a read-only handle.
    #[error("permission denied: {0}")]
    Permission(&'static str),
    /// API called out of sequence.
    #[error("misuse: {0}")]
    Misuse(&'static str),
    /// Bad argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// File or page does not exist.
    #[error("not found")]
    NotFound,
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, SombraError>;

impl SombraError {
    /// Classifies this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SombraError::Busy => ErrorCode::Busy,
            SombraError::Full => ErrorCode::Full,
            SombraError::Io(_) => ErrorCode::IoErr,
            SombraError::Corruption(_) => ErrorCode::Corrupt,
            SombraError::Permission(_) => ErrorCode::Perm,
            SombraError::Misuse(_) => ErrorCode::Misuse,
            SombraError::Invalid(_) => ErrorCode::Invalid,
            SombraError::NotFound => ErrorCode::NotFound,
        }
    }

    /// Rebuilds an error from a stored sticky code.
    pub fn sticky(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Busy => SombraError::Busy,
            ErrorCode::Full => SombraError::Full,
            ErrorCode::IoErr => SombraError::Io(io::Error::new(
                io::ErrorKind::Other,
                "pager is in an error state after a failed I/O",
            )),
            ErrorCode::Corrupt => SombraError::Corruption("pager is in an error state"),
            ErrorCode::Perm => SombraError::Permission("pager is in an error state"),
            ErrorCode::Misuse => SombraError::Misuse("pager is in an error state"),
            ErrorCode::Invalid => SombraError::Invalid("pager is in an error state"),
            ErrorCode::NotFound => SombraError::NotFound,
        }
    }

    /// True for errors that leave the pager in its sticky error state.
    pub fn is_sticky(&self) -> bool {
        matches!(self.code(), ErrorCode::Full | ErrorCode::IoErr)
    }
}

impl From<io::Error> for SombraError {
    fn from(err: io::Error) -> Self {
        if is_disk_full(&err) {
            SombraError::Full
        } else {
            SombraError::Io(err)
        }
    }
}

#[cfg(unix)]
fn is_disk_full(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOSPC)
}

#[cfg(not(unix))]
fn is_disk_full(_err: &io::Error) -> bool {
    false
}
