//! Rollback-journal pager: a page cache over one database file with
//! SHARED/RESERVED/EXCLUSIVE locking, two-phase commit, statement
//! journals and hot-journal recovery.
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use sombra_rollback::primitives::io::{FileType, OpenPermissions, StdFileSystem};
//! use sombra_rollback::{PageId, Pager};
//!
//! # fn main() -> sombra_rollback::Result<()> {
//! let mut pager = Pager::open(
//!     Arc::new(StdFileSystem),
//!     Some(Path::new("app.db")),
//!     None,
//!     FileType::MainDb,
//!     OpenPermissions::create(),
//! )?;
//! let page = pager.get_page(PageId(1))?;
//! pager.write(&page)?;
//! pager.page_data_mut(&page)?.fill(0xab);
//! pager.release(page)?;
//! pager.commit()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

pub mod primitives;
pub mod testkit;
/// Page numbers, errors and checksums.
pub mod types;

pub use primitives::pager::{
    JournalMode, LockingMode, PageFlags, PageHandle, Pager, PagerOptions, PagerState,
    PagerStats, Synchronous, MEMORY_DB_PATH,
};
pub use types::{ErrorCode, PageId, Result, SombraError};

/// A pager shared between threads. Every call holds the mutex, which
/// serializes access per database handle.
pub type SharedPager = Arc<parking_lot::Mutex<Pager>>;

/// Wraps a pager for sharing between threads.
pub fn shared(pager: Pager) -> SharedPager {
    Arc::new(parking_lot::Mutex::new(pager))
}
