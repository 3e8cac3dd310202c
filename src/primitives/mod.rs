//! Low-level primitives the pager is built from.
//!
//! Includes the file service, the database lock levels and the pager with
//! its cache and journals.

/// Database lock levels and the advisory file locks behind them.
pub mod concurrency;

/// File service consumed by the pager.
///
/// Positioned reads and writes, sync, truncate and locking over `std::fs`
/// or memory.
pub mod io;

/// Page cache, journals and the transactional pager.
pub mod pager;
