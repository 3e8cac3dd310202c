#![forbid(unsafe_code)]

mod bitvec;
mod busy;
mod cache;
mod frame;
pub mod journal;
mod pager;
mod txn;

pub use bitvec::BitVec;
pub use busy::{BackoffBusyHandler, BusyHandler, NoBusyHandler};
pub use frame::{PageFlags, PageHandle};
pub use journal::{JournalHeader, JOURNAL_MAGIC};
pub use pager::{
    JournalMode, LockingMode, PageDestructor, Pager, PagerOptions, PagerState, PagerStats,
    Synchronous, MEMORY_DB_PATH,
};
