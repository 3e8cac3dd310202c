#![allow(unsafe_code)]

//! Advisory database file locks.
//!
//! A database file is locked at one of five levels. POSIX record locks belong
//! to the process rather than to a file descriptor, so every handle on the
//! same inode shares one [`InodeLock`] from a process-wide table, and the
//! byte-range locks below are only taken or dropped when the aggregate state
//! of the inode changes.

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::types::{Result, SombraError};

/// First byte of the lock region. The page containing it is never used.
pub const PENDING_BYTE: u64 = 0x4000_0000;
/// Byte locked by the connection holding RESERVED.
pub const RESERVED_BYTE: u64 = PENDING_BYTE + 1;
/// Start of the range readers lock for SHARED.
pub const SHARED_FIRST: u64 = PENDING_BYTE + 2;
/// Length of the SHARED range.
pub const SHARED_SIZE: u64 = 510;

/// Lock levels, weakest first.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LockLevel {
    /// No lock held.
    #[default]
    None,
    /// Readers. Any number of connections may hold it.
    Shared,
    /// A writer intends to write. Coexists with SHARED.
    Reserved,
    /// A writer is waiting for readers to drain. Blocks new SHARED.
    Pending,
    /// The writer may change the database file.
    Exclusive,
}

impl LockLevel {
    /// Name used in logs and by the inspector.
    pub fn as_str(self) -> &'static str {
        match self {
            LockLevel::None => "none",
            LockLevel::Shared => "shared",
            LockLevel::Reserved => "reserved",
            LockLevel::Pending => "pending",
            LockLevel::Exclusive => "exclusive",
        }
    }
}

/// Identity under which handles share lock state.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum LockKey {
    /// An on-disk file, identified by device and inode.
    Inode {
        /// Device id.
        dev: u64,
        /// Inode number.
        ino: u64,
    },
    /// A file in an in-memory file system instance.
    Memory {
        /// Id of the file system instance.
        fs: u64,
        /// Path inside that instance.
        path: PathBuf,
    },
}

struct InodeLock {
    level: LockLevel,
    shared: u32,
    os_file: Option<Arc<File>>,
    // Descriptors closed while the inode was still locked. Closing them would
    // drop every record lock this process holds on the inode.
    parked: Vec<Arc<File>>,
}

impl InodeLock {
    fn os_lock(&self, start: u64, len: u64, exclusive: bool) -> Result<bool> {
        match &self.os_file {
            Some(file) => lock_region(file, start, len, exclusive),
            None => Ok(true),
        }
    }

    fn os_unlock(&self, start: u64, len: u64) -> Result<()> {
        match &self.os_file {
            Some(file) => unlock_region(file, start, len),
            None => Ok(()),
        }
    }

    fn os_reserved_held(&self) -> Result<bool> {
        match &self.os_file {
            Some(file) => region_write_locked(file, RESERVED_BYTE, 1),
            None => Ok(false),
        }
    }
}

type Registry = Mutex<FxHashMap<LockKey, Weak<Mutex<InodeLock>>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// One connection's lock on a database file.
pub struct FileLock {
    level: LockLevel,
    inode: Arc<Mutex<InodeLock>>,
}

impl FileLock {
    /// Lock handle for an on-disk file.
    pub fn for_file(file: &Arc<File>) -> Result<Self> {
        let key = inode_key(file)?;
        Ok(Self::attach(key, Some(Arc::clone(file))))
    }

    /// Lock handle that only coordinates within this process.
    pub fn for_key(key: LockKey) -> Self {
        Self::attach(key, None)
    }

    fn attach(key: LockKey, os_file: Option<Arc<File>>) -> Self {
        let mut table = registry().lock();
        if let Some(inode) = table.get(&key).and_then(Weak::upgrade) {
            return Self {
                level: LockLevel::None,
                inode,
            };
        }
        table.retain(|_, weak| weak.strong_count() > 0);
        let inode = Arc::new(Mutex::new(InodeLock {
            level: LockLevel::None,
            shared: 0,
            os_file,
            parked: Vec::new(),
        }));
        table.insert(key, Arc::downgrade(&inode));
        Self {
            level: LockLevel::None,
            inode,
        }
    }

    /// Level held by this handle.
    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Tries to raise the lock to `target` without blocking.
    ///
    /// Returns `Ok(false)` on contention. A failed attempt at EXCLUSIVE leaves
    /// the handle at PENDING so no new reader can get in ahead of it.
    pub fn lock(&mut self, target: LockLevel) -> Result<bool> {
        if self.level >= target {
            return Ok(true);
        }
        if target == LockLevel::Pending {
            return Err(SombraError::Misuse("PENDING is never requested directly"));
        }
        if target == LockLevel::Reserved && self.level != LockLevel::Shared {
            return Err(SombraError::Misuse("RESERVED requires SHARED"));
        }
        if target == LockLevel::Exclusive && self.level == LockLevel::None {
            return Err(SombraError::Misuse("EXCLUSIVE requires SHARED"));
        }

        let mut inode = self.inode.lock();
        if inode.level != self.level
            && (inode.level >= LockLevel::Pending || target > LockLevel::Shared)
        {
            return Ok(false);
        }

        if target == LockLevel::Shared
            && matches!(inode.level, LockLevel::Shared | LockLevel::Reserved)
        {
            inode.shared += 1;
            self.level = LockLevel::Shared;
            return Ok(true);
        }

        let needs_pending = target == LockLevel::Shared
            || (target == LockLevel::Exclusive && self.level < LockLevel::Pending);
        if needs_pending && !inode.os_lock(PENDING_BYTE, 1, target != LockLevel::Shared)? {
            return Ok(false);
        }

        let granted = match target {
            LockLevel::Shared => {
                let granted = inode.os_lock(SHARED_FIRST, SHARED_SIZE, false)?;
                inode.os_unlock(PENDING_BYTE, 1)?;
                if granted {
                    inode.shared = 1;
                }
                granted
            }
            _ if target == LockLevel::Exclusive && inode.shared > 1 => false,
            LockLevel::Reserved => inode.os_lock(RESERVED_BYTE, 1, true)?,
            _ => inode.os_lock(SHARED_FIRST, SHARED_SIZE, true)?,
        };

        if granted {
            self.level = target;
            inode.level = target;
        } else if target == LockLevel::Exclusive {
            self.level = LockLevel::Pending;
            inode.level = LockLevel::Pending;
        }
        Ok(granted)
    }

    /// Lowers the lock to `target`, which must be SHARED or NONE.
    pub fn unlock(&mut self, target: LockLevel) -> Result<()> {
        if self.level <= target {
            return Ok(());
        }
        if target > LockLevel::Shared {
            return Err(SombraError::Misuse("unlock target above SHARED"));
        }
        let mut inode = self.inode.lock();
        if self.level > LockLevel::Shared {
            debug_assert_eq!(inode.level, self.level);
            if target == LockLevel::Shared {
                inode.os_lock(SHARED_FIRST, SHARED_SIZE, false)?;
            }
            inode.os_unlock(PENDING_BYTE, 2)?;
            inode.level = LockLevel::Shared;
        }
        if target == LockLevel::None {
            inode.shared = inode.shared.saturating_sub(1);
            if inode.shared == 0 {
                inode.os_unlock(SHARED_FIRST, SHARED_SIZE)?;
                inode.level = LockLevel::None;
                inode.parked.clear();
            }
        }
        self.level = target;
        Ok(())
    }

    /// True when any connection, here or in another process, holds
    /// RESERVED or stronger.
    pub fn check_reserved(&self) -> Result<bool> {
        let inode = self.inode.lock();
        if inode.level > LockLevel::Shared {
            return Ok(true);
        }
        inode.os_reserved_held()
    }

    /// Keeps `file` open until the inode is fully unlocked.
    pub fn park(&self, file: Arc<File>) {
        let mut inode = self.inode.lock();
        if inode.shared > 0 {
            inode.parked.push(file);
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(_err) = self.unlock(LockLevel::None) {
            #[cfg(debug_assertions)]
            eprintln!("failed to release file lock: {:?}", _err);
        }
    }
}

#[cfg(unix)]
fn inode_key(file: &File) -> Result<LockKey> {
    use std::os::unix::fs::MetadataExt;
    let meta = file.metadata()?;
    Ok(LockKey::Inode {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
fn inode_key(file: &File) -> Result<LockKey> {
    // Without inode numbers every handle gets its own entry, keyed by address.
    Ok(LockKey::Memory {
        fs: 0,
        path: PathBuf::from(format!("{:p}", file)),
    })
}

fn lock_region(file: &Arc<File>, start: u64, len: u64, exclusive: bool) -> Result<bool> {
    #[cfg(unix)]
    {
        unix::lock_region(file, start, len, exclusive).map_err(SombraError::from)
    }
    #[cfg(not(unix))]
    {
        let _ = (file, start, len, exclusive);
        Ok(true)
    }
}

fn unlock_region(file: &Arc<File>, start: u64, len: u64) -> Result<()> {
    #[cfg(unix)]
    {
        unix::unlock_region(file, start, len).map_err(SombraError::from)
    }
    #[cfg(not(unix))]
    {
        let _ = (file, start, len);
        Ok(())
    }
}

fn region_write_locked(file: &Arc<File>, start: u64, len: u64) -> Result<bool> {
    #[cfg(unix)]
    {
        unix::region_write_locked(file, start, len).map_err(SombraError::from)
    }
    #[cfg(not(unix))]
    {
        let _ = (file, start, len);
        Ok(false)
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::io::AsRawFd;

    fn flock(l_type: libc::c_int, start: u64, len: u64) -> libc::flock {
        // SAFETY: flock is a plain C struct; all-zero is a valid value.
        let mut lock: libc::flock = unsafe { std::mem::zeroed() };
        lock.l_type = l_type as _;
        lock.l_whence = libc::SEEK_SET as _;
        lock.l_start = start as libc::off_t;
        lock.l_len = len as libc::off_t;
        lock
    }

    pub fn lock_region(file: &Arc<File>, start: u64, len: u64, exclusive: bool) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        let l_type = if exclusive { libc::F_WRLCK } else { libc::F_RDLCK };
        let mut lock = flock(l_type as libc::c_int, start, len);
        loop {
            let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut lock) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn unlock_region(file: &Arc<File>, start: u64, len: u64) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let mut lock = flock(libc::F_UNLCK as libc::c_int, start, len);
        let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut lock) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    pub fn region_write_locked(file: &Arc<File>, start: u64, len: u64) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        let mut lock = flock(libc::F_WRLCK as libc::c_int, start, len);
        let res = unsafe { libc::fcntl(fd, libc::F_GETLK, &mut lock) };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(lock.l_type as libc::c_int != libc::F_UNLCK as libc::c_int)
    }
}
