//! Fault injection for exercising the pager's error paths.
//!
//! [`FaultyFileSystem`] wraps another file system and fails chosen
//! operations on the files it opens: the Nth write, every sync or truncate,
//! or everything once a simulated crash happened.

use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::primitives::concurrency::LockLevel;
use crate::primitives::io::{FileIo, FileSystem, FileType, OpenPermissions};
use crate::types::{Result, SombraError};

/// Error an injected fault produces.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fault {
    /// Disk full.
    Full,
    /// Generic I/O failure.
    Io,
}

impl Fault {
    fn error(self, op: &'static str) -> SombraError {
        match self {
            Fault::Full => SombraError::Full,
            Fault::Io => SombraError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("injected fault on {op}"),
            )),
        }
    }
}

/// Which files a write fault applies to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultTarget {
    /// Every file.
    Any,
    /// Rollback and statement journals.
    Journal,
    /// Main, temporary and in-memory database files.
    Database,
}

impl FaultTarget {
    fn matches(self, file_type: FileType) -> bool {
        match self {
            FaultTarget::Any => true,
            FaultTarget::Journal => matches!(
                file_type,
                FileType::MainJournal
                    | FileType::TempJournal
                    | FileType::StatementJournal
                    | FileType::MasterJournal
            ),
            FaultTarget::Database => matches!(
                file_type,
                FileType::MainDb | FileType::TempDb | FileType::MemoryDb
            ),
        }
    }
}

#[derive(Debug, Default)]
struct Plan {
    /// Successful writes so far, across every file.
    writes: u64,
    /// Fail the write that comes after `remaining` more matching writes.
    write_fault: Option<WriteFault>,
    sync_fault: Option<Fault>,
    truncate_fault: Option<Fault>,
    /// Enter the crashed state after this many more writes.
    crash_after: Option<u64>,
    crashed: bool,
}

#[derive(Debug)]
struct WriteFault {
    target: FaultTarget,
    remaining: u64,
    fault: Fault,
    repeat: bool,
}

/// File system wrapper that injects failures. Clones share one fault plan.
#[derive(Clone)]
pub struct FaultyFileSystem {
    inner: Arc<dyn FileSystem>,
    plan: Arc<Mutex<Plan>>,
}

impl FaultyFileSystem {
    /// Wraps `inner` with no faults planned.
    pub fn new(inner: Arc<dyn FileSystem>) -> Self {
        Self {
            inner,
            plan: Arc::new(Mutex::new(Plan::default())),
        }
    }

    /// Fails the write that follows `after` more successful writes to
    /// files matching `target`. With `repeat`, every later matching write
    /// fails too.
    pub fn fail_write(&self, target: FaultTarget, after: u64, fault: Fault, repeat: bool) {
        self.plan.lock().write_fault = Some(WriteFault {
            target,
            remaining: after,
            fault,
            repeat,
        });
    }

    /// Fails every sync until cleared.
    pub fn fail_syncs(&self, fault: Fault) {
        self.plan.lock().sync_fault = Some(fault);
    }

    /// Fails every truncate until cleared.
    pub fn fail_truncates(&self, fault: Fault) {
        self.plan.lock().truncate_fault = Some(fault);
    }

    /// Simulates a process death after `writes` more successful writes:
    /// from then on every write, sync, truncate and delete fails, so
    /// whatever is on disk stays as it was.
    pub fn crash_after(&self, writes: u64) {
        let mut plan = self.plan.lock();
        if writes == 0 {
            plan.crashed = true;
        } else {
            plan.crash_after = Some(writes);
        }
    }

    /// True once a planned crash happened.
    pub fn is_crashed(&self) -> bool {
        self.plan.lock().crashed
    }

    /// Successful writes seen so far.
    pub fn writes(&self) -> u64 {
        self.plan.lock().writes
    }

    /// Removes every fault and leaves the crashed state.
    pub fn clear(&self) {
        let mut plan = self.plan.lock();
        let writes = plan.writes;
        *plan = Plan {
            writes,
            ..Plan::default()
        };
    }

    fn wrap(&self, inner: Arc<dyn FileIo>, file_type: FileType) -> Arc<dyn FileIo> {
        Arc::new(FaultyFile {
            inner,
            file_type,
            plan: self.plan.clone(),
        })
    }
}

impl FileSystem for FaultyFileSystem {
    fn open(
        &self,
        path: &Path,
        file_type: FileType,
        permissions: OpenPermissions,
    ) -> Result<Arc<dyn FileIo>> {
        if permissions.contains(OpenPermissions::CREATE) && self.is_crashed() {
            return Err(Fault::Io.error("open"));
        }
        let inner = self.inner.open(path, file_type, permissions)?;
        Ok(self.wrap(inner, file_type))
    }

    fn open_temp(&self, file_type: FileType) -> Result<Arc<dyn FileIo>> {
        let inner = self.inner.open_temp(file_type)?;
        Ok(self.wrap(inner, file_type))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        if self.is_crashed() {
            return Err(Fault::Io.error("delete"));
        }
        self.inner.delete(path)
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path)
    }
}

struct FaultyFile {
    inner: Arc<dyn FileIo>,
    file_type: FileType,
    plan: Arc<Mutex<Plan>>,
}

impl FaultyFile {
    fn check_write(&self) -> Result<()> {
        let mut plan = self.plan.lock();
        if plan.crashed {
            return Err(Fault::Io.error("write"));
        }
        if let Some(wf) = plan.write_fault.as_mut() {
            if wf.target.matches(self.file_type) {
                if wf.remaining == 0 {
                    let fault = wf.fault;
                    if !wf.repeat {
                        plan.write_fault = None;
                    }
                    return Err(fault.error("write"));
                }
                wf.remaining -= 1;
            }
        }
        Ok(())
    }

    fn wrote(&self) {
        let mut plan = self.plan.lock();
        plan.writes += 1;
        if let Some(left) = plan.crash_after.as_mut() {
            *left -= 1;
            if *left == 0 {
                plan.crash_after = None;
                plan.crashed = true;
            }
        }
    }
}

impl FileIo for FaultyFile {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.check_write()?;
        self.inner.write_at(off, src)?;
        self.wrote();
        Ok(())
    }

    fn read_at_padded(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
        self.inner.read_at_padded(off, dst)
    }

    fn sync_all(&self) -> Result<()> {
        let plan = self.plan.lock();
        if plan.crashed {
            return Err(Fault::Io.error("sync"));
        }
        if let Some(fault) = plan.sync_fault {
            return Err(fault.error("sync"));
        }
        drop(plan);
        self.inner.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let plan = self.plan.lock();
        if plan.crashed {
            return Err(Fault::Io.error("truncate"));
        }
        if let Some(fault) = plan.truncate_fault {
            return Err(fault.error("truncate"));
        }
        drop(plan);
        self.inner.truncate(len)
    }

    fn lock(&self, level: LockLevel) -> Result<bool> {
        self.inner.lock(level)
    }

    fn unlock(&self, level: LockLevel) -> Result<()> {
        self.inner.unlock(level)
    }

    fn lock_level(&self) -> LockLevel {
        self.inner.lock_level()
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        self.inner.check_reserved_lock()
    }

    fn sector_size(&self) -> usize {
        self.inner.sector_size()
    }
}
