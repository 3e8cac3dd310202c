#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use super::{FileIo, FileSystem, FileType, OpenPermissions, DEFAULT_SECTOR_SIZE};
use crate::primitives::concurrency::{FileLock, LockKey, LockLevel};
use crate::types::{Result, SombraError};

static NEXT_FS_ID: AtomicU64 = AtomicU64::new(1);

type Contents = Arc<RwLock<Vec<u8>>>;
type FileTable = Arc<Mutex<FxHashMap<PathBuf, Contents>>>;

/// File system whose files live in process memory.
///
/// Clones share the same files, so a database can be closed and reopened
/// through another clone. Locks are coordinated between handles of the same
/// instance only.
#[derive(Clone)]
pub struct MemFileSystem {
    id: u64,
    files: FileTable,
    sector_size: usize,
}

impl Default for MemFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFileSystem {
    /// Empty file system reporting the default sector size.
    pub fn new() -> Self {
        Self::with_sector_size(DEFAULT_SECTOR_SIZE)
    }

    /// Empty file system whose files report `sector_size`.
    pub fn with_sector_size(sector_size: usize) -> Self {
        Self {
            id: NEXT_FS_ID.fetch_add(1, Ordering::Relaxed),
            files: Arc::new(Mutex::new(FxHashMap::default())),
            sector_size,
        }
    }

    /// Copy of a file's bytes.
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().get(path).map(|data| data.read().clone())
    }

    /// Replaces (or creates) a file with `bytes`.
    pub fn set_contents(&self, path: &Path, bytes: Vec<u8>) {
        let mut files = self.files.lock();
        match files.get(path) {
            Some(existing) => *existing.write() = bytes,
            None => {
                files.insert(path.to_path_buf(), Arc::new(RwLock::new(bytes)));
            }
        }
    }

    /// Paths of every file currently present.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.files.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn lock_for(&self, path: &Path) -> FileLock {
        FileLock::for_key(LockKey::Memory {
            fs: self.id,
            path: path.to_path_buf(),
        })
    }
}

impl FileSystem for MemFileSystem {
    fn open(
        &self,
        path: &Path,
        _file_type: FileType,
        permissions: OpenPermissions,
    ) -> Result<Arc<dyn FileIo>> {
        let read_only = !permissions.contains(OpenPermissions::READWRITE);
        let data = {
            let mut files = self.files.lock();
            match files.get(path) {
                Some(_) if permissions.contains(OpenPermissions::EXCLUSIVE) => {
                    return Err(SombraError::Invalid("file already exists"));
                }
                Some(data) => Arc::clone(data),
                None if permissions.contains(OpenPermissions::CREATE) && !read_only => {
                    let data: Contents = Arc::new(RwLock::new(Vec::new()));
                    files.insert(path.to_path_buf(), Arc::clone(&data));
                    data
                }
                None => return Err(SombraError::NotFound),
            }
        };
        let delete_on_close = permissions
            .contains(OpenPermissions::DELETEONCLOSE)
            .then(|| (Arc::clone(&self.files), path.to_path_buf()));
        Ok(Arc::new(MemFileIo {
            data,
            lock: Mutex::new(self.lock_for(path)),
            read_only,
            sector_size: self.sector_size,
            delete_on_close,
        }))
    }

    fn open_temp(&self, _file_type: FileType) -> Result<Arc<dyn FileIo>> {
        let anon = PathBuf::from(format!(
            "\0temp-{}",
            NEXT_FS_ID.fetch_add(1, Ordering::Relaxed)
        ));
        Ok(Arc::new(MemFileIo {
            data: Arc::new(RwLock::new(Vec::new())),
            lock: Mutex::new(self.lock_for(&anon)),
            read_only: false,
            sector_size: self.sector_size,
            delete_on_close: None,
        }))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        self.files.lock().remove(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.files.lock().contains_key(path))
    }
}

/// Handle on a [`MemFileSystem`] file.
pub struct MemFileIo {
    data: Contents,
    lock: Mutex<FileLock>,
    read_only: bool,
    sector_size: usize,
    delete_on_close: Option<(FileTable, PathBuf)>,
}

impl Drop for MemFileIo {
    fn drop(&mut self) {
        if let Some((files, path)) = self.delete_on_close.take() {
            files.lock().remove(&path);
        }
    }
}

impl MemFileIo {
    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(SombraError::Permission("file opened read-only"));
        }
        Ok(())
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let start = off as usize;
        let end = start
            .checked_add(dst.len())
            .ok_or(SombraError::Invalid("read offset overflow"))?;
        if end > data.len() {
            return Err(SombraError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of memory file",
            )));
        }
        dst.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut data = self.data.write();
        let start = off as usize;
        let end = start
            .checked_add(src.len())
            .ok_or(SombraError::Invalid("write offset overflow"))?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.check_writable()?;
        self.data.write().resize(len as usize, 0);
        Ok(())
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

    fn sector_size(&self) -> usize {
        self.sector_size
    }
}
