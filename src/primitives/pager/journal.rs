//! Rollback journal and master journal formats.
//!
//! ```text
//! header   magic[8] | record_count | nonce | initial_pages | sector_size | page_size
//!          (big endian u32s, zero padded to sector_size)
//! record   page_no:u32 | page bytes | checksum:u32
//! trailer  0:u32 | master name | name_len:u32 | name_crc:u32 | magic[8]
//! ```
//!
//! A record count of zero means the count was never finalised; readers then
//! derive it from the file length and rely on the checksums.

use std::path::{Path, PathBuf};

use crate::primitives::io::{FileIo, FileSystem, FileType, OpenPermissions};
use crate::types::{journal_checksum, PageId, Result, SombraError};

/// Marks a live journal header and the end of a master trailer.
pub const JOURNAL_MAGIC: [u8; 8] = [0xd9, 0xd5, 0x05, 0xf9, 0x20, 0xa1, 0x63, 0xd7];
/// Encoded header length, before sector padding.
pub const JOURNAL_HEADER_LEN: usize = 28;
const TRAILER_TAIL_LEN: usize = 16;
const MAX_MASTER_NAME: usize = 4096;

/// Offset of the record-count field within the header.
pub const RECORD_COUNT_OFFSET: u64 = 8;

fn be_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Decoded journal header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JournalHeader {
    /// Records written, or 0 before phase one finalized it.
    pub record_count: u32,
    /// Seed of every record checksum in this journal.
    pub nonce: u32,
    /// Database size in pages when the transaction began.
    pub initial_pages: u32,
    /// Sector size the journal was padded to.
    pub sector_size: u32,
    /// Database page size.
    pub page_size: u32,
}

impl JournalHeader {
    /// Encodes the header with its magic.
    pub fn encode(&self) -> [u8; JOURNAL_HEADER_LEN] {
        let mut buf = [0u8; JOURNAL_HEADER_LEN];
        buf[0..8].copy_from_slice(&JOURNAL_MAGIC);
        buf[8..12].copy_from_slice(&self.record_count.to_be_bytes());
        buf[12..16].copy_from_slice(&self.nonce.to_be_bytes());
        buf[16..20].copy_from_slice(&self.initial_pages.to_be_bytes());
        buf[20..24].copy_from_slice(&self.sector_size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.page_size.to_be_bytes());
        buf
    }

    /// Decodes a header, failing on a short buffer or a bad magic.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < JOURNAL_HEADER_LEN {
            return Err(SombraError::Corruption("journal header truncated"));
        }
        if src[0..8] != JOURNAL_MAGIC {
            return Err(SombraError::Corruption("journal magic mismatch"));
        }
        let header = Self {
            record_count: be_u32(src, 8),
            nonce: be_u32(src, 12),
            initial_pages: be_u32(src, 16),
            sector_size: be_u32(src, 20),
            page_size: be_u32(src, 24),
        };
        if !valid_size(header.page_size) || !valid_size(header.sector_size) {
            return Err(SombraError::Corruption("journal header sizes invalid"));
        }
        Ok(header)
    }

    /// Reads the header at the start of `file`. Returns `None` for a file too
    /// short to hold one or whose header was zeroed.
    pub fn read_from(file: &dyn FileIo) -> Result<Option<Self>> {
        if file.len()? < JOURNAL_HEADER_LEN as u64 {
            return Ok(None);
        }
        let mut buf = [0u8; JOURNAL_HEADER_LEN];
        file.read_at(0, &mut buf)?;
        if buf[0..8] != JOURNAL_MAGIC {
            return Ok(None);
        }
        Self::decode(&buf).map(Some)
    }

    /// Bytes the header occupies on disk.
    pub fn padded_len(&self) -> u64 {
        u64::from(self.sector_size)
    }

    /// Number of records to replay from a journal of `journal_len` bytes.
    pub fn replay_count(&self, journal_len: u64) -> u32 {
        if self.record_count != 0 {
            return self.record_count;
        }
        let body = journal_len.saturating_sub(self.padded_len());
        (body / record_len(self.page_size as usize) as u64) as u32
    }
}

fn valid_size(size: u32) -> bool {
    (512..=65536).contains(&size) && size.is_power_of_two()
}

/// On-disk length of one rollback-journal record.
pub fn record_len(page_size: usize) -> usize {
    4 + page_size + 4
}

/// Appends a record for `page` to `out`.
pub fn encode_record(out: &mut Vec<u8>, page: PageId, data: &[u8], nonce: u32) {
    out.extend_from_slice(&page.0.to_be_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(&journal_checksum(nonce, page.0, data).to_be_bytes());
}

/// Decodes one record. Returns `None` when the checksum does not verify or
/// the page number is zero.
pub fn decode_record(src: &[u8], page_size: usize, nonce: u32) -> Option<(PageId, &[u8])> {
    if src.len() < record_len(page_size) {
        return None;
    }
    let page = PageId(be_u32(src, 0));
    if page.is_null() {
        return None;
    }
    let data = &src[4..4 + page_size];
    let stored = be_u32(src, 4 + page_size);
    (journal_checksum(nonce, page.0, data) == stored).then_some((page, data))
}

/// Encodes the trailer naming the master journal of a multi-file commit.
pub fn encode_master_trailer(name: &str) -> Vec<u8> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(4 + bytes.len() + TRAILER_TAIL_LEN);
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(bytes);
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&crc32fast::hash(bytes).to_be_bytes());
    out.extend_from_slice(&JOURNAL_MAGIC);
    out
}

/// Reads the master journal name from the end of a journal, if one was
/// written and verifies.
pub fn read_master_name(file: &dyn FileIo) -> Result<Option<String>> {
    let len = file.len()?;
    if len < (JOURNAL_HEADER_LEN + TRAILER_TAIL_LEN + 4) as u64 {
        return Ok(None);
    }
    let mut tail = [0u8; TRAILER_TAIL_LEN];
    file.read_at(len - TRAILER_TAIL_LEN as u64, &mut tail)?;
    if tail[8..16] != JOURNAL_MAGIC {
        return Ok(None);
    }
    let name_len = be_u32(&tail, 0) as usize;
    let name_crc = be_u32(&tail, 4);
    let needed = (4 + name_len + TRAILER_TAIL_LEN) as u64;
    if name_len == 0 || name_len > MAX_MASTER_NAME || needed > len {
        return Ok(None);
    }
    let mut buf = vec![0u8; 4 + name_len];
    file.read_at(len - needed, &mut buf)?;
    if be_u32(&buf, 0) != 0 {
        return Ok(None);
    }
    let name = &buf[4..];
    if crc32fast::hash(name) != name_crc {
        return Ok(None);
    }
    Ok(String::from_utf8(name.to_vec()).ok())
}

/// Creates a master journal listing the journals of every participant.
/// Names are NUL terminated.
pub fn write_master_journal(fs: &dyn FileSystem, path: &Path, children: &[PathBuf]) -> Result<()> {
    let file = fs.open(
        path,
        FileType::MasterJournal,
        OpenPermissions::create() | OpenPermissions::EXCLUSIVE,
    )?;
    let mut buf = Vec::new();
    for child in children {
        let name = child
            .to_str()
            .ok_or(SombraError::Invalid("journal path is not valid UTF-8"))?;
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
    }
    file.write_at(0, &buf)?;
    file.sync_all()?;
    tracing::debug!(
        master = %path.display(),
        children = children.len(),
        "pager.master_journal.write"
    );
    Ok(())
}

/// Lists the child journals named by a master journal.
pub fn read_master_journal(fs: &dyn FileSystem, path: &Path) -> Result<Vec<PathBuf>> {
    let file = fs.open(path, FileType::MasterJournal, OpenPermissions::READONLY)?;
    let len = file.len()? as usize;
    let mut buf = vec![0u8; len];
    file.read_at(0, &mut buf)?;
    Ok(buf
        .split(|&b| b == 0)
        .filter(|name| !name.is_empty())
        .filter_map(|name| std::str::from_utf8(name).ok())
        .map(PathBuf::from)
        .collect())
}
