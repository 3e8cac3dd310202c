#![forbid(unsafe_code)]

/// Incremental 32-bit checksum.
pub trait Checksum {
    /// Returns to the initial state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Checksum of everything fed so far.
    fn finalize(&self) -> u32;
}

/// CRC-32 accumulator, optionally seeded.
pub struct Crc32Fast {
    seed: u32,
    inner: crc32fast::Hasher,
}

impl Crc32Fast {
    /// Starts a checksum whose initial state is `seed`.
    pub fn seeded(seed: u32) -> Self {
        Self {
            seed,
            inner: crc32fast::Hasher::new_with_initial(seed),
        }
    }
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self::seeded(0)
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner = crc32fast::Hasher::new_with_initial(self.seed);
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum stored after each rollback-journal record.
///
/// Seeded with the per-journal nonce so a record left over from an earlier
/// journal at the same offset never verifies against the current header.
pub fn journal_checksum(nonce: u32, page_no: u32, data: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::seeded(nonce);
    hasher.update(&page_no.to_be_bytes());
    hasher.update(data);
    hasher.finalize()
}

/// Content hash cached on a page to catch stale writes.
pub fn page_hash(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
