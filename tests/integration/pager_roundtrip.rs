#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use sombra_rollback::primitives::io::{FileSystem, FileType, OpenPermissions, StdFileSystem};
use sombra_rollback::{PageId, Pager, PagerOptions, PagerState, Result, Synchronous};
use tempfile::tempdir;

fn open(path: &Path) -> Result<Pager> {
    let fs: Arc<dyn FileSystem> = Arc::new(StdFileSystem);
    Pager::open(fs, Some(path), None, FileType::MainDb, OpenPermissions::create())
}

fn fill(pager: &mut Pager, page: u32, byte: u8) -> Result<()> {
    let handle = pager.get_page(PageId(page))?;
    pager.write(&handle)?;
    pager.page_data_mut(&handle)?.fill(byte);
    pager.release(handle)
}

fn assert_filled(pager: &mut Pager, page: u32, byte: u8) -> Result<()> {
    let handle = pager.get_page(PageId(page))?;
    assert!(
        pager.page_data(&handle).iter().all(|&b| b == byte),
        "page {page} should be filled with {byte:#04x}"
    );
    pager.release(handle)
}

#[test]
fn commit_reopen_then_rollback() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("roundtrip.db");

    {
        let mut pager = open(&db_path)?;
        assert_eq!(pager.page_size(), 1024);
        let two = pager.get_page(PageId(2))?;
        let three = pager.get_page(PageId(3))?;
        pager.begin(false)?;
        pager.write(&two)?;
        pager.page_data_mut(&two)?.fill(0x01);
        pager.write(&three)?;
        pager.page_data_mut(&three)?.fill(0x02);
        pager.release(two)?;
        pager.release(three)?;
        pager.commit()?;
        pager.close()?;
    }
    assert!(!db_path.with_file_name("roundtrip.db-journal").exists());
    assert_eq!(std::fs::metadata(&db_path)?.len(), 3 * 1024);

    let mut pager = open(&db_path)?;
    assert_filled(&mut pager, 2, 0x01)?;
    assert_filled(&mut pager, 3, 0x02)?;

    pager.begin(false)?;
    fill(&mut pager, 2, 0x02)?;
    fill(&mut pager, 3, 0x01)?;
    pager.rollback()?;

    assert_filled(&mut pager, 2, 0x01)?;
    assert_filled(&mut pager, 3, 0x02)?;
    assert_eq!(pager.page_count()?, 3);
    Ok(())
}

#[test]
fn many_transactions_accumulate() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("many.db");
    let options = PagerOptions {
        synchronous: Synchronous::Normal,
        page_size: 4096,
        ..PagerOptions::default()
    };
    {
        let fs: Arc<dyn FileSystem> = Arc::new(StdFileSystem);
        let mut pager = Pager::open_with_options(
            fs,
            Some(&db_path),
            None,
            FileType::MainDb,
            OpenPermissions::create(),
            options.clone(),
        )?;
        for round in 1..=10u32 {
            fill(&mut pager, round, round as u8)?;
            fill(&mut pager, 1, round as u8)?;
            pager.commit()?;
            assert_eq!(pager.state(), PagerState::Unlocked);
        }
    }

    let fs: Arc<dyn FileSystem> = Arc::new(StdFileSystem);
    let mut pager = Pager::open_with_options(
        fs,
        Some(&db_path),
        None,
        FileType::MainDb,
        OpenPermissions::create(),
        options,
    )?;
    assert_eq!(pager.page_count()?, 10);
    assert_filled(&mut pager, 1, 10)?;
    for page in 2..=10u32 {
        assert_filled(&mut pager, page, page as u8)?;
    }
    Ok(())
}

#[test]
fn small_cache_evicts_clean_pages() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("small-cache.db");
    let fs: Arc<dyn FileSystem> = Arc::new(StdFileSystem);
    let mut pager = Pager::open_with_options(
        fs,
        Some(&db_path),
        None,
        FileType::MainDb,
        OpenPermissions::create(),
        PagerOptions {
            cache_pages: 4,
            ..PagerOptions::default()
        },
    )?;
    for page in 1..=32u32 {
        fill(&mut pager, page, page as u8)?;
    }
    assert!(pager.cached_pages() >= 32);
    pager.commit()?;
    assert_eq!(pager.cached_pages(), 0);

    // Holding page 1 keeps the shared lock and the cache between reads.
    let pin = pager.get_page(PageId(1))?;
    for page in 2..=32u32 {
        assert_filled(&mut pager, page, page as u8)?;
    }
    assert!(pager.stats().evictions > 0);
    assert!(pager.cached_pages() <= 4);
    assert!(pager.page_data(&pin).iter().all(|&b| b == 1));
    pager.release(pin)?;
    Ok(())
}
