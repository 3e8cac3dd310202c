#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use sombra_rollback::primitives::io::{FileType, MemFileSystem, OpenPermissions};
use sombra_rollback::{
    JournalMode, PageFlags, PageId, Pager, PagerOptions, PagerState, Result, SombraError,
};

const DB: &str = "rollback.db";

fn open(fs: &MemFileSystem, options: PagerOptions) -> Result<Pager> {
    Pager::open_with_options(
        Arc::new(fs.clone()),
        Some(Path::new(DB)),
        None,
        FileType::MainDb,
        OpenPermissions::create(),
        options,
    )
}

fn fill(pager: &mut Pager, page: u32, byte: u8) -> Result<()> {
    let handle = pager.get_page(PageId(page))?;
    pager.write(&handle)?;
    pager.page_data_mut(&handle)?.fill(byte);
    pager.release(handle)
}

fn first_byte(pager: &mut Pager, page: u32) -> Result<u8> {
    let handle = pager.get_page(PageId(page))?;
    let byte = pager.page_data(&handle)[0];
    pager.release(handle)?;
    Ok(byte)
}

fn seeded(fs: &MemFileSystem, options: PagerOptions, pages: u32) -> Result<Pager> {
    let mut pager = open(fs, options)?;
    for page in 1..=pages {
        fill(&mut pager, page, page as u8)?;
    }
    pager.commit()?;
    Ok(pager)
}

#[test]
fn rollback_discards_growth_and_changes() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = seeded(&fs, PagerOptions::default(), 4)?;
    let before = fs.contents(Path::new(DB));

    fill(&mut pager, 1, 0xf1)?;
    fill(&mut pager, 4, 0xf4)?;
    fill(&mut pager, 9, 0xf9)?;
    assert_eq!(pager.page_count()?, 9);
    pager.rollback()?;

    assert_eq!(pager.page_count()?, 4);
    for page in 1..=4 {
        assert_eq!(first_byte(&mut pager, page)?, page as u8);
    }
    assert_eq!(fs.contents(Path::new(DB)), before);
    assert!(fs.contents(Path::new("rollback.db-journal")).is_none());
    assert_eq!(pager.state(), PagerState::Unlocked);
    Ok(())
}

#[test]
fn referenced_pages_see_restored_content() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = seeded(&fs, PagerOptions::default(), 2)?;
    let held = pager.get_page(PageId(2))?;
    pager.write(&held)?;
    pager.page_data_mut(&held)?.fill(0xee);
    let grown = pager.get_page(PageId(3))?;
    pager.write(&grown)?;
    pager.page_data_mut(&grown)?.fill(0xdd);

    pager.rollback()?;
    assert!(pager.page_data(&held).iter().all(|&b| b == 2));
    assert!(!pager.page_flags(&held).contains(PageFlags::DIRTY));
    assert!(pager.page_data(&grown).iter().all(|&b| b == 0));
    pager.release(grown)?;
    pager.release(held)?;
    Ok(())
}

#[test]
fn dont_write_skips_page_at_commit() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = seeded(&fs, PagerOptions::default(), 3)?;
    let free = pager.get_page(PageId(2))?;
    pager.write(&free)?;
    pager.page_data_mut(&free)?.fill(0x77);
    pager.dont_write(&free)?;
    assert!(pager.page_flags(&free).contains(PageFlags::DONT_WRITE));
    pager.release(free)?;
    fill(&mut pager, 3, 0x33)?;
    pager.commit()?;

    let image = fs.contents(Path::new(DB)).expect("database");
    assert_eq!(image[1024], 2);
    assert_eq!(image[2048], 0x33);
    Ok(())
}

#[test]
fn dont_rollback_keeps_new_content() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = seeded(&fs, PagerOptions::default(), 3)?;
    fill(&mut pager, 1, 0x10)?;
    let page = pager.get_page(PageId(3))?;
    pager.dont_rollback(&page);
    assert!(pager.page_flags(&page).contains(PageFlags::IN_JOURNAL));
    pager.write(&page)?;
    pager.page_data_mut(&page)?.fill(0x30);
    pager.release(page)?;
    assert_eq!(pager.stats().journal_records, 1);
    pager.commit()?;
    assert_eq!(first_byte(&mut pager, 3)?, 0x30);
    Ok(())
}

#[test]
fn truncate_image_shrinks_file_and_rolls_back() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = seeded(&fs, PagerOptions::default(), 6)?;

    pager.begin(false)?;
    pager.truncate_image(2)?;
    assert_eq!(pager.page_count()?, 2);
    assert!(matches!(
        pager.truncate_image(3),
        Err(SombraError::Invalid(_))
    ));
    pager.rollback()?;
    assert_eq!(pager.page_count()?, 6);
    assert_eq!(first_byte(&mut pager, 6)?, 6);

    pager.begin(false)?;
    pager.truncate_image(2)?;
    pager.commit()?;
    assert_eq!(fs.contents(Path::new(DB)).map(|d| d.len()), Some(2048));
    assert_eq!(pager.page_count()?, 2);
    Ok(())
}

#[test]
fn rewrite_after_truncate_rolls_back_to_committed_image() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = seeded(&fs, PagerOptions::default(), 5)?;

    pager.begin(false)?;
    pager.truncate_image(2)?;
    let page = pager.get_page(PageId(3))?;
    assert!(pager.page_data(&page).iter().all(|&b| b == 0));
    pager.write(&page)?;
    pager.page_data_mut(&page)?.fill(0xee);
    assert_eq!(pager.page_count()?, 3);
    pager.rollback()?;

    // The held frame is restored from the journal, not reloaded.
    assert!(pager.page_data(&page).iter().all(|&b| b == 3));
    pager.release(page)?;
    assert_eq!(pager.page_count()?, 5);
    for number in 1..=5 {
        assert_eq!(first_byte(&mut pager, number)?, number as u8);
    }

    pager.begin(false)?;
    pager.truncate_image(2)?;
    fill(&mut pager, 3, 0xee)?;
    pager.commit()?;
    let image = fs.contents(Path::new(DB)).expect("database file");
    assert_eq!(image.len(), 3072);
    assert!(image[2048..].iter().all(|&b| b == 0xee));
    Ok(())
}

#[test]
fn growth_after_truncate_leaves_cut_pages_zeroed() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = seeded(&fs, PagerOptions::default(), 5)?;

    pager.begin(false)?;
    pager.truncate_image(2)?;
    fill(&mut pager, 6, 0x66)?;
    assert_eq!(pager.page_count()?, 6);
    assert_eq!(first_byte(&mut pager, 2)?, 2);
    assert_eq!(first_byte(&mut pager, 4)?, 0);
    pager.commit()?;

    let image = fs.contents(Path::new(DB)).expect("database file");
    assert_eq!(image.len(), 6 * 1024);
    assert!(image[2048..5 * 1024].iter().all(|&b| b == 0));
    assert!(image[5 * 1024..].iter().all(|&b| b == 0x66));
    assert_eq!(first_byte(&mut pager, 4)?, 0);
    Ok(())
}

#[test]
fn writes_after_phase_one_are_refused() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = seeded(&fs, PagerOptions::default(), 3)?;

    fill(&mut pager, 1, 0x11)?;
    pager.commit_phase_one(Some("rollback.mj"), false)?;
    assert_eq!(pager.state(), PagerState::Synced);

    let page = pager.get_page(PageId(2))?;
    assert!(matches!(pager.write(&page), Err(SombraError::Misuse(_))));
    pager.release(page)?;
    assert!(matches!(
        pager.truncate_image(1),
        Err(SombraError::Misuse(_))
    ));
    assert_eq!(pager.error(), None);

    pager.commit_phase_two()?;
    assert!(fs.contents(Path::new("rollback.db-journal")).is_none());
    assert_eq!(first_byte(&mut pager, 1)?, 0x11);
    assert_eq!(first_byte(&mut pager, 2)?, 2);
    assert_eq!(pager.page_count()?, 3);
    Ok(())
}

#[test]
fn move_page_rekeys_content() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = seeded(&fs, PagerOptions::default(), 3)?;
    let page = pager.get_page(PageId(3))?;
    pager.write(&page)?;
    pager.page_data_mut(&page)?.fill(0x99);
    pager.move_page(&page, PageId(5), false)?;
    assert_eq!(pager.page_number(&page), PageId(5));
    pager.release(page)?;
    assert_eq!(pager.page_count()?, 5);
    pager.commit()?;

    let image = fs.contents(Path::new(DB)).expect("database");
    assert_eq!(image.len(), 5 * 1024);
    assert_eq!(image[4 * 1024], 0x99);
    assert_eq!(image[2 * 1024], 3);
    Ok(())
}

#[test]
fn journal_mode_off_rolls_back_cache_only() -> Result<()> {
    let fs = MemFileSystem::new();
    let options = PagerOptions {
        journal_mode: JournalMode::Off,
        ..PagerOptions::default()
    };
    let mut pager = seeded(&fs, options, 2)?;
    fill(&mut pager, 2, 0x55)?;
    assert!(fs.contents(Path::new("rollback.db-journal")).is_none());
    pager.rollback()?;
    assert_eq!(first_byte(&mut pager, 2)?, 2);
    Ok(())
}

#[test]
fn memory_journal_mode_leaves_no_file() -> Result<()> {
    let fs = MemFileSystem::new();
    let options = PagerOptions {
        journal_mode: JournalMode::Memory,
        ..PagerOptions::default()
    };
    let mut pager = seeded(&fs, options, 2)?;
    fill(&mut pager, 1, 0x44)?;
    assert_eq!(fs.paths().len(), 1);
    pager.rollback()?;
    assert_eq!(first_byte(&mut pager, 1)?, 1);
    Ok(())
}

#[test]
fn journal_mode_cannot_change_inside_transaction() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = seeded(&fs, PagerOptions::default(), 1)?;
    fill(&mut pager, 1, 9)?;
    assert!(matches!(
        pager.set_journal_mode(JournalMode::Persist),
        Err(SombraError::Misuse(_))
    ));
    pager.commit()?;
    pager.set_journal_mode(JournalMode::Persist)?;
    fill(&mut pager, 1, 10)?;
    pager.commit()?;
    assert!(fs.contents(Path::new("rollback.db-journal")).is_some());
    Ok(())
}
