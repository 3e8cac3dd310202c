#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use sombra_rollback::primitives::io::{FileType, MemFileSystem, OpenPermissions};
use sombra_rollback::{
    JournalMode, PageFlags, PageId, Pager, PagerOptions, Result, SombraError, MEMORY_DB_PATH,
};

fn open(fs: &MemFileSystem, path: &str, options: PagerOptions) -> Result<Pager> {
    Pager::open_with_options(
        Arc::new(fs.clone()),
        Some(Path::new(path)),
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

fn seed(pager: &mut Pager, pages: u32) -> Result<()> {
    for page in 1..=pages {
        fill(pager, page, page as u8)?;
    }
    pager.commit()
}

/// Writes before the statement survive its rollback; writes inside it,
/// including growth, do not.
fn scoped_rollback(pager: &mut Pager) -> Result<()> {
    seed(pager, 4)?;

    fill(pager, 1, 0xa1)?;
    fill(pager, 2, 0xa2)?;
    pager.start_statement()?;
    fill(pager, 2, 0xb2)?;
    fill(pager, 3, 0xb3)?;
    fill(pager, 7, 0xb7)?;
    assert_eq!(pager.page_count()?, 7);
    pager.statement_rollback()?;

    assert_eq!(pager.page_count()?, 4);
    assert_eq!(first_byte(pager, 1)?, 0xa1);
    assert_eq!(first_byte(pager, 2)?, 0xa2);
    assert_eq!(first_byte(pager, 3)?, 3);
    assert!(pager.in_transaction());

    pager.commit()?;
    assert_eq!(first_byte(pager, 1)?, 0xa1);
    assert_eq!(first_byte(pager, 2)?, 0xa2);
    assert_eq!(first_byte(pager, 3)?, 3);
    assert_eq!(pager.page_count()?, 4);
    Ok(())
}

#[test]
fn statement_rollback_is_scoped() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = open(&fs, "stmt.db", PagerOptions::default())?;
    scoped_rollback(&mut pager)?;
    assert_eq!(pager.stats().statement_records, 1);
    Ok(())
}

#[test]
fn statement_rollback_with_memory_journal() -> Result<()> {
    let fs = MemFileSystem::new();
    let options = PagerOptions {
        journal_mode: JournalMode::Memory,
        ..PagerOptions::default()
    };
    let mut pager = open(&fs, "stmt-mem.db", options)?;
    scoped_rollback(&mut pager)?;
    assert_eq!(fs.paths().len(), 1);
    Ok(())
}

#[test]
fn statement_rollback_in_memory_database() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = open(&fs, MEMORY_DB_PATH, PagerOptions::default())?;
    assert!(pager.is_memory());
    scoped_rollback(&mut pager)
}

/// A truncate inside a statement drops a page dirtied before it; the
/// statement rollback brings back that transaction-level content.
fn truncate_inside_statement(pager: &mut Pager) -> Result<()> {
    seed(pager, 4)?;

    fill(pager, 4, 0x44)?;
    pager.start_statement()?;
    pager.truncate_image(2)?;
    assert_eq!(pager.page_count()?, 2);
    pager.statement_rollback()?;

    assert_eq!(pager.page_count()?, 4);
    assert_eq!(first_byte(pager, 3)?, 3);
    assert_eq!(first_byte(pager, 4)?, 0x44);
    pager.commit()?;
    assert_eq!(first_byte(pager, 4)?, 0x44);
    Ok(())
}

#[test]
fn truncate_inside_statement_rolls_back() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = open(&fs, "stmt-truncate.db", PagerOptions::default())?;
    truncate_inside_statement(&mut pager)
}

#[test]
fn truncate_inside_statement_in_memory_database() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = open(&fs, MEMORY_DB_PATH, PagerOptions::default())?;
    truncate_inside_statement(&mut pager)
}

#[test]
fn statement_commit_keeps_changes_for_transaction_rollback() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = open(&fs, "stmt-commit.db", PagerOptions::default())?;
    seed(&mut pager, 3)?;

    fill(&mut pager, 1, 0x11)?;
    pager.start_statement()?;
    fill(&mut pager, 2, 0x22)?;
    let handle = pager.get_page(PageId(2))?;
    assert!(pager
        .page_flags(&handle)
        .contains(PageFlags::IN_STATEMENT_JOURNAL));
    pager.release(handle)?;
    pager.statement_commit()?;

    let handle = pager.get_page(PageId(2))?;
    assert!(!pager
        .page_flags(&handle)
        .contains(PageFlags::IN_STATEMENT_JOURNAL));
    pager.release(handle)?;
    assert_eq!(first_byte(&mut pager, 2)?, 0x22);

    pager.rollback()?;
    assert_eq!(first_byte(&mut pager, 1)?, 1);
    assert_eq!(first_byte(&mut pager, 2)?, 2);
    Ok(())
}

#[test]
fn second_statement_after_rollback() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = open(&fs, "stmt-twice.db", PagerOptions::default())?;
    seed(&mut pager, 2)?;

    pager.begin(false)?;
    pager.start_statement()?;
    fill(&mut pager, 1, 0x31)?;
    pager.statement_rollback()?;
    pager.start_statement()?;
    fill(&mut pager, 2, 0x32)?;
    pager.statement_commit()?;
    pager.commit()?;

    assert_eq!(first_byte(&mut pager, 1)?, 1);
    assert_eq!(first_byte(&mut pager, 2)?, 0x32);
    Ok(())
}

#[test]
fn statement_requires_transaction() -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = open(&fs, "stmt-misuse.db", PagerOptions::default())?;
    assert!(matches!(
        pager.start_statement(),
        Err(SombraError::Misuse(_))
    ));
    pager.begin(false)?;
    pager.start_statement()?;
    assert!(matches!(
        pager.start_statement(),
        Err(SombraError::Misuse(_))
    ));
    pager.statement_rollback()?;
    pager.statement_rollback()?;
    pager.rollback()
}
