#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use sombra_rollback::primitives::io::{FileType, MemFileSystem, OpenPermissions};
use sombra_rollback::testkit::{Fault, FaultTarget, FaultyFileSystem};
use sombra_rollback::{ErrorCode, PageId, Pager, Result, SombraError};

const DB: &str = "faulty.db";

fn setup(pages: u32) -> Result<(MemFileSystem, FaultyFileSystem, Pager)> {
    let mem = MemFileSystem::new();
    let faulty = FaultyFileSystem::new(Arc::new(mem.clone()));
    let mut pager = Pager::open(
        Arc::new(faulty.clone()),
        Some(Path::new(DB)),
        None,
        FileType::MainDb,
        OpenPermissions::create(),
    )?;
    for page in 1..=pages {
        fill(&mut pager, page, page as u8)?;
    }
    pager.commit()?;
    Ok((mem, faulty, pager))
}

fn fill(pager: &mut Pager, page: u32, byte: u8) -> Result<()> {
    let handle = pager.get_page(PageId(page))?;
    let result = pager
        .write(&handle)
        .and_then(|()| pager.page_data_mut(&handle).map(|data| data.fill(byte)));
    pager.release(handle)?;
    result
}

fn first_byte(pager: &mut Pager, page: u32) -> Result<u8> {
    let handle = pager.get_page(PageId(page))?;
    let byte = pager.page_data(&handle)[0];
    pager.release(handle)?;
    Ok(byte)
}

#[test]
fn full_disk_rolls_back_and_sticks() -> Result<()> {
    let (mem, faulty, mut pager) = setup(3)?;
    let before = mem.contents(Path::new(DB));

    // Header and first record succeed, the second record hits a full disk.
    faulty.fail_write(FaultTarget::Journal, 2, Fault::Full, false);
    fill(&mut pager, 1, 0xf1)?;
    fill(&mut pager, 4, 0xf4)?;
    assert!(matches!(fill(&mut pager, 2, 0xf2), Err(SombraError::Full)));

    assert!(!pager.in_transaction());
    assert_eq!(pager.error(), Some(ErrorCode::Full));
    assert_eq!(mem.contents(Path::new(DB)), before);
    assert_eq!(pager.page_count()?, 3);
    assert_eq!(first_byte(&mut pager, 1)?, 1);
    assert_eq!(first_byte(&mut pager, 2)?, 2);

    assert!(matches!(fill(&mut pager, 3, 0xf3), Err(SombraError::Full)));
    assert!(matches!(pager.begin(false), Err(SombraError::Full)));

    pager.rollback()?;
    assert_eq!(pager.error(), None);
    fill(&mut pager, 3, 0x33)?;
    pager.commit()?;
    assert_eq!(first_byte(&mut pager, 3)?, 0x33);
    Ok(())
}

#[test]
fn full_disk_on_journal_header() -> Result<()> {
    let (mem, faulty, mut pager) = setup(2)?;
    faulty.fail_write(FaultTarget::Journal, 0, Fault::Full, false);
    assert!(matches!(fill(&mut pager, 1, 9), Err(SombraError::Full)));
    assert!(mem.contents(Path::new("faulty.db-journal")).is_none());
    assert_eq!(first_byte(&mut pager, 1)?, 1);
    pager.rollback()?;
    fill(&mut pager, 1, 9)?;
    pager.commit()?;
    assert_eq!(first_byte(&mut pager, 1)?, 9);
    Ok(())
}

#[test]
fn cached_pages_stay_visible_after_disk_full() -> Result<()> {
    let (_mem, faulty, mut pager) = setup(2)?;
    let held = pager.get_page(PageId(1))?;
    faulty.fail_write(FaultTarget::Journal, 0, Fault::Full, false);
    assert!(matches!(fill(&mut pager, 2, 9), Err(SombraError::Full)));
    assert_eq!(pager.error(), Some(ErrorCode::Full));

    let again = pager.lookup(PageId(1)).expect("page 1 is still cached");
    assert_eq!(pager.page_data(&again)[0], 1);
    assert_eq!(pager.page_ref_count(&again), 2);
    pager.release(again)?;
    pager.release(held)?;
    assert!(pager.lookup(PageId(1)).is_none());
    Ok(())
}

#[test]
fn io_error_in_phase_two_is_sticky_until_rollback() -> Result<()> {
    let (mem, faulty, mut pager) = setup(3)?;
    let before = mem.contents(Path::new(DB));
    for page in 1..=3 {
        fill(&mut pager, page, 0xee)?;
    }
    faulty.fail_write(FaultTarget::Database, 1, Fault::Io, false);
    assert!(matches!(pager.commit(), Err(SombraError::Io(_))));
    assert_eq!(pager.error(), Some(ErrorCode::IoErr));
    assert!(pager.in_transaction());
    assert_ne!(mem.contents(Path::new(DB)), before);

    assert!(matches!(pager.get_page(PageId(1)), Err(SombraError::Io(_))));
    assert!(matches!(pager.commit(), Err(SombraError::Io(_))));

    pager.rollback()?;
    assert_eq!(pager.error(), None);
    assert_eq!(mem.contents(Path::new(DB)), before);
    for page in 1..=3 {
        assert_eq!(first_byte(&mut pager, page)?, page as u8);
    }
    Ok(())
}

#[test]
fn failed_journal_sync_leaves_database_untouched() -> Result<()> {
    let (mem, faulty, mut pager) = setup(2)?;
    let before = mem.contents(Path::new(DB));
    fill(&mut pager, 2, 0x22)?;
    faulty.fail_syncs(Fault::Io);
    assert!(pager.commit().is_err());
    assert_eq!(mem.contents(Path::new(DB)), before);

    faulty.clear();
    pager.rollback()?;
    assert_eq!(first_byte(&mut pager, 2)?, 2);
    Ok(())
}

#[test]
fn partial_trailing_page_is_not_counted() -> Result<()> {
    let (mem, _faulty, mut pager) = setup(1)?;
    mem.set_contents(Path::new(DB), vec![1u8; 1500]);
    assert_eq!(pager.page_count()?, 1);
    let handle = pager.get_page(PageId(2))?;
    assert!(pager.page_data(&handle).iter().all(|&b| b == 0));
    pager.release(handle)?;
    assert_eq!(first_byte(&mut pager, 1)?, 1);
    Ok(())
}
