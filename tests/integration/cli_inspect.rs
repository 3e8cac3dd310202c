#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use sombra_rollback::primitives::io::{FileSystem, FileType, OpenPermissions, StdFileSystem};
use sombra_rollback::{PageId, Pager, Result};
use tempfile::TempDir;

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

fn setup_db(name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.db"));
    let mut pager = open(&path).expect("open pager");
    for page in 1..=3 {
        fill(&mut pager, page, 0xa0 + page as u8).expect("fill");
    }
    pager.commit().expect("commit");
    (dir, path)
}

fn json_output(args: &[&str], db_path: &Path) -> Value {
    let output = cargo_bin_cmd!("journal-inspect")
        .arg(db_path)
        .arg("--json")
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

#[test]
fn info_reports_page_count() {
    let (_dir, db_path) = setup_db("info");
    let value = json_output(&["info"], &db_path);
    assert_eq!(value["page_count"], 3);
    assert_eq!(value["file_size"], 3 * 1024);
    assert!(value["journal"].is_null());
}

#[test]
fn header_dumps_first_bytes() {
    let (_dir, db_path) = setup_db("header");
    let value = json_output(&["header", "--bytes", "32"], &db_path);
    assert_eq!(value["bytes"], 32);
    let rows = value["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["hex"], "a1".repeat(16));
}

#[test]
fn journal_lists_verified_records() -> Result<()> {
    let (_dir, db_path) = setup_db("journal");
    let mut pager = open(&db_path)?;
    fill(&mut pager, 2, 0x02)?;
    fill(&mut pager, 3, 0x03)?;
    pager.commit_phase_one(None, false)?;

    let value = json_output(&["journal"], &db_path);
    assert_eq!(value["header"]["record_count"], 2);
    assert_eq!(value["header"]["initial_pages"], 3);
    assert_eq!(value["header"]["page_size"], 1024);
    let records = value["records"].as_array().expect("records");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["page"], 2);
    assert_eq!(records[1]["page"], 3);
    assert!(records.iter().all(|r| r["checksum_ok"] == true));

    pager.rollback()?;
    Ok(())
}

#[test]
fn text_output_and_missing_journal() {
    let (_dir, db_path) = setup_db("text");
    let output = cargo_bin_cmd!("journal-inspect")
        .arg(&db_path)
        .arg("info")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("DATABASE INFO"));
    assert!(text.contains("Page Count"));
    cargo_bin_cmd!("journal-inspect")
        .arg(&db_path)
        .arg("journal")
        .assert()
        .failure();
}
