#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sombra_rollback::primitives::io::{FileType, MemFileSystem, OpenPermissions};
use sombra_rollback::{PageId, Pager, PagerOptions, Result};

const DB: &str = "prop.db";
const MAX_PAGE: u32 = 12;
const PAGE_SIZE: u32 = 512;

#[derive(Debug, Clone)]
enum Op {
    Write { page: u32, byte: u8 },
    Truncate { pages: u32 },
    Commit,
    Rollback,
    StartStatement,
    StatementCommit,
    StatementRollback,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (1..=MAX_PAGE, any::<u8>()).prop_map(|(page, byte)| Op::Write { page, byte }),
        1 => (0..=MAX_PAGE).prop_map(|pages| Op::Truncate { pages }),
        2 => Just(Op::Commit),
        1 => Just(Op::Rollback),
        1 => Just(Op::StartStatement),
        1 => Just(Op::StatementCommit),
        1 => Just(Op::StatementRollback),
    ]
}

fn arb_txn_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1..=MAX_PAGE, any::<u8>()).prop_map(|(page, byte)| Op::Write { page, byte }),
        1 => (0..=MAX_PAGE).prop_map(|pages| Op::Truncate { pages }),
    ]
}

/// Page image the pager is expected to expose: fill byte per page.
#[derive(Clone, Debug, Default, PartialEq)]
struct Image {
    pages: Vec<u8>,
}

impl Image {
    fn write(&mut self, page: u32, byte: u8) {
        let idx = page as usize - 1;
        if self.pages.len() <= idx {
            self.pages.resize(idx + 1, 0);
        }
        self.pages[idx] = byte;
    }

    fn truncate(&mut self, pages: u32) {
        self.pages.truncate(pages as usize);
    }

    fn get(&self, page: u32) -> u8 {
        self.pages.get(page as usize - 1).copied().unwrap_or(0)
    }
}

/// Reference model of transaction and statement semantics.
#[derive(Default)]
struct Model {
    committed: Image,
    current: Option<Image>,
    statement: Option<Image>,
}

impl Model {
    fn apply(&mut self, op: &Op) {
        match op {
            Op::Write { page, byte } => {
                self.current
                    .get_or_insert_with(|| self.committed.clone())
                    .write(*page, *byte);
            }
            Op::Truncate { pages } => {
                self.current
                    .get_or_insert_with(|| self.committed.clone())
                    .truncate(*pages);
            }
            Op::Commit => {
                if let Some(image) = self.current.take() {
                    self.committed = image;
                }
                self.statement = None;
            }
            Op::Rollback => {
                self.current = None;
                self.statement = None;
            }
            Op::StartStatement => {
                if let Some(image) = &self.current {
                    if self.statement.is_none() {
                        self.statement = Some(image.clone());
                    }
                }
            }
            Op::StatementCommit => self.statement = None,
            Op::StatementRollback => {
                if let Some(snapshot) = self.statement.take() {
                    self.current = Some(snapshot);
                }
            }
        }
    }

    fn visible(&self) -> &Image {
        self.current.as_ref().unwrap_or(&self.committed)
    }
}

fn open(fs: &MemFileSystem, options: &PagerOptions) -> Result<Pager> {
    Pager::open_with_options(
        Arc::new(fs.clone()),
        Some(Path::new(DB)),
        None,
        FileType::MainDb,
        OpenPermissions::create(),
        options.clone(),
    )
}

fn apply(pager: &mut Pager, op: &Op) -> Result<()> {
    match op {
        Op::Write { page, byte } => {
            let handle = pager.get_page(PageId(*page))?;
            pager.write(&handle)?;
            pager.page_data_mut(&handle)?.fill(*byte);
            pager.release(handle)
        }
        Op::Truncate { pages } => {
            if !pager.in_transaction() {
                pager.begin(false)?;
            }
            let pages = (*pages).min(pager.page_count()?);
            pager.truncate_image(pages)
        }
        Op::Commit => {
            if pager.in_transaction() {
                pager.commit()
            } else {
                Ok(())
            }
        }
        Op::Rollback => pager.rollback(),
        Op::StartStatement => {
            if pager.in_transaction() {
                match pager.start_statement() {
                    Err(sombra_rollback::SombraError::Misuse(_)) => Ok(()),
                    other => other,
                }
            } else {
                Ok(())
            }
        }
        Op::StatementCommit => pager.statement_commit(),
        Op::StatementRollback => pager.statement_rollback(),
    }
}

fn check(pager: &mut Pager, expected: &Image) -> Result<()> {
    assert_eq!(pager.page_count()? as usize, expected.pages.len());
    for page in 1..=MAX_PAGE {
        let handle = pager.get_page(PageId(page))?;
        let want = expected.get(page);
        let ok = pager.page_data(&handle).iter().all(|&b| b == want);
        pager.release(handle)?;
        assert!(ok, "page {page} should hold {want:#04x}");
    }
    Ok(())
}

fn run(ops: &[Op], options: PagerOptions) -> Result<()> {
    let fs = MemFileSystem::new();
    let mut pager = open(&fs, &options)?;
    let mut model = Model::default();
    for op in ops {
        apply(&mut pager, op)?;
        model.apply(op);
    }
    if pager.in_transaction() {
        let expected = model.visible().clone();
        check(&mut pager, &expected)?;
    }
    apply(&mut pager, &Op::Commit)?;
    model.apply(&Op::Commit);
    pager.close()?;

    let mut reopened = open(&fs, &options)?;
    check(&mut reopened, &model.committed)
}

fn options() -> PagerOptions {
    PagerOptions {
        page_size: PAGE_SIZE,
        ..PagerOptions::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_committed_writes_survive_reopen(
        writes in prop::collection::vec((1..=MAX_PAGE, any::<u8>()), 1..40)
    ) {
        let ops: Vec<Op> = writes
            .into_iter()
            .map(|(page, byte)| Op::Write { page, byte })
            .collect();
        run(&ops, options()).unwrap();
    }

    #[test]
    fn prop_rollback_restores_start_state(
        seed in prop::collection::vec((1..=MAX_PAGE, any::<u8>()), 1..12),
        txn in prop::collection::vec((1..=MAX_PAGE, any::<u8>()), 1..24),
    ) {
        let fs = MemFileSystem::new();
        let mut pager = open(&fs, &options()).unwrap();
        let mut image = Image::default();
        for (page, byte) in seed {
            apply(&mut pager, &Op::Write { page, byte }).unwrap();
            image.write(page, byte);
        }
        pager.commit().unwrap();
        for (page, byte) in txn {
            apply(&mut pager, &Op::Write { page, byte }).unwrap();
        }
        pager.rollback().unwrap();
        check(&mut pager, &image).unwrap();
        prop_assert!(fs.contents(Path::new("prop.db-journal")).is_none());
    }

    #[test]
    fn prop_rollback_after_truncate_restores_start_state(
        seed in prop::collection::vec((1..=MAX_PAGE, any::<u8>()), 1..12),
        txn in prop::collection::vec(arb_txn_op(), 1..24),
    ) {
        let fs = MemFileSystem::new();
        let mut pager = open(&fs, &options()).unwrap();
        let mut model = Model::default();
        for (page, byte) in seed {
            let op = Op::Write { page, byte };
            apply(&mut pager, &op).unwrap();
            model.apply(&op);
        }
        apply(&mut pager, &Op::Commit).unwrap();
        model.apply(&Op::Commit);
        for op in &txn {
            apply(&mut pager, op).unwrap();
            model.apply(op);
        }
        let expected = model.visible().clone();
        check(&mut pager, &expected).unwrap();
        pager.rollback().unwrap();
        model.apply(&Op::Rollback);
        check(&mut pager, &model.committed).unwrap();
        prop_assert!(fs.contents(Path::new("prop.db-journal")).is_none());
    }

    #[test]
    fn prop_any_sequence_matches_model(ops in prop::collection::vec(arb_op(), 1..60)) {
        run(&ops, options()).unwrap();
    }

    #[test]
    fn prop_memory_database_matches_model(ops in prop::collection::vec(arb_op(), 1..60)) {
        let fs = MemFileSystem::new();
        let mut pager = Pager::open_with_options(
            Arc::new(fs),
            Some(Path::new(sombra_rollback::MEMORY_DB_PATH)),
            None,
            FileType::MainDb,
            OpenPermissions::create(),
            options(),
        ).unwrap();
        let mut model = Model::default();
        for op in &ops {
            apply(&mut pager, op).unwrap();
            model.apply(op);
        }
        let expected = model.visible().clone();
        check(&mut pager, &expected).unwrap();
    }
}

#[test]
fn seeded_workload_with_wide_sectors() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    let fs = MemFileSystem::with_sector_size(4096);
    let opts = options();
    let mut pager = open(&fs, &opts)?;
    let mut model = Model::default();
    for _ in 0..400 {
        let op = match rng.gen_range(0..11) {
            0..=5 => Op::Write {
                page: rng.gen_range(1..=MAX_PAGE),
                byte: rng.gen(),
            },
            6 | 7 => Op::Commit,
            8 => Op::Rollback,
            9 => Op::Truncate {
                pages: rng.gen_range(0..=MAX_PAGE),
            },
            _ => {
                if rng.gen_bool(0.5) {
                    Op::StartStatement
                } else {
                    Op::StatementRollback
                }
            }
        };
        apply(&mut pager, &op)?;
        model.apply(&op);
        if matches!(op, Op::Commit | Op::Rollback) {
            check(&mut pager, &model.committed)?;
        }
    }
    apply(&mut pager, &Op::Commit)?;
    model.apply(&Op::Commit);
    drop(pager);

    let mut reopened = open(&fs, &opts)?;
    check(&mut reopened, &model.committed)
}
