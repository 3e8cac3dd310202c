//! Read-only inspector for pager database and rollback journal files.
#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use sombra_rollback::primitives::io::{
    append_suffix, FileIo, FileSystem, FileType, OpenPermissions, StdFileSystem,
};
use sombra_rollback::primitives::pager::journal::{self, JournalHeader};
use sombra_rollback::{PageId, Result, SombraError};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "journal-inspect",
    version,
    about = "Inspect pager database files and rollback journals",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(value_name = "DB")]
    db_path: PathBuf,

    #[arg(long, global = true, help = "Emit JSON instead of text")]
    json: bool,

    #[arg(
        long,
        global = true,
        default_value_t = 1024,
        help = "Page size used to count database pages"
    )]
    page_size: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show file sizes, page count and journal status
    Info,
    /// Hex dump the start of the database file
    Header {
        #[arg(long, default_value_t = 100, help = "Bytes to dump")]
        bytes: usize,
    },
    /// Decode the rollback journal and verify its records
    Journal {
        #[arg(long, value_name = "FILE", help = "Journal path (default: <DB>-journal)")]
        path: Option<PathBuf>,
    },
}

fn print_header(title: &str) {
    println!();
    println!("{title}");
    println!("{}", "=".repeat(title.len()));
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {:.<28} {}", name, value);
}

fn open_read_only(fs: &StdFileSystem, path: &Path, file_type: FileType) -> Result<Arc<dyn FileIo>> {
    fs.open(path, file_type, OpenPermissions::READONLY)
}

fn cmd_info(cli: &Cli) -> Result<Value> {
    let fs = StdFileSystem;
    let db = open_read_only(&fs, &cli.db_path, FileType::MainDb)?;
    let size = db.len()?;
    let page_size = u64::from(cli.page_size);
    let mut page_count = size / page_size;
    if page_count == 0 && size > 0 {
        page_count = 1;
    }
    let journal_path = append_suffix(&cli.db_path, "-journal");
    let journal = if fs.exists(&journal_path)? {
        let file = open_read_only(&fs, &journal_path, FileType::MainJournal)?;
        let header = JournalHeader::read_from(file.as_ref())?;
        Some((file.len()?, header))
    } else {
        None
    };
    Ok(json!({
        "path": cli.db_path.display().to_string(),
        "file_size": size,
        "page_size": page_size,
        "page_count": page_count,
        "journal": journal.map(|(len, header)| json!({
            "path": journal_path.display().to_string(),
            "size": len,
            "live": header.is_some(),
        })),
    }))
}

fn cmd_header(cli: &Cli, bytes: usize) -> Result<Value> {
    let fs = StdFileSystem;
    let db = open_read_only(&fs, &cli.db_path, FileType::MainDb)?;
    let mut buf = vec![0u8; bytes];
    let read = db.read_at_padded(0, &mut buf)?;
    buf.truncate(read);
    let rows: Vec<Value> = buf
        .chunks(16)
        .enumerate()
        .map(|(i, chunk)| json!({ "offset": i * 16, "hex": hex::encode(chunk) }))
        .collect();
    Ok(json!({ "bytes": read, "rows": rows }))
}

fn cmd_journal(cli: &Cli, path: Option<&Path>) -> Result<Value> {
    let fs = StdFileSystem;
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| append_suffix(&cli.db_path, "-journal"));
    if !fs.exists(&path)? {
        return Err(SombraError::NotFound);
    }
    let file = open_read_only(&fs, &path, FileType::MainJournal)?;
    let len = file.len()?;
    let Some(header) = JournalHeader::read_from(file.as_ref())? else {
        return Ok(json!({
            "path": path.display().to_string(),
            "size": len,
            "header": Value::Null,
        }));
    };
    let master = journal::read_master_name(file.as_ref())?;
    let page_size = header.page_size as usize;
    let record_len = journal::record_len(page_size);
    let count = header.replay_count(len);
    let mut records = Vec::new();
    let mut buf = vec![0u8; record_len];
    let mut off = header.padded_len();
    for _ in 0..count {
        if off + record_len as u64 > len {
            break;
        }
        file.read_at(off, &mut buf)?;
        let page = PageId(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
        let valid = journal::decode_record(&buf, page_size, header.nonce).is_some();
        records.push(json!({ "offset": off, "page": page.0, "checksum_ok": valid }));
        off += record_len as u64;
    }
    Ok(json!({
        "path": path.display().to_string(),
        "size": len,
        "header": {
            "record_count": header.record_count,
            "nonce": header.nonce,
            "initial_pages": header.initial_pages,
            "sector_size": header.sector_size,
            "page_size": header.page_size,
        },
        "master_journal": master,
        "records": records,
    }))
}

fn print_text(command: &Command, value: &Value) {
    match command {
        Command::Info => {
            print_header("DATABASE INFO");
            print_field("Path", value["path"].as_str().unwrap_or_default());
            print_field("File Size", format!("{} bytes", value["file_size"]));
            print_field("Page Size", format!("{} bytes", value["page_size"]));
            print_field("Page Count", &value["page_count"]);
            match value["journal"].as_object() {
                Some(j) => {
                    print_field("Journal", j["path"].as_str().unwrap_or_default());
                    print_field("Journal Size", format!("{} bytes", j["size"]));
                    print_field("Journal Live", &j["live"]);
                }
                None => print_field("Journal", "none"),
            }
        }
        Command::Header { .. } => {
            print_header("DATABASE HEADER");
            for row in value["rows"].as_array().into_iter().flatten() {
                let offset = row["offset"].as_u64().unwrap_or_default();
                println!("  {:08x}  {}", offset, row["hex"].as_str().unwrap_or_default());
            }
        }
        Command::Journal { .. } => {
            print_header("ROLLBACK JOURNAL");
            print_field("Path", value["path"].as_str().unwrap_or_default());
            print_field("Size", format!("{} bytes", value["size"]));
            let header = &value["header"];
            if header.is_null() {
                print_field("Header", "zeroed or missing");
                return;
            }
            print_field("Record Count", &header["record_count"]);
            print_field("Nonce", format!("{:#010x}", header["nonce"].as_u64().unwrap_or_default()));
            print_field("Initial Pages", &header["initial_pages"]);
            print_field("Sector Size", &header["sector_size"]);
            print_field("Page Size", &header["page_size"]);
            match value["master_journal"].as_str() {
                Some(name) => print_field("Master Journal", name),
                None => print_field("Master Journal", "none"),
            }
            println!();
            for record in value["records"].as_array().into_iter().flatten() {
                let status = if record["checksum_ok"].as_bool() == Some(true) {
                    "ok"
                } else {
                    "BAD CHECKSUM"
                };
                println!(
                    "  @{:<10} page {:<8} {}",
                    record["offset"], record["page"], status
                );
            }
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let value = match &cli.command {
        Command::Info => cmd_info(cli)?,
        Command::Header { bytes } => cmd_header(cli, *bytes)?,
        Command::Journal { path } => cmd_journal(cli, path.as_deref())?,
    };
    if cli.json {
        let text = serde_json::to_string_pretty(&value)
            .map_err(|_| SombraError::Invalid("unserializable output"))?;
        println!("{text}");
    } else {
        print_text(&cli.command, &value);
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}
