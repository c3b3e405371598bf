use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use arbordb_storage::alert::AlertMonitor;
use arbordb_storage::buffer::BufferPool;
use arbordb_storage::journal::{
    JournalRecord, JournalScanner, RangePredicate, ScanFilter, ScannedRecord,
};
use arbordb_storage::key::Key;
use arbordb_storage::taskspec::{self, ArgSpec};
use arbordb_storage::verify::{IntegrityCheck, IntegrityCheckOptions};
use arbordb_storage::volume::Volume;
use arbordb_storage::{Error, Result};

#[derive(Parser)]
#[command(name = "arbordb", version, arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the structural integrity of a volume's trees
    Icheck(IcheckArgs),
    /// Print selected journal records, one line each
    Jview(JviewArgs),
}

#[derive(Parser)]
struct IcheckArgs {
    /// Volume file to check
    #[arg(long)]
    volume: PathBuf,

    /// Task arguments: trees=<selector> plus flags r u h p P v c
    #[arg(trailing_var_arg = true)]
    task: Vec<String>,
}

#[derive(Parser)]
struct JviewArgs {
    /// Task arguments: path=<prefix> start= end= types= pages= timestamps=
    /// maxkey= maxvalue= plus flag v
    #[arg(trailing_var_arg = true)]
    task: Vec<String>,
}

const ICHECK_SPECS: &[ArgSpec] = &[ArgSpec::text("trees", Some("*"), "tree name selector")];
const ICHECK_FLAGS: &str = "ruhpPvc";

const JVIEW_SPECS: &[ArgSpec] = &[
    ArgSpec::text("path", None, "journal file prefix"),
    ArgSpec::text("start", Some("0"), "first journal address"),
    ArgSpec::text("end", Some(""), "journal address to stop before"),
    ArgSpec::text("types", Some("*"), "record type list, e.g. TS,SR,TC"),
    ArgSpec::text("pages", Some("*"), "page address ranges"),
    ArgSpec::text("timestamps", Some("*"), "timestamp ranges"),
    ArgSpec::int("maxkey", Some("42"), 1, 10_000, "key preview length"),
    ArgSpec::int("maxvalue", Some("256"), 1, 1_000_000, "value preview length"),
];
const JVIEW_FLAGS: &str = "v";

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Icheck(args) => icheck(args),
        Commands::Jview(args) => jview(args),
    };
    match outcome {
        Ok(code) => code,
        Err(Error::InvalidArgument(message)) => {
            eprintln!("invalid argument: {message}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn icheck(args: IcheckArgs) -> Result<ExitCode> {
    let task = taskspec::parse(ICHECK_SPECS, ICHECK_FLAGS, &args.task)?;
    let options = IntegrityCheckOptions {
        tree_selector: task.text("trees").to_string(),
        selector_is_regex: task.flag('r'),
        freeze_updates: !task.flag('u'),
        fix_holes: task.flag('h'),
        prune: task.flag('p'),
        prune_and_clear: task.flag('P'),
        verbose: task.flag('v'),
        csv: task.flag('c'),
        ..IntegrityCheckOptions::default()
    };
    let writable = options.prune || options.prune_and_clear;
    let volume = Volume::open(&args.volume, !writable)?;
    let pool = BufferPool::new(volume);
    let monitor = AlertMonitor::new();

    let report = {
        let mut check = IntegrityCheck::new(&pool)
            .with_options(options.clone())
            .with_monitor(&monitor);
        check.run()?
    };

    println!(
        "{}: {} tree(s), {} page(s) visited, {} fault(s), {} hole(s), {} garbage page(s)",
        args.volume.display(),
        report.trees_checked.len(),
        report.pages_visited,
        report.faults.len(),
        report.holes.len(),
        report.garbage_pages,
    );
    if options.verbose {
        for fault in &report.faults {
            println!("fault: {fault}");
        }
        for hole in &report.holes {
            println!("hole: tree={} page={} level={}", hole.tree, hole.page, hole.level);
        }
        println!("{}", serde_json::to_string_pretty(&report.counters).unwrap());
    }
    if options.csv {
        println!("{}", report.to_csv());
    }
    monitor.poll(now_ms(), true);

    if report.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn jview(args: JviewArgs) -> Result<ExitCode> {
    let task = taskspec::parse(JVIEW_SPECS, JVIEW_FLAGS, &args.task)?;
    if !task.has("path") || task.text("path").is_empty() {
        return Err(Error::InvalidArgument("path=<prefix> is required".into()));
    }
    let start = parse_address(task.text("start"))?;
    let end = match task.text("end") {
        "" => None,
        text => Some(parse_address(text)?),
    };
    let filter = ScanFilter {
        types: ScanFilter::parse_types(task.text("types"))?,
        pages: RangePredicate::parse(task.text("pages"))?,
        timestamps: RangePredicate::parse(task.text("timestamps"))?,
    };
    let maxkey = task.int("maxkey") as usize;
    let maxvalue = task.int("maxvalue") as usize;
    let verbose = task.flag('v');

    let mut scanner = JournalScanner::open(task.text("path"), start, end);
    let selected = scanner.scan(&filter, |record| {
        println!("{}", format_record(record, maxkey, maxvalue));
        Ok(())
    })?;
    if verbose {
        eprintln!("{selected} record(s) selected, stopped at {}", scanner.address());
    }
    Ok(ExitCode::SUCCESS)
}

fn parse_address(text: &str) -> Result<u64> {
    text.parse()
        .map_err(|_| Error::InvalidArgument(format!("bad journal address {text:?}")))
}

fn format_record(scanned: &ScannedRecord, maxkey: usize, maxvalue: usize) -> String {
    let head = format!(
        "{:>16} {:>12} {} {:>8}",
        scanned.address,
        scanned.timestamp,
        scanned.record.record_type(),
        scanned.length
    );
    let detail = match &scanned.record {
        JournalRecord::FileHeader {
            version,
            block_size,
            base_address,
            ..
        } => format!("version={version} blockSize={block_size} base={base_address}"),
        JournalRecord::End {
            current_address, ..
        } => format!("current={current_address}"),
        JournalRecord::IdentifyVolume {
            handle,
            volume_id,
            name,
        } => format!("handle={handle} id={volume_id:#x} name={name}"),
        JournalRecord::IdentifyTree {
            handle,
            volume_handle,
            name,
        } => format!("handle={handle} volume={volume_handle} name={name}"),
        JournalRecord::PageImage {
            volume_handle,
            page_address,
            bytes,
        } => format!("volume={volume_handle} page={page_address} imageSize={}", bytes.len()),
        JournalRecord::PageMap { entries } => format!("entries={}", entries.len()),
        JournalRecord::TxMap { entries } => format!("entries={}", entries.len()),
        JournalRecord::Checkpoint {
            base_address,
            system_time_ms,
        } => format!("base={base_address} systemTime={system_time_ms}"),
        JournalRecord::TxStart { start_timestamp } => format!("start={start_timestamp}"),
        JournalRecord::TxCommit => String::new(),
        JournalRecord::Store {
            tree_handle,
            key,
            value,
        } => format!(
            "tree={tree_handle} key={} value={}",
            preview_key(key, maxkey),
            preview_bytes(value, maxvalue)
        ),
        JournalRecord::DeleteRange {
            tree_handle,
            key1,
            key2,
        } => format!(
            "tree={tree_handle} key1={} key2={}",
            preview_key(key1, maxkey),
            preview_key(key2, maxkey)
        ),
        JournalRecord::DeleteTree { tree_handle } => format!("tree={tree_handle}"),
    };
    if detail.is_empty() {
        head
    } else {
        format!("{head} {detail}")
    }
}

fn preview_key(encoded: &[u8], max: usize) -> String {
    let rendered = match Key::from_encoded(encoded) {
        Ok(key) => key.to_string(),
        Err(_) => preview_bytes(encoded, max),
    };
    truncate(rendered, max)
}

fn preview_bytes(bytes: &[u8], max: usize) -> String {
    let printable = bytes
        .iter()
        .all(|&b| b.is_ascii_graphic() || b == b' ');
    let rendered = if printable {
        format!("\"{}\"", String::from_utf8_lossy(bytes))
    } else {
        let mut out = String::with_capacity(bytes.len() * 2 + 2);
        out.push_str("0x");
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        out
    };
    truncate(rendered, max)
}

fn truncate(text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
