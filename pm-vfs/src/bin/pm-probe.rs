use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use memmap2::Mmap;
use pm_vfs::{IoOp, OpenFlags, PmemVfs, SyncFlags, VfsError, VfsFile};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let probe = ProbeCommand::parse();
    match run(probe) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("pm-probe: {err} (result code {})", err.code());
            ExitCode::FAILURE
        }
    }
}

/// Open a file through the persistent memory provider and report how it is mapped.
///
/// The provider is configured from the `PMEM_VFS_*` environment, like any host engine would.
#[derive(Parser)]
struct ProbeCommand {
    #[arg(help = "The database or log file to open")]
    path: PathBuf,

    /// Open the file as this kind, which decides when writes are flushed.
    #[arg(value_enum, long, default_value = "db")]
    kind: Kind,

    /// Write this text to the file.
    #[arg(long)]
    write: Option<String>,

    /// Offset of the write.
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// Sync the file after writing.
    #[arg(long)]
    sync: bool,

    /// Print the first bytes of the file as stored, read through a separate mapping.
    #[arg(long, value_name = "N")]
    dump: Option<usize>,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Kind {
    /// A main database file.
    Db,
    /// A write-ahead log, flushed on every write.
    Wal,
}

fn run(probe: ProbeCommand) -> Result<(), VfsError> {
    let vfs = PmemVfs::from_env()?;
    let flags = match probe.kind {
        Kind::Db => OpenFlags::main_db(),
        Kind::Wal => OpenFlags::wal(),
    };

    let mut file = vfs.open_file(Some(&probe.path), flags)?;
    let store = file.store();
    println!("path: {}", store.path().display());
    println!("medium: {:?}", store.medium());
    println!("role: {:?}", store.role());
    println!("capacity: {}", store.capacity());
    println!("size: {}", store.file_size());

    if let Some(text) = &probe.write {
        file.write(probe.offset, text.as_bytes())?;
        println!("wrote: {} bytes at {}", text.len(), probe.offset);
    }

    if probe.sync {
        file.sync(SyncFlags::default())?;
    }

    let stats = file.store().stats();
    println!(
        "flushes: {} after writes, {} on sync, {} skipped",
        stats.write_flushes, stats.sync_flushes, stats.noop_syncs
    );

    let real = file.path().to_owned();
    file.close()?;

    if let Some(n) = probe.dump {
        dump(real, n)?;
    }

    Ok(())
}

fn dump(path: PathBuf, n: usize) -> Result<(), VfsError> {
    let io = |source: std::io::Error| VfsError::Io {
        op: IoOp::Read,
        path: path.clone(),
        source,
    };

    let file = File::open(&path).map_err(io)?;
    if file.metadata().map_err(io)?.len() == 0 {
        println!("dump: empty");
        return Ok(());
    }

    let map = unsafe { Mmap::map(&file) }.map_err(io)?;
    let shown = &map[..n.min(map.len())];

    for (line, chunk) in shown.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let text: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        println!("{:08x}  {:<47}  {text}", line * 16, hex.join(" "));
    }

    Ok(())
}
