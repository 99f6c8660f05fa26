//! `superpack` command line tool.
//!
//! Builds and inspects superpack archives, downloads packs through a
//! [`DlcManager`], and decodes single `.dvpl` fragments.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use superpack_client::{DlcEvent, DlcManager, Hints};
use superpack_formats::{
    CompressionType, FileTable, PackMetaData, SuperpackBuilder, SuperpackFooter, SuperpackFormat,
    unpack_lite,
};
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Parser)]
#[command(name = "superpack", about = "Superpack archive and DLC download tool", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build a superpack from a directory
    Pack {
        /// Directory holding the files to pack
        input: PathBuf,

        /// JSON manifest describing packs
        #[arg(long)]
        packs: PathBuf,

        /// Output archive
        #[arg(short, long)]
        output: PathBuf,

        /// Codec applied to every file
        #[arg(long, value_enum, default_value_t = Codec::Lz4)]
        compression: Codec,
    },

    /// Print the footer, file table and packs of an archive
    Inspect {
        archive: PathBuf,

        /// Also list every file
        #[arg(long)]
        files: bool,
    },

    /// Download packs from a remote superpack
    Fetch {
        url: String,

        /// Download directory
        dir: PathBuf,

        /// Packs to download
        #[arg(required = true)]
        packs: Vec<String>,

        /// Concurrent transfers
        #[arg(long, env = "SUPERPACK_MAX_HANDLES", default_value_t = 8)]
        max_handles: usize,

        /// Give up after this many seconds
        #[arg(long, env = "SUPERPACK_FETCH_TIMEOUT", default_value_t = 600)]
        timeout: u64,
    },

    /// Decode one local fragment
    UnpackLite {
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Codec {
    None,
    Lz4,
    Lz4hc,
    Deflate,
}

impl From<Codec> for CompressionType {
    fn from(codec: Codec) -> Self {
        match codec {
            Codec::None => Self::None,
            Codec::Lz4 => Self::Lz4,
            Codec::Lz4hc => Self::Lz4Hc,
            Codec::Deflate => Self::Deflate,
        }
    }
}

/// `packs.json`
///
/// ```json
/// { "packs": [
///     { "name": "base", "dependencies": [], "prefixes": ["common/"] },
///     { "name": "level1", "dependencies": ["base"], "prefixes": ["levels/1/"] }
/// ] }
/// ```
///
/// A file belongs to the first pack with a matching path prefix.
#[derive(Debug, Deserialize)]
struct Manifest {
    packs: Vec<ManifestPack>,
}

#[derive(Debug, Deserialize)]
struct ManifestPack {
    name: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    prefixes: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Pack {
            input,
            packs,
            output,
            compression,
        } => pack(&input, &packs, &output, compression.into()),
        Command::Inspect { archive, files } => inspect(&archive, files),
        Command::Fetch {
            url,
            dir,
            packs,
            max_handles,
            timeout,
        } => fetch(
            &url,
            &dir,
            &packs,
            max_handles,
            Duration::from_secs(timeout),
        ),
        Command::UnpackLite { input, output } => {
            let bytes = fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            let data = unpack_lite(&bytes).with_context(|| format!("decoding {}", input.display()))?;
            fs::write(&output, &data).with_context(|| format!("writing {}", output.display()))?;
            info!(bytes = data.len(), output = %output.display(), "Fragment decoded");
            Ok(())
        }
    }
}

fn pack(input: &Path, manifest: &Path, output: &Path, compression: CompressionType) -> Result<()> {
    let manifest: Manifest = serde_json::from_slice(
        &fs::read(manifest).with_context(|| format!("reading {}", manifest.display()))?,
    )
    .context("parsing pack manifest")?;

    let mut builder = SuperpackBuilder::new().with_compression(compression);
    for pack in &manifest.packs {
        let dependencies: Vec<&str> = pack.dependencies.iter().map(String::as_str).collect();
        builder.pack(&pack.name, &dependencies);
    }

    let mut per_pack: HashMap<&str, usize> = HashMap::new();
    for entry in WalkDir::new(input).sort_by_file_name() {
        let entry = entry.context("walking input directory")?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(input)
            .context("file outside input directory")?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let Some(owner) = manifest
            .packs
            .iter()
            .find(|pack| pack.prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())))
        else {
            bail!("{name} matches no pack prefix");
        };
        let data = fs::read(entry.path()).with_context(|| format!("reading {}", entry.path().display()))?;
        builder.add_file(&owner.name, &name, data);
        *per_pack.entry(owner.name.as_str()).or_default() += 1;
    }

    let built = builder.build().context("building superpack")?;
    fs::write(output, &built.bytes).with_context(|| format!("writing {}", output.display()))?;
    for pack in &manifest.packs {
        info!(
            pack = %pack.name,
            files = per_pack.get(pack.name.as_str()).copied().unwrap_or(0),
            "Packed"
        );
    }
    info!(
        files = built.entries.len(),
        bytes = built.bytes.len(),
        output = %output.display(),
        "Superpack written"
    );
    Ok(())
}

fn inspect(path: &Path, list_files: bool) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let total = bytes.len() as u64;
    let footer = SuperpackFooter::from_archive_tail(&bytes).context("decoding footer")?;
    footer.validate_sizes(total)?;

    let table_start = footer.files_table_offset(total)? as usize;
    let table_end = table_start + footer.info.files_table_size as usize;
    let table = FileTable::extract(&footer, &bytes[table_start..table_end]).context("decoding file table")?;

    let meta_start = footer.meta_data_offset(total)? as usize;
    let meta_end = meta_start + footer.meta_data_size as usize;
    let meta = PackMetaData::parse(&bytes[meta_start..meta_end]).context("decoding metadata")?;

    println!("Archive:        {} ({total} bytes)", path.display());
    println!("Files:          {}", footer.info.num_files);
    println!(
        "File table:     {} bytes at {table_start}, crc 0x{:08x}",
        footer.info.files_table_size, footer.info.files_table_crc32
    );
    println!(
        "Names:          {} -> {} bytes",
        footer.info.names_size_compressed, footer.info.names_size_original
    );
    println!(
        "Metadata:       {} bytes at {meta_start}, crc 0x{:08x}",
        footer.meta_data_size, footer.meta_data_crc32
    );
    println!();
    println!("Packs:");
    for (index, pack) in meta.packs().iter().enumerate() {
        let files = meta.file_indexes(&pack.pack_name);
        let stored: u64 = files
            .iter()
            .filter_map(|&file| table.entry(file as usize))
            .map(|entry| u64::from(entry.compressed_size))
            .sum();
        let dependencies = meta.pack_dependency_names(&pack.pack_name)?;
        println!(
            "  [{index}] {:<24} {:>6} files {:>12} bytes  deps: {}",
            pack.pack_name,
            files.len(),
            stored,
            if dependencies.is_empty() {
                "-".to_string()
            } else {
                dependencies.join(", ")
            }
        );
    }

    if list_files {
        println!();
        println!("Files:");
        for index in 0..table.len() {
            let (Some(entry), Some(name)) = (table.entry(index), table.name(index)) else {
                continue;
            };
            println!(
                "  {index:>6} {:<48} {:>10} -> {:>10} {:<7} crc 0x{:08x} pack {}",
                name,
                entry.compressed_size,
                entry.original_size,
                entry.compression_type.name(),
                entry.compressed_crc32,
                entry.meta_index
            );
        }
    }
    Ok(())
}

fn fetch(url: &str, dir: &Path, packs: &[String], max_handles: usize, timeout: Duration) -> Result<()> {
    superpack_protocol::ensure_crypto_provider();
    let hints = Hints::from_env().with_downloader_max_handles(max_handles);
    let mut manager = DlcManager::http(&hints).context("creating downloader")?;

    let handles = packs
        .iter()
        .map(|pack| manager.request_pack(pack))
        .collect::<Result<Vec<_>, _>>()?;
    manager
        .initialize(dir, url, hints)
        .with_context(|| format!("initializing in {}", dir.display()))?;

    let tick = Duration::from_millis(16);
    let deadline = Instant::now() + timeout;
    let mut last_report = Instant::now();
    loop {
        manager.update(tick);
        for event in manager.drain_events() {
            match event {
                DlcEvent::NetworkReady(false) => warn!(
                    error = manager.last_error_message().unwrap_or("unknown"),
                    "Superpack unreachable, retrying"
                ),
                DlcEvent::InitializeFinished {
                    already_downloaded,
                    total_files,
                } => info!(already_downloaded, total_files, "Initialized"),
                DlcEvent::NoSpaceLeftOnDevice(path) => {
                    bail!("no space left on device writing {}", path.display());
                }
                DlcEvent::FileError { path, message } => {
                    warn!(path = %path.display(), error = %message, "File error");
                }
                _ => {}
            }
        }

        let requests: Vec<_> = handles.iter().filter_map(|&h| manager.request(h)).collect();
        if let Some(failed) = requests.iter().find(|r| r.is_failed()) {
            bail!("pack {} failed: {}", failed.name(), failed.error().unwrap_or("unknown error"));
        }
        if manager.is_initialized() && packs.iter().all(|pack| manager.is_pack_downloaded(pack)) {
            break;
        }
        if Instant::now() >= deadline {
            bail!("timed out in state {}", manager.init_state());
        }
        if last_report.elapsed() >= Duration::from_secs(2) && manager.is_initialized() {
            let progress = manager.progress();
            info!(
                downloaded = progress.already_downloaded,
                total = progress.total,
                in_queue = progress.in_queue,
                "Progress"
            );
            last_report = Instant::now();
        }
        std::thread::sleep(tick);
    }

    let progress = manager.progress();
    info!(
        packs = packs.len(),
        downloaded = progress.already_downloaded,
        total = progress.total,
        "Packs downloaded"
    );
    Ok(())
}
