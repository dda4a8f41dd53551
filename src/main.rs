//! Command-line probe for the content server.
//!
//! Resolves one path of one project the way the HTTP layer would and writes
//! the body to stdout, or lists the project's archive.

use anyhow::{Result, bail};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use zipages::{ArchiveCache, ArchiveIndex, Cli, ContentServer, HttpObjectStore, Served};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let store = Arc::new(HttpObjectStore::new(&cli.store_url, cli.store_config())?);
    let server = ContentServer::new(
        store.clone(),
        Arc::new(ArchiveCache::new()),
        cli.serve_config(),
    );
    let cancel = CancellationToken::new();

    if cli.list || cli.verbose {
        let Some(index) = server.archive(&cli.lookup_path(), &cancel).await? else {
            bail!(
                "no archive at {}",
                cli.lookup_path().object_key(&cli.archive_name)
            );
        };
        list_files(&index, cli.verbose);
    } else {
        serve(&server, &cli, &cancel).await?;
    }

    // Display network transfer statistics
    if !cli.is_quiet() {
        let stats = store.stats();
        eprintln!(
            "\nTotal bytes transferred: {} in {} requests",
            format_size(stats.bytes()),
            stats.requests()
        );
    }

    Ok(())
}

/// Resolve the requested path and copy its body to stdout.
async fn serve(server: &ContentServer, cli: &Cli, cancel: &CancellationToken) -> Result<()> {
    let lookup = cli.lookup_path();
    let mut content = match server.serve(&lookup, &cli.path, cancel).await? {
        Served::Content(content) => content,
        Served::NotServed => bail!("{}: not found", cli.path),
    };

    if cli.include_headers {
        eprintln!("source: {:?}", content.source);
        for (name, value) in &content.headers {
            eprintln!("{name}: {}", value.to_str().unwrap_or("<binary>"));
        }
        eprintln!();
    }

    let mut stdout = tokio::io::stdout();
    content.body.copy_to(&mut stdout).await?;
    Ok(())
}

/// List files in the archive.
///
/// Supports two output formats:
/// - Simple format (`-l`): Just file names, one per line
/// - Verbose format (`-v`): Detailed table with size, compression ratio, and timestamps
fn list_files(index: &ArchiveIndex, verbose: bool) {
    if verbose {
        println!(
            "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  Name",
            "Length", "Size", "Cmpr", "Date", "Time"
        );
        println!("{}", "-".repeat(70));
    }

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;

    for entry in index.entries() {
        if verbose {
            let (year, month, day) = entry.mod_date();
            let (hour, minute, _second) = entry.mod_time();

            println!(
                "{:>10}  {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02}  {}",
                entry.uncompressed_size,
                entry.compressed_size,
                ratio(entry.compressed_size, entry.uncompressed_size),
                year,
                month,
                day,
                hour,
                minute,
                entry.name
            );

            total_uncompressed += entry.uncompressed_size;
            total_compressed += entry.compressed_size;
        } else {
            println!("{}", entry.name);
        }
    }

    if verbose {
        println!("{}", "-".repeat(70));
        println!(
            "{:>10}  {:>10}  {}  {:>21}  {} files",
            total_uncompressed,
            total_compressed,
            ratio(total_compressed, total_uncompressed),
            "",
            index.len()
        );
    }
}

/// Space saved by compression, as a right-aligned percentage
fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - (compressed * 100 / uncompressed))
    } else {
        "  0%".to_string()
    }
}

/// Format a byte size into a human-readable string.
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
