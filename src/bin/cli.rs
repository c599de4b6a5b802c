//! AtlasBlob CLI
//!
//! Command-line access to a blob data file.

use std::path::PathBuf;
use std::process::ExitCode;

use atlasblob::{BlobId, BlobStore, Config};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// AtlasBlob CLI
#[derive(Parser, Debug)]
#[command(name = "atlasblob-cli")]
#[command(about = "Store and inspect blobs in an AtlasBlob data file")]
#[command(version)]
struct Args {
    /// Data file
    #[arg(short, long, default_value = "./atlasblob.db")]
    file: PathBuf,

    /// Page size used when the file is created
    #[arg(short, long, default_value = "16384")]
    page_size: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store the contents of a file, print the blob id
    Put {
        /// File to read
        input: PathBuf,
    },

    /// Print a blob, or write it to a file
    Get {
        /// Blob id (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_blob_id)]
        id: BlobId,

        /// Write the blob here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Print the size of a blob
    Size {
        #[arg(value_parser = parse_blob_id)]
        id: BlobId,
    },

    /// Delete a blob
    Rm {
        #[arg(value_parser = parse_blob_id)]
        id: BlobId,
    },

    /// Replace a blob with the contents of a file, print the new id
    Replace {
        #[arg(value_parser = parse_blob_id)]
        id: BlobId,

        /// File to read
        input: PathBuf,
    },

    /// Verify every page of the data file
    Check,

    /// Print page statistics
    Stats,
}

fn parse_blob_id(s: &str) -> Result<BlobId, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed
        .map(BlobId::new)
        .map_err(|e| format!("invalid blob id '{}': {}", s, e))
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,atlasblob=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> atlasblob::Result<()> {
    let read_only = matches!(
        args.command,
        Commands::Get { .. } | Commands::Size { .. } | Commands::Check | Commands::Stats
    );

    let config = Config::builder()
        .data_path(&args.file)
        .page_size(args.page_size)
        .read_only(read_only)
        .build();

    let mut store = BlobStore::open(config)?;

    match args.command {
        Commands::Put { input } => {
            let data = std::fs::read(&input)?;
            let id = store.put(&data)?;
            println!("{}", id);
        }
        Commands::Get { id, out } => {
            let data = store.get_bytes(id)?;
            match out {
                Some(path) => std::fs::write(path, &data)?,
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&data)?;
                }
            }
        }
        Commands::Size { id } => {
            println!("{}", store.size(id)?);
        }
        Commands::Rm { id } => {
            store.remove(id)?;
            println!("removed {}", id);
        }
        Commands::Replace { id, input } => {
            let data = std::fs::read(&input)?;
            let new_id = store.replace(id, &data)?;
            println!("{}", new_id);
        }
        Commands::Check => {
            let report = store.check()?;
            println!(
                "blob pages: {}, continuation pages: {}, free bytes: {}",
                report.blob_pages, report.continuation_pages, report.free_bytes
            );
            for (address, problem) in &report.problems {
                println!("page {:#x}: {}", address, problem);
            }
            println!("{}", if report.is_ok() { "OK" } else { "FAILED" });
        }
        Commands::Stats => {
            let stats = store.stats();
            println!("page size:    {}", stats.page_size);
            println!("pages:        {}", stats.page_count);
            println!("free pages:   {}", stats.free_pages);
            println!("cached pages: {}", stats.cached_pages);
            println!("mapped:       {}", stats.mapped);
        }
    }

    store.close()
}
