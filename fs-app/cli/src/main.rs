//! tinyext Command Line Interface
//!
//! Interactive shell over a tinyext filesystem held in memory or in an image file.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tinyext::blockdev::{FileBackedBlockDevice, MemoryBlockDevice, DEFAULT_BLOCK_SIZE};
use tinyext::format::Superblock;
use tinyext::{FileSystem, FormatOptions, FsConfig};

mod help;
mod shell;
mod users;

use shell::Shell;
use users::CliConfig;

/// tinyext - an ext2-flavored filesystem on a virtual disk
#[derive(Parser, Debug)]
#[command(
    name = "tinyext",
    about = "Interactive shell for the tinyext filesystem",
    version = env!("CARGO_PKG_VERSION"),
    author = "tinyext contributors"
)]
struct Cli {
    /// Disk image to use; without it the disk lives in memory
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Format the image even if it already holds a filesystem
    #[arg(short, long)]
    format: bool,

    /// Block size in bytes for a fresh format
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Number of blocks for a fresh format
    #[arg(long, default_value_t = 1024)]
    blocks: u64,

    /// Inode table slots for a fresh format (default: one per eight blocks)
    #[arg(long)]
    inodes: Option<u64>,

    /// Volume label for a fresh format
    #[arg(long)]
    volume_name: Option<String>,

    /// JSON file with filesystem settings and the user table
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn format_options(&self) -> FormatOptions {
        let mut options = FormatOptions::with_geometry(self.block_size, self.blocks);
        if let Some(inodes) = self.inodes {
            options.inode_count = inodes;
        }
        options.volume_name = self.volume_name.clone();
        options
    }
}

/// Mount the image named on the command line, formatting it when it is new
/// or when `--format` was given
fn open_filesystem(cli: &Cli, config: FsConfig) -> Result<FileSystem> {
    let options = cli.format_options();

    let path = match &cli.image {
        None => {
            info!(
                "Using an in-memory disk ({} blocks of {} bytes)",
                options.block_count, options.block_size
            );
            let device = Arc::new(MemoryBlockDevice::new(options.block_count, options.block_size));
            return FileSystem::format(device, &options, config)
                .context("Failed to format the in-memory disk");
        }
        Some(path) => path,
    };

    if path.exists() && !cli.format {
        let superblock = Superblock::probe(path)
            .with_context(|| format!("{} does not hold a tinyext filesystem", path.display()))?;
        let device = FileBackedBlockDevice::open(path, superblock.block_size as usize, false)
            .with_context(|| format!("Failed to open image {}", path.display()))?;

        info!(
            "Mounting {} (volume '{}')",
            path.display(),
            superblock.volume_name()
        );
        return FileSystem::mount(Arc::new(device), config)
            .with_context(|| format!("Failed to mount {}", path.display()));
    }

    let device = FileBackedBlockDevice::create(path, options.block_count, options.block_size)
        .with_context(|| format!("Failed to create image {}", path.display()))?;
    info!("Formatting {}", path.display());
    FileSystem::format(Arc::new(device), &options, config)
        .with_context(|| format!("Failed to format {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new().filter_level(log_level).init();

    info!("tinyext CLI v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => CliConfig::load(path)?,
        None => CliConfig::default(),
    };

    let fs = open_filesystem(&cli, config.filesystem)?;
    let stdin = io::stdin();
    let mut shell = Shell::new(fs, config.users, stdin.lock(), io::stdout());
    shell.run()?;

    shell
        .filesystem()
        .sync()
        .context("Failed to flush the disk")?;
    Ok(())
}
