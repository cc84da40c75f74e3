//! veilfs - Encrypted virtual filesystem layer
//!
//! Usage:
//!   veilfs --share <dir> init            - Initialize a new share
//!   veilfs --share <dir> ls [path]       - List a directory
//!   veilfs --share <dir> put <src> <dst> - Encrypt a local file into the share
//!   veilfs --share <dir> cat <path>      - Decrypt a file to stdout
//!   veilfs --share <dir> rm <path>       - Delete a file
//!   veilfs --share <dir> mkdir <path>    - Create a directory
//!   veilfs --share <dir> mv <from> <to>  - Rename a file
//!   veilfs --share <dir> info <path>     - Show file metadata

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use veilfs::config::EncryptionConfig;
use veilfs::crypto::kdf;
use veilfs::prelude::*;

#[derive(Parser)]
#[command(name = "veilfs")]
#[command(version = "0.3.0")]
#[command(about = "Encrypted virtual filesystem layer for untrusted storage")]
struct Cli {
    /// Share backing directory
    #[arg(short, long)]
    share: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new share in the backing directory
    Init {
        /// Plaintext bytes per encrypted chunk
        #[arg(long)]
        chunk_size: Option<u32>,
    },

    /// List a directory of the share
    Ls {
        /// Plaintext path, defaults to the root
        #[arg(default_value = "/")]
        path: String,
    },

    /// Encrypt a local file into the share
    Put {
        /// Local source file
        source: PathBuf,

        /// Plaintext destination path inside the share
        dest: String,
    },

    /// Decrypt a share file to stdout
    Cat {
        /// Plaintext path inside the share
        path: String,
    },

    /// Delete a file from the share
    Rm {
        /// Plaintext path inside the share
        path: String,
    },

    /// Create a directory in the share
    Mkdir {
        /// Plaintext path inside the share
        path: String,
    },

    /// Remove an empty directory from the share
    Rmdir {
        /// Plaintext path inside the share
        path: String,
    },

    /// Rename a file inside the share
    Mv {
        /// Current plaintext path
        from: String,

        /// New plaintext path
        to: String,
    },

    /// Show metadata for a path
    Info {
        /// Plaintext path inside the share
        path: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    let share_root = expand_tilde(&cli.share);

    if let Err(e) = run_command(cli.command, &share_root) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, share_root: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Init { chunk_size } => cmd_init(share_root, chunk_size),
        Commands::Ls { path } => cmd_ls(share_root, &path),
        Commands::Put { source, dest } => cmd_put(share_root, &source, &dest),
        Commands::Cat { path } => cmd_cat(share_root, &path),
        Commands::Rm { path } => cmd_rm(share_root, &path),
        Commands::Mkdir { path } => cmd_mkdir(share_root, &path),
        Commands::Rmdir { path } => cmd_rmdir(share_root, &path),
        Commands::Mv { from, to } => cmd_mv(share_root, &from, &to),
        Commands::Info { path } => cmd_info(share_root, &path),
    }
}

/// Load the share config, prompt for the passphrase, and mount
fn mount(share_root: &Path) -> anyhow::Result<VirtualVolume> {
    let config = ShareConfig::load(share_root).context("share is not initialized (run init)")?;

    let passphrase = rpassword::prompt_password("Share passphrase: ")?;
    let ctx = kdf::derive_key_context(
        &config.share_id,
        config.key_version,
        &passphrase,
        &config.encryption,
    )?;

    let volume = VirtualVolume::new(share_root, KeyChain::new(ctx), config.volume)?;
    Ok(volume)
}

fn cmd_init(share_root: &Path, chunk_size: Option<u32>) -> anyhow::Result<()> {
    std::fs::create_dir_all(share_root)?;
    if ShareConfig::path_for(share_root).exists() {
        bail!("share at {} is already initialized", share_root.display());
    }

    let passphrase = rpassword::prompt_password("New share passphrase: ")?;
    let confirm = rpassword::prompt_password("Confirm passphrase: ")?;
    if passphrase != confirm {
        bail!("passphrases do not match");
    }

    let mut volume = VolumeConfig::default();
    if let Some(cs) = chunk_size {
        if cs == 0 {
            bail!("chunk size must be non-zero");
        }
        volume.chunk_size = cs;
    }

    let config = ShareConfig {
        share_id: uuid::Uuid::new_v4().to_string(),
        key_version: 1,
        volume,
        encryption: EncryptionConfig {
            salt: kdf::generate_salt().to_vec(),
            ..EncryptionConfig::default()
        },
    };
    config.save(share_root)?;

    // derive once so a typo in the passphrase surfaces now, not on first use
    kdf::derive_key_context(&config.share_id, 1, &passphrase, &config.encryption)?;

    info!("Initialized share {} at {}", config.share_id, share_root.display());
    Ok(())
}

fn cmd_ls(share_root: &Path, path: &str) -> anyhow::Result<()> {
    let volume = mount(share_root)?;
    let mut entries = volume.list_directory(path)?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    for entry in entries {
        if entry.is_directory {
            println!("{}/", entry.name);
        } else {
            println!("{}", entry.name);
        }
    }
    Ok(())
}

fn cmd_put(share_root: &Path, source: &Path, dest: &str) -> anyhow::Result<()> {
    let volume = mount(share_root)?;
    let mut input = std::fs::File::open(source)
        .with_context(|| format!("cannot open {}", source.display()))?;

    let mut file = volume.get_file(dest)?;
    file.open(CreationFlags::CreateAlways)?;

    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write(&buf[..n])?;
        total += n as u64;
    }
    file.flush()?;
    file.close()?;

    info!("Wrote {} bytes to {}", total, dest);
    Ok(())
}

fn cmd_cat(share_root: &Path, path: &str) -> anyhow::Result<()> {
    let volume = mount(share_root)?;
    let mut file = volume.get_file(path)?;
    file.open(CreationFlags::OpenExisting)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
    }
    out.flush()?;
    file.close()?;
    Ok(())
}

fn cmd_rm(share_root: &Path, path: &str) -> anyhow::Result<()> {
    let volume = mount(share_root)?;
    let mut file = volume.get_file(path)?;
    file.delete()?;
    info!("Deleted {}", path);
    Ok(())
}

fn cmd_mkdir(share_root: &Path, path: &str) -> anyhow::Result<()> {
    let volume = mount(share_root)?;
    volume.create_directory(path)?;
    Ok(())
}

fn cmd_rmdir(share_root: &Path, path: &str) -> anyhow::Result<()> {
    let volume = mount(share_root)?;
    volume.remove_directory(path)?;
    Ok(())
}

fn cmd_mv(share_root: &Path, from: &str, to: &str) -> anyhow::Result<()> {
    let volume = mount(share_root)?;
    let mut file = volume.get_file(from)?;
    file.rename_to(to)?;
    info!("Renamed {} to {}", from, to);
    Ok(())
}

fn cmd_info(share_root: &Path, path: &str) -> anyhow::Result<()> {
    let volume = mount(share_root)?;
    let info = volume.get_file_info(path, false, false)?;
    let backing = volume.resolve(path)?;

    println!("Name:      {}", info.file_name);
    println!("Type:      {}", if info.is_directory { "directory" } else { "file" });
    println!("Size:      {} bytes", info.size);
    println!("Backing:   {}", backing.display());
    if let Ok(elapsed) = info.modified.elapsed() {
        println!("Modified:  {}s ago", elapsed.as_secs());
    }
    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if path.starts_with("~") {
        if let Some(home) = dirs::home_dir() {
            if let Ok(rest) = path.strip_prefix("~") {
                return home.join(rest);
            }
        }
    }
    path.to_path_buf()
}
