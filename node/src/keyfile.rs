//! Wallet key file handling.
//!
//! The key file holds a single line: the 64-hex-character private key. On
//! Unix it is created with mode `0600`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use triad_protocol::identity::Wallet;

pub const WALLET_FILE: &str = "wallet.key";

/// Where the wallet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// `--private-key` / `TRIAD_PRIVATE_KEY`.
    Explicit,
    /// An existing key file.
    File,
    /// Generated and written on this run.
    Generated,
}

pub fn wallet_path(data_dir: &Path) -> PathBuf {
    data_dir.join(WALLET_FILE)
}

/// Writes `private_key_hex` to `path`, replacing any previous file.
pub fn write_key(path: &Path, private_key_hex: &str) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create key file {}", path.display()))?;
    writeln!(file, "{private_key_hex}")
        .with_context(|| format!("failed to write key file {}", path.display()))?;

    // `mode` only applies on creation; tighten an existing file too.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

pub fn read_wallet(path: &Path) -> Result<Wallet> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    Wallet::from_private_key(contents.trim())
        .with_context(|| format!("invalid key in {}", path.display()))
}

/// Creates a fresh wallet and writes its key to `path`. Refuses to replace
/// an existing file unless `force` is set.
pub fn create_wallet(path: &Path, force: bool) -> Result<Wallet> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to replace it)",
            path.display()
        );
    }
    let mut wallet = Wallet::new();
    let pair = wallet.generate_key_pair();
    write_key(path, &pair.private_key)?;
    Ok(wallet)
}

/// Resolves the node's wallet: the explicit key if given, else the key
/// file, else a newly generated key that is saved for next time.
pub fn load_or_create(data_dir: &Path, explicit: Option<&str>) -> Result<(Wallet, KeySource)> {
    if let Some(hex) = explicit {
        let wallet = Wallet::from_private_key(hex.trim()).context("invalid --private-key")?;
        return Ok((wallet, KeySource::Explicit));
    }

    let path = wallet_path(data_dir);
    if path.exists() {
        return Ok((read_wallet(&path)?, KeySource::File));
    }
    Ok((create_wallet(&path, false)?, KeySource::Generated))
}
