//! Object storage seen as flat `/`-separated names inside one bucket.

mod dry_run;
mod http;
mod local;

pub use dry_run::DryRunStore;
pub use http::{HttpStore, HttpStoreConfig};
pub use local::LocalStore;

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

pub const MAX_PART_COUNT: u64 = 10_000;
pub const DEFAULT_PART_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 10 * 1024 * 1024;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    /// Worth retrying: network trouble, timeouts, server-side errors.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// Credentials, endpoint or bucket are wrong; retrying will not help.
    #[error("storage configuration error: {0}")]
    Config(String),

    #[error("size mismatch for {name}: remote {remote} != local {local}")]
    SizeMismatch { name: String, local: u64, remote: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Config(_))
    }
}

pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Every object name starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Immediate children (objects and sub-prefixes) below the directory
    /// `prefix`, as bare names, sorted. An empty prefix lists the bucket root.
    fn list_children(&self, prefix: &str) -> Result<Vec<String>>;

    /// Size of the object, `None` if it does not exist.
    fn size(&self, name: &str) -> Result<Option<u64>>;

    fn put(&self, local: &Path, name: &str, multipart: bool) -> Result<()>;

    fn get(&self, name: &str, local: &Path) -> Result<()>;

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.size(name)?.is_some())
    }

    /// True if `name` is an object or a non-empty directory prefix.
    fn path_exists(&self, name: &str) -> Result<bool> {
        if self.exists(name)? {
            return Ok(true);
        }
        Ok(!self.list(&dir_prefix(name))?.is_empty())
    }

    /// Writes are only logged.
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// `name` with exactly one trailing `/`, or empty for the root.
pub fn dir_prefix(name: &str) -> String {
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Start from the preferred part size and double it until the upload fits
/// in [`MAX_PART_COUNT`] parts.
pub fn determine_part_size(total_size: u64, preferred_size: u64) -> u64 {
    let mut part_size = preferred_size.max(1);
    while total_size.div_ceil(part_size) > MAX_PART_COUNT {
        part_size *= 2;
    }
    part_size
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
