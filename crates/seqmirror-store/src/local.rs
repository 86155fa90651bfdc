use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;
use walkdir::WalkDir;

use crate::{determine_part_size, dir_prefix, ObjectStore, Result, StoreError, DEFAULT_PART_SIZE};

const TEMP_MARKER: &str = ".seqmirror.part.";

/// Bucket kept as a directory tree: `<root>/<bucket>/<name>`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    bucket: String,
    bucket_dir: PathBuf,
    preferred_part_size: u64,
}

impl LocalStore {
    pub fn new(root: &Path, bucket: &str) -> Result<Self> {
        if bucket.is_empty() || bucket.contains('/') || bucket.contains('\\') {
            return Err(StoreError::Config(format!("invalid bucket name: '{}'", bucket)));
        }
        if !root.is_dir() {
            return Err(StoreError::Config(format!(
                "store root is not a directory: {}",
                root.display()
            )));
        }
        let bucket_dir = root.join(bucket);
        fs::create_dir_all(&bucket_dir)?;
        Ok(Self {
            bucket: bucket.to_string(),
            bucket_dir,
            preferred_part_size: DEFAULT_PART_SIZE,
        })
    }

    pub fn with_part_size(mut self, preferred_part_size: u64) -> Self {
        self.preferred_part_size = preferred_part_size;
        self
    }

    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        let mut path = self.bucket_dir.clone();
        for part in name.split('/').filter(|p| !p.is_empty()) {
            if part == "." || part == ".." {
                return Err(StoreError::Config(format!("invalid object name: {}", name)));
            }
            path.push(part);
        }
        Ok(path)
    }

    fn temp_sibling(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("object");
        path.with_file_name(format!(
            ".{}{}{}.{}",
            name,
            TEMP_MARKER,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    fn copy_in_parts(&self, src: &Path, dst: &Path) -> Result<()> {
        let total = fs::metadata(src)?.len();
        let part_size = determine_part_size(total, self.preferred_part_size);
        let mut reader = fs::File::open(src)?;
        let mut writer = fs::File::create(dst)?;
        let mut buf = vec![0u8; part_size.min(8 * 1024 * 1024) as usize];
        let mut offset = 0u64;
        let mut part_number = 1u64;
        while offset < total {
            let part_len = part_size.min(total - offset);
            let mut remaining = part_len;
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                reader.read_exact(&mut buf[..want])?;
                writer.write_all(&buf[..want])?;
                remaining -= want as u64;
            }
            debug!(part_number, part_len, "part written");
            offset += part_len;
            part_number += 1;
        }
        writer.sync_all()?;
        Ok(())
    }
}

fn is_temp(name: &str) -> bool {
    name.contains(TEMP_MARKER)
}

impl ObjectStore for LocalStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base_dir = match prefix.rfind('/') {
            Some(idx) => self.object_path(&prefix[..idx])?,
            None => self.bucket_dir.clone(),
        };
        if !base_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in WalkDir::new(&base_dir) {
            let entry = entry.map_err(|e| StoreError::Transient(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.bucket_dir) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if name.starts_with(prefix) && !is_temp(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn list_children(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.object_path(&dir_prefix(prefix))?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().to_string();
            if !is_temp(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn size(&self, name: &str) -> Result<Option<u64>> {
        match fs::metadata(self.object_path(name)?) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, local: &Path, name: &str, multipart: bool) -> Result<()> {
        let target = self.object_path(name)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = Self::temp_sibling(&target);
        let copied = if multipart {
            self.copy_in_parts(local, &tmp)
        } else {
            fs::copy(local, &tmp).map(|_| ()).map_err(StoreError::from)
        };
        if let Err(e) = copied {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn get(&self, name: &str, local: &Path) -> Result<()> {
        let source = self.object_path(name)?;
        if !source.is_file() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = Self::temp_sibling(local);
        if let Err(e) = fs::copy(&source, &tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        fs::rename(&tmp, local)?;
        Ok(())
    }
}
