//! Per-file transfer policy shared by push and pull.
//!
//! A file is skipped when the other side already holds the same number of
//! bytes, unless forced. Everything else is copied and the sizes compared
//! afterwards. Failures are recorded, not raised, so one bad file never
//! stops a run; the caller retries them once at the end with force on.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error, info};
use walkdir::WalkDir;

use seqmirror_core::ShutdownSignal;
use seqmirror_store::{ObjectStore, StoreError};

/// Something on the local side to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transferable {
    File(PathBuf),
    Directory(PathBuf),
}

impl Transferable {
    pub fn from_path(path: &Path) -> Self {
        if path.is_dir() {
            Transferable::Directory(path.to_path_buf())
        } else {
            Transferable::File(path.to_path_buf())
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Transferable::File(p) | Transferable::Directory(p) => p,
        }
    }
}

/// A transfer that failed on its last attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailedTransfer {
    Push(PathBuf),
    Pull(String),
}

impl FailedTransfer {
    pub fn describe(&self) -> String {
        match self {
            FailedTransfer::Push(path) => path.display().to_string(),
            FailedTransfer::Pull(name) => name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Copied,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub uploaded: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Transferer {
    store: Arc<dyn ObjectStore>,
    local_root: PathBuf,
    force: bool,
    multipart_threshold: u64,
    shutdown: Arc<ShutdownSignal>,
    failed: Vec<FailedTransfer>,
    stats: TransferStats,
}

impl Transferer {
    /// Object names are paths relative to `local_root` with `/` separators.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        local_root: impl Into<PathBuf>,
        force: bool,
        multipart_threshold: u64,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            store,
            local_root: local_root.into(),
            force,
            multipart_threshold,
            shutdown,
            failed: Vec::new(),
            stats: TransferStats::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn failed(&self) -> &[FailedTransfer] {
        &self.failed
    }

    /// Clear failures and counters before the next run.
    pub fn begin_run(&mut self) {
        self.failed.clear();
        self.stats = TransferStats::default();
    }

    pub fn remote_name(&self, path: &Path) -> Result<String> {
        let rel = path.strip_prefix(&self.local_root).map_err(|_| {
            anyhow::anyhow!(
                "path_outside_root: {} is not under {}",
                path.display(),
                self.local_root.display()
            )
        })?;
        Ok(rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"))
    }

    pub fn local_path(&self, name: &str) -> PathBuf {
        let mut path = self.local_root.clone();
        for part in name.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }

    /// Fatal store errors and forced shutdown propagate; anything else is
    /// recorded as a failure of this item. An item is listed at most once,
    /// and a later success takes it off the list.
    fn absorb(
        &mut self,
        attempt: std::result::Result<Outcome, StoreError>,
        item: FailedTransfer,
    ) -> Result<()> {
        match attempt {
            Ok(outcome) => {
                if outcome == Outcome::Skipped {
                    self.stats.skipped += 1;
                }
                self.failed.retain(|f| f != &item);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                error!(item = %item.describe(), error = %e, "transfer failed");
                self.stats.failed += 1;
                self.record_failure(item);
                Ok(())
            }
        }
    }

    fn record_failure(&mut self, item: FailedTransfer) {
        if !self.failed.contains(&item) {
            self.failed.push(item);
        }
    }

    pub fn push(&mut self, item: &Transferable) -> Result<()> {
        self.push_with(item, self.force)
    }

    fn push_with(&mut self, item: &Transferable, force: bool) -> Result<()> {
        match item {
            Transferable::File(path) => self.push_file_with(path, force),
            Transferable::Directory(dir) => {
                let files: Vec<PathBuf> = WalkDir::new(dir)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .map(|e| e.into_path())
                    .collect();
                debug!(dir = %dir.display(), files = files.len(), "sending directory");
                for file in files {
                    self.push_file_with(&file, force)?;
                }
                Ok(())
            }
        }
    }

    pub fn push_path(&mut self, path: &Path) -> Result<()> {
        self.push(&Transferable::from_path(path))
    }

    /// Send `dir` if it exists; a missing directory is not a failure.
    pub fn push_optional_dir(&mut self, dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "optional directory missing, skipped");
            return Ok(());
        }
        self.push(&Transferable::Directory(dir.to_path_buf()))
    }

    pub fn push_file(&mut self, path: &Path) -> Result<()> {
        self.push_file_with(path, self.force)
    }

    fn push_file_with(&mut self, path: &Path, force: bool) -> Result<()> {
        self.shutdown.check()?;
        let name = self.remote_name(path)?;
        let attempt = self.upload(path, &name, force);
        self.absorb(attempt, FailedTransfer::Push(path.to_path_buf()))
    }

    fn upload(
        &mut self,
        path: &Path,
        name: &str,
        force: bool,
    ) -> std::result::Result<Outcome, StoreError> {
        let local_size = fs::metadata(path)?.len();
        if !force && self.store.size(name)? == Some(local_size) {
            debug!(name, size = local_size, "already uploaded, skipped");
            return Ok(Outcome::Skipped);
        }
        let multipart = local_size > self.multipart_threshold;
        self.store.put(path, name, multipart)?;
        if !self.store.is_dry_run() {
            let remote = self.store.size(name)?.unwrap_or(0);
            if remote != local_size {
                return Err(StoreError::SizeMismatch {
                    name: name.to_string(),
                    local: local_size,
                    remote,
                });
            }
        }
        self.stats.uploaded += 1;
        info!(name, size = local_size, multipart, "uploaded");
        Ok(Outcome::Copied)
    }

    pub fn pull_file(&mut self, name: &str) -> Result<()> {
        self.pull_file_with(name, self.force)
    }

    fn pull_file_with(&mut self, name: &str, force: bool) -> Result<()> {
        self.shutdown.check()?;
        let attempt = self.download(name, force);
        self.absorb(attempt, FailedTransfer::Pull(name.to_string()))
    }

    fn download(&mut self, name: &str, force: bool) -> std::result::Result<Outcome, StoreError> {
        let local = self.local_path(name);
        let remote_size = self
            .store
            .size(name)?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let local_size = fs::metadata(&local).ok().map(|m| m.len());
        if !force && local_size == Some(remote_size) {
            debug!(name, size = remote_size, "already downloaded, skipped");
            return Ok(Outcome::Skipped);
        }
        self.store.get(name, &local)?;
        if !self.store.is_dry_run() {
            let got = fs::metadata(&local)?.len();
            if got != remote_size {
                return Err(StoreError::SizeMismatch {
                    name: name.to_string(),
                    local: got,
                    remote: remote_size,
                });
            }
        }
        self.stats.downloaded += 1;
        info!(name, size = remote_size, "downloaded");
        Ok(Outcome::Copied)
    }

    /// Download every object under the directory `prefix`.
    pub fn pull_prefix(&mut self, prefix: &str) -> Result<()> {
        let dir = seqmirror_store::dir_prefix(prefix);
        let names = match self.store.list(&dir) {
            Ok(names) => names,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                error!(prefix = %dir, error = %e, "listing failed");
                self.stats.failed += 1;
                self.record_failure(FailedTransfer::Pull(dir));
                return Ok(());
            }
        };
        self.failed.retain(|f| f != &FailedTransfer::Pull(dir.clone()));
        for name in names {
            self.pull_file(&name)?;
        }
        Ok(())
    }

    /// Attempt every failed item once more with force on. Returns what is
    /// still failing.
    pub fn retry_failed(&mut self) -> Result<Vec<FailedTransfer>> {
        let pending = std::mem::take(&mut self.failed);
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        info!(count = pending.len(), "retrying failed transfers");
        for item in pending {
            match item {
                FailedTransfer::Push(path) => {
                    self.push_with(&Transferable::from_path(&path), true)?
                }
                FailedTransfer::Pull(name) if name.ends_with('/') => {
                    let names = match self.store.list(&name) {
                        Ok(names) => names,
                        Err(e) if e.is_fatal() => return Err(e.into()),
                        Err(e) => {
                            error!(prefix = %name, error = %e, "listing failed again");
                            self.record_failure(FailedTransfer::Pull(name));
                            continue;
                        }
                    };
                    for n in names {
                        self.pull_file_with(&n, true)?;
                    }
                }
                FailedTransfer::Pull(name) => self.pull_file_with(&name, true)?,
            }
        }
        Ok(self.failed.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{scratch_dir, CountingStore};
    use seqmirror_store::LocalStore;

    fn transferer(store: Arc<dyn ObjectStore>, root: &Path, force: bool) -> Transferer {
        Transferer::new(store, root, force, 8, Arc::new(ShutdownSignal::new()))
    }

    #[test]
    fn unchanged_file_is_not_uploaded_twice() {
        let root = scratch_dir("transfer_idempotent");
        let src = root.join("src");
        let run = src.join("200101_NB501234_0001_AHXXXXXX");
        fs::create_dir_all(&run).expect("mkdir");
        fs::write(run.join("RunInfo.xml"), b"<RunInfo/>").expect("write");
        let store = Arc::new(CountingStore::new(
            LocalStore::new(&root, "bucket").expect("store"),
        ));

        let mut t = transferer(store.clone(), &src, false);
        t.push_file(&run.join("RunInfo.xml")).expect("first");
        assert_eq!(store.puts(), 1);
        t.push_file(&run.join("RunInfo.xml")).expect("second");
        assert_eq!(store.puts(), 1);
        assert_eq!(t.stats().uploaded, 1);
        assert_eq!(t.stats().skipped, 1);

        let mut forced = transferer(store.clone(), &src, true);
        forced.push_file(&run.join("RunInfo.xml")).expect("forced");
        assert_eq!(store.puts(), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn directories_are_walked_and_named_relative_to_root() {
        let root = scratch_dir("transfer_dir");
        let src = root.join("src");
        let interop = src.join("run_a").join("InterOp");
        fs::create_dir_all(interop.join("C1.1")).expect("mkdir");
        fs::write(interop.join("b.bin"), b"bb").expect("write");
        fs::write(interop.join("C1.1").join("a.bin"), b"a").expect("write");
        let bucket = LocalStore::new(&root, "bucket").expect("store");
        let store: Arc<dyn ObjectStore> = Arc::new(bucket);

        let mut t = transferer(store.clone(), &src, false);
        t.push_optional_dir(&interop).expect("dir");
        t.push_optional_dir(&src.join("run_a").join("Images")).expect("missing dir");
        assert_eq!(
            store.list("run_a/").expect("list"),
            vec!["run_a/InterOp/C1.1/a.bin", "run_a/InterOp/b.bin"]
        );
        assert!(t.failed().is_empty());
        assert!(t.remote_name(&root.join("elsewhere")).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_file_is_recorded_and_retried_with_force() {
        let root = scratch_dir("transfer_retry");
        let src = root.join("src");
        fs::create_dir_all(src.join("run_a")).expect("mkdir");
        let store = Arc::new(CountingStore::new(
            LocalStore::new(&root, "bucket").expect("store"),
        ));
        let late = src.join("run_a").join("late.txt");

        let mut t = transferer(store.clone(), &src, false);
        t.push_file(&late).expect("failure is absorbed");
        assert_eq!(t.failed(), &[FailedTransfer::Push(late.clone())]);
        assert_eq!(t.stats().failed, 1);

        fs::write(&late, b"now here").expect("write");
        let unresolved = t.retry_failed().expect("retry");
        assert!(unresolved.is_empty());
        assert_eq!(store.puts(), 1);
        assert_eq!(store.size("run_a/late.txt").expect("size"), Some(8));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn pull_skips_matching_local_copies() {
        let root = scratch_dir("transfer_pull");
        let bucket = LocalStore::new(&root, "bucket").expect("store");
        let seed = root.join("seed.txt");
        fs::write(&seed, b"0123456789").expect("write");
        bucket.put(&seed, "run_a/Config/x.cfg", false).expect("put");
        bucket.put(&seed, "run_a/Config/y.cfg", true).expect("put");
        let dest = root.join("dest");
        let store = Arc::new(CountingStore::new(bucket));

        let mut t = transferer(store.clone(), &dest, false);
        t.pull_prefix("run_a/Config").expect("pull");
        assert_eq!(store.gets(), 2);
        assert_eq!(fs::read(dest.join("run_a/Config/y.cfg")).expect("read"), b"0123456789");
        t.pull_prefix("run_a/Config/").expect("pull again");
        assert_eq!(store.gets(), 2);
        assert_eq!(t.stats().downloaded, 2);
        assert_eq!(t.stats().skipped, 2);

        t.pull_file("run_a/absent").expect("absorbed");
        assert_eq!(t.failed(), &[FailedTransfer::Pull("run_a/absent".to_string())]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn repeated_failures_are_listed_once_and_cleared_by_success() {
        let root = scratch_dir("transfer_dedupe");
        let bucket = LocalStore::new(&root, "bucket").expect("store");
        let dest = root.join("dest");
        let store: Arc<dyn ObjectStore> = Arc::new(bucket);
        let mut t = transferer(Arc::clone(&store), &dest, false);

        for _ in 0..3 {
            t.pull_file("run_a/late.bin").expect("absorbed");
            t.pull_file("run_a/gone.bin").expect("absorbed");
        }
        assert_eq!(
            t.failed(),
            &[
                FailedTransfer::Pull("run_a/late.bin".to_string()),
                FailedTransfer::Pull("run_a/gone.bin".to_string())
            ]
        );
        assert_eq!(t.stats().failed, 6);

        let seed = root.join("seed.bin");
        fs::write(&seed, b"late").expect("write");
        store.put(&seed, "run_a/late.bin", false).expect("put");
        t.pull_prefix("run_a").expect("pass");
        assert_eq!(t.failed(), &[FailedTransfer::Pull("run_a/gone.bin".to_string())]);

        let unresolved = t.retry_failed().expect("retry");
        assert_eq!(unresolved, vec![FailedTransfer::Pull("run_a/gone.bin".to_string())]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn forced_shutdown_stops_transfers() {
        let root = scratch_dir("transfer_interrupt");
        let src = root.join("src");
        fs::create_dir_all(src.join("run_a")).expect("mkdir");
        fs::write(src.join("run_a").join("f"), b"f").expect("write");
        let shutdown = Arc::new(ShutdownSignal::new());
        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalStore::new(&root, "bucket").expect("store"));
        let mut t = Transferer::new(store, &src, false, 8, Arc::clone(&shutdown));
        shutdown.force_exit();
        let err = t.push_file(&src.join("run_a").join("f")).expect_err("interrupted");
        assert!(crate::is_interrupted(&err));
        let _ = fs::remove_dir_all(root);
    }
}
