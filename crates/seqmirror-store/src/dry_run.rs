use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::{ObjectStore, Result};

/// Reads go to the wrapped store; writes are logged and dropped.
pub struct DryRunStore {
    inner: Arc<dyn ObjectStore>,
}

impl DryRunStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }
}

impl ObjectStore for DryRunStore {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn list_children(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_children(prefix)
    }

    fn size(&self, name: &str) -> Result<Option<u64>> {
        self.inner.size(name)
    }

    fn put(&self, local: &Path, name: &str, multipart: bool) -> Result<()> {
        info!(
            local = %local.display(),
            bucket = self.inner.bucket(),
            name,
            multipart,
            "dry run: skipping upload"
        );
        Ok(())
    }

    fn get(&self, name: &str, local: &Path) -> Result<()> {
        info!(
            bucket = self.inner.bucket(),
            name,
            local = %local.display(),
            "dry run: skipping download"
        );
        Ok(())
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}
