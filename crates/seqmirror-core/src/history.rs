use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::atomic_write_json_pretty;
use crate::error::Result;

pub const FLAG_KNOWN: u8 = 0;
pub const FLAG_DONE: u8 = 1;

/// Persisted map of run id to completion flag. Rewritten whole on every save.
#[derive(Debug, Clone)]
pub struct TransferHistory {
    path: PathBuf,
    entries: BTreeMap<String, u8>,
}

impl TransferHistory {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let entries: BTreeMap<String, u8> = serde_json::from_slice(&fs::read(path)?)?;
        let done = entries.values().filter(|flag| **flag == FLAG_DONE).count();
        info!(
            path = %path.display(),
            known = entries.len(),
            done,
            "history loaded"
        );
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// First start: record everything already present as known-but-not-ours
    /// so it is never picked up, and persist straight away.
    pub fn bootstrap<I, S>(path: &Path, existing: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut history = Self::empty(path);
        for name in existing {
            history.entries.insert(name.into(), FLAG_KNOWN);
        }
        info!(
            path = %path.display(),
            known = history.entries.len(),
            "no history found, existing entries marked as known"
        );
        history.save()?;
        Ok(history)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, run_id: &str) -> Option<u8> {
        self.entries.get(run_id).copied()
    }

    pub fn set(&mut self, run_id: &str, flag: u8) {
        self.entries.insert(run_id.to_string(), flag);
    }

    pub fn mark_done(&mut self, run_id: &str) {
        self.set(run_id, FLAG_DONE);
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.entries.contains_key(run_id)
    }

    pub fn is_done(&self, run_id: &str) -> bool {
        self.get(run_id) == Some(FLAG_DONE)
    }

    pub fn done_runs(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, flag)| **flag == FLAG_DONE)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self) -> Result<()> {
        let value = serde_json::to_value(&self.entries)?;
        atomic_write_json_pretty(&self.path, &value)
    }
}
