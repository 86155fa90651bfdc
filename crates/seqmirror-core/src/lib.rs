//! Run-progress model for instrument output directories: where every file of
//! a run lives, when it is safe to read, in which order it appears, and when
//! the run is finished.

pub mod availability;
pub mod completion;
pub mod error;
pub mod history;
pub mod layout;
pub mod queue;
pub mod sequencer;
pub mod shutdown;

pub use availability::{Availability, DEFAULT_CYCLE_POLL, DEFAULT_FILE_POLL};
pub use completion::{CompletionOracle, CompletionStatus, DEFAULT_SETTLE_WINDOW};
pub use error::{CoreError, Result};
pub use history::{TransferHistory, FLAG_DONE, FLAG_KNOWN};
pub use layout::{
    is_valid_run_name, CycleFileSet, RunLayout, CYCLE_COUNT_UNKNOWN, DEFAULT_LANE_COUNT,
};
pub use queue::{QueueItem, WorkQueue, DISCOVERY_PRIORITY, SENTINEL_PRIORITY};
pub use sequencer::RunSequencer;
pub use shutdown::{ShutdownSignal, ShutdownState};

use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write through a sibling temp file and rename over the target.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
pub(crate) mod testutil {
    use chrono::Utc;
    use std::path::PathBuf;

    pub fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "seqmirror_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        std::fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }
}
