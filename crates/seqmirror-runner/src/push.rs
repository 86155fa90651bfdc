use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use seqmirror_core::{
    is_valid_run_name, Availability, CompletionOracle, RunLayout, RunSequencer, ShutdownSignal,
    DEFAULT_CYCLE_POLL, DEFAULT_FILE_POLL, DEFAULT_LANE_COUNT, DEFAULT_SETTLE_WINDOW,
};

use crate::engine::{RunProcessor, RunReport, RunSource};
use crate::transfer::Transferer;
use crate::INTEROP_RESYNC_EVERY;

#[derive(Debug, Clone)]
pub struct PushSettings {
    pub lane_count: u32,
    pub file_poll: Duration,
    pub cycle_poll: Duration,
    pub settle_window: Duration,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            lane_count: DEFAULT_LANE_COUNT,
            file_poll: DEFAULT_FILE_POLL,
            cycle_poll: DEFAULT_CYCLE_POLL,
            settle_window: DEFAULT_SETTLE_WINDOW,
        }
    }
}

/// Run directories directly below the instrument output root.
pub struct LocalRunSource {
    root: PathBuf,
}

impl LocalRunSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl RunSource for LocalRunSource {
    fn discover(&self) -> Result<Vec<String>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if is_valid_run_name(&name) && entry.path().is_dir() {
                runs.push(name);
            }
        }
        runs.sort();
        Ok(runs)
    }
}

/// Sends a local run to the store while the instrument is still writing it.
pub struct PushProcessor {
    source_root: PathBuf,
    settings: PushSettings,
    waits: Availability,
    transferer: Transferer,
}

impl PushProcessor {
    /// `transferer` must be rooted at `source_root` so object names start
    /// with the run id.
    pub fn new(
        source_root: impl Into<PathBuf>,
        settings: PushSettings,
        transferer: Transferer,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        let waits = Availability::new(shutdown, settings.file_poll, settings.cycle_poll);
        Self {
            source_root: source_root.into(),
            settings,
            waits,
            transferer,
        }
    }

    fn await_and_push(&mut self, path: &Path) -> Result<()> {
        self.waits.await_file(path)?;
        self.transferer.push_path(path)
    }

    fn push_dynamic(&mut self, layout: &RunLayout) -> Result<()> {
        for dir in layout.dynamic_dirs() {
            self.transferer.push_optional_dir(&dir)?;
        }
        Ok(())
    }

    fn push_live(&mut self, layout: &RunLayout) -> Result<()> {
        for dir in layout.static_dirs() {
            self.await_and_push(&dir)?;
        }
        let sequencer = RunSequencer::new(layout.clone(), self.waits.clone());
        for (sent, path) in sequencer.enumerate() {
            let path = path?;
            self.transferer.push_path(&path)?;
            if (sent + 1) % INTEROP_RESYNC_EVERY == 0 {
                self.push_dynamic(layout)?;
            }
        }
        for dir in layout.non_critical_dirs() {
            self.transferer.push_optional_dir(&dir)?;
        }
        self.push_dynamic(layout)
    }
}

impl RunProcessor for PushProcessor {
    fn process(&mut self, run_id: &str) -> Result<RunReport> {
        let layout = RunLayout::new(self.source_root.join(run_id), self.settings.lane_count);
        let oracle = CompletionOracle::new(layout.clone(), self.settings.settle_window);
        self.transferer.begin_run();

        if oracle.fully_finished()? {
            info!(run_id, "run already finished, sending it in one pass");
            self.transferer.push_path(layout.root())?;
        } else {
            info!(run_id, lanes = layout.lane_count(), "following live run");
            self.push_live(&layout)?;
        }

        let unresolved = self.transferer.retry_failed()?;
        let marker = layout.run_completion_marker();
        self.waits.await_file(&marker)?;
        debug!(run_id, "sending completion marker last");
        self.transferer.push_file(&marker)?;

        let stats = self.transferer.stats();
        Ok(RunReport {
            run_id: run_id.to_string(),
            transferred: stats.uploaded,
            skipped: stats.skipped,
            unresolved: unresolved.iter().map(|f| f.describe()).collect(),
        })
    }
}
