use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

use seqmirror_core::{
    is_valid_run_name, CompletionOracle, RunLayout, ShutdownSignal, DEFAULT_FILE_POLL,
    DEFAULT_LANE_COUNT, DEFAULT_SETTLE_WINDOW,
};
use seqmirror_store::ObjectStore;

use crate::engine::{RunProcessor, RunReport, RunSource};
use crate::transfer::Transferer;
use crate::INTEROP_RESYNC_EVERY;

#[derive(Debug, Clone)]
pub struct PullSettings {
    pub lane_count: u32,
    /// Delay between two looks at the store while waiting for an object.
    pub remote_poll: Duration,
    pub settle_window: Duration,
}

impl Default for PullSettings {
    fn default() -> Self {
        Self {
            lane_count: DEFAULT_LANE_COUNT,
            remote_poll: DEFAULT_FILE_POLL,
            settle_window: DEFAULT_SETTLE_WINDOW,
        }
    }
}

/// Top-level prefixes of the bucket that look like runs.
pub struct RemoteRunSource {
    store: Arc<dyn ObjectStore>,
}

impl RemoteRunSource {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

impl RunSource for RemoteRunSource {
    fn discover(&self) -> Result<Vec<String>> {
        let mut runs: Vec<String> = self
            .store
            .list_children("")?
            .into_iter()
            .filter(|name| is_valid_run_name(name))
            .collect();
        runs.sort();
        Ok(runs)
    }
}

/// Mirrors a run from the store into a local directory while it is still
/// being uploaded.
pub struct PullProcessor {
    dest_root: PathBuf,
    settings: PullSettings,
    transferer: Transferer,
    shutdown: Arc<ShutdownSignal>,
}

impl PullProcessor {
    /// `transferer` must be rooted at `dest_root`.
    pub fn new(
        dest_root: impl Into<PathBuf>,
        settings: PullSettings,
        transferer: Transferer,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            dest_root: dest_root.into(),
            settings,
            transferer,
            shutdown,
        }
    }

    /// Poll the store until `name` is an object or a non-empty prefix.
    fn await_remote(&self, name: &str) -> Result<()> {
        debug!(name, "waiting for remote object");
        loop {
            self.shutdown.check()?;
            match self.transferer.store().path_exists(name) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => warn!(name, error = %e, "remote check failed, polling again"),
            }
            self.shutdown.sleep(self.settings.remote_poll)?;
        }
    }

    fn await_and_pull_dir(&mut self, name: &str) -> Result<()> {
        self.await_remote(name)?;
        self.transferer.pull_prefix(name)
    }

    fn await_and_pull_file(&mut self, name: &str) -> Result<()> {
        self.await_remote(name)?;
        self.transferer.pull_file(name)
    }

    /// Nothing lands locally in a dry run, so the local copy cannot tell
    /// when the run is complete. Wait for the completion marker on the
    /// store instead and then list every object once.
    fn plan_dry_run(&mut self, run_id: &str, layout: &RunLayout) -> Result<()> {
        let marker = self.transferer.remote_name(&layout.run_completion_marker())?;
        self.await_remote(&marker)?;
        info!(run_id, "dry run: remote run complete, listing objects");
        self.transferer.pull_prefix(run_id)
    }

    fn report(&mut self, run_id: &str) -> Result<RunReport> {
        let unresolved = self.transferer.retry_failed()?;
        let stats = self.transferer.stats();
        Ok(RunReport {
            run_id: run_id.to_string(),
            transferred: stats.downloaded,
            skipped: stats.skipped,
            unresolved: unresolved.iter().map(|f| f.describe()).collect(),
        })
    }
}

impl RunProcessor for PullProcessor {
    fn process(&mut self, run_id: &str) -> Result<RunReport> {
        let layout = RunLayout::new(self.dest_root.join(run_id), self.settings.lane_count);
        self.transferer.begin_run();
        info!(run_id, dest = %layout.root().display(), "pulling run");
        if self.transferer.store().is_dry_run() {
            self.plan_dry_run(run_id, &layout)?;
            return self.report(run_id);
        }

        for dir in layout.static_dirs() {
            let name = self.transferer.remote_name(&dir)?;
            self.await_and_pull_dir(&name)?;
        }
        let run_info = self.transferer.remote_name(&layout.run_info_xml())?;
        self.await_and_pull_file(&run_info)?;
        if !layout.run_info_xml().exists() {
            return Err(anyhow!(
                "run_descriptor_missing: {} could not be downloaded",
                run_info
            ));
        }
        let cycles = layout.cycle_count()?;
        info!(run_id, cycles, "run descriptor downloaded");

        let interop = self.transferer.remote_name(&layout.interop_dir())?;
        let mut fetched = 0usize;
        for cycle in 1..=cycles {
            for lane in layout.lanes() {
                let set = layout.cycle_files(cycle, lane);
                for path in [set.data, set.index] {
                    let name = self.transferer.remote_name(&path)?;
                    self.await_and_pull_file(&name)?;
                    fetched += 1;
                    if fetched % INTEROP_RESYNC_EVERY == 0 {
                        self.transferer.pull_prefix(&interop)?;
                    }
                }
            }
        }
        for lane in layout.lanes() {
            for path in [
                layout.location_file(lane),
                layout.lane_index_file(lane),
                layout.filter_file(lane),
            ] {
                let name = self.transferer.remote_name(&path)?;
                self.await_and_pull_file(&name)?;
            }
        }

        let oracle = CompletionOracle::new(layout.clone(), self.settings.settle_window);
        loop {
            self.transferer.pull_prefix(run_id)?;
            if oracle.run_complete()? {
                break;
            }
            debug!(run_id, "local copy not complete yet");
            self.shutdown.sleep(self.settings.remote_poll)?;
        }

        self.report(run_id)
    }
}
