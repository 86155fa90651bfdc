use std::fs;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::Result;
use crate::layout::{RunLayout, CYCLE_COUNT_UNKNOWN};

/// Time the completion marker must have existed before the run is treated as
/// finished. Absorbs late final writes; it is policy, not proof.
pub const DEFAULT_SETTLE_WINDOW: Duration = Duration::from_secs(300);

const DATA_FILE_SUFFIX: &str = ".bcl.bgzf";

#[derive(Debug, Clone, Serialize)]
pub struct CompletionStatus {
    pub run_id: String,
    pub cycle_count: Option<u32>,
    pub data_files: usize,
    pub expected_data_files: Option<u64>,
    pub sequencing_finished: bool,
    pub all_files_present: bool,
    pub run_complete: bool,
}

/// Verdicts about a run computed from what is on disk right now.
#[derive(Debug, Clone)]
pub struct CompletionOracle {
    layout: RunLayout,
    settle_window: Duration,
}

impl CompletionOracle {
    pub fn new(layout: RunLayout, settle_window: Duration) -> Self {
        Self {
            layout,
            settle_window,
        }
    }

    /// RTA-complete marker present and every read-complete marker found
    /// exists. The number of read markers is not compared with the reads in
    /// the descriptor.
    pub fn sequencing_finished(&self) -> Result<bool> {
        if !self.layout.rta_complete_marker().exists() {
            return Ok(false);
        }
        Ok(self
            .layout
            .read_complete_markers()?
            .iter()
            .all(|marker| marker.exists()))
    }

    pub fn all_files_present(&self) -> Result<bool> {
        if !self.layout.run_info_xml().exists() {
            return Ok(false);
        }
        for lane in self.layout.lanes() {
            let lane_files = [
                self.layout.location_file(lane),
                self.layout.filter_file(lane),
                self.layout.lane_index_file(lane),
            ];
            if !lane_files.iter().all(|p| p.exists()) {
                return Ok(false);
            }
        }
        let cycles = self.layout.cycle_count()?;
        for lane in self.layout.lanes() {
            for cycle in 1..=cycles {
                let set = self.layout.cycle_files(cycle, lane);
                if !set.data.exists() || !set.index.exists() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Base-call data files currently under the base-call directory.
    pub fn data_file_count(&self) -> usize {
        let basecalls = self.layout.basecall_dir();
        if !basecalls.exists() {
            return 0;
        }
        WalkDir::new(basecalls)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.file_name().to_string_lossy().ends_with(DATA_FILE_SUFFIX))
            .count()
    }

    pub fn run_complete(&self) -> Result<bool> {
        self.run_complete_at(SystemTime::now())
    }

    /// Completion marker present, data file count matches lanes x cycles,
    /// and the marker is at least one settle window old at `now`.
    pub fn run_complete_at(&self, now: SystemTime) -> Result<bool> {
        let marker = self.layout.run_completion_marker();
        let metadata = match fs::metadata(&marker) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("completion marker not found, run not finished");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if !self.layout.run_info_xml().exists() {
            debug!("run descriptor not found, run not finished");
            return Ok(false);
        }
        let cycles = self.layout.cycle_count()?;
        let expected = u64::from(self.layout.lane_count()) * u64::from(cycles);
        let found = self.data_file_count() as u64;
        if found != expected {
            debug!(found, expected, "data file count does not match cycle count");
            return Ok(false);
        }
        let created = metadata.created().or_else(|_| metadata.modified())?;
        let age = now.duration_since(created).unwrap_or(Duration::ZERO);
        if age < self.settle_window {
            debug!(
                age_secs = age.as_secs(),
                settle_secs = self.settle_window.as_secs(),
                "run finished, waiting for settle window"
            );
            return Ok(false);
        }
        Ok(true)
    }

    pub fn status(&self) -> Result<CompletionStatus> {
        let cycle_count = match self.layout.cycle_count()? {
            CYCLE_COUNT_UNKNOWN => None,
            n => Some(n),
        };
        Ok(CompletionStatus {
            run_id: self.layout.run_id(),
            cycle_count,
            data_files: self.data_file_count(),
            expected_data_files: cycle_count
                .map(|c| u64::from(c) * u64::from(self.layout.lane_count())),
            sequencing_finished: self.sequencing_finished()?,
            all_files_present: self.all_files_present()?,
            run_complete: self.run_complete()?,
        })
    }

    /// All three verdicts together: the run can be sent in one pass.
    pub fn fully_finished(&self) -> Result<bool> {
        Ok(self.sequencing_finished()? && self.all_files_present()? && self.run_complete()?)
    }
}
