//! Blocking waits on files the instrument is still producing.
//!
//! A file "existing" does not mean it is complete: the instrument creates it
//! and then keeps writing. Both waits therefore add one extra poll interval
//! after the file shows up. That settle delay is a timing heuristic, not a
//! content check; everything downstream relies on it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::layout::RunLayout;
use crate::shutdown::ShutdownSignal;

pub const DEFAULT_FILE_POLL: Duration = Duration::from_secs(10);
pub const DEFAULT_CYCLE_POLL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Availability {
    shutdown: Arc<ShutdownSignal>,
    file_interval: Duration,
    cycle_interval: Duration,
}

impl Availability {
    pub fn new(shutdown: Arc<ShutdownSignal>, file_interval: Duration, cycle_interval: Duration) -> Self {
        Self {
            shutdown,
            file_interval,
            cycle_interval,
        }
    }

    /// Poll until `path` exists, then sleep one more interval.
    pub fn await_path(&self, path: &Path, interval: Duration) -> Result<()> {
        debug!(path = %path.display(), "waiting for path");
        while !path.exists() {
            self.shutdown.sleep(interval)?;
        }
        self.shutdown.sleep(interval)?;
        debug!(path = %path.display(), "path appeared");
        Ok(())
    }

    pub fn await_file(&self, path: &Path) -> Result<()> {
        self.await_path(path, self.file_interval)
    }

    /// Poll until lane 1 of `cycle` exists. If lane 1 of the next cycle is
    /// not there yet the cycle may still be flushing, so sleep once more.
    pub fn await_cycle(&self, layout: &RunLayout, cycle: u32, interval: Duration) -> Result<()> {
        debug!(cycle, "waiting for cycle");
        let this_cycle = layout.cycle_data_file(cycle, 1);
        let next_cycle = layout.cycle_data_file(cycle + 1, 1);
        while !this_cycle.exists() {
            self.shutdown.sleep(interval)?;
        }
        if !next_cycle.exists() {
            self.shutdown.sleep(interval)?;
        }
        debug!(cycle, "cycle written");
        Ok(())
    }

    pub fn await_cycle_default(&self, layout: &RunLayout, cycle: u32) -> Result<()> {
        self.await_cycle(layout, cycle, self.cycle_interval)
    }
}
