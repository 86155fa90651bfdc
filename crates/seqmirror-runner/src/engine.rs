//! Producer/consumer pair that turns discovered runs into finished mirrors.
//!
//! The producer rescans on a fixed interval and enqueues runs that are
//! neither in history nor already in flight. The consumer takes one run at a
//! time and drives it to completion before popping the next. Both share one
//! [`SyncEngine`]; nothing here is global.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use seqmirror_core::{
    ShutdownSignal, ShutdownState, TransferHistory, WorkQueue, DISCOVERY_PRIORITY,
};

use crate::{is_fatal, is_interrupted};

pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    InProgress,
}

/// Lists candidate run ids wherever runs appear.
pub trait RunSource: Send + Sync {
    fn discover(&self) -> Result<Vec<String>>;
}

/// Mirrors one run end to end.
pub trait RunProcessor: Send {
    fn process(&mut self, run_id: &str) -> Result<RunReport>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub transferred: usize,
    pub skipped: usize,
    /// Items still failing after the retry pass.
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineSummary {
    pub completed: Vec<String>,
    /// Forced shutdown abandoned a run.
    pub interrupted: bool,
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Shared {
    queue: WorkQueue,
    in_flight: Mutex<BTreeMap<String, RunState>>,
    history: Mutex<TransferHistory>,
    shutdown: Arc<ShutdownSignal>,
}

/// Cloneable view used by signal handlers and tests.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    /// Stop discovering and wake the consumer; a second call forces exit.
    pub fn request_stop(&self) -> ShutdownState {
        let state = self.shared.shutdown.request_stop();
        self.shared.queue.push_sentinel();
        state
    }

    pub fn shutdown(&self) -> &Arc<ShutdownSignal> {
        &self.shared.shutdown
    }

    pub fn run_state(&self, run_id: &str) -> Option<RunState> {
        lock_or_recover(&self.shared.in_flight).get(run_id).copied()
    }

    pub fn in_flight(&self) -> BTreeMap<String, RunState> {
        lock_or_recover(&self.shared.in_flight).clone()
    }

    pub fn is_done(&self, run_id: &str) -> bool {
        lock_or_recover(&self.shared.history).is_done(run_id)
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }
}

pub struct SyncEngine {
    shared: Arc<Shared>,
    rescan_interval: Duration,
}

/// Load history, or create it from what is already visible so that
/// pre-existing runs are left alone.
pub fn load_or_bootstrap_history(path: &Path, source: &dyn RunSource) -> Result<TransferHistory> {
    if path.exists() {
        return TransferHistory::load(path)
            .map_err(|e| anyhow!("history_unreadable: {}: {}", path.display(), e));
    }
    let existing = source.discover()?;
    Ok(TransferHistory::bootstrap(path, existing)?)
}

impl SyncEngine {
    pub fn new(
        history: TransferHistory,
        shutdown: Arc<ShutdownSignal>,
        rescan_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: WorkQueue::new(),
                in_flight: Mutex::new(BTreeMap::new()),
                history: Mutex::new(history),
                shutdown,
            }),
            rescan_interval,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// One discovery pass. Returns how many runs were enqueued.
    pub fn scan_once(&self, source: &dyn RunSource) -> Result<usize> {
        let candidates = source.discover()?;
        let history = lock_or_recover(&self.shared.history);
        let mut in_flight = lock_or_recover(&self.shared.in_flight);
        let mut enqueued = 0;
        for run_id in candidates {
            if history.contains(&run_id) || in_flight.contains_key(&run_id) {
                continue;
            }
            in_flight.insert(run_id.clone(), RunState::Queued);
            info!(run_id = %run_id, "new run queued");
            self.shared.queue.push(DISCOVERY_PRIORITY, run_id);
            enqueued += 1;
        }
        Ok(enqueued)
    }

    fn produce(&self, source: &dyn RunSource) {
        loop {
            match self.scan_once(source) {
                Ok(n) => debug!(enqueued = n, "scan finished"),
                Err(e) => warn!(error = %e, "scan failed, retrying on next interval"),
            }
            if !self.shared.shutdown.sleep_while_running(self.rescan_interval) {
                break;
            }
        }
        debug!("producer stopped");
    }

    fn set_state(&self, run_id: &str, state: Option<RunState>) {
        let mut in_flight = lock_or_recover(&self.shared.in_flight);
        match state {
            Some(state) => {
                in_flight.insert(run_id.to_string(), state);
            }
            None => {
                in_flight.remove(run_id);
            }
        }
    }

    fn finish_run(&self, report: &RunReport) {
        {
            let mut history = lock_or_recover(&self.shared.history);
            history.mark_done(&report.run_id);
            if let Err(e) = history.save() {
                error!(
                    path = %history.path().display(),
                    error = %e,
                    "failed to persist history"
                );
            }
        }
        self.set_state(&report.run_id, None);
        if !report.unresolved.is_empty() {
            error!(
                run_id = %report.run_id,
                files = ?report.unresolved,
                "run finished with transfers that never succeeded"
            );
        }
        info!(
            run_id = %report.run_id,
            transferred = report.transferred,
            skipped = report.skipped,
            "run mirrored"
        );
    }

    fn consume(&self, processor: &mut dyn RunProcessor) -> Result<EngineSummary> {
        let mut summary = EngineSummary::default();
        loop {
            let item = self.shared.queue.pop();
            let Some(run_id) = item.run_id else {
                debug!("stop sentinel received");
                break;
            };
            if self.shared.shutdown.is_stopping() {
                self.set_state(&run_id, None);
                continue;
            }
            self.set_state(&run_id, Some(RunState::InProgress));
            info!(run_id = %run_id, "run started");
            match processor.process(&run_id) {
                Ok(report) => {
                    self.finish_run(&report);
                    summary.completed.push(run_id);
                }
                Err(e) if is_interrupted(&e) => {
                    warn!(run_id = %run_id, "run abandoned by forced shutdown");
                    self.set_state(&run_id, None);
                    summary.interrupted = true;
                    break;
                }
                Err(e) if is_fatal(&e) => {
                    self.set_state(&run_id, None);
                    return Err(e);
                }
                Err(e) => {
                    // Left out of history: the next scan picks it up again.
                    error!(run_id = %run_id, error = %e, "run failed");
                    self.set_state(&run_id, None);
                }
            }
        }
        Ok(summary)
    }

    /// Run producer and consumer until the consumer sees the stop sentinel.
    pub fn run(
        &self,
        source: &dyn RunSource,
        processor: &mut dyn RunProcessor,
    ) -> Result<EngineSummary> {
        let result = thread::scope(|scope| {
            let producer = thread::Builder::new()
                .name("seqmirror-producer".to_string())
                .spawn_scoped(scope, move || self.produce(source))?;
            let consumer = match thread::Builder::new()
                .name("seqmirror-consumer".to_string())
                .spawn_scoped(scope, move || self.consume(processor))
            {
                Ok(consumer) => consumer,
                Err(e) => {
                    self.shared.shutdown.request_stop();
                    return Err(e.into());
                }
            };
            let outcome = consumer
                .join()
                .map_err(|_| anyhow!("consumer thread panicked"));
            // The producer only exits once a stop was requested.
            if !self.shared.shutdown.is_stopping() {
                self.shared.shutdown.request_stop();
            }
            producer
                .join()
                .map_err(|_| anyhow!("producer thread panicked"))?;
            outcome?
        });
        if let Ok(summary) = &result {
            info!(
                completed = summary.completed.len(),
                interrupted = summary.interrupted,
                "engine stopped"
            );
        }
        result
    }
}
