//! Mirror orchestration: discovery, the producer/consumer engine, and the
//! push and pull flows that walk a run in instrument order.

pub mod config;
pub mod engine;
pub mod pull;
pub mod push;
pub mod signals;
pub mod transfer;

pub use config::{validate_store, MirrorConfig, StoreConfig};
pub use engine::{
    load_or_bootstrap_history, EngineHandle, EngineSummary, RunProcessor, RunReport, RunSource,
    RunState, SyncEngine, DEFAULT_RESCAN_INTERVAL,
};
pub use pull::{PullProcessor, PullSettings, RemoteRunSource};
pub use push::{LocalRunSource, PushProcessor, PushSettings};
pub use signals::install_signal_handlers;
pub use transfer::{FailedTransfer, Transferable, Transferer, TransferStats};

use seqmirror_core::CoreError;
use seqmirror_store::StoreError;

/// Number of sequenced files between two re-sends of the InterOp directory.
pub const INTEROP_RESYNC_EVERY: usize = 16;

/// True when `err` came from a forced shutdown.
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    err.downcast_ref::<CoreError>()
        .is_some_and(CoreError::is_interrupted)
}

/// True when `err` is a storage configuration problem that retrying will
/// not fix.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<StoreError>()
        .is_some_and(StoreError::is_fatal)
}
