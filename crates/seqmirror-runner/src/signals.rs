use std::thread;

use anyhow::{anyhow, Result};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};

use seqmirror_core::ShutdownState;

use crate::engine::EngineHandle;

fn signal_name(signal: i32) -> &'static str {
    match signal {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        _ => "signal",
    }
}

/// Route SIGINT/SIGTERM to the engine from a dedicated listener thread. The
/// first signal stops gracefully, the second forces exit.
pub fn install_signal_handlers(handle: EngineHandle) -> Result<thread::JoinHandle<()>> {
    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| anyhow!("signal_registration_failed: {}", e))?;
    let listener = thread::Builder::new()
        .name("seqmirror-signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                match handle.request_stop() {
                    ShutdownState::Stopping => info!(
                        signal = signal_name(signal),
                        "stop requested, finishing the current run; signal again to force exit"
                    ),
                    state => warn!(
                        signal = signal_name(signal),
                        state = ?state,
                        "forced shutdown requested"
                    ),
                }
            }
        })?;
    Ok(listener)
}
