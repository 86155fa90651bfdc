use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{CoreError, Result};

const SLEEP_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    /// Stop discovering; the run in progress is still finished.
    Stopping,
    /// Abandon the run in progress as soon as the current step returns.
    ForceExit,
}

impl ShutdownState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Stopping => 1,
            Self::ForceExit => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Stopping,
            2 => Self::ForceExit,
            _ => Self::Running,
        }
    }
}

/// Cooperative shutdown flag shared by the producer, the consumer and every
/// wait they perform.
#[derive(Debug)]
pub struct ShutdownSignal {
    state: AtomicU8,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(ShutdownState::Running.as_u8()),
        }
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_stopping(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    pub fn is_force_exit(&self) -> bool {
        self.state() == ShutdownState::ForceExit
    }

    /// First request stops gracefully, any later one escalates to force exit.
    /// Returns the state after the transition.
    pub fn request_stop(&self) -> ShutdownState {
        match self.state.compare_exchange(
            ShutdownState::Running.as_u8(),
            ShutdownState::Stopping.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => ShutdownState::Stopping,
            Err(_) => {
                self.force_exit();
                ShutdownState::ForceExit
            }
        }
    }

    pub fn force_exit(&self) {
        if self
            .state
            .swap(ShutdownState::ForceExit.as_u8(), Ordering::AcqRel)
            != ShutdownState::ForceExit.as_u8()
        {
            warn!("forced shutdown requested, abandoning current work");
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.is_force_exit() {
            return Err(CoreError::Interrupted);
        }
        Ok(())
    }

    /// Sleep for `duration`, returning early with `Interrupted` on force exit.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    /// Sleep for `duration` unless any stop is requested first. Returns false
    /// when the sleep was cut short.
    pub fn sleep_while_running(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopping() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
