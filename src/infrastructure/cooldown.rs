//! Shared cooldown clock
//!
//! A single "quiet until" instant shared by every remote call. Any caller may
//! push it further out; all callers wait it out before sending.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug)]
pub struct CooldownClock {
    until: Mutex<Instant>,
}

impl Default for CooldownClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CooldownClock {
    pub fn new() -> Self {
        Self {
            until: Mutex::new(Instant::now()),
        }
    }

    /// Forbid new calls for `duration` from now. Never shortens a cooldown
    /// that is already in effect: a later, shorter hint does not replace a
    /// longer one, unlike a plain overwrite of the deadline.
    pub fn declare(&self, duration: Duration) {
        let target = Instant::now() + duration;
        let mut until = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        if target > *until {
            *until = target;
            warn!("🧊 Remote cooldown declared for {:?}", duration);
        }
    }

    /// Time left before calls are allowed again
    pub fn remaining(&self) -> Duration {
        let until = *self.until.lock().unwrap_or_else(PoisonError::into_inner);
        until.saturating_duration_since(Instant::now())
    }

    /// Wait until the cooldown is over. Returns `false` if `cancel` fired
    /// first.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        loop {
            let until = *self.until.lock().unwrap_or_else(PoisonError::into_inner);
            if until <= Instant::now() {
                return true;
            }
            // the deadline may move while we sleep, so check again afterwards
            tokio::select! {
                () = sleep_until(until) => {}
                () = cancel.cancelled() => return false,
            }
        }
    }
}
