//! Per-request timeout bookkeeping.
//!
//! The tracker owns the timer tasks but not what happens when they fire: the
//! caller supplies a `schedule` closure that spawns the timer and reports
//! expiry back with the epoch it was armed under. A stale epoch means the timer
//! was re-armed or cleared after it fired.

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::types::{ProtocolError, ProtocolResult};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(60_000);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutConfig {
    pub timeout: Duration,
    pub max_total_timeout: Option<Duration>,
    pub reset_on_progress: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            max_total_timeout: None,
            reset_on_progress: false,
        }
    }
}

struct TimeoutEntry {
    started: Instant,
    config: TimeoutConfig,
    epoch: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
pub(crate) struct TimeoutTracker {
    entries: HashMap<i64, TimeoutEntry>,
    next_epoch: u64,
}

impl TimeoutTracker {
    fn bump(&mut self) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        epoch
    }

    /// Arm the timer for `id`, replacing any previous one.
    pub fn start<F>(&mut self, id: i64, config: TimeoutConfig, schedule: F)
    where
        F: FnOnce(u64, Duration) -> JoinHandle<()>,
    {
        let epoch = self.bump();
        let timer = schedule(epoch, config.timeout);
        if let Some(old) = self.entries.insert(
            id,
            TimeoutEntry {
                started: Instant::now(),
                config,
                epoch,
                timer,
            },
        ) {
            old.timer.abort();
        }
    }

    pub fn resets_on_progress(&self, id: i64) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|entry| entry.config.reset_on_progress)
    }

    /// Re-arm the timer for `id`. Returns `Ok(false)` when nothing is tracked.
    ///
    /// Fails once the total time since the call started reaches the maximum;
    /// the entry is dropped in that case.
    pub fn reset<F>(&mut self, id: i64, schedule: F) -> ProtocolResult<bool>
    where
        F: FnOnce(u64, Duration) -> JoinHandle<()>,
    {
        let Some(entry) = self.entries.get(&id) else {
            return Ok(false);
        };
        let elapsed = entry.started.elapsed();
        if let Some(max) = entry.config.max_total_timeout {
            if elapsed >= max {
                self.clear(id);
                return Err(ProtocolError::MaxTotalTimeoutExceeded {
                    max_total_timeout_ms: max.as_millis() as u64,
                    total_elapsed_ms: elapsed.as_millis() as u64,
                });
            }
        }

        let epoch = self.bump();
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.timer.abort();
            entry.epoch = epoch;
            entry.timer = schedule(epoch, entry.config.timeout);
        }
        Ok(true)
    }

    /// Claim an expiry. Returns the configured timeout when `epoch` is still
    /// current, and stops tracking `id`.
    pub fn expire(&mut self, id: i64, epoch: u64) -> Option<Duration> {
        match self.entries.get(&id) {
            Some(entry) if entry.epoch == epoch => {
                self.entries.remove(&id).map(|entry| entry.config.timeout)
            }
            _ => None,
        }
    }

    pub fn clear(&mut self, id: i64) {
        if let Some(entry) = self.entries.remove(&id) {
            entry.timer.abort();
        }
    }

    pub fn clear_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.timer.abort();
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.entries.contains_key(&id)
    }
}
