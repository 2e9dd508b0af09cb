//! Configuration loading and resolution.

use std::str::FromStr;

use taskwire::{ProtocolOptions, DEFAULT_TASK_POLL_INTERVAL_MS};

pub const POLL_INTERVAL_ENV: &str = "TASKWIRE_POLL_INTERVAL_MS";
pub const MAX_QUEUE_SIZE_ENV: &str = "TASKWIRE_MAX_QUEUE_SIZE";
pub const TASK_TTL_ENV: &str = "TASKWIRE_TASK_TTL_MS";

/// Server settings after flags, environment and defaults are merged.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Poll interval advertised on created tasks.
    pub poll_interval_ms: u64,
    /// Cap on queued side-channel messages per task.
    pub max_queue_size: Option<usize>,
    /// Ttl for tasks whose creator did not ask for one.
    pub task_ttl_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_TASK_POLL_INTERVAL_MS,
            max_queue_size: None,
            task_ttl_ms: None,
        }
    }
}

impl ServerConfig {
    /// Explicit values win, then the process environment, then defaults.
    pub fn resolve(
        poll_interval_ms: Option<u64>,
        max_queue_size: Option<usize>,
        task_ttl_ms: Option<u64>,
    ) -> Self {
        Self::resolve_with(poll_interval_ms, max_queue_size, task_ttl_ms, |name| {
            std::env::var(name).ok()
        })
    }

    /// Same as [`ServerConfig::resolve`] with a custom environment lookup.
    pub fn resolve_with(
        poll_interval_ms: Option<u64>,
        max_queue_size: Option<usize>,
        task_ttl_ms: Option<u64>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            poll_interval_ms: poll_interval_ms
                .or_else(|| from_env(&env, POLL_INTERVAL_ENV))
                .unwrap_or(defaults.poll_interval_ms),
            max_queue_size: max_queue_size.or_else(|| from_env(&env, MAX_QUEUE_SIZE_ENV)),
            task_ttl_ms: task_ttl_ms.or_else(|| from_env(&env, TASK_TTL_ENV)),
        }
    }

    /// Apply the queue and polling settings to protocol options.
    pub fn apply(&self, options: ProtocolOptions) -> ProtocolOptions {
        let options = options.with_default_task_poll_interval(self.poll_interval_ms);
        match self.max_queue_size {
            Some(size) => options.with_max_task_queue_size(size),
            None => options,
        }
    }
}

fn from_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = env(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {name}={raw:?}: not a valid number");
            None
        }
    }
}
