use std::time::Duration;

/// Retry behavior attached to a `ScheduleActivity` command.
///
/// Retries are driven from workflow code: each failed attempt schedules a
/// backoff timer and re-issues the activity, so every attempt and every
/// backoff is captured in history.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryOptions {
    /// Retry up to `max_attempts` times with the default backoff curve
    /// (1s initial, doubling, capped at 60s).
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts, ..Self::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityOptions {
    pub retry: RetryOptions,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubWorkflowOptions {
    /// Instance ID for the child. Defaults to a deterministic derivation
    /// from the parent instance and the scheduling command.
    pub instance_id: Option<String>,
    pub version: String,
}
