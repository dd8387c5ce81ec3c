//! Scheduler settings and per-operation routing.

use crate::error::{SchedulerError, SchedulerResult};
use std::collections::HashSet;
use std::time::Duration;

/// Suffix appended to an operation name to form its default dead-letter target.
pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

/// Retry policy and quarantine destination, static per deployment.
#[derive(Debug, Clone)]
pub struct RetrySchedulerConfig {
    /// Delay before the first retry; doubled for every further retry.
    pub base_delay: Duration,
    /// Retries allowed before a message is quarantined.
    pub max_retries: u32,
    /// Target receiving quarantined messages.
    pub poison_target: String,
    /// Maximum characters of payload quoted in alerts.
    pub preview_len: usize,
}

impl Default for RetrySchedulerConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_retries: 3,
            poison_target: "poison".to_string(),
            preview_len: 256,
        }
    }
}

/// Where one operation's requests and dead letters live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRoute {
    pub operation: String,
    pub request_target: String,
    pub dead_letter_target: String,
}

impl OperationRoute {
    /// Route whose request target is the operation name and whose dead
    /// letters go to `<operation>.dlq`.
    pub fn new(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        Self {
            request_target: operation.clone(),
            dead_letter_target: format!("{operation}{DEAD_LETTER_SUFFIX}"),
            operation,
        }
    }

    pub fn with_request_target(mut self, target: impl Into<String>) -> Self {
        self.request_target = target.into();
        self
    }

    pub fn with_dead_letter_target(mut self, target: impl Into<String>) -> Self {
        self.dead_letter_target = target.into();
        self
    }
}

/// Reject route sets the scheduler cannot run safely.
pub fn validate(config: &RetrySchedulerConfig, routes: &[OperationRoute]) -> SchedulerResult<()> {
    if config.poison_target.is_empty() {
        return Err(SchedulerError::Config("poison target must not be empty".into()));
    }
    if routes.is_empty() {
        return Err(SchedulerError::Config("at least one operation route is required".into()));
    }

    let mut dead_letter_targets = HashSet::new();
    for route in routes {
        if route.dead_letter_target == route.request_target {
            return Err(SchedulerError::Config(format!(
                "operation {} dead-letters into its own request target",
                route.operation
            )));
        }
        if route.dead_letter_target == config.poison_target || route.request_target == config.poison_target {
            return Err(SchedulerError::Config(format!(
                "operation {} is routed through the poison target {}",
                route.operation, config.poison_target
            )));
        }
        if !dead_letter_targets.insert(route.dead_letter_target.as_str()) {
            return Err(SchedulerError::Config(format!(
                "dead-letter target {} is shared by several operations",
                route.dead_letter_target
            )));
        }
    }
    Ok(())
}
