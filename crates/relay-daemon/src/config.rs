//! Configuration for the relay daemon.

use crate::error::{RelayError, RelayResult};
use broker_transport::RedisBrokerConfig;
use dead_letter_retry_scheduler::{backoff_delay, OperationRoute, RetrySchedulerConfig};
use idempotency_gate::GateConfig;
use std::time::Duration;
use sync_rpc_client::RpcClientConfig;

/// Relay configuration, static per deployment.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// How long an RPC caller waits for its reply
    pub rpc_timeout: Duration,

    /// Delay before the first retry of a dead-lettered message
    pub retry_base_delay: Duration,

    /// Retries before a message is quarantined
    pub max_retries: u32,

    /// Target receiving quarantined messages
    pub poison_target: String,

    /// Retention of idempotency records
    pub idempotency_ttl: Duration,

    /// Operations whose dead letters are retried
    pub routes: Vec<OperationRoute>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            rpc_timeout: Duration::from_secs(30),
            retry_base_delay: Duration::from_secs(5),
            max_retries: 3,
            poison_target: "poison".to_string(),
            idempotency_ttl: Duration::from_secs(86_400),
            routes: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RelayResult<Self> {
        let defaults = Self::default();

        let redis_url = lookup("REDIS_URL").unwrap_or(defaults.redis_url);
        let rpc_timeout = seconds(&lookup, "RELAY_RPC_TIMEOUT_SECS")?.unwrap_or(defaults.rpc_timeout);
        let retry_base_delay =
            seconds(&lookup, "RELAY_RETRY_BASE_DELAY_SECS")?.unwrap_or(defaults.retry_base_delay);
        let max_retries = number::<u32>(&lookup, "RELAY_MAX_RETRIES")?.unwrap_or(defaults.max_retries);
        let poison_target = lookup("RELAY_POISON_TARGET")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.poison_target);
        let idempotency_ttl =
            seconds(&lookup, "RELAY_IDEMPOTENCY_TTL_SECS")?.unwrap_or(defaults.idempotency_ttl);

        let routes = lookup("RELAY_OPERATIONS")
            .map(|list| parse_routes(&list, &lookup))
            .unwrap_or_default();

        Ok(Self {
            redis_url,
            rpc_timeout,
            retry_base_delay,
            max_retries,
            poison_target,
            idempotency_ttl,
            routes,
        })
    }

    pub fn scheduler_config(&self) -> RetrySchedulerConfig {
        RetrySchedulerConfig {
            base_delay: self.retry_base_delay,
            max_retries: self.max_retries,
            poison_target: self.poison_target.clone(),
            ..Default::default()
        }
    }

    /// Broker settings. Pending entries are only reclaimed once idle past
    /// the longest retry backoff, since the scheduler holds a dead letter
    /// unacknowledged for the whole delay.
    pub fn broker_config(&self) -> RedisBrokerConfig {
        let mut config = RedisBrokerConfig::new(self.redis_url.clone());
        let longest_hold = backoff_delay(self.retry_base_delay, self.max_retries).saturating_add(RECLAIM_MARGIN);
        let longest_hold_ms = u64::try_from(longest_hold.as_millis()).unwrap_or(u64::MAX);
        config.claim_idle_ms = config.claim_idle_ms.max(longest_hold_ms);
        config
    }

    pub fn rpc_config(&self) -> RpcClientConfig {
        RpcClientConfig::with_reply_timeout(self.rpc_timeout)
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            retention: self.idempotency_ttl,
        }
    }
}

/// Slack added to the longest backoff before a held entry counts as idle.
const RECLAIM_MARGIN: Duration = Duration::from_secs(30);

/// Name of the variable overriding `operation`'s dead-letter target:
/// `RELAY_DLQ_` followed by the upper-cased operation name with every
/// non-alphanumeric character replaced by `_`.
pub fn dead_letter_override_var(operation: &str) -> String {
    let suffix: String = operation
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("RELAY_DLQ_{suffix}")
}

/// Routes for a comma-separated operation list, applying any
/// [`dead_letter_override_var`] found through `lookup`.
pub fn parse_routes(list: &str, lookup: &impl Fn(&str) -> Option<String>) -> Vec<OperationRoute> {
    list.split(',')
        .map(str::trim)
        .filter(|op| !op.is_empty())
        .map(|op| {
            let route = OperationRoute::new(op);
            match lookup(&dead_letter_override_var(op)).filter(|s| !s.trim().is_empty()) {
                Some(target) => route.with_dead_letter_target(target),
                None => route,
            }
        })
        .collect()
}

fn number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> RelayResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| RelayError::Config(format!("{name}={raw:?} is not a valid number: {e}")))
        })
        .transpose()
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> RelayResult<Option<Duration>> {
    Ok(number::<u64>(lookup, name)?.map(Duration::from_secs))
}
