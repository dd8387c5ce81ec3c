//! Relay binary entry point.
//!
//! Usage:
//!   relay scheduler
//!   relay call <target> <json>
//!   relay inspect <operation> <correlation-id>

use anyhow::Context;
use broker_transport::{Headers, RedisBroker};
use clap::{Parser, Subcommand};
use observability::LogFormat;
use dead_letter_retry_scheduler::{PoisonLedger, PoisonMonitor, RetryScheduler};
use idempotency_gate::{idempotency_key, IdempotencyGate, RedisIdempotencyStore};
use relay_daemon::{parse_routes, RelayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sync_rpc_client::RpcClient;
use tracing::{error, info};

/// Relay: reliable request/reply, retry and quarantine over Redis Streams.
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "Synchronous calls, dead-letter retries and poison quarantine over a message broker")]
struct Args {
    /// Redis connection URL (overrides REDIS_URL).
    #[arg(long)]
    redis_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (json, compact)
    #[arg(long, env = "RELAY_LOG_FORMAT", default_value = "compact", value_parser = parse_log_format)]
    log_format: LogFormat,

    /// Also append JSON log lines to this file.
    #[arg(long, env = "RELAY_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dead-letter retry scheduler and the poison monitor.
    Scheduler {
        /// Comma-separated operations to serve (overrides RELAY_OPERATIONS).
        #[arg(long, value_delimiter = ',')]
        operations: Option<Vec<String>>,

        /// Retry base delay in seconds (overrides RELAY_RETRY_BASE_DELAY_SECS).
        #[arg(long)]
        base_delay_secs: Option<u64>,

        /// Retries before quarantine (overrides RELAY_MAX_RETRIES).
        #[arg(long)]
        max_retries: Option<u32>,

        /// Poison target (overrides RELAY_POISON_TARGET).
        #[arg(long)]
        poison_target: Option<String>,
    },

    /// Send one request and print the reply body.
    Call {
        /// Target to publish the request to.
        target: String,

        /// JSON request payload.
        json: String,

        /// Reply timeout in seconds (overrides RELAY_RPC_TIMEOUT_SECS).
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Print the idempotency record of one command.
    Inspect {
        operation: String,
        correlation_id: String,
    },
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    LogFormat::parse(value).ok_or_else(|| format!("unknown log format {value:?}, expected json or compact"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    observability::init_with_config(observability::LogConfig {
        service_name: "relay".into(),
        default_level: args.log_level.clone(),
        format: args.log_format,
        log_path: args.log_file.clone(),
        use_stderr: true,
    })
    .context("failed to initialize logging")?;

    let mut config = RelayConfig::from_env()?;
    if let Some(redis_url) = args.redis_url {
        config.redis_url = redis_url;
    }

    match args.command {
        Command::Scheduler {
            operations,
            base_delay_secs,
            max_retries,
            poison_target,
        } => {
            if let Some(operations) = operations {
                config.routes = parse_routes(&operations.join(","), &|name: &str| std::env::var(name).ok());
            }
            if let Some(secs) = base_delay_secs {
                config.retry_base_delay = Duration::from_secs(secs);
            }
            if let Some(max_retries) = max_retries {
                config.max_retries = max_retries;
            }
            if let Some(poison_target) = poison_target {
                config.poison_target = poison_target;
            }
            run_scheduler(config).await
        }
        Command::Call {
            target,
            json,
            timeout_secs,
        } => {
            if let Some(secs) = timeout_secs {
                config.rpc_timeout = Duration::from_secs(secs);
            }
            call(config, &target, &json).await
        }
        Command::Inspect {
            operation,
            correlation_id,
        } => inspect(config, &operation, &correlation_id).await,
    }
}

async fn connect(config: &RelayConfig) -> anyhow::Result<Arc<RedisBroker>> {
    let broker = RedisBroker::connect(config.broker_config())
        .await
        .with_context(|| format!("failed to connect to {}", config.redis_url))?;
    Ok(Arc::new(broker))
}

async fn run_scheduler(config: RelayConfig) -> anyhow::Result<()> {
    info!(
        redis_url = %config.redis_url,
        operations = config.routes.len(),
        base_delay_secs = config.retry_base_delay.as_secs(),
        max_retries = config.max_retries,
        poison_target = %config.poison_target,
        "Configuration loaded"
    );

    let broker = connect(&config).await?;
    let scheduler = RetryScheduler::new(broker.clone(), config.scheduler_config(), config.routes.clone())
        .start()
        .await?;
    let monitor = PoisonMonitor::new(broker, config.poison_target.clone(), Arc::new(PoisonLedger::default()))
        .start()
        .await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, exiting...");

    scheduler.shutdown().await;
    monitor.shutdown().await;
    Ok(())
}

async fn call(config: RelayConfig, target: &str, json: &str) -> anyhow::Result<()> {
    let request: serde_json::Value =
        serde_json::from_str(json).context("request payload is not valid JSON")?;
    let payload = serde_json::to_vec(&request)?;

    let client = RpcClient::new(connect(&config).await?, config.rpc_config());
    match client
        .call_raw(target, payload, Headers::new(), config.rpc_timeout)
        .await
    {
        Ok(reply) => {
            println!("{}", serde_json::to_string_pretty(&reply)?);
            Ok(())
        }
        Err(e) => {
            error!(target = %target, error = %e, "Call failed");
            Err(e.into())
        }
    }
}

async fn inspect(config: RelayConfig, operation: &str, correlation_id: &str) -> anyhow::Result<()> {
    let store = RedisIdempotencyStore::connect(&config.redis_url).await?;
    let gate = IdempotencyGate::new(store, config.gate_config());
    let key = idempotency_key(operation, correlation_id);

    match gate.lookup(&key).await? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!("{key}: absent"),
    }
    Ok(())
}
