//! Redis Streams broker.
//!
//! Every target is a stream. Publishing is `XADD`, consuming is
//! `XREADGROUP` within a consumer group followed by `XACK`. Redis has no
//! native dead-lettering, so a rejected message is `XADD`ed to the queue's
//! dead-letter stream before it is acknowledged. Reply destinations are
//! short-lived `reply:<uuid>` streams read with a plain `XREAD BLOCK`.
//!
//! Entries a crashed consumer read but never acknowledged stay pending in
//! the group. Every consumer loop takes them over with `XAUTOCLAIM` once
//! they have been idle for [`RedisBrokerConfig::claim_idle_ms`], on start
//! and periodically after that.

use crate::broker::{
    Acknowledger, Broker, Delivery, DeliveryStream, ListenerTeardown, QueueOptions, ReplyHandler,
    ReplyListener,
};
use crate::envelope::{Envelope, Headers, HEADER_DEATH_REASON, HEADER_ORIGINAL_TARGET};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadReply};
use redis::{AsyncCommands, Client, Cmd, RedisResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Prefix of reply destination stream keys.
pub const REDIS_REPLY_PREFIX: &str = "reply:";

/// Seconds an unread reply stream survives after its listener is gone.
const REPLY_STREAM_TTL_SECS: i64 = 60;

/// Stream field carrying the JSON-encoded envelope metadata.
const FIELD_META: &str = "meta";

/// Stream field carrying the raw payload bytes.
const FIELD_PAYLOAD: &str = "payload";

/// Entries taken over per `XAUTOCLAIM` round trip.
const RECLAIM_BATCH: usize = 16;

/// Configuration for [`RedisBroker`].
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Consumer group shared by all relay instances
    pub consumer_group: String,
    /// Consumer name (unique per instance)
    pub consumer_name: String,
    /// XREADGROUP / XREAD block timeout in milliseconds
    pub block_timeout_ms: u64,
    /// Idle time in milliseconds after which a pending entry is reclaimed.
    /// Must exceed the longest time a consumer holds a delivery unsettled,
    /// retry backoffs included, or held entries are delivered twice.
    pub claim_idle_ms: u64,
}

impl RedisBrokerConfig {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            consumer_group: "relay".to_string(),
            consumer_name: format!("relay-{}", Uuid::new_v4()),
            block_timeout_ms: 5000,
            claim_idle_ms: 60_000,
        }
    }
}

/// Envelope fields other than the payload, as stored in the stream.
#[derive(Debug, Serialize, Deserialize)]
struct WireMeta {
    message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    #[serde(default)]
    headers: Headers,
    #[serde(default)]
    redelivered: bool,
}

fn encode_meta(envelope: &Envelope) -> BrokerResult<String> {
    Ok(serde_json::to_string(&WireMeta {
        message_id: envelope.message_id.clone(),
        correlation_id: envelope.correlation_id.clone(),
        reply_to: envelope.reply_to.clone(),
        headers: envelope.headers.clone(),
        redelivered: envelope.redelivered,
    })?)
}

fn decode_entry(entry: &StreamId) -> BrokerResult<Envelope> {
    let meta: String = entry
        .get(FIELD_META)
        .ok_or_else(|| BrokerError::Protocol(format!("entry {} missing {FIELD_META}", entry.id)))?;
    let payload: Vec<u8> = entry.get(FIELD_PAYLOAD).unwrap_or_default();
    let meta: WireMeta = serde_json::from_str(&meta)?;

    Ok(Envelope {
        message_id: meta.message_id,
        correlation_id: meta.correlation_id,
        reply_to: meta.reply_to,
        headers: meta.headers,
        payload,
        redelivered: meta.redelivered,
    })
}

async fn xadd(conn: &mut MultiplexedConnection, target: &str, envelope: &Envelope) -> BrokerResult<String> {
    let meta = encode_meta(envelope)?;
    let id: String = redis::cmd("XADD")
        .arg(target)
        .arg("*")
        .arg(FIELD_META)
        .arg(meta)
        .arg(FIELD_PAYLOAD)
        .arg(envelope.payload.as_slice())
        .query_async(conn)
        .await?;
    Ok(id)
}

/// `XGROUP CREATE` starting at the beginning of the stream, so entries
/// published before the group existed are still consumed.
fn create_group_cmd(stream_key: &str, group: &str) -> Cmd {
    let mut cmd = redis::cmd("XGROUP");
    cmd.arg("CREATE").arg(stream_key).arg(group).arg("0").arg("MKSTREAM");
    cmd
}

fn reclaim_cmd(config: &RedisBrokerConfig, stream_key: &str, cursor: &str) -> Cmd {
    let mut cmd = redis::cmd("XAUTOCLAIM");
    cmd.arg(stream_key)
        .arg(&config.consumer_group)
        .arg(&config.consumer_name)
        .arg(config.claim_idle_ms)
        .arg(cursor)
        .arg(StreamAutoClaimOptions::default().count(RECLAIM_BATCH));
    cmd
}

/// Redis Streams [`Broker`].
pub struct RedisBroker {
    client: Client,
    conn: MultiplexedConnection,
    config: RedisBrokerConfig,
    queues: Arc<Mutex<HashMap<String, QueueOptions>>>,
}

impl RedisBroker {
    /// Connect to Redis.
    pub async fn connect(config: RedisBrokerConfig) -> BrokerResult<Self> {
        let client = Client::open(config.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;

        info!(
            redis_url = %config.redis_url,
            group = %config.consumer_group,
            consumer = %config.consumer_name,
            "Connected Redis broker"
        );

        Ok(Self {
            client,
            conn,
            config,
            queues: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Ensure the consumer group exists on `stream_key`, creating it if necessary.
    async fn ensure_consumer_group(&self, stream_key: &str) -> BrokerResult<()> {
        let result: RedisResult<()> = create_group_cmd(stream_key, &self.config.consumer_group)
            .query_async(&mut self.conn.clone())
            .await;

        match result {
            Ok(()) => {
                info!(stream = %stream_key, group = %self.config.consumer_group, "Created consumer group");
                Ok(())
            }
            // BUSYGROUP means the group already exists
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %stream_key, group = %self.config.consumer_group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn declare_queue(&self, target: &str, options: QueueOptions) -> BrokerResult<()> {
        self.ensure_consumer_group(target).await?;
        if let Some(dlq) = &options.dead_letter_target {
            self.ensure_consumer_group(dlq).await?;
        }
        self.queues.lock().insert(target.to_string(), options);
        Ok(())
    }

    async fn publish(&self, target: &str, envelope: Envelope) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let id = xadd(&mut conn, target, &envelope).await?;

        if target.starts_with(REDIS_REPLY_PREFIX) {
            let _: bool = conn.expire(target, REPLY_STREAM_TTL_SECS).await?;
        }

        debug!(
            target = %target,
            entry_id = %id,
            correlation_id = %envelope.correlation_label(),
            "Published message"
        );
        Ok(())
    }

    async fn consume(&self, target: &str) -> BrokerResult<DeliveryStream> {
        self.ensure_consumer_group(target).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = ConsumeLoop {
            client: self.client.clone(),
            conn: self.client.get_multiplexed_async_connection().await?,
            ack_conn: self.conn.clone(),
            config: self.config.clone(),
            queues: self.queues.clone(),
            target: target.to_string(),
        };
        tokio::spawn(worker.run(tx));

        Ok(DeliveryStream::new(rx))
    }

    async fn open_reply_listener(&self, handler: ReplyHandler) -> BrokerResult<ReplyListener> {
        let destination = format!("{REDIS_REPLY_PREFIX}{}", Uuid::new_v4());
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let block_ms = self.config.block_timeout_ms;
        let key = destination.clone();

        // The listener reads from id 0, so a reply published before the first
        // XREAD is still observed.
        let task = tokio::spawn(async move {
            let mut last_id = "0".to_string();
            loop {
                let reply: RedisResult<Option<StreamReadReply>> = redis::cmd("XREAD")
                    .arg("BLOCK")
                    .arg(block_ms)
                    .arg("STREAMS")
                    .arg(&key)
                    .arg(&last_id)
                    .query_async(&mut conn)
                    .await;

                match reply {
                    Ok(Some(reply)) => {
                        for entry in reply.keys.iter().flat_map(|k| k.ids.iter()) {
                            last_id = entry.id.clone();
                            match decode_entry(entry) {
                                Ok(envelope) => handler(envelope),
                                Err(e) => warn!(destination = %key, error = %e, "Undecodable reply entry"),
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(destination = %key, error = %e, "Reply listener read failed");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        });

        Ok(ReplyListener::new(
            destination.clone(),
            Box::new(RedisTeardown {
                task,
                conn: self.conn.clone(),
                destination,
            }),
        ))
    }
}

struct RedisTeardown {
    task: JoinHandle<()>,
    conn: MultiplexedConnection,
    destination: String,
}

impl ListenerTeardown for RedisTeardown {
    fn teardown(self: Box<Self>) -> BrokerResult<()> {
        self.task.abort();

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BrokerError::Closed(format!("cannot delete {}: {e}", self.destination)))?;
        let mut conn = self.conn;
        let destination = self.destination;
        runtime.spawn(async move {
            let result: RedisResult<i64> = conn.del(&destination).await;
            if let Err(e) = result {
                warn!(destination = %destination, error = %e, "Failed to delete reply stream");
            }
        });
        Ok(())
    }
}

struct ConsumeLoop {
    client: Client,
    conn: MultiplexedConnection,
    ack_conn: MultiplexedConnection,
    config: RedisBrokerConfig,
    queues: Arc<Mutex<HashMap<String, QueueOptions>>>,
    target: String,
}

impl ConsumeLoop {
    async fn run(mut self, tx: mpsc::UnboundedSender<Delivery>) {
        info!(stream = %self.target, consumer = %self.config.consumer_name, "Starting stream consumer");

        let reclaim_every = Duration::from_millis(self.config.claim_idle_ms);
        let mut last_reclaim: Option<Instant> = None;

        loop {
            if last_reclaim.map_or(true, |at| at.elapsed() >= reclaim_every) {
                last_reclaim = Some(Instant::now());
                match self.reclaim_idle(&tx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(stream = %self.target, "Consumer dropped, stopping stream consumer");
                        return;
                    }
                    Err(e) => warn!(stream = %self.target, error = %e, "Failed to reclaim idle entries"),
                }
            }

            let reply: RedisResult<Option<StreamReadReply>> = redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(&self.config.consumer_group)
                .arg(&self.config.consumer_name)
                .arg("COUNT")
                .arg(16)
                .arg("BLOCK")
                .arg(self.config.block_timeout_ms)
                .arg("STREAMS")
                .arg(&self.target)
                .arg(">")
                .query_async(&mut self.conn)
                .await;

            let reply = match reply {
                Ok(Some(reply)) => reply,
                Ok(None) => {
                    if tx.is_closed() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(stream = %self.target, error = %e, "Redis error, attempting to reconnect...");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    match self.client.get_multiplexed_async_connection().await {
                        Ok(conn) => self.conn = conn,
                        Err(reconnect_err) => {
                            error!(error = %reconnect_err, "Failed to reconnect to Redis");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                    continue;
                }
            };

            for entry in reply.keys.iter().flat_map(|k| k.ids.iter()) {
                if !self.dispatch(&tx, entry, false).await {
                    info!(stream = %self.target, "Consumer dropped, stopping stream consumer");
                    return;
                }
            }
        }
    }

    /// Take over every entry of the group idle for longer than
    /// `claim_idle_ms`. `Ok(false)` once the consumer is gone.
    async fn reclaim_idle(&mut self, tx: &mpsc::UnboundedSender<Delivery>) -> BrokerResult<bool> {
        let mut cursor = "0-0".to_string();
        loop {
            let reply: StreamAutoClaimReply = reclaim_cmd(&self.config, &self.target, &cursor)
                .query_async(&mut self.conn)
                .await?;

            if !reply.claimed.is_empty() {
                info!(stream = %self.target, count = reply.claimed.len(), "Reclaimed idle pending entries");
            }
            for entry in &reply.claimed {
                if !self.dispatch(tx, entry, true).await {
                    return Ok(false);
                }
            }

            if reply.next_stream_id == "0-0" {
                return Ok(true);
            }
            cursor = reply.next_stream_id;
        }
    }

    /// Hand one entry to the consumer. `false` once the consumer is gone.
    async fn dispatch(&self, tx: &mpsc::UnboundedSender<Delivery>, entry: &StreamId, reclaimed: bool) -> bool {
        let acknowledger = Arc::new(RedisAcknowledger {
            conn: self.ack_conn.clone(),
            group: self.config.consumer_group.clone(),
            stream: self.target.clone(),
            entry_id: entry.id.clone(),
            queues: self.queues.clone(),
        });

        let mut envelope = match decode_entry(entry) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(stream = %self.target, entry_id = %entry.id, error = %e, "Undecodable entry, acknowledging");
                if let Err(ack_err) = acknowledger.xack().await {
                    warn!(error = %ack_err, "Failed to acknowledge undecodable entry");
                }
                return true;
            }
        };
        envelope.redelivered |= reclaimed;

        tx.send(Delivery::new(envelope, self.target.as_str(), acknowledger)).is_ok()
    }
}

struct RedisAcknowledger {
    conn: MultiplexedConnection,
    group: String,
    stream: String,
    entry_id: String,
    queues: Arc<Mutex<HashMap<String, QueueOptions>>>,
}

impl RedisAcknowledger {
    async fn xack(&self) -> BrokerResult<()> {
        let acked: i64 = self
            .conn
            .clone()
            .xack(&self.stream, &self.group, &[&self.entry_id])
            .await?;
        if acked != 1 {
            warn!(stream = %self.stream, entry_id = %self.entry_id, "XACK returned {}, entry may not exist", acked);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for RedisAcknowledger {
    async fn ack(&self, _envelope: &Envelope) -> BrokerResult<()> {
        self.xack().await
    }

    async fn reject(&self, envelope: &Envelope, requeue: bool) -> BrokerResult<()> {
        let mut conn = self.conn.clone();

        if requeue {
            let mut again = envelope.clone();
            again.redelivered = true;
            xadd(&mut conn, &self.stream, &again).await?;
            return self.xack().await;
        }

        let dead_letter_target = self
            .queues
            .lock()
            .get(&self.stream)
            .and_then(|options| options.dead_letter_target.clone());

        match dead_letter_target {
            Some(dlq) => {
                let mut dead = envelope.clone();
                dead.redelivered = false;
                dead.set_header_if_absent(HEADER_ORIGINAL_TARGET, self.stream.as_str());
                dead.set_header(HEADER_DEATH_REASON, "rejected");
                xadd(&mut conn, &dlq, &dead).await?;
                debug!(
                    source = %self.stream,
                    dead_letter_target = %dlq,
                    correlation_id = %envelope.correlation_label(),
                    "Dead-lettered rejected message"
                );
            }
            None => warn!(
                source = %self.stream,
                correlation_id = %envelope.correlation_label(),
                "Rejected message has no dead-letter target, dropping"
            ),
        }

        self.xack().await
    }

    fn release(&self, envelope: &Envelope) {
        // Left pending in the group; a consumer loop reclaims it once idle.
        debug!(
            stream = %self.stream,
            entry_id = %self.entry_id,
            correlation_id = %envelope.correlation_label(),
            "Unsettled delivery dropped, left pending for reclaim"
        );
    }
}
