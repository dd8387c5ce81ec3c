//! Request/reply over the broker.

use crate::config::RpcClientConfig;
use crate::error::{RpcError, RpcResult};
use crate::protocol::ReplyBody;
use broker_transport::{Broker, Envelope, Headers, ReplyHandler, ReplyListener};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Issues a request on the broker and waits for the correlated reply.
///
/// Each call owns its correlation id and its reply destination, so
/// concurrent calls never observe each other's replies. Waiting suspends
/// only the calling task.
pub struct RpcClient<B> {
    broker: B,
    config: RpcClientConfig,
}

impl<B: Broker> RpcClient<B> {
    pub fn new(broker: B, config: RpcClientConfig) -> Self {
        Self { broker, config }
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.config
    }

    /// Call `target` with a JSON request and decode the result, waiting at
    /// most the configured reply timeout.
    pub async fn call<Req, Resp>(&self, target: &str, request: &Req) -> RpcResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.call_with_timeout(target, request, self.config.reply_timeout)
            .await
    }

    /// Like [`RpcClient::call`] with an explicit deadline.
    pub async fn call_with_timeout<Req, Resp>(
        &self,
        target: &str,
        request: &Req,
        reply_timeout: Duration,
    ) -> RpcResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.call_with_headers(target, request, Headers::new(), reply_timeout)
            .await
    }

    /// Typed call carrying extra request headers.
    pub async fn call_with_headers<Req, Resp>(
        &self,
        target: &str,
        request: &Req,
        headers: Headers,
        reply_timeout: Duration,
    ) -> RpcResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)
            .map_err(|e| RpcError::Serialization(format!("cannot encode request: {e}")))?;
        let body = self.call_raw(target, payload, headers, reply_timeout).await?;
        body.into_typed()
    }

    /// Send raw request bytes and return the decoded reply body.
    pub async fn call_raw(
        &self,
        target: &str,
        payload: Vec<u8>,
        headers: Headers,
        reply_timeout: Duration,
    ) -> RpcResult<ReplyBody> {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        // The listener must be live before the request is published, or a
        // fast responder's reply could be missed.
        let listener = self
            .broker
            .open_reply_listener(reply_slot(correlation_id.clone(), tx))
            .await?;

        let outcome = self
            .exchange(&listener, target, &correlation_id, payload, headers, rx, reply_timeout)
            .await;

        let destination = listener.destination().to_string();
        if let Err(e) = listener.close() {
            warn!(
                correlation_id = %correlation_id,
                destination = %destination,
                error = %e,
                "Failed to tear down reply listener"
            );
        }

        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &self,
        listener: &ReplyListener,
        target: &str,
        correlation_id: &str,
        payload: Vec<u8>,
        headers: Headers,
        rx: oneshot::Receiver<Envelope>,
        reply_timeout: Duration,
    ) -> RpcResult<ReplyBody> {
        let request = Envelope::new(payload)
            .with_correlation_id(correlation_id)
            .with_reply_to(listener.destination())
            .with_headers(headers);

        self.broker.publish(target, request).await?;
        info!(
            correlation_id = %correlation_id,
            operation = %target,
            state = "request_sent",
            reply_to = %listener.destination(),
            "RPC request sent"
        );

        match timeout(reply_timeout, rx).await {
            Ok(Ok(reply)) => {
                info!(
                    correlation_id = %correlation_id,
                    operation = %target,
                    state = "reply_received",
                    "RPC reply received"
                );
                ReplyBody::decode(&reply.payload)
            }
            Ok(Err(_)) => Err(RpcError::Transport(broker_transport::BrokerError::Closed(
                format!("reply listener for {correlation_id} closed before a reply arrived"),
            ))),
            Err(_) => {
                warn!(
                    correlation_id = %correlation_id,
                    operation = %target,
                    state = "timeout",
                    timeout_ms = reply_timeout.as_millis() as u64,
                    "RPC call timed out"
                );
                Err(RpcError::Timeout {
                    target: target.to_string(),
                    correlation_id: correlation_id.to_string(),
                    after: reply_timeout,
                })
            }
        }
    }
}

/// Reply handler that forwards the first envelope carrying
/// `correlation_id` into the one-shot slot and ignores everything else.
fn reply_slot(correlation_id: String, tx: oneshot::Sender<Envelope>) -> ReplyHandler {
    let slot = Arc::new(Mutex::new(Some(tx)));
    Arc::new(move |envelope: Envelope| {
        if envelope.correlation_id.as_deref() != Some(correlation_id.as_str()) {
            debug!(
                expected = %correlation_id,
                got = %envelope.correlation_label(),
                "Ignoring reply with foreign correlation id"
            );
            return;
        }

        let Some(tx) = slot.lock().take() else {
            debug!(correlation_id = %correlation_id, "Ignoring duplicate reply");
            return;
        };
        // The caller may already have timed out; a late reply is dropped.
        let _ = tx.send(envelope);
    })
}
