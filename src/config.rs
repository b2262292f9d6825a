//! Per-session tunables and server-side interceptor hooks.

use std::fmt;
use std::sync::Arc;

use crate::client_id::ClientId;
use crate::packet::{ApplicationMessage, QoS};

/// What to do with a new publish when a client's pending queue is full.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowStrategy {
    /// The incoming publish is silently discarded.
    #[default]
    DropNewMessage,
    /// The head of the queue is discarded to make room for the new packet.
    DropOldestQueuedMessage,
}

/// Plain-data session tunables; the embedding broker owns loading these
/// from its config file.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SessionConfig {
    /// Upper bound on publishes queued for delivery to one client.
    pub max_pending_messages: usize,

    pub overflow_strategy: OverflowStrategy,

    /// The maximum Keep Alive interval, in seconds.
    ///
    /// A client may request a nonzero interval smaller than this; a request of
    /// 0 (no timeout) is replaced by this value. Set to 0 to let the client
    /// choose freely, including no timeout at all.
    pub max_keep_alive: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_pending_messages: 250,
            overflow_strategy: OverflowStrategy::default(),
            max_keep_alive: 3600,
        }
    }
}

/// A SUBSCRIBE entry under review by the subscription interceptor.
///
/// The interceptor may lower (or raise) `qos`, clear `accept` to answer the
/// filter with a 0x80 return code, or set `close_connection` to tear the
/// whole connection down after the SUBACK is sent.
#[derive(Debug)]
pub struct SubscriptionRequest {
    pub filter: String,
    pub qos: QoS,
    pub accept: bool,
    pub close_connection: bool,
}

/// Context handed to the client-message-queue interceptor right before a
/// publish is queued for one receiving client.
///
/// The interceptor may mutate `message` in place or clear `accept_enqueue`
/// to drop the delivery for this receiver only.
pub struct EnqueueContext<'a> {
    /// The publishing client; `None` for broker-originated messages
    /// (retained replays, wills of anonymous origins).
    pub sender_client_id: Option<&'a ClientId>,
    pub receiver_client_id: &'a ClientId,
    pub message: &'a mut ApplicationMessage,
    pub accept_enqueue: bool,
}

pub type SubscriptionInterceptor = dyn Fn(&mut SubscriptionRequest) + Send + Sync;
pub type EnqueueInterceptor = dyn Fn(&mut EnqueueContext<'_>) + Send + Sync;

/// Everything a [`Session`](crate::session::Session) needs to be told at
/// construction: the plain config plus the optional server-side hooks.
#[derive(Clone, Default)]
pub struct SessionOptions {
    pub config: SessionConfig,
    pub subscription_interceptor: Option<Arc<SubscriptionInterceptor>>,
    pub enqueue_interceptor: Option<Arc<EnqueueInterceptor>>,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("config", &self.config)
            .field(
                "subscription_interceptor",
                &self.subscription_interceptor.is_some(),
            )
            .field("enqueue_interceptor", &self.enqueue_interceptor.is_some())
            .finish()
    }
}
