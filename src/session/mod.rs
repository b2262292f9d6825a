//! The per-client session engine.
//!
//! One [`Session`] exists per client known to the broker's registry. While a
//! client is connected, three cooperative tasks run on its behalf: the
//! receive loop inside [`run`](Session::run), the pending-queue sender, and
//! the keep-alive watch. A single [`CancellationToken`] created per run gates
//! all three; [`stop`](Session::stop) is the only thing that cancels it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelError, ProtocolVersion, ReadHooks};
use crate::client_id::ClientId;
use crate::config::{EnqueueContext, SessionOptions};
use crate::packet::{
    ApplicationMessage, Connect, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, Subscribe,
    SubscribeFilter, SubscribeReturnCode, Unsubscribe,
};
use crate::registry::SessionRegistry;
use crate::topic::Filter;

mod keep_alive;
mod packet_id;
mod queue;
mod subscriptions;

pub use keep_alive::KeepAlive;
pub use packet_id::{PacketId, PacketIdAllocator};

use keep_alive::KeepAliveMonitor;
use queue::PendingQueue;
use subscriptions::Subscriptions;

/// How a session ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DisconnectKind {
    /// The client sent DISCONNECT; the will is discarded.
    Clean,
    /// Anything else: I/O failure, protocol violation, keep-alive expiry,
    /// broker-side eviction. The will (if any) is published.
    NotClean,
}

/// Point-in-time diagnostic view of a session.
#[derive(Clone, Debug)]
pub struct SessionStatus {
    pub client_id: ClientId,
    pub is_connected: bool,
    pub endpoint: Option<String>,
    pub protocol_version: Option<ProtocolVersion>,
    pub pending_messages_count: usize,
    pub sent_packets_count: u64,
    pub last_packet_received: Option<SystemTime>,
    pub last_non_keep_alive_packet_received: Option<SystemTime>,
}

/// The server-side context for one client.
///
/// Owned by the registry and shared (via `Arc`) with the tasks spawned by
/// [`run`](Self::run). Outlives individual connections: subscriptions and
/// queued publishes carry over to the client's next connection.
pub struct Session {
    client_id: ClientId,
    registry: Arc<dyn SessionRegistry>,
    options: SessionOptions,

    subscriptions: Subscriptions,
    packet_ids: PacketIdAllocator,
    queue: PendingQueue,

    /// Connection-lifetime state, mutated only on lifecycle transitions.
    /// The lock is never held across an await.
    connected: Mutex<ConnectedState>,
    was_clean_disconnect: AtomicBool,
}

#[derive(Default)]
struct ConnectedState {
    channel: Option<Arc<dyn Channel>>,
    token: Option<CancellationToken>,
    /// Kept after disconnect so status can still report the last-seen
    /// timestamps.
    monitor: Option<KeepAliveMonitor>,
    will: Option<ApplicationMessage>,
}

impl Session {
    pub fn new(
        client_id: ClientId,
        registry: Arc<dyn SessionRegistry>,
        options: SessionOptions,
    ) -> Self {
        let queue = PendingQueue::new(
            options.config.max_pending_messages,
            options.config.overflow_strategy,
        );

        Session {
            client_id,
            registry,
            options,
            subscriptions: Subscriptions::default(),
            packet_ids: PacketIdAllocator::new(),
            queue,
            connected: Mutex::new(ConnectedState::default()),
            was_clean_disconnect: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.lock().channel.is_some()
    }

    /// Drive one connection of this client until it ends.
    ///
    /// Returns `true` if the client disconnected cleanly (DISCONNECT packet),
    /// `false` otherwise. No error escapes; failures are logged and folded
    /// into the unclean outcome.
    #[tracing::instrument(name = "Session::run", skip_all, fields(client_id = %self.client_id, endpoint = %channel.endpoint()))]
    pub async fn run(self: Arc<Self>, connect: Connect, channel: Arc<dyn Channel>) -> bool {
        let token = CancellationToken::new();

        let keep_alive = KeepAlive::from_seconds(connect.keep_alive)
            .clamp_to(KeepAlive::from_seconds(self.options.config.max_keep_alive));
        let monitor = KeepAliveMonitor::new(keep_alive);

        {
            let mut state = self.connected.lock();

            if state.channel.is_some() {
                tracing::warn!("session is already connected; refusing to run again");
                return false;
            }

            state.channel = Some(Arc::clone(&channel));
            state.token = Some(token.clone());
            state.monitor = Some(monitor.clone());
            state.will = connect.last_will.map(ApplicationMessage::from);
        }

        self.was_clean_disconnect.store(false, Ordering::Relaxed);

        // Pause the idle deadline while a packet is mid-transfer on the wire.
        channel.set_read_hooks(Some(ReadHooks::new(
            {
                let monitor = monitor.clone();
                move || monitor.pause()
            },
            {
                let monitor = monitor.clone();
                move || monitor.resume()
            },
        )));

        let sender_task = tokio::spawn({
            let session = Arc::clone(&self);
            let channel = Arc::clone(&channel);
            let token = token.clone();

            async move {
                let on_failure = {
                    let session = Arc::clone(&session);
                    move || session.stop(DisconnectKind::NotClean)
                };

                session.queue.drain(channel, token, &on_failure).await;
            }
        });

        let keep_alive_task = tokio::spawn({
            let session = Arc::clone(&self);
            let monitor = monitor.clone();
            let token = token.clone();

            async move {
                if monitor.watch(&token).await {
                    tracing::warn!(
                        client_id = %session.client_id,
                        "keep-alive expired; closing connection"
                    );
                    session.stop(DisconnectKind::NotClean);
                }
            }
        });

        self.receive_loop(&channel, &token, &monitor).await;

        // Every exit from the loop has stopped the session already, unless
        // the adapter reported a cancellation nobody asked for; the sender
        // and keep-alive tasks need the token cancelled either way.
        if !token.is_cancelled() {
            self.stop(DisconnectKind::NotClean);
        }

        // Teardown. The sender and keep-alive tasks observe the cancelled
        // token and wind down on their own; joining them keeps the "one
        // sender per session" invariant across an immediate reconnect.
        channel.set_read_hooks(None);

        {
            let mut state = self.connected.lock();
            state.channel = None;
            state.token = None;
        }

        let _ = sender_task.await;
        let _ = keep_alive_task.await;

        self.was_clean_disconnect.load(Ordering::Relaxed)
    }

    async fn receive_loop(
        &self,
        channel: &Arc<dyn Channel>,
        token: &CancellationToken,
        monitor: &KeepAliveMonitor,
    ) {
        loop {
            let packet = tokio::select! {
                _ = token.cancelled() => break,
                received = channel.receive_packet() => match received {
                    Ok(Some(packet)) => packet,
                    Ok(None) => {
                        // An EOF without a DISCONNECT first still publishes
                        // the will.
                        tracing::debug!("connection closed by remote peer");
                        self.stop(DisconnectKind::NotClean);
                        break;
                    }
                    Err(e) if e.is_cancellation() => break,
                    Err(e) => {
                        match e {
                            ChannelError::Timeout => tracing::warn!("receive timed out"),
                            ChannelError::Io(e) => tracing::warn!("receive failed: {e}"),
                            e => tracing::warn!("receive failed: {e}"),
                        }
                        self.stop(DisconnectKind::NotClean);
                        break;
                    }
                },
            };

            tracing::trace!(?packet, "received");
            monitor.packet_received(&packet);

            if let Err(e) = self.handle_packet(channel, token, packet).await {
                if !e.is_cancellation() {
                    tracing::warn!("failed to send response: {e}");
                    self.stop(DisconnectKind::NotClean);
                }
                break;
            }
        }
    }

    /// Dispatch one inbound packet.
    ///
    /// `Err` means an inline response could not be sent; protocol violations
    /// are handled internally by stopping the session.
    async fn handle_packet(
        &self,
        channel: &Arc<dyn Channel>,
        token: &CancellationToken,
        packet: Packet,
    ) -> Result<(), ChannelError> {
        match packet {
            Packet::Publish(publish) => {
                self.handle_publish(channel, token, publish).await?;
            }
            Packet::PingReq => {
                channel.send_packet(&Packet::PingResp, token).await?;
            }
            Packet::PubRel(pubrel) => {
                // Completes the receiver side of a QoS 2 exchange; the
                // message itself was dispatched when the PUBLISH arrived.
                channel
                    .send_packet(&Packet::PubComp(PubComp { pkid: pubrel.pkid }), token)
                    .await?;
            }
            Packet::PubRec(pubrec) => {
                channel
                    .send_packet(&Packet::PubRel(PubRel { pkid: pubrec.pkid }), token)
                    .await?;
            }
            Packet::PubAck(_) | Packet::PubComp(_) => {
                // Outbound QoS > 0 completion is not tracked; the pending
                // queue forgets a publish the moment it is written out.
                tracing::trace!(?packet, "discarding acknowledgement");
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(channel, token, subscribe).await?;
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(channel, token, unsubscribe).await?;
            }
            Packet::Disconnect => {
                tracing::debug!("client disconnected cleanly");
                self.stop(DisconnectKind::Clean);
            }
            Packet::Connect(_) => {
                // [MQTT-3.1.0-2]
                tracing::warn!("second CONNECT packet");
                self.stop(DisconnectKind::NotClean);
            }
            other => {
                tracing::warn!(packet = ?other, "received unsupported packet");
                self.stop(DisconnectKind::NotClean);
            }
        }

        Ok(())
    }

    async fn handle_publish(
        &self,
        channel: &Arc<dyn Channel>,
        token: &CancellationToken,
        publish: Publish,
    ) -> Result<(), ChannelError> {
        // A packet id must be present exactly for QoS > 0. [MQTT-2.3.1-5]
        if (publish.qos == QoS::AtMostOnce) != (publish.pkid == 0) {
            tracing::warn!(
                qos = publish.qos as u8,
                pkid = publish.pkid,
                "publish with mismatched QoS and packet id"
            );
            self.stop(DisconnectKind::NotClean);
            return Ok(());
        }

        // Fan out before acknowledging, so an observer of the ack can assume
        // the broadcast has begun. For QoS 2 this is method "B" of §4.3.3:
        // deliver on PUBLISH, then walk the PUBREC/PUBREL/PUBCOMP handshake.
        self.registry
            .enqueue_application_message(Some(&self.client_id), ApplicationMessage::from(&publish));

        match publish.qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                channel
                    .send_packet(
                        &Packet::PubAck(PubAck {
                            pkid: publish.pkid,
                        }),
                        token,
                    )
                    .await?;
            }
            QoS::ExactlyOnce => {
                channel
                    .send_packet(
                        &Packet::PubRec(PubRec {
                            pkid: publish.pkid,
                        }),
                        token,
                    )
                    .await?;
            }
        }

        Ok(())
    }

    async fn handle_subscribe(
        &self,
        channel: &Arc<dyn Channel>,
        token: &CancellationToken,
        subscribe: Subscribe,
    ) -> Result<(), ChannelError> {
        // [MQTT-3.8.3-3]
        if subscribe.filters.is_empty() {
            tracing::warn!("no filters in SUBSCRIBE");
            self.stop(DisconnectKind::NotClean);
            return Ok(());
        }

        let outcome = self.subscriptions.subscribe(
            subscribe.pkid,
            subscribe.filters,
            self.options.subscription_interceptor.as_deref(),
        );

        channel
            .send_packet(&Packet::SubAck(outcome.suback), token)
            .await?;

        if outcome.close_connection {
            tracing::debug!("subscription interceptor demanded connection close");
            self.stop(DisconnectKind::NotClean);
            return Ok(());
        }

        self.replay_retained(&outcome.accepted);

        Ok(())
    }

    async fn handle_unsubscribe(
        &self,
        channel: &Arc<dyn Channel>,
        token: &CancellationToken,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ChannelError> {
        let unsuback = self
            .subscriptions
            .unsubscribe(unsubscribe.pkid, unsubscribe.filters);

        channel.send_packet(&Packet::UnsubAck(unsuback), token).await
    }

    /// End the session.
    ///
    /// Idempotent: only the first call after (or during) a `run` takes
    /// effect. On a not-clean stop the will message, if one was registered at
    /// CONNECT, is published through the registry exactly once.
    pub fn stop(&self, kind: DisconnectKind) {
        let will = {
            let mut state = self.connected.lock();

            let Some(token) = &state.token else {
                return;
            };

            if token.is_cancelled() {
                return;
            }

            self.was_clean_disconnect
                .store(kind == DisconnectKind::Clean, Ordering::Relaxed);
            token.cancel();

            // Consumed either way; only published when the end wasn't clean.
            match (kind, state.will.take()) {
                (DisconnectKind::NotClean, will) => will,
                (DisconnectKind::Clean, _) => None,
            }
        };

        // Dispatch outside the state lock; the registry will re-enter other
        // sessions' (and possibly this session's) enqueue path.
        if let Some(will) = will {
            tracing::debug!(topic = will.topic, "publishing will message");
            self.registry
                .enqueue_application_message(Some(&self.client_id), will);
        }
    }

    /// Fan-out sink, invoked by the registry for every message that might
    /// concern this client.
    ///
    /// Non-blocking and reentrant; never fails outward, so one misbehaving
    /// recipient cannot break the broadcast.
    pub fn enqueue_application_message(
        &self,
        sender: Option<&ClientId>,
        mut message: ApplicationMessage,
    ) {
        let Some(effective_qos) = self.subscriptions.check(&message) else {
            return;
        };

        if let Some(interceptor) = self.options.enqueue_interceptor.as_deref() {
            let mut context = EnqueueContext {
                sender_client_id: sender,
                receiver_client_id: &self.client_id,
                message: &mut message,
                accept_enqueue: true,
            };

            // A panicking interceptor only takes this one session down,
            // not the registry's whole broadcast.
            let accepted = match catch_unwind(AssertUnwindSafe(|| {
                interceptor(&mut context);
                context.accept_enqueue
            })) {
                Ok(accepted) => accepted,
                Err(_) => {
                    tracing::error!(
                        client_id = %self.client_id,
                        "message queue interceptor panicked"
                    );
                    self.stop(DisconnectKind::NotClean);
                    return;
                }
            };

            if !accepted {
                tracing::trace!(topic = message.topic, "interceptor dropped delivery");
                return;
            }
        }

        let pkid = match effective_qos {
            QoS::AtMostOnce => 0,
            _ => self.packet_ids.allocate().get(),
        };

        self.queue
            .enqueue(Packet::Publish(message.into_publish(effective_qos, pkid)));
    }

    /// Server-initiated subscribe (admin APIs and the like); no SUBACK is
    /// involved, but retained messages replay exactly as for a client
    /// SUBSCRIBE.
    pub fn subscribe(&self, filters: Vec<SubscribeFilter>) -> Vec<SubscribeReturnCode> {
        let outcome = self.subscriptions.subscribe(
            0,
            filters,
            self.options.subscription_interceptor.as_deref(),
        );

        if outcome.close_connection {
            self.stop(DisconnectKind::NotClean);
        } else {
            self.replay_retained(&outcome.accepted);
        }

        outcome.suback.return_codes
    }

    /// Server-initiated unsubscribe.
    pub fn unsubscribe(&self, filters: Vec<String>) {
        self.subscriptions.unsubscribe(0, filters);
    }

    pub fn clear_pending_application_messages(&self) {
        self.queue.clear();
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.connected.lock();

        SessionStatus {
            client_id: self.client_id.clone(),
            is_connected: state.channel.is_some(),
            endpoint: state.channel.as_ref().map(|channel| channel.endpoint()),
            protocol_version: state
                .channel
                .as_ref()
                .map(|channel| channel.protocol_version()),
            pending_messages_count: self.queue.len(),
            sent_packets_count: self.queue.sent_packets(),
            last_packet_received: state
                .monitor
                .as_ref()
                .and_then(|monitor| monitor.last_packet_received()),
            last_non_keep_alive_packet_received: state
                .monitor
                .as_ref()
                .and_then(|monitor| monitor.last_non_keep_alive_packet_received()),
        }
    }

    fn replay_retained(&self, filters: &[Filter]) {
        if filters.is_empty() {
            return;
        }

        // Route retained messages through the normal enqueue path so they get
        // the same QoS downgrade and interception as live traffic.
        for message in self.registry.retained_messages(filters) {
            self.enqueue_application_message(None, message);
        }
    }
}
