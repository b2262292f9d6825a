//! The bounded queue of publishes awaiting transmission, and the sender task
//! that drains it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelError};
use crate::config::OverflowStrategy;
use crate::packet::{Packet, QoS};

/// Bounded FIFO of packets queued for delivery to the client.
///
/// Almost always PUBLISHes; control-packet responses are sent inline by the
/// session and never pass through here. The queue outlives any single
/// connection: packets left over when a connection dies are delivered by the
/// next run's sender task.
pub(crate) struct PendingQueue {
    packets: Mutex<VecDeque<Packet>>,
    /// Edge-triggered wake for the sender task. `Notify` stores at most one
    /// permit, so a burst of enqueues coalesces into a single wake.
    wake: Notify,
    max_pending: usize,
    strategy: OverflowStrategy,
    sent_packets: AtomicU64,
}

impl PendingQueue {
    pub fn new(max_pending: usize, strategy: OverflowStrategy) -> Self {
        PendingQueue {
            packets: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            max_pending,
            strategy,
            sent_packets: AtomicU64::new(0),
        }
    }

    /// Queue a packet, applying the overflow strategy when full.
    pub fn enqueue(&self, packet: Packet) {
        {
            let mut packets = self.packets.lock();

            if packets.len() >= self.max_pending {
                match self.strategy {
                    OverflowStrategy::DropNewMessage => {
                        tracing::trace!("pending queue full; dropping new packet");
                        return;
                    }
                    OverflowStrategy::DropOldestQueuedMessage => {
                        tracing::trace!("pending queue full; dropping oldest packet");
                        packets.pop_front();
                    }
                }
            }

            packets.push_back(packet);
        }

        self.wake.notify_one();
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    /// Best effort: a packet already popped by the sender is not recalled.
    pub fn clear(&self) {
        self.packets.lock().clear();
    }

    pub fn sent_packets(&self) -> u64 {
        self.sent_packets.load(Ordering::Relaxed)
    }

    /// The sender loop: pop, send, repeat; park on the wake signal when the
    /// queue is observed empty.
    ///
    /// A failed QoS > 0 PUBLISH is re-queued at the tail with its DUP flag
    /// set, preserving at-least-once delivery across the reconnect that
    /// `on_failure` (which stops the session uncleanly) will force.
    pub async fn drain(
        &self,
        channel: Arc<dyn Channel>,
        token: CancellationToken,
        on_failure: &(dyn Fn() + Send + Sync),
    ) {
        loop {
            // Checked before every pop so a failure-triggered stop aborts the
            // loop without further sends.
            if token.is_cancelled() {
                break;
            }

            let packet = self.packets.lock().pop_front();

            let Some(packet) = packet else {
                tokio::select! {
                    _ = self.wake.notified() => continue,
                    _ = token.cancelled() => break,
                }
            };

            match channel.send_packet(&packet, &token).await {
                Ok(()) => {
                    self.sent_packets.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    if e.is_cancellation() || token.is_cancelled() {
                        // Cooperative shutdown; whatever is still queued stays
                        // in memory for the session's next connection.
                        break;
                    }

                    match &e {
                        ChannelError::Timeout => {
                            tracing::warn!("timed out sending queued packet")
                        }
                        ChannelError::Io(e) => {
                            tracing::warn!("i/o failure sending queued packet: {e}")
                        }
                        ChannelError::Cancelled => unreachable!("handled above"),
                        other => tracing::error!("failed to send queued packet: {other}"),
                    }

                    if let Packet::Publish(mut publish) = packet {
                        if publish.qos > QoS::AtMostOnce {
                            publish.dup = true;
                            self.enqueue(Packet::Publish(publish));
                        }
                    }

                    on_failure();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PendingQueue;
    use crate::config::OverflowStrategy;
    use crate::packet::{Packet, Publish, QoS};
    use bytes::Bytes;

    fn publish(payload: &'static [u8]) -> Packet {
        Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "t".to_string(),
            pkid: 0,
            payload: Bytes::from_static(payload),
        })
    }

    fn payloads(queue: &PendingQueue) -> Vec<Bytes> {
        let mut out = Vec::new();

        while let Some(packet) = queue.packets.lock().pop_front() {
            let Packet::Publish(publish) = packet else {
                panic!("expected a publish");
            };
            out.push(publish.payload);
        }

        out
    }

    #[test]
    fn drop_new_keeps_the_prefix() {
        let queue = PendingQueue::new(2, OverflowStrategy::DropNewMessage);

        queue.enqueue(publish(b"p1"));
        queue.enqueue(publish(b"p2"));
        queue.enqueue(publish(b"p3"));

        assert_eq!(queue.len(), 2);
        assert_eq!(payloads(&queue), ["p1".as_bytes(), b"p2"]);
    }

    #[test]
    fn drop_oldest_keeps_the_suffix() {
        let queue = PendingQueue::new(2, OverflowStrategy::DropOldestQueuedMessage);

        queue.enqueue(publish(b"p1"));
        queue.enqueue(publish(b"p2"));
        queue.enqueue(publish(b"p3"));

        assert_eq!(queue.len(), 2);
        assert_eq!(payloads(&queue), ["p2".as_bytes(), b"p3"]);
    }

    #[test]
    fn clear_empties_the_queue() {
        let queue = PendingQueue::new(8, OverflowStrategy::DropNewMessage);

        queue.enqueue(publish(b"p1"));
        queue.enqueue(publish(b"p2"));
        queue.clear();

        assert_eq!(queue.len(), 0);
    }
}
