//! Keep-alive intervals and idle-connection enforcement.

use std::num::NonZeroU16;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::packet::Packet;

/// A client's Keep Alive interval, in whole seconds.
///
/// Zero seconds means the client opted out of idle enforcement.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KeepAlive(Option<NonZeroU16>);

impl KeepAlive {
    pub fn from_seconds(seconds: u16) -> KeepAlive {
        KeepAlive(NonZeroU16::new(seconds))
    }

    pub fn as_seconds(self) -> u16 {
        self.0.map_or(0, NonZeroU16::get)
    }

    /// The idle deadline this interval implies, or `None` when disabled.
    ///
    /// MQTT grants the client a grace period of one and a half Keep Alive
    /// periods before the server must drop the connection as if the network
    /// had failed [MQTT-3.1.2-24]. 1500 ms per second keeps the arithmetic
    /// in integers; a u16 of seconds cannot overflow it.
    pub fn timeout(self) -> Option<Duration> {
        let seconds = u64::from(self.as_seconds());

        (seconds > 0).then(|| Duration::from_millis(seconds * 1500))
    }

    /// Cap a client-requested interval by the broker-wide maximum.
    ///
    /// The maximum also substitutes for a request of zero, so opting out of
    /// keep-alive is only possible when the broker imposes no cap.
    pub fn clamp_to(self, max: KeepAlive) -> KeepAlive {
        let Some(max) = max.0 else {
            return self;
        };

        KeepAlive(Some(self.0.map_or(max, |requested| requested.min(max))))
    }
}

/// Watches the gap between inbound packets and flags the session as dead once
/// it exceeds the grace period.
///
/// Cloning yields another handle onto the same monitor; one clone runs
/// [`watch`](Self::watch) as a task while the session feeds timestamps in via
/// [`packet_received`](Self::packet_received) and the channel's read hooks
/// drive [`pause`](Self::pause)/[`resume`](Self::resume) around each wire
/// read.
#[derive(Clone)]
pub(crate) struct KeepAliveMonitor {
    shared: Arc<Shared>,
}

struct Shared {
    /// `None` disables enforcement entirely (Keep Alive of zero).
    timeout: Option<Duration>,
    /// How often the deadline is re-checked.
    check_interval: Duration,
    paused: AtomicBool,
    /// Nudges the watch task for an immediate re-check on resume.
    nudge: Notify,
    received: Mutex<Received>,
}

struct Received {
    /// Monotonic mark the deadline is measured from.
    deadline_mark: Instant,
    last_packet: Option<SystemTime>,
    last_non_keep_alive_packet: Option<SystemTime>,
}

impl KeepAliveMonitor {
    pub fn new(keep_alive: KeepAlive) -> Self {
        let check_interval = keep_alive
            .timeout()
            // Re-check twice per Keep Alive period, i.e. three times within
            // the 1.5x grace window.
            .map_or(Duration::from_secs(30), |_| {
                Duration::from_secs(u64::from(keep_alive.as_seconds())) / 2
            });

        Self::from_durations(keep_alive.timeout(), check_interval)
    }

    pub(crate) fn from_durations(timeout: Option<Duration>, check_interval: Duration) -> Self {
        KeepAliveMonitor {
            shared: Arc::new(Shared {
                timeout,
                check_interval,
                paused: AtomicBool::new(false),
                nudge: Notify::new(),
                received: Mutex::new(Received {
                    deadline_mark: Instant::now(),
                    last_packet: None,
                    last_non_keep_alive_packet: None,
                }),
            }),
        }
    }

    /// Record an inbound packet of any kind.
    pub fn packet_received(&self, packet: &Packet) {
        let mut received = self.shared.received.lock();

        received.deadline_mark = Instant::now();

        let now = SystemTime::now();
        received.last_packet = Some(now);

        if !packet.is_keep_alive_only() {
            received.last_non_keep_alive_packet = Some(now);
        }
    }

    /// Suspend deadline enforcement while a packet read is in progress.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Relaxed);
        // Let a stale deadline take effect now rather than a check interval
        // from now.
        self.shared.nudge.notify_one();
    }

    pub fn last_packet_received(&self) -> Option<SystemTime> {
        self.shared.received.lock().last_packet
    }

    pub fn last_non_keep_alive_packet_received(&self) -> Option<SystemTime> {
        self.shared.received.lock().last_non_keep_alive_packet
    }

    /// Run deadline enforcement until the connection dies or goes idle too
    /// long.
    ///
    /// Returns `true` if the keep-alive expired (the caller stops the session
    /// uncleanly), `false` on cooperative cancellation.
    pub async fn watch(&self, token: &CancellationToken) -> bool {
        let Some(timeout) = self.shared.timeout else {
            // No Keep Alive; nothing to enforce.
            token.cancelled().await;
            return false;
        };

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.shared.check_interval) => {}
                _ = self.shared.nudge.notified() => {}
                _ = token.cancelled() => return false,
            }

            if self.shared.paused.load(Ordering::Relaxed) {
                continue;
            }

            let deadline_mark = self.shared.received.lock().deadline_mark;

            if deadline_mark.elapsed() >= timeout {
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{KeepAlive, KeepAliveMonitor};
    use crate::packet::Packet;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn timeout_is_one_and_a_half_periods() {
        assert_eq!(
            KeepAlive::from_seconds(60).timeout(),
            Some(Duration::from_secs(90))
        );
        assert_eq!(KeepAlive::from_seconds(0).timeout(), None);
    }

    #[test]
    fn clamping() {
        let clamp = |secs, max| {
            KeepAlive::from_seconds(secs)
                .clamp_to(KeepAlive::from_seconds(max))
                .as_seconds()
        };

        assert_eq!(clamp(60, 3600), 60);
        assert_eq!(clamp(7200, 3600), 3600);
        // Zero (no timeout) is replaced by the maximum...
        assert_eq!(clamp(0, 3600), 3600);
        // ...unless the broker doesn't impose one.
        assert_eq!(clamp(0, 0), 0);
        assert_eq!(clamp(60, 0), 60);
    }

    #[tokio::test]
    async fn expires_when_idle() {
        let monitor = KeepAliveMonitor::from_durations(
            Some(Duration::from_millis(60)),
            Duration::from_millis(10),
        );
        let token = CancellationToken::new();

        assert!(monitor.watch(&token).await);
    }

    #[tokio::test]
    async fn packets_defer_the_deadline() {
        let monitor = KeepAliveMonitor::from_durations(
            Some(Duration::from_millis(80)),
            Duration::from_millis(10),
        );
        let token = CancellationToken::new();

        let watch = {
            let monitor = monitor.clone();
            let token = token.clone();
            tokio::spawn(async move { monitor.watch(&token).await })
        };

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            monitor.packet_received(&Packet::PingReq);
            assert!(!watch.is_finished());
        }

        token.cancel();
        assert!(!watch.await.unwrap());

        // PINGREQ counts for liveness but not for the application-traffic
        // timestamp.
        assert!(monitor.last_packet_received().is_some());
        assert!(monitor.last_non_keep_alive_packet_received().is_none());
    }

    #[tokio::test]
    async fn pausing_masks_a_slow_read() {
        let monitor = KeepAliveMonitor::from_durations(
            Some(Duration::from_millis(40)),
            Duration::from_millis(10),
        );
        let token = CancellationToken::new();

        monitor.pause();

        let watch = {
            let monitor = monitor.clone();
            let token = token.clone();
            tokio::spawn(async move { monitor.watch(&token).await })
        };

        // Well past the deadline, but the monitor is paused.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!watch.is_finished());

        // The "read" completes without yielding a packet; the stale deadline
        // is now enforced again.
        monitor.resume();
        assert!(watch.await.unwrap());
    }

    #[tokio::test]
    async fn zero_keep_alive_never_expires() {
        let monitor = KeepAliveMonitor::new(KeepAlive::from_seconds(0));
        let token = CancellationToken::new();

        let watch = {
            let monitor = monitor.clone();
            let token = token.clone();
            tokio::spawn(async move { monitor.watch(&token).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!watch.is_finished());

        token.cancel();
        assert!(!watch.await.unwrap());
    }
}
