//! The framed duplex channel a session drives.
//!
//! Transport, TLS, and wire encoding live behind this trait; the session only
//! ever sees decoded [`Packet`]s. Implementations must serialize concurrent
//! `send_packet` calls internally: the session issues inline control-packet
//! sends from its receive loop while the pending-queue sender task drains
//! publishes on another task.

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::packet::Packet;

/// Negotiated MQTT protocol revision.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// MQTT 3.1
    V3,
    /// MQTT 3.1.1
    V4,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProtocolVersion::V3 => "3.1",
            ProtocolVersion::V4 => "3.1.1",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel operation timed out")]
    Timeout,

    #[error("i/o failure on channel")]
    Io(
        #[from]
        #[source]
        io::Error,
    ),

    /// Framing or protocol-level garbage from the peer.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// The session's cancellation token fired mid-operation.
    #[error("operation cancelled")]
    Cancelled,
}

impl ChannelError {
    /// Cooperative cancellation is an expected end-of-life signal,
    /// never logged or escalated.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ChannelError::Cancelled)
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Callbacks bracketing each packet read on the wire.
///
/// `read_started` fires when the first bytes of a packet arrive,
/// `read_completed` once the whole packet has been decoded. The session uses
/// them to pause keep-alive enforcement while a (possibly large) packet is
/// mid-transfer, so a slow read is not mistaken for a dead peer.
#[derive(Clone)]
pub struct ReadHooks {
    started: Hook,
    completed: Hook,
}

impl ReadHooks {
    pub fn new(
        started: impl Fn() + Send + Sync + 'static,
        completed: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        ReadHooks {
            started: Arc::new(started),
            completed: Arc::new(completed),
        }
    }

    pub fn read_started(&self) {
        (self.started)();
    }

    pub fn read_completed(&self) {
        (self.completed)();
    }
}

impl fmt::Debug for ReadHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadHooks").finish_non_exhaustive()
    }
}

/// A connected duplex pipe yielding decoded packets and accepting encoded ones.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Wait for the next packet.
    ///
    /// Returns `Ok(None)` on an orderly end of stream; errors are reserved
    /// for timeouts, I/O failures, and malformed input.
    async fn receive_packet(&self) -> Result<Option<Packet>, ChannelError>;

    /// Encode and send one packet, giving up when `cancel` fires.
    async fn send_packet(
        &self,
        packet: &Packet,
        cancel: &CancellationToken,
    ) -> Result<(), ChannelError>;

    /// Install (or with `None`, detach) the read-bracketing callbacks.
    fn set_read_hooks(&self, hooks: Option<ReadHooks>);

    /// Opaque description of the remote endpoint, for diagnostics.
    fn endpoint(&self) -> String;

    fn protocol_version(&self) -> ProtocolVersion;
}
