use color_eyre::eyre::{eyre, WrapErr};
pub use color_eyre::eyre::{Error, Result};
use tracing_subscriber::EnvFilter;

pub mod channel;
pub mod client_id;
pub mod config;
pub mod packet;
pub mod registry;
pub mod session;
pub mod topic;

pub use channel::{Channel, ChannelError, ProtocolVersion, ReadHooks};
pub use client_id::ClientId;
pub use config::{OverflowStrategy, SessionConfig, SessionOptions};
pub use packet::{ApplicationMessage, Packet, QoS};
pub use registry::SessionRegistry;
pub use session::{DisconnectKind, Session, SessionStatus};
pub use topic::Filter;

/// Install the process-wide error and log plumbing.
///
/// Intended for binaries and test harnesses embedding the engine; the engine
/// itself only emits `tracing` events and never touches the subscriber.
pub fn bootstrap() -> Result<()> {
    // `.env` is optional; only a present-but-unreadable file is fatal.
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(e) if e.not_found() => {}
        Err(e) => return Err(e).wrap_err("failed to load `.env`"),
    }

    color_eyre::install()?;

    let filter = EnvFilter::from_default_env();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| eyre!("failed to set the tracing subscriber: {e}"))?;

    Ok(())
}
