//! The broker-wide collaborators a session talks back to.

use crate::client_id::ClientId;
use crate::packet::ApplicationMessage;
use crate::topic::Filter;

/// The sessions registry / router.
///
/// One per broker; it fans a published message out to every matching session
/// (by invoking that session's
/// [`enqueue_application_message`](crate::session::Session::enqueue_application_message))
/// and owns the retained message store.
pub trait SessionRegistry: Send + Sync {
    /// Dispatch `message` to every subscribed session and, when
    /// `message.retain` is set, update the retained store.
    ///
    /// `sender` is the publishing client, or `None` for broker-originated
    /// messages. Must not block: sessions call this from their receive loops
    /// and from [`stop`](crate::session::Session::stop) while delivering a
    /// will message.
    fn enqueue_application_message(&self, sender: Option<&ClientId>, message: ApplicationMessage);

    /// Retained messages whose topic matches any of `filters`.
    fn retained_messages(&self, filters: &[Filter]) -> Vec<ApplicationMessage>;
}
