//! The decoded MQTT control packet model.
//!
//! The channel adapter owns the wire form; everything above it works with
//! these types. The shapes follow MQTT 3.1.1 §3 with the fixed-header flags
//! (`dup`, `qos`, `retain`) folded into the packet structs.

use bytes::Bytes;

/// MQTT Quality of Service level.
///
/// Ordered so that `min`/`max` implement the delivery downgrade rule directly.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    /// Map a wire-level QoS value; values above 2 are a protocol violation.
    pub fn from_u8(value: u8) -> Option<QoS> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// A decoded MQTT control packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// PINGREQ keeps the connection alive but carries no application traffic,
    /// so diagnostics track it separately.
    pub fn is_keep_alive_only(&self) -> bool {
        matches!(self, Packet::PingReq)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    /// Keep Alive interval in seconds; 0 disables the idle timeout.
    pub keep_alive: u16,
    pub clean_session: bool,
    pub last_will: Option<LastWill>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// 0 when no identifier is present (QoS 0).
    pub pkid: u16,
    pub payload: Bytes,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PubAck {
    pub pkid: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PubRec {
    pub pkid: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PubRel {
    pub pkid: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PubComp {
    pub pkid: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

/// Per-filter SUBACK return code: the granted QoS, or 0x80 on rejection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub filters: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnsubAck {
    pub pkid: u16,
}

/// The payload the broker routes: what remains of a PUBLISH once the
/// per-connection envelope (packet id, DUP flag) is stripped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl ApplicationMessage {
    /// Re-wrap as a PUBLISH for delivery to a subscriber.
    ///
    /// `qos` is the effective (already downgraded) delivery QoS; `pkid` must
    /// be 0 exactly when `qos` is [`QoS::AtMostOnce`].
    pub fn into_publish(self, qos: QoS, pkid: u16) -> Publish {
        debug_assert_eq!(qos == QoS::AtMostOnce, pkid == 0);

        Publish {
            dup: false,
            qos,
            retain: self.retain,
            topic: self.topic,
            pkid,
            payload: self.payload,
        }
    }
}

impl From<&Publish> for ApplicationMessage {
    fn from(publish: &Publish) -> Self {
        ApplicationMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

impl From<LastWill> for ApplicationMessage {
    fn from(will: LastWill) -> Self {
        ApplicationMessage {
            topic: will.topic,
            payload: will.message,
            qos: will.qos,
            retain: will.retain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_from_u8_rejects_out_of_range() {
        assert_eq!(QoS::from_u8(0), Some(QoS::AtMostOnce));
        assert_eq!(QoS::from_u8(2), Some(QoS::ExactlyOnce));
        assert_eq!(QoS::from_u8(3), None);
    }

    #[test]
    fn qos_ordering_implements_downgrade() {
        use std::cmp::min;

        assert_eq!(min(QoS::ExactlyOnce, QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(min(QoS::AtMostOnce, QoS::ExactlyOnce), QoS::AtMostOnce);
    }

    #[test]
    fn publish_round_trips_through_application_message() {
        let publish = Publish {
            dup: true,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "a/b".to_string(),
            pkid: 7,
            payload: Bytes::from_static(b"x"),
        };

        let message = ApplicationMessage::from(&publish);

        // The per-connection envelope is not part of the routed message.
        let rewrapped = message.into_publish(QoS::AtLeastOnce, 12);
        assert!(!rewrapped.dup);
        assert_eq!(rewrapped.pkid, 12);
        assert_eq!(rewrapped.topic, "a/b");
        assert!(rewrapped.retain);
    }
}
