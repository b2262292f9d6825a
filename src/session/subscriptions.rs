//! One client's topic filters and the matching rules applied on fan-out.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::config::{SubscriptionInterceptor, SubscriptionRequest};
use crate::packet::{
    ApplicationMessage, QoS, SubAck, SubscribeFilter, SubscribeReturnCode, UnsubAck,
};
use crate::topic::Filter;

/// The set of active topic filters for one client, each with its granted QoS.
///
/// Mutated only from the session's receive path and the server-initiated
/// subscribe/unsubscribe operations; read concurrently by registry fan-out
/// running on other tasks, hence the lock.
#[derive(Default)]
pub(crate) struct Subscriptions {
    granted: RwLock<HashMap<String, Granted>>,
}

struct Granted {
    filter: Filter,
    qos: QoS,
}

pub(crate) struct SubscribeOutcome {
    pub suback: SubAck,
    /// Set when the subscription interceptor demanded the connection be
    /// closed; the SUBACK is still sent first.
    pub close_connection: bool,
    /// The filters granted by this call, for retained-message replay.
    pub accepted: Vec<Filter>,
}

impl Subscriptions {
    /// Process a SUBSCRIBE's filter list.
    ///
    /// Individual filters can fail (unparseable, or vetoed by the
    /// interceptor) without affecting their neighbours; each failure only
    /// shows up as a 0x80 return code in the SUBACK. [MQTT-3.9.3-2]
    /// A duplicate filter replaces the prior grant. [MQTT-3.8.4-3]
    pub fn subscribe(
        &self,
        pkid: u16,
        filters: Vec<SubscribeFilter>,
        interceptor: Option<&SubscriptionInterceptor>,
    ) -> SubscribeOutcome {
        let mut return_codes = Vec::with_capacity(filters.len());
        let mut accepted = Vec::new();
        let mut close_connection = false;

        for entry in filters {
            let Ok(filter) = entry.path.parse::<Filter>() else {
                tracing::debug!(filter = entry.path, "rejecting unparseable filter");
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            };

            let mut request = SubscriptionRequest {
                filter: entry.path,
                qos: entry.qos,
                accept: true,
                close_connection: false,
            };

            if let Some(interceptor) = interceptor {
                interceptor(&mut request);
            }

            close_connection |= request.close_connection;

            if !request.accept {
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            return_codes.push(SubscribeReturnCode::Success(request.qos));
            accepted.push(filter.clone());

            self.granted.write().insert(
                request.filter,
                Granted {
                    filter,
                    qos: request.qos,
                },
            );
        }

        SubscribeOutcome {
            suback: SubAck { pkid, return_codes },
            close_connection,
            accepted,
        }
    }

    /// Remove filters; unknown ones are silently tolerated. [MQTT-3.10.4-5]
    pub fn unsubscribe(&self, pkid: u16, filters: Vec<String>) -> UnsubAck {
        let mut granted = self.granted.write();

        for filter in filters {
            granted.remove(&filter);
        }

        UnsubAck { pkid }
    }

    /// The QoS this client should receive `message` at, or `None` when no
    /// filter matches.
    ///
    /// With overlapping filters the highest granted QoS wins
    /// [MQTT-3.3.5-1], capped at the QoS the message was published with.
    pub fn check(&self, message: &ApplicationMessage) -> Option<QoS> {
        self.granted
            .read()
            .values()
            .filter(|granted| granted.filter.matches_topic(&message.topic))
            .map(|granted| granted.qos)
            .max()
            .map(|granted_qos| granted_qos.min(message.qos))
    }
}
