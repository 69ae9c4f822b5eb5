//! Pure routing of rumqttc events
//!
//! Translates the raw `rumqttc::Event` stream into [`TransportEvent`]s the
//! managed client understands. Everything here is side-effect free apart from
//! debug logging.

use crate::transport::mqtt::connection::connect_code_from;
use crate::transport::{DisconnectReason, TransportEvent};
use rumqttc::{Event, Outgoing, Packet, QoS, SubscribeReasonCode};
use tracing::debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT event to the appropriate handling (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::Forward(TransportEvent::ConnAck {
                    code: connect_code_from(connack.code),
                    session_present: connack.session_present,
                }),
                Packet::Publish(publish) => EventRoute::Forward(TransportEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                }),
                Packet::SubAck(suback) => EventRoute::Forward(TransportEvent::SubAck {
                    packet_id: suback.pkid,
                    granted: Self::granted_qos(&suback.return_codes),
                }),
                Packet::PubAck(puback) => EventRoute::Forward(TransportEvent::PubAck {
                    packet_id: puback.pkid,
                }),
                Packet::PubComp(pubcomp) => EventRoute::Forward(TransportEvent::PubAck {
                    packet_id: pubcomp.pkid,
                }),
                Packet::Disconnect => EventRoute::Forward(TransportEvent::Disconnected {
                    reason: DisconnectReason::BrokerInitiated,
                }),
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Granted QoS per filter; `None` marks a rejected filter (pure function)
    pub fn granted_qos(return_codes: &[SubscribeReasonCode]) -> Vec<Option<QoS>> {
        return_codes
            .iter()
            .map(|code| match code {
                SubscribeReasonCode::Success(qos) => Some(*qos),
                SubscribeReasonCode::Failure => None,
            })
            .collect()
    }

    /// Check a SubAck for rejected filters (pure function)
    pub fn validate_subscription_success(granted: &[Option<QoS>]) -> Result<(), String> {
        let rejected = granted.iter().filter(|qos| qos.is_none()).count();
        if rejected > 0 {
            Err(format!(
                "{rejected} of {} subscription filter(s) rejected by broker",
                granted.len()
            ))
        } else {
            Ok(())
        }
    }

    /// Log a routed event that is not forwarded to the client
    pub fn log_unforwarded(route: &EventRoute) {
        match route {
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event)
            }
            EventRoute::DisconnectSent => {
                debug!(target: "mqtt_transport", "DISCONNECT sent to broker")
            }
            EventRoute::OutgoingEvent | EventRoute::Forward(_) => {}
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Event the managed client reacts to
    Forward(TransportEvent),
    /// Our own DISCONNECT packet left the socket
    DisconnectSent,
    /// Infrastructure event (PingResp, PubRec, ...)
    InfrastructureEvent(String),
    /// Outgoing event (handled by rumqttc)
    OutgoingEvent,
}
