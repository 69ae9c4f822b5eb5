//! Mock transport for testing
//!
//! [`MockBroker`] is the test's handle on a scripted broker: it decides how
//! each connect is answered, records every call the client makes on the
//! transport, and injects transport events (acks, messages, drops) the way a
//! network loop would. [`MockTransport`] is the [`Transport`] the client
//! receives from [`MockBroker::factory`].

use crate::transport::{
    ConnectCode, DisconnectReason, EventSender, Transport, TransportError, TransportEvent,
    TransportOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// One call the client made on its transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    SetCredentials {
        username: String,
        password: String,
    },
    Connect {
        host: String,
        port: u16,
        keepalive: Duration,
    },
    LoopStart,
    LoopStop,
    Disconnect,
    Subscribe {
        topic: String,
        qos: QoS,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
    },
}

/// How the scripted broker answers one connect
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectBehavior {
    /// Accept; the ConnAck is delivered when the loop starts
    Acknowledge { session_present: bool },
    /// Socket connects but no ConnAck arrives until the test sends one
    Silent,
    /// Socket connects, then the broker answers with a refusal code
    RejectAck(ConnectCode),
    /// `connect` itself fails with a broker refusal
    Refuse(ConnectCode),
    /// `connect` itself fails at the socket level
    SocketError,
}

impl Default for ConnectBehavior {
    fn default() -> Self {
        ConnectBehavior::Acknowledge {
            session_present: false,
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    calls: Vec<TransportCall>,
    behaviors: VecDeque<ConnectBehavior>,
    pending_answer: Option<ConnectBehavior>,
    events: Option<EventSender>,
    created_with: Vec<TransportOptions>,
    fail_subscribe: bool,
    fail_publish: bool,
}

/// Scripted broker shared between a test and its [`MockTransport`]s
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker whose next connects are answered in the given order
    pub fn with_behaviors(behaviors: impl IntoIterator<Item = ConnectBehavior>) -> Self {
        let broker = Self::new();
        broker.lock().behaviors.extend(behaviors);
        broker
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panicking test thread must not hide the recorded calls
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Transport factory for `ManagedClient::with_transport`
    pub fn factory(
        &self,
    ) -> impl Fn(&TransportOptions) -> Result<MockTransport, TransportError> + Send + Sync + 'static
    {
        let broker = self.clone();
        move |options: &TransportOptions| {
            broker.lock().created_with.push(options.clone());
            Ok(MockTransport {
                broker: broker.clone(),
            })
        }
    }

    /// Queue the answer to a later connect; unscripted connects are acknowledged
    pub fn push_connect_behavior(&self, behavior: ConnectBehavior) {
        self.lock().behaviors.push_back(behavior);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.lock().fail_subscribe = fail;
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.lock().fail_publish = fail;
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn count_calls(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    pub fn subscribe_calls(&self) -> Vec<(String, QoS)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Subscribe { topic, qos } => Some((topic.clone(), *qos)),
                _ => None,
            })
            .collect()
    }

    pub fn publish_calls(&self) -> Vec<(String, Vec<u8>, QoS)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Publish {
                    topic,
                    payload,
                    qos,
                } => Some((topic.clone(), payload.clone(), *qos)),
                _ => None,
            })
            .collect()
    }

    pub fn connect_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, TransportCall::Connect { .. }))
    }

    /// Number of transport handles the factory produced
    pub fn handles_created(&self) -> usize {
        self.lock().created_with.len()
    }

    pub fn transport_options(&self) -> Vec<TransportOptions> {
        self.lock().created_with.clone()
    }

    /// Push an event as the running network loop would; false if no loop runs
    pub fn send_event(&self, event: TransportEvent) -> bool {
        match &self.lock().events {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    pub fn ack_connect(&self, session_present: bool) -> bool {
        self.send_event(TransportEvent::ConnAck {
            code: ConnectCode::Accepted,
            session_present,
        })
    }

    pub fn reject_connect(&self, code: ConnectCode) -> bool {
        self.send_event(TransportEvent::ConnAck {
            code,
            session_present: false,
        })
    }

    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        self.send_event(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        })
    }

    /// Simulate the link going away; the network loop ends with it
    pub fn drop_connection(&self, reason: DisconnectReason) -> bool {
        let events = self.lock().events.take();
        match events {
            Some(events) => events
                .send(TransportEvent::Disconnected { reason })
                .is_ok(),
            None => false,
        }
    }

    pub fn sub_ack(&self, packet_id: u16, granted: Vec<Option<QoS>>) -> bool {
        self.send_event(TransportEvent::SubAck { packet_id, granted })
    }

    pub fn pub_ack(&self, packet_id: u16) -> bool {
        self.send_event(TransportEvent::PubAck { packet_id })
    }

    fn record(&self, call: TransportCall) {
        self.lock().calls.push(call);
    }
}

/// Transport handle produced by [`MockBroker::factory`]
#[derive(Debug)]
pub struct MockTransport {
    broker: MockBroker,
}

#[async_trait]
impl Transport for MockTransport {
    fn set_credentials(&mut self, username: &str, password: &str) {
        self.broker.record(TransportCall::SetCredentials {
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    async fn connect(
        &self,
        host: &str,
        port: u16,
        keepalive: Duration,
    ) -> Result<(), TransportError> {
        self.broker.record(TransportCall::Connect {
            host: host.to_string(),
            port,
            keepalive,
        });

        let mut state = self.broker.lock();
        let behavior = state.behaviors.pop_front().unwrap_or_default();
        match behavior {
            ConnectBehavior::Refuse(code) => Err(TransportError::Refused(code)),
            ConnectBehavior::SocketError => Err(TransportError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            ))),
            answer => {
                state.pending_answer = Some(answer);
                Ok(())
            }
        }
    }

    async fn loop_start(&self, events: EventSender) -> Result<(), TransportError> {
        self.broker.record(TransportCall::LoopStart);

        let mut state = self.broker.lock();
        let answer = match state.pending_answer.take() {
            Some(ConnectBehavior::Acknowledge { session_present }) => {
                Some(TransportEvent::ConnAck {
                    code: ConnectCode::Accepted,
                    session_present,
                })
            }
            Some(ConnectBehavior::RejectAck(code)) => Some(TransportEvent::ConnAck {
                code,
                session_present: false,
            }),
            _ => None,
        };

        if let Some(event) = answer {
            let _ = events.send(event);
        }
        state.events = Some(events);
        Ok(())
    }

    async fn loop_stop(&self) {
        self.broker.record(TransportCall::LoopStop);
        self.broker.lock().events = None;
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.broker.record(TransportCall::Disconnect);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.broker.record(TransportCall::Subscribe {
            topic: topic.to_string(),
            qos,
        });

        if self.broker.lock().fail_subscribe {
            return Err(TransportError::Network("mock subscribe failure".to_string()));
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), TransportError> {
        self.broker.record(TransportCall::Publish {
            topic: topic.to_string(),
            payload,
            qos,
        });

        if self.broker.lock().fail_publish {
            return Err(TransportError::Network("mock publish failure".to_string()));
        }
        Ok(())
    }
}
