//! # Broker Events
//!
//! Transport-neutral view of what the MQTT client reported.
//!
//! The rumqttc event loop runs on its own task; every event it yields is
//! translated here and queued to the supervisor, which applies it to the
//! [`BrokerConnection`](super::BrokerConnection) on the event loop.

use bytes::Bytes;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};

/// Something that happened on the broker link
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// CONNACK (or a refused connect); 0 means accepted
    ConnAck { code: u8 },
    /// SUBSCRIBE left with this packet id
    SubscribeSent { pkid: u16 },
    /// SUBACK; `granted` is false if the broker returned a failure code
    SubAck { pkid: u16, granted: bool },
    /// UNSUBSCRIBE left with this packet id
    UnsubscribeSent { pkid: u16 },
    UnsubAck { pkid: u16 },
    PublishSent { pkid: u16 },
    PubAck { pkid: u16 },
    /// Application message
    Message { topic: String, payload: Bytes },
    /// Link closed; `None` after a client-requested disconnect
    Disconnected { reason: Option<String> },
    /// Anything else worth a log line
    Log { message: String },
}

impl BrokerEvent {
    /// Translate a rumqttc event
    pub fn from_mqtt(event: Event) -> Self {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => BrokerEvent::ConnAck {
                code: return_code(ack.code),
            },
            Event::Incoming(Packet::SubAck(ack)) => BrokerEvent::SubAck {
                pkid: ack.pkid,
                granted: ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_))),
            },
            Event::Incoming(Packet::UnsubAck(ack)) => BrokerEvent::UnsubAck { pkid: ack.pkid },
            Event::Incoming(Packet::PubAck(ack)) => BrokerEvent::PubAck { pkid: ack.pkid },
            Event::Incoming(Packet::Publish(publish)) => BrokerEvent::Message {
                topic: publish.topic,
                payload: publish.payload,
            },
            Event::Incoming(Packet::Disconnect) => BrokerEvent::Disconnected {
                reason: Some("broker closed the connection".to_string()),
            },
            Event::Outgoing(Outgoing::Subscribe(pkid)) => BrokerEvent::SubscribeSent { pkid },
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => BrokerEvent::UnsubscribeSent { pkid },
            Event::Outgoing(Outgoing::Publish(pkid)) => BrokerEvent::PublishSent { pkid },
            Event::Outgoing(Outgoing::Disconnect) => BrokerEvent::Disconnected { reason: None },
            other => BrokerEvent::Log {
                message: format!("{:?}", other),
            },
        }
    }
}

/// MQTT 3.1.1 CONNACK return code
pub fn return_code(code: ConnectReturnCode) -> u8 {
    code as u8
}

/// Human-readable CONNACK return code
pub fn describe_return_code(code: u8) -> &'static str {
    match code {
        0 => "connection accepted",
        1 => "unacceptable protocol version",
        2 => "client identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown return code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Publish, QoS, SubAck, UnsubAck};

    #[test]
    fn test_connack_codes() {
        let ok = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(BrokerEvent::from_mqtt(ok), BrokerEvent::ConnAck { code: 0 });

        let refused = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
        }));
        assert_eq!(BrokerEvent::from_mqtt(refused), BrokerEvent::ConnAck { code: 5 });
    }

    #[test]
    fn test_suback_granted_and_failed() {
        let granted = Event::Incoming(Packet::SubAck(SubAck {
            pkid: 3,
            return_codes: vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)],
        }));
        assert_eq!(
            BrokerEvent::from_mqtt(granted),
            BrokerEvent::SubAck { pkid: 3, granted: true }
        );

        let failed = Event::Incoming(Packet::SubAck(SubAck {
            pkid: 4,
            return_codes: vec![SubscribeReasonCode::Failure],
        }));
        assert_eq!(
            BrokerEvent::from_mqtt(failed),
            BrokerEvent::SubAck { pkid: 4, granted: false }
        );
    }

    #[test]
    fn test_outgoing_and_unsuback() {
        assert_eq!(
            BrokerEvent::from_mqtt(Event::Outgoing(Outgoing::Subscribe(9))),
            BrokerEvent::SubscribeSent { pkid: 9 }
        );
        assert_eq!(
            BrokerEvent::from_mqtt(Event::Outgoing(Outgoing::Unsubscribe(10))),
            BrokerEvent::UnsubscribeSent { pkid: 10 }
        );
        assert_eq!(
            BrokerEvent::from_mqtt(Event::Incoming(Packet::UnsubAck(UnsubAck { pkid: 10 }))),
            BrokerEvent::UnsubAck { pkid: 10 }
        );
        assert_eq!(
            BrokerEvent::from_mqtt(Event::Outgoing(Outgoing::Disconnect)),
            BrokerEvent::Disconnected { reason: None }
        );
    }

    #[test]
    fn test_publish_becomes_message() {
        let publish = Publish::new("icarus/B1", QoS::AtLeastOnce, br#"{"latitude":1.0}"#.to_vec());
        match BrokerEvent::from_mqtt(Event::Incoming(Packet::Publish(publish))) {
            BrokerEvent::Message { topic, payload } => {
                assert_eq!(topic, "icarus/B1");
                assert_eq!(&payload[..], br#"{"latitude":1.0}"#);
            }
            other => panic!("Expected Message, got: {:?}", other),
        }
    }

    #[test]
    fn test_pings_are_logged() {
        let event = BrokerEvent::from_mqtt(Event::Outgoing(Outgoing::PingReq));
        assert!(matches!(event, BrokerEvent::Log { .. }));
    }

    #[test]
    fn test_describe_return_code() {
        assert_eq!(describe_return_code(0), "connection accepted");
        assert_eq!(describe_return_code(4), "bad user name or password");
        assert_eq!(describe_return_code(200), "unknown return code");
    }
}
