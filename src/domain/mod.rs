pub mod topic;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use topic::{topic_matches, validate_filter};

/// MQTT delivery guarantee. Serialized as its wire number (0, 1, 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QosLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2 (got {})", other)),
        }
    }
}

impl From<QosLevel> for rumqttc::QoS {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for QosLevel {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => QosLevel::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => QosLevel::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => QosLevel::ExactlyOnce,
        }
    }
}

/// A topic filter plus the QoS requested for it. Fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub filter: String,
    pub qos: QosLevel,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, qos: QosLevel) -> Self {
        Self { filter: filter.into(), qos }
    }
}

/// A message as delivered by the broker, stamped on receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
    pub retain: bool,
    pub dup: bool,
    pub received_at: OffsetDateTime,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QosLevel) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
            received_at: OffsetDateTime::now_utc(),
        }
    }
}

/// What the broker needs back to consider a QoS 1/2 delivery handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckToken {
    pub topic: String,
    pub pkid: u16,
    pub qos: QosLevel,
}

/// Message handed from the subscription side to the sink side.
/// `ack` is `None` for QoS 0 deliveries.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: InboundMessage,
    pub ack: Option<AckToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Utf8,
    Base64,
}

/// Durable, line-oriented form of an [`InboundMessage`].
#[derive(Debug, Clone, Serialize)]
pub struct PersistenceRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub topic: String,
    pub qos: QosLevel,
    pub retain: bool,
    pub dup: bool,
    pub payload: String,
    pub payload_encoding: PayloadEncoding,
}

impl From<&InboundMessage> for PersistenceRecord {
    fn from(msg: &InboundMessage) -> Self {
        let (payload, payload_encoding) = encode_payload(&msg.payload);
        Self {
            received_at: msg.received_at,
            topic: msg.topic.clone(),
            qos: msg.qos,
            retain: msg.retain,
            dup: msg.dup,
            payload,
            payload_encoding,
        }
    }
}

/// UTF-8 payloads are kept as text, anything else is base64.
pub fn encode_payload(payload: &[u8]) -> (String, PayloadEncoding) {
    use base64::{engine::general_purpose, Engine as _};

    match std::str::from_utf8(payload) {
        Ok(text) => (text.to_string(), PayloadEncoding::Utf8),
        Err(_) => (general_purpose::STANDARD.encode(payload), PayloadEncoding::Base64),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_gauge(self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
        }
    }
}

/// Process-level lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Connected,
    Running,
    Draining,
    Stopped,
}

impl ProcessState {
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Starting, Connected)
                | (Connected, Running)
                | (Running, Connected)
                | (Starting, Draining)
                | (Connected, Draining)
                | (Running, Draining)
                | (Draining, Stopped)
        )
    }
}
