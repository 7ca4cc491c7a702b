use async_trait::async_trait;
use crate::domain::{AckToken, Delivery, InboundMessage, QosLevel, Subscription};
use crate::error::{ConnectionError, PersistenceError, SubscriptionError};

/// What a broker session hands back from a single poll.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnAck { session_present: bool },
    Publish(Delivery),
    /// One entry per filter of the last subscribe request; `None` = rejected.
    SubAck { granted: Vec<Option<QosLevel>> },
    /// Pings, outgoing packets, acks: nothing for the logger to do.
    Other,
}

/// One live MQTT link. Polling drives both network I/O and reconnects.
#[async_trait]
pub trait BrokerSession: Send {
    async fn poll(&mut self) -> Result<SessionEvent, ConnectionError>;

    /// Queues one SUBSCRIBE carrying every filter, in order.
    async fn subscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), SubscriptionError>;

    /// Queues an UNSUBSCRIBE for every filter so the broker stops routing to us.
    async fn unsubscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), SubscriptionError>;

    /// Sends DISCONNECT once every previously queued request (acks included) is out.
    async fn disconnect(&mut self) -> Result<(), ConnectionError>;
}

#[async_trait]
pub trait MessageAcker: Send + Sync {
    /// Acknowledge a delivery. Only called after the message is durable.
    async fn ack(&self, token: &AckToken) -> anyhow::Result<()>;
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Persist a single message; on `Ok` the record is durable.
    async fn persist(&self, message: &InboundMessage) -> Result<(), PersistenceError> {
        self.persist_batch(std::slice::from_ref(message)).await
    }

    /// Persist all messages or none of them.
    async fn persist_batch(&self, batch: &[InboundMessage]) -> Result<(), PersistenceError>;

    async fn flush(&self) -> Result<(), PersistenceError>;
}
