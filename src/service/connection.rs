use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::ReconnectPolicy;
use crate::domain::{ConnectionState, Delivery, ProcessState, QosLevel, Subscription};
use crate::error::{ConnectionError, SubscriptionError};
use crate::ports::{BrokerSession, SessionEvent};
use crate::service::backoff::Backoff;
use crate::service::lifecycle::Lifecycle;

/// Broker events that matter above the connection layer.
#[derive(Debug)]
pub enum LinkEvent {
    /// Initial connect or a completed reconnect; subscriptions must be re-issued.
    Connected { session_present: bool },
    Publish(Delivery),
    SubAck { granted: Vec<Option<QosLevel>> },
}

/// Owns the broker session and keeps it connected.
pub struct ConnectionManager {
    session: Box<dyn BrokerSession>,
    backoff: Backoff,
    connect_timeout: Duration,
    lifecycle: Arc<Lifecycle>,
}

impl ConnectionManager {
    pub fn new(
        session: Box<dyn BrokerSession>,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            session,
            backoff: Backoff::new(policy),
            connect_timeout,
            lifecycle,
        }
    }

    /// Blocks until the broker accepts the connection. Returns the session-present flag.
    pub async fn connect(&mut self) -> Result<bool, ConnectionError> {
        loop {
            self.lifecycle.set_connection(ConnectionState::Connecting);

            let attempt = tokio::time::timeout(self.connect_timeout, self.await_connack()).await;
            let err = match attempt {
                Ok(Ok(session_present)) => {
                    self.backoff.reset();
                    self.lifecycle.set_connection(ConnectionState::Connected);
                    info!("MQTT Connected (session_present={})", session_present);
                    return Ok(session_present);
                }
                Ok(Err(e)) => e,
                Err(_) => ConnectionError::Timeout(self.connect_timeout),
            };

            self.lifecycle.set_connection(ConnectionState::Disconnected);
            if err.is_fatal() {
                error!("MQTT connection failed permanently: {}", err);
                return Err(err);
            }
            self.wait_before_retry(err).await?;
        }
    }

    /// Re-establishes the link after `cause` took it down.
    pub async fn ensure_connected(&mut self, cause: ConnectionError) -> Result<bool, ConnectionError> {
        self.lifecycle.set_connection(ConnectionState::Disconnected);
        if cause.is_fatal() {
            error!("MQTT connection failed permanently: {}", cause);
            return Err(cause);
        }
        self.wait_before_retry(cause).await?;
        self.connect().await
    }

    pub async fn next_event(&mut self) -> Result<LinkEvent, ConnectionError> {
        loop {
            match self.session.poll().await {
                Ok(SessionEvent::Publish(delivery)) => return Ok(LinkEvent::Publish(delivery)),
                Ok(SessionEvent::SubAck { granted }) => return Ok(LinkEvent::SubAck { granted }),
                Ok(SessionEvent::ConnAck { session_present }) => {
                    self.backoff.reset();
                    self.lifecycle.set_connection(ConnectionState::Connected);
                    return Ok(LinkEvent::Connected { session_present });
                }
                Ok(SessionEvent::Other) => continue,
                Err(e) => {
                    warn!("MQTT connection lost: {}", e);
                    if self.lifecycle.process_state() == ProcessState::Running {
                        self.lifecycle.advance(ProcessState::Connected);
                    }
                    let session_present = self.ensure_connected(e).await?;
                    return Ok(LinkEvent::Connected { session_present });
                }
            }
        }
    }

    pub async fn subscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), SubscriptionError> {
        self.session.subscribe(subscriptions).await
    }

    pub async fn unsubscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), SubscriptionError> {
        self.session.unsubscribe(subscriptions).await
    }

    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        let result = self.session.disconnect().await;
        self.lifecycle.set_connection(ConnectionState::Disconnected);
        result
    }

    async fn await_connack(&mut self) -> Result<bool, ConnectionError> {
        loop {
            match self.session.poll().await? {
                SessionEvent::ConnAck { session_present } => return Ok(session_present),
                other => debug!(?other, "Event before CONNACK"),
            }
        }
    }

    async fn wait_before_retry(&mut self, err: ConnectionError) -> Result<(), ConnectionError> {
        match self.backoff.next_delay() {
            Some(delay) => {
                warn!(
                    "MQTT Error: {}. Reconnect attempt {} in {:?}",
                    err,
                    self.backoff.attempts(),
                    delay
                );
                metrics::counter!("mqtt_reconnects_total", 1);
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => {
                let attempts = self.backoff.attempts();
                error!("Giving up on broker after {} reconnect attempts: {}", attempts, err);
                Err(ConnectionError::RetriesExhausted { attempts, last: err.to_string() })
            }
        }
    }
}
