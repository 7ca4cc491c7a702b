use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, NetworkOptions, Outgoing, Packet, Publish,
    SubscribeFilter, SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::config::BrokerConfig;
use crate::domain::{AckToken, Delivery, InboundMessage, QosLevel, Subscription};
use crate::error::{ConnectionError, SubscriptionError};
use crate::ports::{BrokerSession, MessageAcker, SessionEvent};

/// Queue depth between `AsyncClient` handles and the event loop.
const REQUEST_CAPACITY: usize = 1000;
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Acknowledges deliveries through a cloned client handle.
pub struct MqttAdapter {
    client: AsyncClient,
}

impl MqttAdapter {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }

    /// Builds options, client and event loop. Nothing touches the network until the first poll.
    pub fn build(config: &BrokerConfig, connect_timeout: Duration) -> anyhow::Result<(AsyncClient, EventLoop)> {
        let mut mqttoptions = MqttOptions::new(config.client_id.clone(), &config.host, config.port);
        mqttoptions.set_keep_alive(config.keep_alive);
        mqttoptions.set_clean_session(config.clean_session);
        // Acks go out only after the sink has made the message durable.
        mqttoptions.set_manual_acks(true);

        if let Some(username) = &config.username {
            mqttoptions.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        if let Some(tls) = &config.tls {
            let transport = match &tls.ca_cert {
                Some(path) => {
                    let ca = std::fs::read(path)
                        .map_err(|e| anyhow::anyhow!("failed to read CA certificate {}: {}", path.display(), e))?;
                    Transport::tls_with_config(TlsConfiguration::Simple { ca, alpn: None, client_auth: None })
                }
                None => Transport::Tls(Default::default()),
            };
            mqttoptions.set_transport(transport);
            info!("MQTT TLS enabled for {}", config.host);
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, REQUEST_CAPACITY);

        let mut network = NetworkOptions::new();
        network.set_connection_timeout(connect_timeout.as_secs().max(1));
        eventloop.set_network_options(network);

        Ok((client, eventloop))
    }
}

#[async_trait]
impl MessageAcker for MqttAdapter {
    #[instrument(skip(self, token), fields(topic = %token.topic, pkid = token.pkid))]
    async fn ack(&self, token: &AckToken) -> anyhow::Result<()> {
        // `AsyncClient::ack` only reads QoS and packet id.
        let mut publish = Publish::new(token.topic.as_str(), token.qos.into(), Vec::<u8>::new());
        publish.pkid = token.pkid;
        self.client
            .ack(&publish)
            .await
            .map_err(|e| anyhow::anyhow!("MQTT Ack Failed: {:?}", e))
    }
}

/// rumqttc-backed [`BrokerSession`].
pub struct RumqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl RumqttSession {
    pub fn new(client: AsyncClient, eventloop: EventLoop) -> Self {
        Self { client, eventloop }
    }
}

#[async_trait]
impl BrokerSession for RumqttSession {
    async fn poll(&mut self) -> Result<SessionEvent, ConnectionError> {
        self.eventloop.poll().await.map(to_session_event).map_err(classify_error)
    }

    async fn subscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), SubscriptionError> {
        let filters = subscriptions
            .iter()
            .map(|s| SubscribeFilter::new(s.filter.clone(), s.qos.into()));
        self.client
            .subscribe_many(filters)
            .await
            .map_err(|e| SubscriptionError::Request(e.to_string()))
    }

    async fn unsubscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), SubscriptionError> {
        for subscription in subscriptions {
            self.client
                .unsubscribe(subscription.filter.clone())
                .await
                .map_err(|e| SubscriptionError::Request(e.to_string()))?;
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| ConnectionError::Network(e.to_string()))?;

        // Requests are processed in order, so pending acks leave before DISCONNECT.
        let drain = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(classify_error(e)),
                }
            }
        };
        match tokio::time::timeout(DISCONNECT_GRACE, drain).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Broker did not take DISCONNECT within {:?}", DISCONNECT_GRACE);
                Err(ConnectionError::Timeout(DISCONNECT_GRACE))
            }
        }
    }
}

pub fn to_session_event(event: Event) -> SessionEvent {
    match event {
        Event::Incoming(Packet::ConnAck(connack)) => SessionEvent::ConnAck {
            session_present: connack.session_present,
        },
        Event::Incoming(Packet::Publish(publish)) => SessionEvent::Publish(to_delivery(publish)),
        Event::Incoming(Packet::SubAck(suback)) => SessionEvent::SubAck {
            granted: suback
                .return_codes
                .iter()
                .map(|code| match code {
                    SubscribeReasonCode::Success(qos) => Some(QosLevel::from(*qos)),
                    SubscribeReasonCode::Failure => None,
                })
                .collect(),
        },
        other => {
            debug!(?other, "MQTT event");
            SessionEvent::Other
        }
    }
}

fn to_delivery(publish: Publish) -> Delivery {
    let qos = QosLevel::from(publish.qos);
    let ack = (qos != QosLevel::AtMostOnce).then(|| AckToken {
        topic: publish.topic.clone(),
        pkid: publish.pkid,
        qos,
    });
    Delivery {
        message: InboundMessage {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
            qos,
            retain: publish.retain,
            dup: publish.dup,
            received_at: OffsetDateTime::now_utc(),
        },
        ack,
    }
}

/// Credential problems and permanent refusals are fatal; everything else is worth a retry.
pub fn classify_error(err: rumqttc::ConnectionError) -> ConnectionError {
    match err {
        rumqttc::ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                ConnectionError::Auth(format!("{:?}", code))
            }
            ConnectReturnCode::BadClientId | ConnectReturnCode::RefusedProtocolVersion => {
                ConnectionError::Refused(format!("{:?}", code))
            }
            other => ConnectionError::Network(format!("connection refused: {:?}", other)),
        },
        other => ConnectionError::Network(other.to_string()),
    }
}
