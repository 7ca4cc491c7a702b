use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::domain::{topic_matches, Delivery, ProcessState, QosLevel, Subscription};
use crate::error::{ConnectionError, LoggerError, SubscriptionError};
use crate::service::connection::{ConnectionManager, LinkEvent};
use crate::service::lifecycle::Lifecycle;
use crate::service::wait_for_shutdown;

/// Turns a broker connection into an ordered stream of deliveries for a fixed set of filters.
pub struct SubscriptionHandler {
    connection: ConnectionManager,
    subscriptions: Vec<Subscription>,
    lifecycle: Arc<Lifecycle>,
    awaiting_suback: bool,
    /// Set once the filters are withdrawn; reconnects no longer re-subscribe.
    unsubscribed: bool,
}

impl SubscriptionHandler {
    /// Connects, then issues every subscription.
    pub async fn subscribe(
        mut connection: ConnectionManager,
        subscriptions: Vec<Subscription>,
        lifecycle: Arc<Lifecycle>,
    ) -> Result<Self, LoggerError> {
        let session_present = connection.connect().await?;
        let mut handler = Self {
            connection,
            subscriptions,
            lifecycle,
            awaiting_suback: false,
            unsubscribed: false,
        };
        handler.on_connected(session_present).await?;
        Ok(handler)
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Next message from the broker. Reconnects and re-subscribes transparently.
    pub async fn next_delivery(&mut self) -> Result<Delivery, LoggerError> {
        loop {
            match self.connection.next_event().await? {
                LinkEvent::Publish(delivery) => {
                    metrics::counter!("mqtt_messages_received_total", 1);
                    if !self.subscriptions.iter().any(|s| topic_matches(&s.filter, &delivery.message.topic)) {
                        debug!("Delivery on {} matches no configured filter", delivery.message.topic);
                    }
                    return Ok(delivery);
                }
                LinkEvent::SubAck { granted } => self.on_suback(&granted)?,
                LinkEvent::Connected { session_present } => {
                    info!("MQTT Reconnected! Resubscribing to {} filters...", self.subscriptions.len());
                    self.on_connected(session_present).await?;
                }
            }
        }
    }

    /// Forwards deliveries into `sender` until shutdown or a fatal error. Consumes the sender.
    pub async fn run(
        &mut self,
        sender: mpsc::Sender<Delivery>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), LoggerError> {
        info!("Subscription Loop Started.");
        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Shutdown Signal Received in Subscription Loop.");
                    return Ok(());
                }
                next = self.next_delivery() => {
                    let delivery = match next {
                        Ok(delivery) => delivery,
                        Err(e) => {
                            error!("Subscription Loop Error: {}", e);
                            return Err(e);
                        }
                    };
                    if let Err(e) = sender.send(delivery).await {
                        error!("Channel closed, dropping {}: recorder is gone", e.0.message.topic);
                        return Err(LoggerError::Internal("recorder stopped accepting messages".into()));
                    }
                }
            }
        }
    }

    /// Withdraws every filter so the broker stops routing new messages here.
    pub async fn unsubscribe(&mut self) -> Result<(), SubscriptionError> {
        self.unsubscribed = true;
        self.awaiting_suback = false;
        info!("Unsubscribing from {} filters", self.subscriptions.len());
        self.connection.unsubscribe(&self.subscriptions).await
    }

    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        self.connection.close().await
    }

    async fn on_connected(&mut self, session_present: bool) -> Result<(), SubscriptionError> {
        if self.unsubscribed {
            debug!("Reconnected while draining; not re-subscribing");
            return Ok(());
        }
        self.lifecycle.advance(ProcessState::Connected);
        if session_present {
            debug!("Broker kept our session; re-subscribing anyway");
        }
        self.connection.subscribe(&self.subscriptions).await?;
        self.awaiting_suback = true;
        Ok(())
    }

    fn on_suback(&mut self, granted: &[Option<QosLevel>]) -> Result<(), SubscriptionError> {
        if !self.awaiting_suback {
            debug!("Unexpected SUBACK ignored");
            return Ok(());
        }
        if granted.len() != self.subscriptions.len() {
            warn!(
                "SUBACK carries {} codes for {} filters",
                granted.len(),
                self.subscriptions.len()
            );
        }

        for (subscription, code) in self.subscriptions.iter().zip(granted) {
            match code {
                None => {
                    error!("Broker rejected subscription to {}", subscription.filter);
                    return Err(SubscriptionError::Rejected { filter: subscription.filter.clone() });
                }
                Some(qos) if *qos != subscription.qos => {
                    info!("Broker granted {:?} instead of {:?} for {}", qos, subscription.qos, subscription.filter);
                }
                Some(_) => {}
            }
        }

        self.awaiting_suback = false;
        info!("Subscribed to {} filters", self.subscriptions.len());
        if self.lifecycle.process_state() != ProcessState::Draining {
            self.lifecycle.advance(ProcessState::Running);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::service::testing::*;
    use std::time::Duration;

    const OK1: Option<QosLevel> = Some(QosLevel::AtLeastOnce);

    fn subscriptions() -> Vec<Subscription> {
        vec![
            Subscription::new("sensors/#", QosLevel::AtLeastOnce),
            Subscription::new("car/+/speed", QosLevel::AtLeastOnce),
        ]
    }

    async fn handler(script: Vec<Step>) -> (Result<SubscriptionHandler, LoggerError>, Arc<std::sync::Mutex<SessionLog>>, Arc<Lifecycle>) {
        let (session, log) = ScriptedSession::new(script);
        let lifecycle = Arc::new(Lifecycle::new());
        let policy = ReconnectPolicy {
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            max_attempts: 5,
        };
        let conn = ConnectionManager::new(Box::new(session), policy, Duration::from_secs(1), lifecycle.clone());
        (SubscriptionHandler::subscribe(conn, subscriptions(), lifecycle.clone()).await, log, lifecycle)
    }

    fn all_filters() -> Trace {
        Trace::Subscribe(vec!["sensors/#".into(), "car/+/speed".into()])
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_after_subscribing() {
        let (handler, log, lifecycle) = handler(vec![
            connack(),
            suback(&[OK1, OK1]),
            publish("sensors/temp", "21.5", 1),
        ])
        .await;
        let mut handler = handler.unwrap();
        assert_eq!(lifecycle.process_state(), ProcessState::Connected);

        let delivery = handler.next_delivery().await.unwrap();
        assert_eq!(delivery.message.topic, "sensors/temp");
        assert_eq!(delivery.message.payload, b"21.5");
        assert_eq!(lifecycle.process_state(), ProcessState::Running);
        assert_eq!(
            log.lock().unwrap().trace,
            vec![Trace::ConnAck, all_filters(), Trace::Publish("sensors/temp".into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribes_full_set_before_resuming_after_disconnect() {
        let (handler, log, lifecycle) = handler(vec![
            connack(),
            suback(&[OK1, OK1]),
            publish("sensors/temp", "21.5", 1),
            network_error(),
            connack(),
            suback(&[OK1, OK1]),
            publish("car/1/speed", "88", 2),
        ])
        .await;
        let mut handler = handler.unwrap();

        assert_eq!(handler.next_delivery().await.unwrap().message.topic, "sensors/temp");
        assert_eq!(handler.next_delivery().await.unwrap().message.topic, "car/1/speed");
        assert_eq!(lifecycle.process_state(), ProcessState::Running);

        let trace = log.lock().unwrap().trace.clone();
        assert_eq!(
            trace,
            vec![
                Trace::ConnAck,
                all_filters(),
                Trace::Publish("sensors/temp".into()),
                Trace::Failure,
                Trace::ConnAck,
                all_filters(),
                Trace::Publish("car/1/speed".into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_after_reconnect_is_still_delivered() {
        let (handler, _log, _) = handler(vec![
            connack(),
            suback(&[OK1, OK1]),
            publish("sensors/temp", "21.5", 1),
            network_error(),
            connack(),
            publish("sensors/temp", "21.5", 1),
            suback(&[OK1, OK1]),
        ])
        .await;
        let mut handler = handler.unwrap();

        let first = handler.next_delivery().await.unwrap();
        let second = handler.next_delivery().await.unwrap();
        assert_eq!(first.message.payload, second.message.payload);
        assert_eq!(first.ack, second.ack);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_filter_is_fatal() {
        let (handler, _log, _) = handler(vec![connack(), suback(&[OK1, None]), publish("sensors/temp", "1", 1)]).await;
        let mut handler = handler.unwrap();

        match handler.next_delivery().await {
            Err(LoggerError::Subscription(SubscriptionError::Rejected { filter })) => assert_eq!(filter, "car/+/speed"),
            other => panic!("expected rejection, got {:?}", other.map(|d| d.message.topic)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn suback_during_drain_keeps_draining_state() {
        let (handler, _log, lifecycle) = handler(vec![connack(), suback(&[OK1, OK1]), Step::Hang]).await;
        let mut handler = handler.unwrap();
        lifecycle.advance(ProcessState::Draining);

        let next = tokio::time::timeout(Duration::from_secs(1), handler.next_delivery()).await;
        assert!(next.is_err(), "no delivery follows the SUBACK");
        assert_eq!(lifecycle.process_state(), ProcessState::Draining);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribed_handler_does_not_resubscribe_after_reconnect() {
        let (handler, log, _) = handler(vec![
            connack(),
            suback(&[OK1, OK1]),
            network_error(),
            connack(),
            publish("sensors/late", "1", 3),
        ])
        .await;
        let mut handler = handler.unwrap();
        handler.unsubscribe().await.unwrap();

        assert_eq!(handler.next_delivery().await.unwrap().message.topic, "sensors/late");
        let trace = log.lock().unwrap().trace.clone();
        assert_eq!(
            trace,
            vec![
                Trace::ConnAck,
                all_filters(),
                Trace::Unsubscribe(vec!["sensors/#".into(), "car/+/speed".into()]),
                Trace::Failure,
                Trace::ConnAck,
                Trace::Publish("sensors/late".into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_forwards_until_shutdown() {
        let (handler, log, _) = handler(vec![
            connack(),
            suback(&[OK1, OK1]),
            publish("sensors/a", "1", 1),
            publish("sensors/b", "2", 2),
        ])
        .await;
        let mut handler = handler.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let result = handler.run(tx, shutdown_rx).await;
            handler.close().await.unwrap();
            result
        });

        assert_eq!(rx.recv().await.unwrap().message.topic, "sensors/a");
        assert_eq!(rx.recv().await.unwrap().message.topic, "sensors/b");
        shutdown_tx.send(true).unwrap();

        task.await.unwrap().unwrap();
        assert!(rx.recv().await.is_none(), "sender is dropped once run returns");
        assert_eq!(log.lock().unwrap().trace.last(), Some(&Trace::Disconnect));
    }
}
