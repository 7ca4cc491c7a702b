//! Scripted stand-ins for the ports, shared by the service tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use crate::domain::{AckToken, Delivery, InboundMessage, QosLevel, Subscription};
use crate::error::{ConnectionError, PersistenceError, SubscriptionError};
use crate::ports::{BrokerSession, MessageAcker, MessageSink, SessionEvent};

pub(crate) enum Step {
    Event(SessionEvent),
    Fail(ConnectionError),
    /// Never completes; models a broker that swallows the CONNECT.
    Hang,
    /// Quiet period before the next step.
    Pause(std::time::Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Trace {
    ConnAck,
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Publish(String),
    Failure,
    Disconnect,
}

#[derive(Default)]
pub(crate) struct SessionLog {
    pub trace: Vec<Trace>,
    pub poll_times: Vec<Instant>,
}

/// Plays back a fixed list of steps, then idles like a quiet broker.
pub(crate) struct ScriptedSession {
    script: VecDeque<Step>,
    log: Arc<Mutex<SessionLog>>,
}

impl ScriptedSession {
    pub fn new(script: Vec<Step>) -> (Self, Arc<Mutex<SessionLog>>) {
        let log = Arc::new(Mutex::new(SessionLog::default()));
        (Self { script: script.into(), log: log.clone() }, log)
    }
}

#[async_trait]
impl BrokerSession for ScriptedSession {
    async fn poll(&mut self) -> Result<SessionEvent, ConnectionError> {
        self.log.lock().unwrap().poll_times.push(Instant::now());
        while let Some(Step::Pause(quiet)) = self.script.front() {
            let quiet = *quiet;
            self.script.pop_front();
            tokio::time::sleep(quiet).await;
        }
        match self.script.pop_front() {
            Some(Step::Event(event)) => {
                let mut log = self.log.lock().unwrap();
                match &event {
                    SessionEvent::ConnAck { .. } => log.trace.push(Trace::ConnAck),
                    SessionEvent::Publish(d) => log.trace.push(Trace::Publish(d.message.topic.clone())),
                    _ => {}
                }
                Ok(event)
            }
            Some(Step::Fail(e)) => {
                self.log.lock().unwrap().trace.push(Trace::Failure);
                Err(e)
            }
            Some(Step::Hang) | Some(Step::Pause(_)) | None => std::future::pending().await,
        }
    }

    async fn subscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), SubscriptionError> {
        let filters = subscriptions.iter().map(|s| s.filter.clone()).collect();
        self.log.lock().unwrap().trace.push(Trace::Subscribe(filters));
        Ok(())
    }

    async fn unsubscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), SubscriptionError> {
        let filters = subscriptions.iter().map(|s| s.filter.clone()).collect();
        self.log.lock().unwrap().trace.push(Trace::Unsubscribe(filters));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        self.log.lock().unwrap().trace.push(Trace::Disconnect);
        Ok(())
    }
}

pub(crate) fn connack() -> Step {
    Step::Event(SessionEvent::ConnAck { session_present: false })
}

pub(crate) fn suback(granted: &[Option<QosLevel>]) -> Step {
    Step::Event(SessionEvent::SubAck { granted: granted.to_vec() })
}

pub(crate) fn publish(topic: &str, payload: &str, pkid: u16) -> Step {
    Step::Event(SessionEvent::Publish(delivery(topic, payload, pkid)))
}

pub(crate) fn delivery(topic: &str, payload: &str, pkid: u16) -> Delivery {
    Delivery {
        message: InboundMessage::new(topic, payload, QosLevel::AtLeastOnce),
        ack: Some(AckToken { topic: topic.to_string(), pkid, qos: QosLevel::AtLeastOnce }),
    }
}

pub(crate) fn network_error() -> Step {
    Step::Fail(ConnectionError::Network("connection reset by peer".into()))
}

#[derive(Default)]
pub(crate) struct RecordingAcker {
    pub acked: Mutex<Vec<u16>>,
}

#[async_trait]
impl MessageAcker for RecordingAcker {
    async fn ack(&self, token: &AckToken) -> anyhow::Result<()> {
        self.acked.lock().unwrap().push(token.pkid);
        Ok(())
    }
}

/// In-memory sink that fails the first `fail_first` calls (`u32::MAX` = always).
#[derive(Default)]
pub(crate) struct MemorySink {
    pub stored: Mutex<Vec<InboundMessage>>,
    pub calls: Mutex<u32>,
    pub flushed: Mutex<bool>,
    fail_first: u32,
}

impl MemorySink {
    pub fn failing(fail_first: u32) -> Self {
        Self { fail_first, ..Default::default() }
    }

    pub fn topics(&self) -> Vec<String> {
        self.stored.lock().unwrap().iter().map(|m| m.topic.clone()).collect()
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn persist_batch(&self, batch: &[InboundMessage]) -> Result<(), PersistenceError> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        if *calls <= self.fail_first {
            return Err(PersistenceError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only file system",
            )));
        }
        self.stored.lock().unwrap().extend_from_slice(batch);
        Ok(())
    }

    async fn flush(&self) -> Result<(), PersistenceError> {
        *self.flushed.lock().unwrap() = true;
        Ok(())
    }
}
