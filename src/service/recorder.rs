use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, error, info, warn, Instrument};

use crate::domain::{AckToken, Delivery, InboundMessage};
use crate::error::PersistenceError;
use crate::ports::{MessageAcker, MessageSink};

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub batch_window: Duration,
    /// Retries after the first failed write; total attempts is `max_retries + 1`.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_window: Duration::from_millis(50),
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Drains the delivery channel into the sink in arrival order.
///
/// A delivery is acknowledged to the broker only after the batch holding it has been
/// durably written. Returns the number of records persisted once the channel closes,
/// or the first write that could not be completed within the retry budget; in that
/// case nothing from the failed batch is acknowledged.
pub async fn run_batch_executor(
    mut receiver: Receiver<Delivery>,
    sink: Arc<dyn MessageSink>,
    acker: Arc<dyn MessageAcker>,
    settings: BatchSettings,
) -> Result<u64, PersistenceError> {
    info!("Batch Executor Started.");
    let batch_size = settings.batch_size.max(1);
    let mut persisted = 0u64;

    loop {
        let mut messages = Vec::with_capacity(batch_size);
        let mut acks = Vec::with_capacity(batch_size);

        // Block for 1st item
        let first = match receiver.recv().await {
            Some(d) => d,
            None => {
                info!("Ingest Channel Closed. Stopping Executor.");
                break;
            }
        };
        push(first, &mut messages, &mut acks);

        let deadline = tokio::time::Instant::now() + settings.batch_window;
        while messages.len() < batch_size {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(d)) => push(d, &mut messages, &mut acks),
                _ => break, // window elapsed or channel closed
            }
        }

        let span = tracing::info_span!("batch_flush", batch_size = messages.len());
        flush_batch(&messages, &acks, sink.as_ref(), acker.as_ref(), &settings)
            .instrument(span)
            .await?;
        persisted += messages.len() as u64;
    }

    sink.flush().await?;
    info!("Batch Executor drained; {} records persisted.", persisted);
    Ok(persisted)
}

fn push(delivery: Delivery, messages: &mut Vec<InboundMessage>, acks: &mut Vec<AckToken>) {
    messages.push(delivery.message);
    if let Some(token) = delivery.ack {
        acks.push(token);
    }
}

async fn flush_batch(
    messages: &[InboundMessage],
    acks: &[AckToken],
    sink: &dyn MessageSink,
    acker: &dyn MessageAcker,
    settings: &BatchSettings,
) -> Result<(), PersistenceError> {
    metrics::histogram!("batch_size", messages.len() as f64);
    let start = std::time::Instant::now();

    persist_with_retry(messages, sink, settings).await?;

    metrics::histogram!("sink_write_duration_seconds", start.elapsed().as_secs_f64());
    metrics::counter!("records_persisted_total", messages.len() as u64);

    for token in acks {
        // Broker will redeliver anything we fail to ack here.
        if let Err(e) = acker.ack(token).await {
            error!("Ack Failed for {} (pkid {}): {:?}", token.topic, token.pkid, e);
        }
    }
    debug!("Flushed {} records, acked {}", messages.len(), acks.len());
    Ok(())
}

async fn persist_with_retry(
    messages: &[InboundMessage],
    sink: &dyn MessageSink,
    settings: &BatchSettings,
) -> Result<(), PersistenceError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match sink.persist_batch(messages).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                metrics::counter!("persist_failures_total", 1);
                if attempt > settings.max_retries {
                    error!("Persisting {} records failed after {} attempts: {}", messages.len(), attempt, e);
                    return Err(PersistenceError::RetriesExhausted {
                        batch: messages.len(),
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                warn!("Batch write failed ({}). Retry {}/{} in {:?}", e, attempt, settings.max_retries, settings.retry_delay);
                tokio::time::sleep(settings.retry_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::{delivery, MemorySink, RecordingAcker};
    use tokio::sync::mpsc;

    fn settings(batch_size: usize, max_retries: u32) -> BatchSettings {
        BatchSettings {
            batch_size,
            batch_window: Duration::from_millis(20),
            max_retries,
            retry_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn persists_in_order_then_acks() {
        let sink = Arc::new(MemorySink::default());
        let acker = Arc::new(RecordingAcker::default());
        let (tx, rx) = mpsc::channel(16);

        for (i, topic) in ["sensors/a", "sensors/b", "sensors/c", "sensors/a"].iter().enumerate() {
            tx.send(delivery(topic, "x", i as u16 + 1)).await.unwrap();
        }
        drop(tx);

        let persisted = run_batch_executor(rx, sink.clone(), acker.clone(), settings(3, 0)).await.unwrap();

        assert_eq!(persisted, 4);
        assert_eq!(sink.topics(), vec!["sensors/a", "sensors/b", "sensors/c", "sensors/a"]);
        assert_eq!(*acker.acked.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(*sink.calls.lock().unwrap(), 2, "batch size 3 splits four records into two writes");
        assert!(*sink.flushed.lock().unwrap());
    }

    #[tokio::test]
    async fn qos0_messages_are_persisted_without_ack() {
        let sink = Arc::new(MemorySink::default());
        let acker = Arc::new(RecordingAcker::default());
        let (tx, rx) = mpsc::channel(4);

        tx.send(Delivery {
            message: InboundMessage::new("status/online", "1", crate::domain::QosLevel::AtMostOnce),
            ack: None,
        })
        .await
        .unwrap();
        drop(tx);

        assert_eq!(run_batch_executor(rx, sink.clone(), acker.clone(), settings(10, 0)).await.unwrap(), 1);
        assert!(acker.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let sink = Arc::new(MemorySink::failing(2));
        let acker = Arc::new(RecordingAcker::default());
        let (tx, rx) = mpsc::channel(4);
        tx.send(delivery("sensors/temp", "21.5", 7)).await.unwrap();
        drop(tx);

        assert_eq!(run_batch_executor(rx, sink.clone(), acker.clone(), settings(10, 3)).await.unwrap(), 1);
        assert_eq!(*sink.calls.lock().unwrap(), 3);
        assert_eq!(*acker.acked.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn persistent_failure_stops_without_acking() {
        let sink = Arc::new(MemorySink::failing(u32::MAX));
        let acker = Arc::new(RecordingAcker::default());
        let (tx, rx) = mpsc::channel(4);
        tx.send(delivery("sensors/temp", "21.5", 1)).await.unwrap();
        tx.send(delivery("sensors/temp", "21.6", 2)).await.unwrap();

        let err = run_batch_executor(rx, sink.clone(), acker.clone(), settings(10, 2)).await.unwrap_err();

        match err {
            PersistenceError::RetriesExhausted { batch, attempts, .. } => {
                assert_eq!(batch, 2);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(acker.acked.lock().unwrap().is_empty());
        assert!(sink.stored.lock().unwrap().is_empty());
        drop(tx);
    }

    #[tokio::test]
    async fn empty_channel_returns_zero() {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let sink = Arc::new(MemorySink::default());
        let n = run_batch_executor(rx, sink.clone(), Arc::new(RecordingAcker::default()), BatchSettings::default())
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert!(*sink.flushed.lock().unwrap());
    }
}
