use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tracing::{error, info, warn};

use crate::domain::{ProcessState, Subscription};
use crate::error::{LoggerError, PersistenceError};
use crate::ports::{MessageAcker, MessageSink};
use crate::service::connection::ConnectionManager;
use crate::service::lifecycle::Lifecycle;
use crate::service::recorder::{run_batch_executor, BatchSettings};
use crate::service::subscription::SubscriptionHandler;
use crate::service::wait_for_shutdown;

#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub batch: BatchSettings,
    pub channel_capacity: usize,
    /// Upper bound on waiting for queued messages to reach the sink at shutdown.
    pub drain_timeout: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            batch: BatchSettings::default(),
            channel_capacity: 1000,
            drain_timeout: Duration::from_secs(20),
        }
    }
}

type ExecutorOutcome = Result<Result<u64, PersistenceError>, JoinError>;

enum First {
    Subscription(Result<(), LoggerError>),
    Executor(ExecutorOutcome),
}

/// Runs the logger until shutdown or a fatal error. Returns the number of records persisted.
///
/// Order on the way out: stop taking deliveries, unsubscribe, drain the queue into the sink
/// (acking as batches land), then disconnect so the queued acks reach the broker.
pub async fn run_logger(
    connection: ConnectionManager,
    subscriptions: Vec<Subscription>,
    sink: Arc<dyn MessageSink>,
    acker: Arc<dyn MessageAcker>,
    settings: RunSettings,
    lifecycle: Arc<Lifecycle>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u64, LoggerError> {
    let subscribed = tokio::select! {
        _ = wait_for_shutdown(&mut shutdown) => {
            info!("Shutdown requested before the broker connection was established.");
            stop(&lifecycle);
            return Ok(0);
        }
        r = SubscriptionHandler::subscribe(connection, subscriptions, lifecycle.clone()) => r,
    };
    let mut handler = match subscribed {
        Ok(h) => h,
        Err(e) => {
            error!("Failed to start subscription: {}", e);
            stop(&lifecycle);
            return Err(e);
        }
    };

    let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
    let mut executor = tokio::spawn(run_batch_executor(rx, sink, acker, settings.batch));

    info!("System Running. Logging {} filters. Press Ctrl+C to stop.", handler.subscriptions().len());

    let first = tokio::select! {
        r = handler.run(tx, shutdown.clone()) => First::Subscription(r),
        r = &mut executor => First::Executor(r),
    };
    lifecycle.advance(ProcessState::Draining);

    let (subscription_result, executor_result) = match first {
        First::Executor(r) => (Ok(()), executor_outcome(r)),
        First::Subscription(r) => {
            if let Err(e) = handler.unsubscribe().await {
                warn!("Unsubscribe before draining failed: {}", e);
            }
            info!("Waiting for Batch Executor to flush...");
            let outcome = match drain(&mut executor, &mut handler, settings.drain_timeout).await {
                Some(outcome) => executor_outcome(outcome),
                None => {
                    warn!("Timeout waiting for Executor.");
                    executor.abort();
                    // Unflushed messages stay unacked; only a persistent session gets them again.
                    Err(LoggerError::Internal(format!(
                        "batch executor did not drain within {:?}",
                        settings.drain_timeout
                    )))
                }
            };
            (r, outcome)
        }
    };

    if let Err(e) = handler.close().await {
        warn!("Broker disconnect was not clean: {}", e);
    }
    stop(&lifecycle);

    let persisted = executor_result?;
    subscription_result?;

    info!("Shutdown Complete. {} records persisted.", persisted);
    Ok(persisted)
}

/// Waits for the executor while keeping the broker session serviced so pending acks go out.
/// Deliveries still in flight after the UNSUBSCRIBE are dropped unacked and counted.
/// `None` on timeout.
async fn drain(
    executor: &mut tokio::task::JoinHandle<Result<u64, PersistenceError>>,
    handler: &mut SubscriptionHandler,
    timeout: Duration,
) -> Option<ExecutorOutcome> {
    let wait = async {
        let mut polling = true;
        loop {
            tokio::select! {
                r = &mut *executor => return r,
                next = handler.next_delivery(), if polling => match next {
                    Ok(d) => {
                        warn!("Dropping delivery on {} that arrived while draining", d.message.topic);
                        metrics::counter!("mqtt_messages_dropped_total", 1);
                    }
                    Err(e) => {
                        warn!("Broker session lost while draining: {}", e);
                        polling = false;
                    }
                },
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.ok()
}

fn executor_outcome(outcome: ExecutorOutcome) -> Result<u64, LoggerError> {
    match outcome {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => {
            error!("Batch Executor failed: {}", e);
            Err(e.into())
        }
        Err(e) => Err(LoggerError::Internal(format!("batch executor panicked: {}", e))),
    }
}

fn stop(lifecycle: &Lifecycle) {
    lifecycle.advance(ProcessState::Draining);
    lifecycle.advance(ProcessState::Stopped);
}
