use tokio::sync::watch;
use tracing::{info, warn};

use crate::domain::{ConnectionState, ProcessState};

/// Publishes connection and process state so liveness can be observed from outside.
pub struct Lifecycle {
    connection: watch::Sender<ConnectionState>,
    process: watch::Sender<ProcessState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        let (process, _) = watch::channel(ProcessState::Starting);
        Self { connection, process }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn process_state(&self) -> ProcessState {
        *self.process.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn watch_process(&self) -> watch::Receiver<ProcessState> {
        self.process.subscribe()
    }

    pub fn set_connection(&self, next: ConnectionState) {
        let changed = self.connection.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            metrics::gauge!("mqtt_connection_state", next.as_gauge());
        }
    }

    /// Moves the process state machine; invalid moves are logged and ignored.
    pub fn advance(&self, next: ProcessState) -> bool {
        let mut from = None;
        let moved = self.process.send_if_modified(|state| {
            if state.can_transition_to(next) {
                from = Some(*state);
                *state = next;
                true
            } else {
                from = Some(*state);
                false
            }
        });
        match (moved, from) {
            (true, Some(prev)) => info!("Process state {:?} -> {:?}", prev, next),
            (false, Some(prev)) if prev != next => warn!("Ignoring process transition {:?} -> {:?}", prev, next),
            _ => {}
        }
        moved
    }
}

/// Logs every connection and process state change until the process stops.
pub async fn report_liveness(
    mut connection: watch::Receiver<ConnectionState>,
    mut process: watch::Receiver<ProcessState>,
) {
    loop {
        tokio::select! {
            changed = connection.changed() => {
                if changed.is_err() { break; }
                let state = *connection.borrow_and_update();
                info!("Broker connection: {:?}", state);
            }
            changed = process.changed() => {
                if changed.is_err() { break; }
                if *process.borrow_and_update() == ProcessState::Stopped {
                    break;
                }
            }
        }
    }
}
