pub mod backoff;
pub mod connection;
pub mod controller;
pub mod lifecycle;
pub mod recorder;
pub mod subscription;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{run_logger, RunSettings};
pub use recorder::BatchSettings;

use tokio::sync::watch;

/// Resolves once `true` is published. A dropped sender never resolves.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_flag_resolves_waiters() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sender_never_signals() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let waited = tokio::time::timeout(Duration::from_secs(5), wait_for_shutdown(&mut rx)).await;
        assert!(waited.is_err());
    }
}
