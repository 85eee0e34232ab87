//! Background Task Shutdown
//!
//! Stop signal shared by the probe loop and the replication feeds of one
//! data source, plus a bounded join of their task handles on close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Stop signal for the tasks a data source spawned.
///
/// Tasks subscribe before they are spawned and exit when the signal fires.
#[derive(Clone)]
pub struct ShutdownController {
    stop_tx: broadcast::Sender<()>,
    stopped: Arc<AtomicBool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            stop_tx,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Receiver that fires once shutdown is signalled.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.stop_tx.subscribe()
    }

    /// Signal every subscribed task to stop. Idempotent.
    pub fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("stopping background tasks");
            let _ = self.stop_tx.send(());
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Signal shutdown and wait for `tasks` to exit.
    ///
    /// Tasks still running when `timeout` runs out are aborted. Returns how
    /// many were aborted.
    pub async fn join(&self, tasks: Vec<JoinHandle<()>>, timeout: Duration) -> usize {
        self.shutdown();

        let deadline = Instant::now() + timeout;
        let mut aborted = 0;
        for mut task in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => tracing::error!("background task failed: {}", e),
                Err(_) => {
                    task.abort();
                    aborted += 1;
                }
            }
        }

        if aborted > 0 {
            tracing::warn!(
                "aborted {} background task(s) still running after {:?}",
                aborted,
                timeout
            );
        }
        aborted
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn until_stopped(controller: &ShutdownController) -> JoinHandle<()> {
        let mut stop = controller.subscribe();
        tokio::spawn(async move {
            let _ = stop.recv().await;
        })
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let controller = ShutdownController::new();
        assert!(!controller.is_shutdown());

        controller.shutdown();
        controller.shutdown();
        assert!(controller.is_shutdown());
    }

    #[tokio::test]
    async fn test_subscribers_see_the_signal() {
        let controller = ShutdownController::new();
        let mut rx = controller.clone().subscribe();

        controller.shutdown();

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_join_waits_for_cooperative_tasks() {
        let controller = ShutdownController::new();
        let tasks = vec![until_stopped(&controller), until_stopped(&controller)];

        assert_eq!(controller.join(tasks, Duration::from_secs(1)).await, 0);
        assert!(controller.is_shutdown());
    }

    #[tokio::test]
    async fn test_join_aborts_tasks_past_the_deadline() {
        let controller = ShutdownController::new();
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let tasks = vec![until_stopped(&controller), stuck];

        let started = std::time::Instant::now();
        assert_eq!(controller.join(tasks, Duration::from_millis(50)).await, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_join_tolerates_panicked_task() {
        let controller = ShutdownController::new();
        let panicked = tokio::spawn(async { panic!("feed task crashed") });

        assert_eq!(controller.join(vec![panicked], Duration::from_secs(1)).await, 0);
    }
}
