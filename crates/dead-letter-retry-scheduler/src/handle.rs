//! Shutdown handle for background consumption loops.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Owns the consumption loops started by the scheduler or the poison
/// monitor. Dropping the handle stops the loops as well.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub(crate) fn new(shutdown: watch::Sender<bool>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { shutdown, tasks }
    }

    /// Whether any consumption loop is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Stop consuming and wait for the loops to exit. Deferred republishes
    /// already scheduled are not cancelled.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Consumption loop ended abnormally");
            }
        }
        debug!("Consumption loops stopped");
    }
}

/// Resolves once shutdown was requested or the handle was dropped.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
