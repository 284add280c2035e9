//! Background maintenance task.
//!
//! Periodically ages out stored records, expires traces and sweeps idle
//! sessions. Missing a tick only delays cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::pipeline::LiveTelemetry;

/// Handle for controlling the background maintenance task.
pub struct MaintenanceHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Signal the task to stop and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.join_handle.await;
    }

    /// Abort the task immediately.
    pub fn abort(self) {
        self.join_handle.abort();
    }
}

/// Start the periodic maintenance task.
///
/// The first pass runs one `interval` after start.
pub fn start_maintenance(live: Arc<LiveTelemetry>, interval: Duration) -> MaintenanceHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let interval = interval.max(Duration::from_millis(1));

    let join_handle = tokio::spawn(async move {
        tracing::info!(
            interval_secs = interval.as_secs(),
            "Starting maintenance task"
        );

        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let report = live.maintain();
                    if !report.is_empty() {
                        tracing::info!(
                            spans = report.spans_pruned,
                            metrics = report.metrics_pruned,
                            logs = report.logs_pruned,
                            traces = report.traces_pruned,
                            sessions_closed = report.sessions_closed,
                            sessions_pruned = report.sessions_pruned,
                            "Maintenance pass removed data"
                        );
                    }
                }
                _ = &mut shutdown_rx => {
                    tracing::info!("Shutdown signal received, stopping maintenance task");
                    break;
                }
            }
        }
    });

    MaintenanceHandle {
        shutdown_tx: Some(shutdown_tx),
        join_handle,
    }
}
