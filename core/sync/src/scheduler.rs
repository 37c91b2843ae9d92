//! Periodic due-task scheduling.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use intsync_common::{Error, Result};

use crate::engine::DueTaskReport;

/// Scheduler request types.
#[derive(Debug)]
pub enum SchedulerRequest {
    /// Process due tasks now, outside the regular cadence.
    RunNow,
    /// Stop the scheduler loop.
    Shutdown,
}

type Request = (SchedulerRequest, oneshot::Sender<Result<DueTaskReport>>);

/// Client side of the due-task loop.
#[derive(Clone)]
pub struct DueTaskScheduler {
    interval: Duration,
    request_tx: mpsc::Sender<Request>,
    shutdown: Arc<RwLock<bool>>,
}

impl DueTaskScheduler {
    /// Create a scheduler ticking every `interval`.
    pub fn new(interval: Duration) -> (Self, DueTaskSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let shutdown = Arc::new(RwLock::new(false));

        let scheduler = Self {
            interval,
            request_tx,
            shutdown: shutdown.clone(),
        };
        let handle = DueTaskSchedulerHandle {
            interval,
            request_rx,
            shutdown,
        };

        (scheduler, handle)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one pass immediately and wait for its report.
    pub async fn run_now(&self) -> Result<DueTaskReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SchedulerRequest::RunNow, response_tx))
            .await
            .map_err(|_| Error::Internal("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Internal("Failed to receive scheduler report".to_string()))?
    }

    /// Stop the loop after the current pass.
    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;

        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SchedulerRequest::Shutdown, response_tx))
            .await;
    }

    pub async fn is_shutdown(&self) -> bool {
        *self.shutdown.read().await
    }
}

/// The loop side; consumed by [`run`](Self::run).
pub struct DueTaskSchedulerHandle {
    interval: Duration,
    request_rx: mpsc::Receiver<Request>,
    shutdown: Arc<RwLock<bool>>,
}

impl DueTaskSchedulerHandle {
    /// Run the scheduler loop.
    ///
    /// `tick_fn` is called on every interval tick (the first fires
    /// immediately) and for every [`DueTaskScheduler::run_now`] request.
    /// Passes never overlap; ticks missed during a long pass are skipped.
    pub async fn run<F, Fut>(mut self, tick_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DueTaskReport>> + Send,
    {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval = ?self.interval, "Due-task scheduler started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some((SchedulerRequest::RunNow, response_tx)) => {
                            debug!("Processing due tasks on request");
                            let _ = response_tx.send(tick_fn().await);
                        }
                        Some((SchedulerRequest::Shutdown, _)) | None => break,
                    }
                }

                _ = ticker.tick() => {
                    match tick_fn().await {
                        Ok(report) => debug!(
                            triggered = report.triggered.len(),
                            skipped = report.skipped.len(),
                            "Scheduled pass completed"
                        ),
                        Err(e) => error!("Scheduled pass failed: {}", e),
                    }
                }
            }
        }

        info!("Due-task scheduler shutting down");
    }
}
