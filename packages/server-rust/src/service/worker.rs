//! Background task driver.
//!
//! A [`BackgroundWorker`] owns one spawned task that feeds submitted jobs and
//! periodic ticks to a [`BackgroundRunnable`]. The client's endpoint refresher
//! runs on it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const TASK_QUEUE_CAPACITY: usize = 64;

#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Handles one submitted job.
    async fn run(&mut self, task: Self::Task);

    /// Called on every tick of the worker interval.
    async fn on_tick(&mut self) {}

    /// Called once after the loop exits.
    async fn shutdown(&mut self) {}
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker stopped")]
    Stopped,
    #[error("worker queue full")]
    QueueFull,
}

/// Handle to a spawned runnable.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: mpsc::Sender<R::Task>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker loop. The first tick fires one `tick` after start.
    ///
    /// `cancel` stops the loop from the outside as well, so a worker can be
    /// tied to a server shutdown token.
    #[must_use]
    pub fn spawn(mut runnable: R, tick: Duration, cancel: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(TASK_QUEUE_CAPACITY);
        let stop = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = stop.cancelled() => break,
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = interval.tick() => runnable.on_tick().await,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx,
            cancel,
            handle: Some(handle),
        }
    }

    /// Queues a job without waiting for capacity.
    ///
    /// # Errors
    ///
    /// `WorkerError::QueueFull` when the queue is at capacity,
    /// `WorkerError::Stopped` once the loop has exited.
    pub fn submit(&self, task: R::Task) -> Result<(), WorkerError> {
        self.tx.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => WorkerError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => WorkerError::Stopped,
        })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancels the loop and waits for `shutdown` to complete.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "background worker ended abnormally");
            }
        }
    }
}

impl<R: BackgroundRunnable> Drop for BackgroundWorker<R> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
