//! Worker pool with structured concurrency.
//!
//! Workers pull messages from one bounded channel shared behind a mutex, so
//! the number of messages in flight never exceeds the number of workers.
//! Workers stop when the channel is closed and empty, which makes dropping
//! the sender the drain signal.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    error::{BrokerError, Result},
    message::QueueMessage,
};

/// Shared receiving end of the dispatch channel.
type SharedReceiver = Arc<Mutex<mpsc::Receiver<QueueMessage>>>;

/// Pool of tasks handling messages through one dispatcher.
pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    receiver: SharedReceiver,
    worker_count: usize,
    worker_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates a pool; no tasks run until `spawn_workers`.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        receiver: mpsc::Receiver<QueueMessage>,
        worker_count: usize,
    ) -> Self {
        Self {
            dispatcher,
            receiver: Arc::new(Mutex::new(receiver)),
            worker_count,
            worker_handles: Vec::new(),
        }
    }

    /// Spawns the configured number of workers.
    pub async fn spawn_workers(&mut self) {
        info!(worker_count = self.worker_count, "spawning relay workers");

        self.dispatcher.stats().write().await.active_workers = self.worker_count;

        for worker_id in 0..self.worker_count {
            let dispatcher = self.dispatcher.clone();
            let receiver = self.receiver.clone();

            let handle = tokio::spawn(async move {
                debug!(worker_id, "relay worker starting");
                run_worker(worker_id, &dispatcher, &receiver).await;
                debug!(worker_id, "relay worker stopped");
            });

            self.worker_handles.push(handle);
        }
    }

    /// Waits for workers to finish what is already queued.
    ///
    /// The caller must drop the sending half first, otherwise workers keep
    /// waiting for more messages until the timeout. Workers still running
    /// after the timeout are aborted.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ShutdownTimeout` if the timeout is exceeded.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "draining relay workers"
        );

        let mut handles = std::mem::take(&mut self.worker_handles);

        let drain = async {
            let mut panics = Vec::new();

            for (worker_id, handle) in handles.iter_mut().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(worker_id, error = %join_error, "worker task panicked");
                    let error = join_error.to_string();
                    panics.push(BrokerError::WorkerPanic { worker_id, error });
                }
            }

            panics
        };

        let drained = tokio::time::timeout(timeout, drain).await;

        let result = match drained {
            Ok(panics) => {
                if !panics.is_empty() {
                    warn!(
                        panic_count = panics.len(),
                        total_workers = self.worker_count,
                        "some workers panicked before shutdown"
                    );
                }
                info!("worker pool drained");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker drain timed out, aborting remaining workers"
                );
                for handle in &handles {
                    handle.abort();
                }
                Err(BrokerError::ShutdownTimeout { timeout })
            },
        };

        self.dispatcher.stats().write().await.active_workers = 0;

        result
    }

    /// Whether any worker is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 {
            error!(
                active_workers = active_count,
                "WorkerPool dropped without shutdown_graceful, aborting workers"
            );
            for handle in &self.worker_handles {
                handle.abort();
            }
        }
    }
}

async fn run_worker(worker_id: usize, dispatcher: &Dispatcher, receiver: &SharedReceiver) {
    loop {
        let next = receiver.lock().await.recv().await;

        let Some(message) = next else {
            break;
        };

        let delivery_tag = message.handle.delivery_tag();
        let disposition = dispatcher.handle(message).await;
        debug!(worker_id, delivery_tag, %disposition, "message settled");
    }
}
