//! Asynchronous work queue for jobs that must not run inside the code path
//! that discovered them, such as returning a recalled delegation while the
//! server waits for the callback reply.
//!
//! Jobs run one at a time in submission order on a single worker task.

use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// A named unit of background work.
pub struct WorkItem {
    /// Label used in logs
    pub name: String,
    /// The job itself
    pub job: BoxFuture<'static, anyhow::Result<()>>,
}

/// Handle to the shared work queue. Cloning is cheap; all clones feed the
/// same worker.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    sender: mpsc::UnboundedSender<WorkItem>,
    shutdown: CancellationToken,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WorkQueue {
    /// Starts the worker task. Must be called inside a tokio runtime.
    pub fn start() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<WorkItem>();
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();

        let worker = tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    item = receiver.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };
                trace!("Running work item {}", item.name);
                if let Err(e) = item.job.await {
                    error!("Work item {} failed: {:?}", item.name, e);
                }
            }
            debug!("Work queue worker finished");
        });

        Self { sender, shutdown, worker: Arc::new(Mutex::new(Some(worker))) }
    }

    /// Queues `job` and returns immediately.
    pub fn submit<F>(&self, name: impl Into<String>, job: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let item = WorkItem { name: name.into(), job: job.boxed() };
        self.sender
            .send(item)
            .map_err(|e| anyhow!("Failed to queue work item {}: queue closed", e.0.name))
    }

    /// Waits until every job submitted before this call has finished.
    pub async fn drain(&self) -> anyhow::Result<()> {
        let (done, finished) = oneshot::channel();
        self.submit("drain", async move {
            let _ = done.send(());
            Ok(())
        })?;
        finished.await.map_err(|_| anyhow!("Work queue stopped before draining"))
    }

    /// Stops the worker after the job it is currently running, if any, and
    /// waits for it. Jobs still queued are dropped.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().expect("unable to lock worker handle").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}
