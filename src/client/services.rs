//! Process-wide helpers shared by every session.

use std::sync::Arc;

use tracing::debug;

use crate::client::callback::CallbackServer;
use crate::client::config::CallbackConfig;
use crate::error::RpcResult;
use crate::protocol::rpc::WorkQueue;

/// Background machinery sessions depend on: the queue recall jobs run on
/// and the server receiving callbacks.
#[derive(Clone, Debug)]
pub struct Services {
    pub work_queue: WorkQueue,
    pub callbacks: Arc<CallbackServer>,
}

impl Services {
    pub async fn start(config: &CallbackConfig) -> RpcResult<Services> {
        let callbacks = CallbackServer::start(config).await?;
        Ok(Services { work_queue: WorkQueue::start(), callbacks })
    }

    /// Finishes queued work, then stops the queue and the callback server.
    pub async fn shutdown(&self) {
        if let Err(e) = self.work_queue.drain().await {
            debug!("Work queue already stopped: {}", e);
        }
        self.work_queue.shutdown().await;
        self.callbacks.shutdown().await;
    }
}
