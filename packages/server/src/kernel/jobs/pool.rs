//! Fixed-size worker pool.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::kernel::deps::ServerDeps;
use crate::kernel::jobs::worker::Worker;

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the configured number of workers, all observing `shutdown`.
    pub fn spawn(deps: &Arc<ServerDeps>, shutdown: &CancellationToken) -> Self {
        let count = deps.config.workers.max(1);
        let handles = (0..count)
            .map(|_| {
                let worker = Worker::new(deps.clone());
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();

        info!(count, "worker pool started");
        Self { handles }
    }

    /// Wait for every worker to exit. Callers cancel the shutdown token
    /// first; workers stop at their next suspension point.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("worker pool drained");
    }
}
