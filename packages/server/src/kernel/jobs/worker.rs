//! Provisioning worker.
//!
//! Each worker independently races `Job::acquire_queued`; there is no central
//! dispatcher. While a job runs, a heartbeat task extends the lease at half
//! the TTL. If an extension reports the lease is no longer ours, the worker
//! cancels the pipeline and makes no further store writes for that job.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::kernel::deps::ServerDeps;
use crate::kernel::jobs::pipeline::{Pipeline, PipelineOutcome};
use crate::kernel::store::{EventLevel, Job, JobEvent};

pub struct Worker {
    deps: Arc<ServerDeps>,
    id: String,
}

impl Worker {
    pub fn new(deps: Arc<ServerDeps>) -> Self {
        Self {
            deps,
            id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker_id = %self.id, "worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let acquired = Job::acquire_queued(
                &self.id,
                self.deps.config.lease_ttl(),
                &self.deps.store,
            )
            .await;

            let job = match acquired {
                Ok(Some(job)) => job,
                Ok(None) => {
                    // Nothing queued; a dead worker may have left an expired
                    // lease behind.
                    match self.try_steal().await {
                        Ok(Some(job)) => {
                            self.process(job, &shutdown).await;
                            continue;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(worker_id = %self.id, error = %e, "lease steal attempt failed");
                        }
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(jittered(self.deps.config.poll_interval())) => {}
                    }
                    continue;
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "failed to poll for queued jobs");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            self.process(job, &shutdown).await;
        }

        info!(worker_id = %self.id, "worker stopped");
    }

    /// Take over the oldest expired-lease provisioning job, if one exists.
    /// The pipeline restarts from the top; every hardware step is idempotent
    /// and the task ISO build is deterministic.
    async fn try_steal(&self) -> anyhow::Result<Option<Job>> {
        let Some(candidate) = Job::find_expired_provisioning(&self.deps.store).await? else {
            return Ok(None);
        };

        let old_worker = candidate.worker_id.clone().unwrap_or_default();
        if !Job::steal_expired_lease(
            candidate.id,
            &self.id,
            self.deps.config.lease_ttl(),
            &self.deps.store,
        )
        .await?
        {
            // Someone else got there first, or the lease was refreshed.
            return Ok(None);
        }

        warn!(worker_id = %self.id, job_id = %candidate.id, %old_worker, "stole expired lease");
        JobEvent::append(
            candidate.id,
            EventLevel::Warn,
            None,
            &format!("lease stolen from {old_worker} by {}", self.id),
            &self.deps.store,
        )
        .await?;

        Job::find_by_id(candidate.id, &self.deps.store)
            .await
            .map(|job| job.filter(|j| j.worker_id.as_deref() == Some(self.id.as_str())))
    }

    async fn process(&self, job: Job, shutdown: &CancellationToken) {
        let job_id = job.id;
        debug!(worker_id = %self.id, %job_id, "acquired job");

        if let Err(e) = JobEvent::append(
            job_id,
            EventLevel::Info,
            None,
            &format!("picked up by {}", self.id),
            &self.deps.store,
        )
        .await
        {
            warn!(%job_id, error = %e, "failed to append acquire event");
        }

        let cancel = shutdown.child_token();
        let heartbeat = self.spawn_heartbeat(job_id, cancel.clone());

        let outcome = Pipeline::new(self.deps.clone(), job, cancel.clone()).run().await;

        cancel.cancel();
        let _ = heartbeat.await;

        match outcome {
            Ok(PipelineOutcome::Finished(status)) => {
                debug!(worker_id = %self.id, %job_id, ?status, "job finished");
                self.closing_event(job_id, &format!("job finished as {}", status.as_str()))
                    .await;
            }
            Ok(PipelineOutcome::Failed { step }) => {
                debug!(worker_id = %self.id, %job_id, step, "job failed");
                self.closing_event(job_id, &format!("job failed at {step}")).await;
            }
            Ok(PipelineOutcome::Evicted) => {
                // Not ours anymore: the reconciler or another worker owns the
                // follow-up. No store writes.
                info!(worker_id = %self.id, %job_id, "job abandoned after lease loss or shutdown");
            }
            Err(e) => {
                error!(worker_id = %self.id, %job_id, error = %e, "pipeline error");
            }
        }
    }

    async fn closing_event(&self, job_id: Uuid, message: &str) {
        if let Err(e) =
            JobEvent::append(job_id, EventLevel::Info, None, message, &self.deps.store).await
        {
            warn!(%job_id, error = %e, "failed to append closing event");
        }
    }

    fn spawn_heartbeat(
        &self,
        job_id: Uuid,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.deps.store.clone();
        let lease_ttl = self.deps.config.lease_ttl();
        let worker_id = self.id.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(lease_ttl / 2);
            interval.tick().await; // the interval's immediate first tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match Job::extend_lease(job_id, &worker_id, lease_ttl, &store).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(%job_id, %worker_id, "lease no longer ours; cancelling pipeline");
                                cancel.cancel();
                                break;
                            }
                            // Transient store trouble is not an eviction; the
                            // lease has TTL/2 of slack left.
                            Err(e) => warn!(%job_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
        })
    }
}

fn jittered(base: Duration) -> Duration {
    let quarter = (base.as_millis() as u64 / 4).max(1);
    base + Duration::from_millis(rand::rng().random_range(0..quarter))
}
