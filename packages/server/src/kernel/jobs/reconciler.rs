//! Startup reconciliation.
//!
//! A crash leaves acquired jobs parked in `provisioning` with a lease that
//! would only lapse after the TTL. Before workers start, every such job is
//! returned to the head of the queue instead of waiting out the lease.

use anyhow::Result;
use tracing::{info, warn};

use crate::kernel::store::{EventLevel, Job, JobEvent, Store};

pub async fn requeue_orphans(store: &Store) -> Result<usize> {
    let orphans = Job::list_provisioning(store).await?;
    let mut requeued = 0;

    for job in orphans {
        if Job::requeue_provisioning(job.id, store).await? {
            JobEvent::append(
                job.id,
                EventLevel::Info,
                Some("reconcile"),
                "requeued job orphaned by controller restart",
                store,
            )
            .await?;
            requeued += 1;
        } else {
            // Raced with a webhook that just finished it; nothing to do.
            warn!(job_id = %job.id, "orphan left provisioning before requeue");
        }
    }

    if requeued > 0 {
        info!(requeued, "requeued orphaned provisioning jobs");
    }
    Ok(requeued)
}
