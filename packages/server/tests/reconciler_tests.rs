//! Startup reconciliation of orphaned provisioning jobs.

mod common;

use std::time::Duration;

use common::harness::{minimal_recipe, TestHarness};
use server_core::kernel::jobs::reconciler;
use server_core::kernel::store::{EventLevel, Job, JobEvent, JobStatus, TerminalOutcome};

const TTL: Duration = Duration::from_secs(60);

#[tokio::test]
async fn orphaned_provisioning_job_is_requeued_with_an_event() {
    let h = TestHarness::new().await;
    h.upsert_server("SER-1").await;
    let id = h.create_job("SER-1", minimal_recipe()).await;

    // Simulate a crash: the job is provisioning under a worker that is gone.
    Job::acquire_queued("stale-worker", TTL, h.store())
        .await
        .unwrap()
        .expect("acquired");
    Job::set_task_iso_path(id, "/tmp/stale/task.iso", h.store())
        .await
        .unwrap();

    assert_eq!(reconciler::requeue_orphans(h.store()).await.unwrap(), 1);

    let job = h.get_job(id).await;
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.worker_id.is_none());
    assert!(job.picked_at.is_none());
    assert!(job.lease_expires_at.is_none());
    assert!(job.task_iso_path.is_none());

    let events = JobEvent::list_for_job(id, h.store()).await.unwrap();
    let reconcile = events
        .iter()
        .find(|e| e.step.as_deref() == Some("reconcile"))
        .expect("reconcile event");
    assert_eq!(reconcile.level, EventLevel::Info);
}

#[tokio::test]
async fn reconciler_ignores_settled_jobs() {
    let h = TestHarness::new().await;
    h.upsert_server("SER-1").await;

    let first = h.create_job("SER-1", minimal_recipe()).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.create_job("SER-1", minimal_recipe()).await;
    // FIFO: the first job gets acquired; finish it so nothing is orphaned.
    Job::acquire_queued("w1", TTL, h.store()).await.unwrap();
    Job::mark_status(first, TerminalOutcome::Succeeded, None, h.store())
        .await
        .unwrap();

    assert_eq!(reconciler::requeue_orphans(h.store()).await.unwrap(), 0);
    assert_eq!(h.get_job(first).await.status, JobStatus::Succeeded);
    assert_eq!(h.get_job(second).await.status, JobStatus::Queued);
}

#[tokio::test]
async fn reconciler_is_idempotent() {
    let h = TestHarness::new().await;
    h.upsert_server("SER-1").await;
    h.create_job("SER-1", minimal_recipe()).await;
    Job::acquire_queued("stale-worker", TTL, h.store())
        .await
        .unwrap();

    assert_eq!(reconciler::requeue_orphans(h.store()).await.unwrap(), 1);
    assert_eq!(reconciler::requeue_orphans(h.store()).await.unwrap(), 0);
}
