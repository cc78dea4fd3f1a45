//! Per-job provisioning pipeline.
//!
//! A fixed step machine over an acquired, provisioning-state job:
//!
//! ```text
//! build_iso -> attach_media -> set_boot -> power_cycle -> await_callback -> cleanup
//! ```
//!
//! Every step appends a job event; unrecoverable errors mark the job
//! `failed` with the step name. Lease loss or shutdown cancels the pipeline
//! at the next suspension point, after which it makes no further store
//! writes: the job is rescued later by the reconciler or a lease steal.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio_util::sync::CancellationToken;

use crate::kernel::bmc::{BmcClient, BootDevice, PowerState};
use crate::kernel::deps::ServerDeps;
use crate::kernel::store::{EventLevel, Job, JobEvent, JobStatus, ServerRecord, TerminalOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    BuildIso,
    AttachMedia,
    SetBoot,
    PowerCycle,
    AwaitCallback,
    Cleanup,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::BuildIso => "build_iso",
            Step::AttachMedia => "attach_media",
            Step::SetBoot => "set_boot",
            Step::PowerCycle => "power_cycle",
            Step::AwaitCallback => "await_callback",
            Step::Cleanup => "cleanup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Terminal state reached and cleanup ran.
    Finished(JobStatus),
    /// Unrecoverable step failure recorded on the job.
    Failed { step: &'static str },
    /// Lease lost or shutdown requested; the job was left as-is.
    Evicted,
}

enum AwaitResult {
    Terminal,
    TimedOut,
    Cancelled,
    NotOurs,
}

pub struct Pipeline {
    deps: Arc<ServerDeps>,
    job: Job,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(deps: Arc<ServerDeps>, job: Job, cancel: CancellationToken) -> Self {
        Self { deps, job, cancel }
    }

    pub async fn run(self) -> Result<PipelineOutcome> {
        let job_id = self.job.id;

        // build_iso
        if self.cancel.is_cancelled() {
            return Ok(PipelineOutcome::Evicted);
        }
        match self.build_iso().await {
            Ok(path) => {
                Job::set_task_iso_path(job_id, &path, &self.deps.store).await?;
                self.event(EventLevel::Info, Step::BuildIso, &format!("task ISO built at {path}"))
                    .await?;
            }
            Err(e) => {
                if self.cancel.is_cancelled() {
                    return Ok(PipelineOutcome::Evicted);
                }
                return self.fail(Step::BuildIso, e).await;
            }
        }

        // Everything from here on needs the server's BMC.
        let server =
            match ServerRecord::find_by_serial(&self.job.server_serial, &self.deps.store).await? {
                Some(server) => server,
                None => {
                    return self
                        .fail(
                            Step::AttachMedia,
                            anyhow!("server {} no longer exists", self.job.server_serial),
                        )
                        .await
                }
            };
        let bmc = match self.deps.bmc.connect(&server).await {
            Ok(bmc) => bmc,
            Err(e) => return self.fail(Step::AttachMedia, e).await,
        };
        ServerRecord::touch_last_seen(&server.serial, &self.deps.store).await?;

        // attach_media
        if let Err(e) = self.attach_media(&bmc, &server).await {
            if self.cancel.is_cancelled() {
                return Ok(PipelineOutcome::Evicted);
            }
            return self.fail(Step::AttachMedia, e).await;
        }
        self.event(EventLevel::Info, Step::AttachMedia, "task ISO attached as virtual media")
            .await?;
        if let Some(outcome) = self.terminal_shortcut(&bmc).await? {
            return Ok(outcome);
        }

        // set_boot
        if let Err(e) = self
            .with_retries(|| bmc.set_boot_override_once(BootDevice::VirtualCd))
            .await
        {
            if self.cancel.is_cancelled() {
                return Ok(PipelineOutcome::Evicted);
            }
            return self.fail(Step::SetBoot, e).await;
        }
        self.event(EventLevel::Info, Step::SetBoot, "one-shot boot override set to virtual CD")
            .await?;

        // power_cycle
        if let Err(e) = self.power_cycle(&bmc).await {
            if self.cancel.is_cancelled() {
                return Ok(PipelineOutcome::Evicted);
            }
            return self.fail(Step::PowerCycle, e).await;
        }
        self.event(EventLevel::Info, Step::PowerCycle, "server powered on from maintenance image")
            .await?;
        if let Some(outcome) = self.terminal_shortcut(&bmc).await? {
            return Ok(outcome);
        }

        // await_callback
        self.event(
            EventLevel::Info,
            Step::AwaitCallback,
            "waiting for dispatcher callback",
        )
        .await?;
        match self.await_callback().await? {
            AwaitResult::Terminal | AwaitResult::TimedOut => self.cleanup(&bmc).await,
            AwaitResult::Cancelled => Ok(PipelineOutcome::Evicted),
            AwaitResult::NotOurs => Ok(PipelineOutcome::Evicted),
        }
    }

    async fn build_iso(&self) -> Result<String> {
        let iso = self.deps.iso.clone();
        let job_id = self.job.id;
        let recipe = self.job.recipe.0.clone();
        let callback_url = self.deps.callback_url(&self.job.server_serial);

        let attempts = self.deps.config.bmc_retries.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            if self.cancel.is_cancelled() {
                return Err(anyhow!("cancelled"));
            }

            let iso = iso.clone();
            let recipe = recipe.clone();
            let callback_url = callback_url.clone();
            let result = tokio::task::spawn_blocking(move || {
                iso.build(job_id, &recipe, &callback_url)
            })
            .await
            .context("task ISO build task panicked")?;

            match result {
                Ok(path) => return Ok(path.display().to_string()),
                Err(e) => {
                    tracing::warn!(%job_id, attempt, error = %e, "task ISO build failed");
                    last_err = Some(e);
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("task ISO build failed")))
    }

    async fn attach_media(&self, bmc: &Arc<dyn BmcClient>, server: &ServerRecord) -> Result<()> {
        // Clear whatever a previous attempt may have left attached.
        self.with_retries(|| bmc.eject_virtual_media()).await?;

        let media_url = self
            .deps
            .signer
            .mint(self.job.id, bmc_host_ip(&server.bmc_address));
        self.with_retries(|| bmc.insert_virtual_media(&media_url))
            .await
    }

    async fn power_cycle(&self, bmc: &Arc<dyn BmcClient>) -> Result<()> {
        let state = self.with_retries(|| bmc.power_state()).await?;
        if state == PowerState::On {
            self.with_retries(|| bmc.power_off()).await?;
            self.wait_for_power(bmc, PowerState::Off).await?;
        }
        self.with_retries(|| bmc.power_on()).await?;
        self.wait_for_power(bmc, PowerState::On).await
    }

    async fn wait_for_power(&self, bmc: &Arc<dyn BmcClient>, want: PowerState) -> Result<()> {
        let deadline = Instant::now() + self.deps.config.bmc_timeout();
        let poll = self
            .deps
            .config
            .poll_interval()
            .min(Duration::from_secs(1));

        loop {
            if bmc.power_state().await? == want {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("power state did not reach {want:?} in time"));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(anyhow!("cancelled")),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Polled wait for the webhook to move the job out of `provisioning`.
    async fn await_callback(&self) -> Result<AwaitResult> {
        let started = Instant::now();
        let poll = self.deps.config.poll_interval();

        loop {
            let job = Job::find_by_id(self.job.id, &self.deps.store)
                .await?
                .context("job row vanished while provisioning")?;

            if job.status.is_terminal() {
                return Ok(AwaitResult::Terminal);
            }
            if job.status != JobStatus::Provisioning
                || job.worker_id.as_deref() != self.job.worker_id.as_deref()
            {
                // Requeued or stolen from under us.
                return Ok(AwaitResult::NotOurs);
            }

            if started.elapsed() >= self.deps.config.job_stuck_timeout() {
                let marked = Job::mark_status(
                    self.job.id,
                    TerminalOutcome::Failed,
                    Some(Step::AwaitCallback.as_str()),
                    &self.deps.store,
                )
                .await?;
                if marked {
                    self.event(
                        EventLevel::Error,
                        Step::AwaitCallback,
                        "timed out waiting for dispatcher callback",
                    )
                    .await?;
                }
                return Ok(AwaitResult::TimedOut);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(AwaitResult::Cancelled),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Best-effort eject and ISO removal, then promote a succeeded job.
    async fn cleanup(&self, bmc: &Arc<dyn BmcClient>) -> Result<PipelineOutcome> {
        if let Err(e) = bmc.eject_virtual_media().await {
            tracing::warn!(job_id = %self.job.id, error = %e, "failed to eject virtual media");
            self.event(
                EventLevel::Warn,
                Step::Cleanup,
                &format!("failed to eject virtual media: {e}"),
            )
            .await?;
        }

        let iso = self.deps.iso.clone();
        let job_id = self.job.id;
        if let Err(e) = tokio::task::spawn_blocking(move || iso.remove(job_id))
            .await
            .context("ISO removal task panicked")?
        {
            tracing::warn!(%job_id, error = %e, "failed to remove task ISO");
        }

        let job = Job::find_by_id(self.job.id, &self.deps.store)
            .await?
            .context("job row vanished during cleanup")?;

        match job.status {
            JobStatus::Succeeded => {
                if Job::complete(self.job.id, &self.deps.store).await? {
                    self.event(EventLevel::Info, Step::Cleanup, "provisioning succeeded; job complete")
                        .await?;
                    Ok(PipelineOutcome::Finished(JobStatus::Complete))
                } else {
                    Ok(PipelineOutcome::Finished(job.status))
                }
            }
            status => {
                self.event(EventLevel::Info, Step::Cleanup, "cleanup finished")
                    .await?;
                Ok(PipelineOutcome::Finished(status))
            }
        }
    }

    /// Webhook may land before `await_callback`; skip forward when it does.
    async fn terminal_shortcut(
        &self,
        bmc: &Arc<dyn BmcClient>,
    ) -> Result<Option<PipelineOutcome>> {
        let job = Job::find_by_id(self.job.id, &self.deps.store)
            .await?
            .context("job row vanished while provisioning")?;
        if job.status.is_terminal() {
            return Ok(Some(self.cleanup(bmc).await?));
        }
        Ok(None)
    }

    async fn fail(&self, step: Step, cause: anyhow::Error) -> Result<PipelineOutcome> {
        tracing::error!(job_id = %self.job.id, step = step.as_str(), error = %cause, "pipeline step failed");
        self.event(EventLevel::Error, step, &cause.to_string()).await?;
        Job::mark_status(
            self.job.id,
            TerminalOutcome::Failed,
            Some(step.as_str()),
            &self.deps.store,
        )
        .await?;
        Ok(PipelineOutcome::Failed {
            step: step.as_str(),
        })
    }

    async fn event(&self, level: EventLevel, step: Step, message: &str) -> Result<()> {
        JobEvent::append(
            self.job.id,
            level,
            Some(step.as_str()),
            message,
            &self.deps.store,
        )
        .await
    }

    async fn with_retries<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = self.deps.config.bmc_retries.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            if self.cancel.is_cancelled() {
                return Err(anyhow!("cancelled"));
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(job_id = %self.job.id, attempt, error = %e, "BMC operation failed");
                    last_err = Some(e);
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("BMC operation failed")))
    }
}

/// IP binding for minted media URLs only works when the BMC address carries a
/// literal IP; hostnames mint an unbound URL.
fn bmc_host_ip(bmc_address: &str) -> Option<IpAddr> {
    let rest = bmc_address.split("://").nth(1).unwrap_or(bmc_address);
    let host = rest.split(['/', ':']).next().unwrap_or(rest);
    host.parse().ok()
}
