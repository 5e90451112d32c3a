//! Execution engine
//!
//! Ties the pieces together: a submission is resolved against the registry,
//! admitted by the scheduler and, once it holds a slot, driven through
//! provision -> build -> run -> collect -> teardown by [`Pipeline`].

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::cancel::CancelToken;
use crate::collector::collect;
use crate::config::EngineConfig;
use crate::core::{
    Classification, ExecutionResult, LanguageInfo, Phase, Registry, RunnerDescriptor, Submission,
};
use crate::error::{EngineError, Result};
use crate::sandbox::{SandboxContext, SandboxController};
use crate::scheduler::{Job, JobHandle, JobId, JobRunner, Scheduler, SchedulerLimits};

/// Runs one admitted job inside its own sandbox context
pub struct Pipeline {
    controller: Arc<SandboxController>,
}

impl Pipeline {
    pub fn new(controller: Arc<SandboxController>) -> Self {
        Self { controller }
    }

    async fn execute(&self, job: &Job, cancel: &mut CancelToken) -> ExecutionResult {
        let language = job.descriptor.id.as_str();

        if cancel.is_cancelled() {
            return ExecutionResult::without_output(
                language,
                Classification::Cancelled,
                None,
                Some("Cancelled before start".to_string()),
            );
        }

        let mut ctx = match self.controller.provision(&job.descriptor, &job.submission).await {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("Failed to provision sandbox for job {}: {:#}", job.id, e);
                return infrastructure_fault(language, None, e);
            }
        };

        let result = self.phases(job, &mut ctx, cancel).await;
        self.controller.teardown(&mut ctx).await;
        result
    }

    async fn phases(
        &self,
        job: &Job,
        ctx: &mut SandboxContext,
        cancel: &mut CancelToken,
    ) -> ExecutionResult {
        let descriptor = &job.descriptor;
        let language = descriptor.id.as_str();

        if let Some(argv) = descriptor.build_argv() {
            let outcome = self
                .controller
                .execute(ctx, Phase::Build, &argv, &descriptor.build_limits, cancel)
                .await;
            match outcome {
                Ok(raw) if raw.is_success() => {
                    debug!("Job {} built in {:?}", job.id, raw.wall_time);
                }
                Ok(raw) => return collect(language, &raw, Phase::Build),
                Err(e) => {
                    error!("Build phase of job {} failed to execute: {:#}", job.id, e);
                    return infrastructure_fault(language, Some(Phase::Build), e);
                }
            }
        }

        let limits = descriptor.limits.restrict(&job.submission.limits);
        match self
            .controller
            .execute(ctx, Phase::Run, &descriptor.run_argv(), &limits, cancel)
            .await
        {
            Ok(raw) => collect(language, &raw, Phase::Run),
            Err(e) => {
                error!("Run phase of job {} failed to execute: {:#}", job.id, e);
                infrastructure_fault(language, Some(Phase::Run), e)
            }
        }
    }
}

#[async_trait]
impl JobRunner for Pipeline {
    async fn run(&self, job: Job, mut cancel: CancelToken) -> ExecutionResult {
        let started = Instant::now();
        info!(
            "Job {} received: language={}, files={}",
            job.id,
            job.descriptor.id,
            job.submission.files.len()
        );

        let result = self.execute(&job, &mut cancel).await;

        info!(
            "Job {} finished: {} (phase={}, wall={}ms, cpu={}ms, mem={}KB, total={:?})",
            job.id,
            result.classification,
            result
                .phase
                .map(|p| p.to_string())
                .unwrap_or_else(|| "none".to_string()),
            result.wall_time_ms,
            result.cpu_time_ms,
            result.memory_kb,
            started.elapsed()
        );
        result
    }
}

fn infrastructure_fault(language: &str, phase: Option<Phase>, e: anyhow::Error) -> ExecutionResult {
    ExecutionResult::without_output(
        language,
        Classification::ProvisionError,
        phase,
        Some(EngineError::Provision(e).to_string()),
    )
}

/// Public entry point: submit, await, cancel
pub struct Engine {
    registry: Arc<Registry>,
    controller: Arc<SandboxController>,
    scheduler: Scheduler,
}

impl Engine {
    pub fn new(config: &EngineConfig, registry: Registry, controller: SandboxController) -> Self {
        let controller = Arc::new(controller);
        let pipeline = Arc::new(Pipeline::new(controller.clone()));

        Self {
            registry: Arc::new(registry),
            controller,
            scheduler: Scheduler::new(pipeline, SchedulerLimits::from(config)),
        }
    }

    /// Engine with the configured catalog and sandbox backend
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let registry = Registry::load(config.languages_path.as_deref())?;
        let controller = SandboxController::from_config(config).await?;
        info!(
            "Engine ready: {} languages, concurrency={}, queue_depth={}",
            registry.len(),
            config.concurrency,
            config.queue_depth
        );

        Ok(Self::new(config, registry, controller))
    }

    /// Admit a submission. Unknown languages and malformed submissions are
    /// rejected before anything is queued.
    pub fn submit(&self, submission: Submission) -> Result<JobHandle> {
        let descriptor = self.registry.resolve(&submission.language)?;
        submission.validate()?;
        check_source_name(&descriptor, &submission)?;

        self.scheduler.submit(descriptor, submission)
    }

    /// Submit and wait for the result
    pub async fn run(&self, submission: Submission) -> Result<ExecutionResult> {
        Ok(self.submit(submission)?.wait().await)
    }

    /// Cancel a job by id; false if it is unknown or already finished
    pub fn cancel(&self, id: JobId) -> bool {
        self.scheduler.cancel(id)
    }

    pub fn languages(&self) -> Vec<LanguageInfo> {
        self.registry.languages()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Sandbox contexts currently alive
    pub fn active_sandboxes(&self) -> usize {
        self.controller.active()
    }

    /// Jobs waiting for an execution slot
    pub fn queued(&self) -> usize {
        self.scheduler.queued()
    }

    /// Occupied execution slots
    pub fn running(&self) -> usize {
        self.scheduler.running()
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

/// An unnamed source file takes the runner's source file name, which must not
/// also be given explicitly
fn check_source_name(descriptor: &RunnerDescriptor, submission: &Submission) -> Result<()> {
    let has_unnamed = submission.files.iter().any(|f| f.path.is_none());
    let clashes = submission
        .files
        .iter()
        .any(|f| f.path.as_deref() == Some(descriptor.source_file.as_str()));

    if has_unnamed && clashes {
        return Err(EngineError::InvalidSubmission(format!(
            "unnamed source file collides with {}",
            descriptor.source_file
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> RunnerDescriptor {
        RunnerDescriptor::new("python", "main.py", &["python3", "{source}"])
    }

    #[test]
    fn test_check_source_name() {
        let ok = Submission::new("python", "print(1)").with_file("util.py", "x = 1");
        assert!(check_source_name(&descriptor(), &ok).is_ok());

        let named_only = Submission::empty("python").with_file("main.py", "print(1)");
        assert!(check_source_name(&descriptor(), &named_only).is_ok());

        let clash = Submission::new("python", "print(1)").with_file("main.py", "print(2)");
        assert!(matches!(
            check_source_name(&descriptor(), &clash),
            Err(EngineError::InvalidSubmission(_))
        ));
    }

    #[test]
    fn test_infrastructure_fault_result() {
        let result = infrastructure_fault(
            "cpp",
            Some(Phase::Build),
            anyhow::anyhow!("No such file or directory").context("Failed to spawn build command"),
        );

        assert_eq!(result.classification, Classification::ProvisionError);
        assert_eq!(result.phase, Some(Phase::Build));
        assert_eq!(
            result.message.as_deref(),
            Some("failed to provision sandbox: Failed to spawn build command: No such file or directory")
        );
    }
}
