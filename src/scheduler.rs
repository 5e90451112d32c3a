//! Job scheduler
//!
//! Admits jobs into at most `concurrency` execution slots, in FIFO order.
//! Excess jobs wait in a bounded queue; a full queue rejects with
//! `Overloaded`, and a job left waiting past the admission timeout is failed
//! with `QueueTimeout` without ever reaching a sandbox.
//!
//! With a per-tenant ceiling, a queued job whose tenant is at its ceiling is
//! passed over until one of that tenant's slots frees up; it keeps its place
//! ahead of every later job of the same tenant.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::cancel::{self, CancelHandle, CancelToken};
use crate::config::EngineConfig;
use crate::core::{Classification, ExecutionResult, RunnerDescriptor, Submission};
use crate::error::{EngineError, Result};

pub type JobId = u64;

/// An admitted submission bound to its runner
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub descriptor: Arc<RunnerDescriptor>,
    pub submission: Submission,
}

/// Runs one job to completion inside an execution slot
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: Job, cancel: CancelToken) -> ExecutionResult;
}

/// Scheduling knobs, usually taken from [`EngineConfig`]
#[derive(Debug, Clone, Copy)]
pub struct SchedulerLimits {
    pub concurrency: usize,
    pub queue_depth: usize,
    pub admission_timeout: Duration,
    pub tenant_concurrency: Option<usize>,
}

impl From<&EngineConfig> for SchedulerLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            queue_depth: config.queue_depth,
            admission_timeout: config.admission_timeout,
            tenant_concurrency: config.tenant_concurrency,
        }
    }
}

struct Queued {
    job: Job,
    cancel: CancelToken,
    reply: oneshot::Sender<ExecutionResult>,
}

impl Queued {
    fn tenant(&self) -> Option<&str> {
        self.job.submission.tenant.as_deref()
    }

    /// Fail a job that never reached a slot
    fn reject(self, classification: Classification, message: &str) {
        let result = ExecutionResult::without_output(
            self.job.submission.language,
            classification,
            None,
            Some(message.to_string()),
        );
        let _ = self.reply.send(result);
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<Queued>,
    running: usize,
    per_tenant: HashMap<String, usize>,
    /// Cancel handles of every queued or running job
    live: HashMap<JobId, CancelHandle>,
    closed: bool,
}

impl State {
    fn take_queued(&mut self, id: JobId) -> Option<Queued> {
        let position = self.queue.iter().position(|q| q.job.id == id)?;
        self.live.remove(&id);
        self.queue.remove(position)
    }
}

struct Inner {
    state: Mutex<State>,
    runner: Arc<dyn JobRunner>,
    limits: SchedulerLimits,
    next_id: AtomicU64,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move every eligible queued job into a slot, oldest first
    fn dispatch(&self, state: &mut State) -> Vec<Queued> {
        let mut started = Vec::new();
        let mut i = 0;

        while state.running < self.limits.concurrency && i < state.queue.len() {
            let eligible = match (state.queue[i].tenant(), self.limits.tenant_concurrency) {
                (Some(tenant), Some(cap)) => {
                    state.per_tenant.get(tenant).copied().unwrap_or(0) < cap
                }
                _ => true,
            };
            if !eligible {
                i += 1;
                continue;
            }

            if let Some(queued) = state.queue.remove(i) {
                state.running += 1;
                if let Some(tenant) = queued.tenant() {
                    *state.per_tenant.entry(tenant.to_string()).or_default() += 1;
                }
                started.push(queued);
            }
        }

        started
    }

    fn cancel(&self, id: JobId) -> bool {
        let mut state = self.state();
        if let Some(queued) = state.take_queued(id) {
            drop(state);
            debug!("Job {} cancelled while queued", id);
            queued.reject(Classification::Cancelled, "Cancelled before start");
            return true;
        }
        match state.live.get(&id) {
            Some(handle) => {
                debug!("Job {} cancelled while running", id);
                handle.cancel();
                true
            }
            None => false,
        }
    }
}

/// Start a job in the slot already reserved for it by `dispatch`
fn launch(inner: &Arc<Inner>, queued: Queued) {
    let Queued { job, cancel, reply } = queued;
    let slot = Slot {
        inner: inner.clone(),
        id: job.id,
        tenant: job.submission.tenant.clone(),
    };
    let runner = inner.runner.clone();

    debug!("Job {} started", job.id);
    tokio::spawn(async move {
        let result = runner.run(job, cancel).await;
        let _ = reply.send(result);
        drop(slot);
    });
}

/// An occupied execution slot; frees itself and admits the next job on drop,
/// including when the runner panics
struct Slot {
    inner: Arc<Inner>,
    id: JobId,
    tenant: Option<String>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        state.running = state.running.saturating_sub(1);
        if let Some(tenant) = &self.tenant {
            if let Some(count) = state.per_tenant.get_mut(tenant) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.per_tenant.remove(tenant);
                }
            }
        }
        state.live.remove(&self.id);

        let started = self.inner.dispatch(&mut state);
        drop(state);
        for queued in started {
            launch(&self.inner, queued);
        }
    }
}

pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn JobRunner>, limits: SchedulerLimits) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                runner,
                limits,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Enqueue a job; fails with `Overloaded` when the wait queue is full
    pub fn submit(
        &self,
        descriptor: Arc<RunnerDescriptor>,
        submission: Submission,
    ) -> Result<JobHandle> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let language = submission.language.clone();
        let (handle, token) = cancel::pair();
        let (tx, rx) = oneshot::channel();

        let mut state = self.inner.state();
        if state.closed {
            return Err(EngineError::ShuttingDown);
        }

        state.live.insert(id, handle);
        state.queue.push_back(Queued {
            job: Job {
                id,
                descriptor,
                submission,
            },
            cancel: token,
            reply: tx,
        });

        let started = self.inner.dispatch(&mut state);
        let waiting = state.queue.iter().any(|q| q.job.id == id);
        let overloaded = waiting && state.queue.len() > self.inner.limits.queue_depth;
        if overloaded {
            state.take_queued(id);
        }
        let queued = state.queue.len();
        drop(state);

        for job in started {
            launch(&self.inner, job);
        }

        if overloaded {
            warn!("Rejecting job {}: {} jobs already queued", id, queued);
            return Err(EngineError::Overloaded { queued });
        }

        if waiting {
            debug!("Job {} queued ({} waiting)", id, queued);
            self.spawn_admission_timer(id);
        }

        Ok(JobHandle {
            id,
            language,
            rx: Some(rx),
            result: None,
            scheduler: Arc::downgrade(&self.inner),
        })
    }

    fn spawn_admission_timer(&self, id: JobId) {
        let inner = Arc::downgrade(&self.inner);
        let timeout = self.inner.limits.admission_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let expired = inner.state().take_queued(id);
            if let Some(queued) = expired {
                info!("Job {} waited {:?} without a slot", id, timeout);
                queued.reject(
                    Classification::QueueTimeout,
                    &format!("No execution slot within {} ms", timeout.as_millis()),
                );
            }
        });
    }

    /// Cancel a queued or running job; false if it is unknown or finished
    pub fn cancel(&self, id: JobId) -> bool {
        self.inner.cancel(id)
    }

    /// Jobs waiting for a slot
    pub fn queued(&self) -> usize {
        self.inner.state().queue.len()
    }

    /// Occupied execution slots
    pub fn running(&self) -> usize {
        self.inner.state().running
    }

    /// Refuse new jobs, fail everything queued and cancel everything running
    pub fn shutdown(&self) {
        let mut state = self.inner.state();
        state.closed = true;
        let queued: Vec<Queued> = state.queue.drain(..).collect();
        for q in &queued {
            state.live.remove(&q.job.id);
        }
        for handle in state.live.values() {
            handle.cancel();
        }
        drop(state);

        info!("Scheduler shutting down ({} queued jobs dropped)", queued.len());
        for q in queued {
            q.reject(Classification::Cancelled, "Engine shutting down");
        }
    }
}

/// Caller's handle on a submitted job
pub struct JobHandle {
    id: JobId,
    language: String,
    rx: Option<oneshot::Receiver<ExecutionResult>>,
    result: Option<ExecutionResult>,
    scheduler: Weak<Inner>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn cancel(&self) {
        if let Some(inner) = self.scheduler.upgrade() {
            inner.cancel(self.id);
        }
    }

    /// Wait for the job's result
    pub async fn wait(mut self) -> ExecutionResult {
        if let Some(result) = self.result.take() {
            return result;
        }
        match self.rx.take() {
            Some(rx) => rx.await.unwrap_or_else(|_| aborted(&self.language)),
            None => aborted(&self.language),
        }
    }

    /// Wait up to `timeout`; `None` if the job is still pending
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Option<ExecutionResult> {
        if let Some(result) = &self.result {
            return Some(result.clone());
        }
        let rx = self.rx.as_mut()?;

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => aborted(&self.language),
            Err(_) => return None,
        };
        self.rx = None;
        self.result = Some(result.clone());
        Some(result)
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("language", &self.language)
            .field("done", &self.result.is_some())
            .finish()
    }
}

/// Result for a job whose runner went away without replying
fn aborted(language: &str) -> ExecutionResult {
    ExecutionResult::without_output(
        language,
        Classification::ProvisionError,
        None,
        Some("Job aborted before producing a result".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Phase;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct FakeRunner {
        delay: Duration,
        current: AtomicUsize,
        max: AtomicUsize,
        started: Mutex<Vec<JobId>>,
    }

    impl FakeRunner {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                current: AtomicUsize::new(0),
                max: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
            })
        }

        fn started(&self) -> Vec<JobId> {
            self.started.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobRunner for FakeRunner {
        async fn run(&self, job: Job, mut cancel: CancelToken) -> ExecutionResult {
            self.started.lock().unwrap().push(job.id);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);

            if job.submission.language == "panic" {
                panic!("runner blew up");
            }

            let classification = tokio::select! {
                _ = tokio::time::sleep(self.delay) => Classification::Success,
                _ = cancel.cancelled() => Classification::Cancelled,
            };
            self.current.fetch_sub(1, Ordering::SeqCst);

            ExecutionResult::without_output(job.submission.language, classification, Some(Phase::Run), None)
        }
    }

    fn limits(concurrency: usize, queue_depth: usize) -> SchedulerLimits {
        SchedulerLimits {
            concurrency,
            queue_depth,
            admission_timeout: Duration::from_secs(30),
            tenant_concurrency: None,
        }
    }

    fn descriptor() -> Arc<RunnerDescriptor> {
        Arc::new(RunnerDescriptor::new("fake", "main.txt", &["true"]))
    }

    fn submit(scheduler: &Scheduler, tenant: Option<&str>) -> JobHandle {
        let mut submission = Submission::new("fake", "x");
        if let Some(tenant) = tenant {
            submission = submission.with_tenant(tenant);
        }
        scheduler.submit(descriptor(), submission).unwrap()
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_and_fifo() {
        let runner = FakeRunner::new(Duration::from_millis(50));
        let scheduler = Scheduler::new(runner.clone(), limits(2, 16));

        let handles: Vec<JobHandle> = (0..5).map(|_| submit(&scheduler, None)).collect();
        let ids: Vec<JobId> = handles.iter().map(JobHandle::id).collect();
        assert_eq!(scheduler.running(), 2);
        assert_eq!(scheduler.queued(), 3);

        for handle in handles {
            assert_eq!(handle.wait().await.classification, Classification::Success);
        }

        assert_eq!(runner.max.load(Ordering::SeqCst), 2);
        assert_eq!(runner.started(), ids);
        assert_eq!(scheduler.running(), 0);
        assert_eq!(scheduler.queued(), 0);
    }

    #[tokio::test]
    async fn test_zero_depth_rejects_when_busy() {
        let runner = FakeRunner::new(Duration::from_millis(200));
        let scheduler = Scheduler::new(runner.clone(), limits(1, 0));

        let first = submit(&scheduler, None);
        let second = scheduler.submit(descriptor(), Submission::new("fake", "x"));

        assert!(matches!(second, Err(EngineError::Overloaded { queued: 0 })));
        assert_eq!(scheduler.queued(), 0);
        assert_eq!(first.wait().await.classification, Classification::Success);
        assert_eq!(runner.started().len(), 1);
    }

    #[tokio::test]
    async fn test_admission_timeout() {
        let runner = FakeRunner::new(Duration::from_millis(300));
        let scheduler = Scheduler::new(
            runner.clone(),
            SchedulerLimits {
                admission_timeout: Duration::from_millis(50),
                ..limits(1, 4)
            },
        );

        let first = submit(&scheduler, None);
        let second = submit(&scheduler, None);

        let result = second.wait().await;
        assert_eq!(result.classification, Classification::QueueTimeout);
        assert_eq!(result.phase, None);
        assert_eq!(runner.started(), vec![first.id()]);
        assert_eq!(first.wait().await.classification, Classification::Success);
    }

    #[tokio::test]
    async fn test_cancel_queued_job_never_starts() {
        let runner = FakeRunner::new(Duration::from_millis(100));
        let scheduler = Scheduler::new(runner.clone(), limits(1, 4));

        let first = submit(&scheduler, None);
        let second = submit(&scheduler, None);
        second.cancel();

        assert_eq!(scheduler.queued(), 0);
        let result = second.wait().await;
        assert_eq!(result.classification, Classification::Cancelled);
        assert_eq!(result.phase, None);

        first.wait().await;
        assert_eq!(runner.started().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let runner = FakeRunner::new(Duration::from_secs(60));
        let scheduler = Scheduler::new(runner, limits(1, 4));

        let handle = submit(&scheduler, None);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        assert!(scheduler.cancel(handle.id()));
        let result = handle.wait().await;

        assert_eq!(result.classification, Classification::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!scheduler.cancel(u64::MAX));
    }

    #[tokio::test]
    async fn test_wait_timeout_pending_then_done() {
        let runner = FakeRunner::new(Duration::from_millis(100));
        let scheduler = Scheduler::new(runner, limits(1, 4));

        let mut handle = submit(&scheduler, None);
        assert!(handle.wait_timeout(Duration::from_millis(5)).await.is_none());

        let result = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.classification, Classification::Success);
        assert_eq!(handle.wait().await, result);
    }

    #[tokio::test]
    async fn test_tenant_ceiling_skips_busy_tenant() {
        let runner = FakeRunner::new(Duration::from_millis(50));
        let scheduler = Scheduler::new(
            runner.clone(),
            SchedulerLimits {
                tenant_concurrency: Some(1),
                ..limits(2, 8)
            },
        );

        let a = submit(&scheduler, Some("alice"));
        let b = submit(&scheduler, Some("alice"));
        let c = submit(&scheduler, Some("bob"));
        let order = vec![a.id(), c.id(), b.id()];

        for handle in [a, b, c] {
            handle.wait().await;
        }
        assert_eq!(runner.started(), order);
    }

    #[tokio::test]
    async fn test_runner_panic_frees_slot() {
        let runner = FakeRunner::new(Duration::from_millis(10));
        let scheduler = Scheduler::new(runner, limits(1, 4));

        let broken = scheduler
            .submit(descriptor(), Submission::new("panic", "x"))
            .unwrap();
        let next = submit(&scheduler, None);

        let result = broken.wait().await;
        assert_eq!(result.classification, Classification::ProvisionError);
        assert_eq!(next.wait().await.classification, Classification::Success);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let runner = FakeRunner::new(Duration::from_secs(60));
        let scheduler = Scheduler::new(runner, limits(1, 4));

        let running = submit(&scheduler, None);
        let queued = submit(&scheduler, None);
        scheduler.shutdown();

        assert_eq!(queued.wait().await.classification, Classification::Cancelled);
        assert_eq!(running.wait().await.classification, Classification::Cancelled);
        assert!(matches!(
            scheduler.submit(descriptor(), Submission::new("fake", "x")),
            Err(EngineError::ShuttingDown)
        ));
    }
}
