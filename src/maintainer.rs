//! Per-job lifecycle state machine.
//!
//! A [`Maintainer`] owns a boxed [`JobPolicy`] and drives it through
//! init/maintain/cancel calls issued by the supervisor's worker. Transitions
//! are signaled by the policy emitting typed events through [`JobContext`],
//! which maps them onto the [`JobState`] ladder; the state only ever moves
//! forward. All lifecycle calls for one job are single-flight: a call that
//! finds the previous one still running is a no-op.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::ClusterProfile;
use crate::error::{Error, Result};
use crate::event::{EventKind, JobEvent};
use crate::job::{JobDescriptor, JobState};
use crate::remote::RemoteShell;

/// Consecutive retryable maintain failures before a warning is logged.
/// Failures are never escalated to a job failure here; the polling loop is
/// deliberately best-effort, which can mask a permanent fault. The warning
/// makes that visible instead of silent.
const SUPPRESSION_WARN_THRESHOLD: u32 = 10;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub init_retry_limit: u32,
    pub maintain_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            init_retry_limit: 3,
            maintain_timeout: Duration::from_secs(48 * 3600),
        }
    }
}

/// Explicit classification of a maintain-hook failure. Retryable errors are
/// logged and swallowed so one bad poll never kills the worker; fatal errors
/// end the job.
#[derive(Debug)]
pub enum HookError {
    Retryable(Error),
    Fatal(Error),
}

impl HookError {
    pub fn retryable(err: impl Into<Error>) -> Self {
        HookError::Retryable(err.into())
    }

    pub fn fatal(err: impl Into<Error>) -> Self {
        HookError::Fatal(err.into())
    }
}

/// Shared per-job runtime state handed to policy hooks: the job descriptor
/// plus buffered events and log lines drained by the supervisor.
pub struct JobContext {
    job: JobDescriptor,
    events: StdMutex<VecDeque<JobEvent>>,
    logs: StdMutex<VecDeque<String>>,
    state: StdMutex<JobState>,
}

impl JobContext {
    pub fn new(job: JobDescriptor) -> Self {
        Self {
            job,
            events: StdMutex::new(VecDeque::new()),
            logs: StdMutex::new(VecDeque::new()),
            state: StdMutex::new(JobState::Queued),
        }
    }

    pub fn job(&self) -> &JobDescriptor {
        &self.job
    }

    /// Buffer a typed event. Lifecycle events advance [`JobContext::state`]:
    /// `Registered`, `Init`, `Ended` and `Failed` map onto the corresponding
    /// rungs of the state ladder.
    pub fn emit(&self, kind: EventKind, message: impl Into<String>) {
        let next = match kind {
            EventKind::Registered => Some(JobState::Registered),
            EventKind::Init => Some(JobState::Running),
            EventKind::Ended => Some(JobState::Ended),
            EventKind::Failed => Some(JobState::Failed),
            _ => None,
        };
        if let Some(next) = next {
            self.advance(next);
        }
        self.events
            .lock()
            .unwrap()
            .push_back(JobEvent::new(self.job.id.clone(), kind, message));
    }

    pub fn log(&self, line: impl Into<String>) {
        self.logs.lock().unwrap().push_back(line.into());
    }

    /// Current rung on the lifecycle ladder.
    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap()
    }

    /// Move to `next` unless the job is already at or past it. A stale event
    /// arriving after a later transition never rolls the state back.
    pub(crate) fn advance(&self, next: JobState) {
        let mut state = self.state.lock().unwrap();
        if next > *state {
            *state = next;
        }
    }

    /// The job has been submitted to the remote scheduler.
    pub fn is_init(&self) -> bool {
        self.state() >= JobState::Running
    }

    /// The job reached a terminal state.
    pub fn is_end(&self) -> bool {
        self.state().is_terminal()
    }

    /// Drain all buffered events in FIFO order, resetting the buffer.
    pub fn drain_events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().drain(..).collect()
    }

    /// Drain all buffered log lines in FIFO order, resetting the buffer.
    pub fn drain_logs(&self) -> Vec<String> {
        self.logs.lock().unwrap().drain(..).collect()
    }
}

/// Lifecycle hooks for one maintainer type. Implementations hold their
/// connector state; the pooled shell arrives with every call because it is
/// only acquired once the job is admitted.
#[async_trait]
pub trait JobPolicy: Send + Sync {
    async fn on_init(&mut self, ctx: &JobContext, shell: &Arc<dyn RemoteShell>) -> Result<()>;

    async fn on_maintain(
        &mut self,
        ctx: &JobContext,
        shell: &Arc<dyn RemoteShell>,
    ) -> Result<(), HookError>;

    async fn on_cancel(&mut self, ctx: &JobContext, shell: &Arc<dyn RemoteShell>) -> Result<()>;

    async fn on_pause(&mut self, _ctx: &JobContext, _shell: &Arc<dyn RemoteShell>) -> Result<()> {
        Err(Error::Unsupported("pause"))
    }

    async fn on_resume(&mut self, _ctx: &JobContext, _shell: &Arc<dyn RemoteShell>) -> Result<()> {
        Err(Error::Unsupported("resume"))
    }
}

pub struct Maintainer {
    ctx: Arc<JobContext>,
    policy: Mutex<Box<dyn JobPolicy>>,
    retries: AtomicU32,
    consecutive_failures: AtomicU32,
    started_at: StdMutex<Option<tokio::time::Instant>>,
    config: LifecycleConfig,
}

impl Maintainer {
    pub fn new(job: JobDescriptor, policy: Box<dyn JobPolicy>, config: LifecycleConfig) -> Self {
        Self {
            ctx: Arc::new(JobContext::new(job)),
            policy: Mutex::new(policy),
            retries: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            started_at: StdMutex::new(None),
            config,
        }
    }

    pub fn ctx(&self) -> &Arc<JobContext> {
        &self.ctx
    }

    pub fn is_init(&self) -> bool {
        self.ctx.is_init()
    }

    pub fn is_end(&self) -> bool {
        self.ctx.is_end()
    }

    /// Run the init hook once, single-flight. At the retry limit the job is
    /// failed instead of retried. The retry counter advances whether or not
    /// the hook succeeded.
    pub async fn init(&self, shell: &Arc<dyn RemoteShell>) {
        let Ok(mut policy) = self.policy.try_lock() else {
            return;
        };
        if self.retries.load(Ordering::SeqCst) >= self.config.init_retry_limit {
            self.ctx.emit(
                EventKind::Failed,
                format!(
                    "initialization failed {} times, giving up",
                    self.config.init_retry_limit
                ),
            );
            return;
        }
        self.ctx.advance(JobState::Initializing);
        let result = policy.on_init(&self.ctx, shell).await;
        self.retries.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = result {
            tracing::warn!(job = %self.ctx.job.id, "init hook failed: {err}");
            self.ctx.log(format!("initialization attempt failed: {err}"));
        }
    }

    /// Run the maintain hook once, single-flight. Retryable failures are
    /// logged and swallowed; fatal failures and timeout end the job.
    pub async fn maintain(&self, shell: &Arc<dyn RemoteShell>) {
        let Ok(mut policy) = self.policy.try_lock() else {
            return;
        };

        let elapsed = {
            let mut started = self.started_at.lock().unwrap();
            let start = started.get_or_insert_with(tokio::time::Instant::now);
            start.elapsed()
        };
        if elapsed > self.config.maintain_timeout {
            self.ctx.emit(
                EventKind::Failed,
                format!("job exceeded the maintain timeout of {:?}", self.config.maintain_timeout),
            );
            return;
        }

        match policy.on_maintain(&self.ctx, shell).await {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            Err(HookError::Fatal(err)) => {
                self.ctx.emit(EventKind::Failed, format!("fatal maintain failure: {err}"));
            }
            Err(HookError::Retryable(err)) => {
                self.ctx.log(format!("maintain attempt failed: {err}"));
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures == SUPPRESSION_WARN_THRESHOLD {
                    tracing::warn!(
                        job = %self.ctx.job.id,
                        failures,
                        "maintain keeps failing; the job may be stuck behind a permanent fault"
                    );
                }
            }
        }
    }

    /// Apply a pending cancellation. Only valid once the job has reached the
    /// remote scheduler; returns whether the cancel hook actually ran so the
    /// caller knows when to clear its pending marker.
    pub async fn cancel(&self, shell: &Arc<dyn RemoteShell>) -> Result<bool> {
        if !self.ctx.is_init() {
            return Ok(false);
        }
        let Ok(mut policy) = self.policy.try_lock() else {
            return Ok(false);
        };
        policy.on_cancel(&self.ctx, shell).await?;
        Ok(true)
    }

    pub async fn pause(&self, shell: &Arc<dyn RemoteShell>) -> Result<()> {
        let mut policy = self.policy.lock().await;
        policy.on_pause(&self.ctx, shell).await
    }

    pub async fn resume(&self, shell: &Arc<dyn RemoteShell>) -> Result<()> {
        let mut policy = self.policy.lock().await;
        policy.on_resume(&self.ctx, shell).await
    }

    pub fn dump_events(&self) -> Vec<JobEvent> {
        self.ctx.drain_events()
    }

    pub fn dump_logs(&self) -> Vec<String> {
        self.ctx.drain_logs()
    }
}

/// Startup-time table mapping maintainer type names to policy constructors.
/// Resolution failures at admission are terminal for the job, so every type
/// a deployment uses must be registered before the supervisor starts.
pub type PolicyFactory =
    Arc<dyn Fn(&JobDescriptor, &ClusterProfile) -> Result<Box<dyn JobPolicy>> + Send + Sync>;

#[derive(Default)]
pub struct MaintainerRegistry {
    factories: HashMap<String, PolicyFactory>,
}

impl MaintainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: PolicyFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn build(&self, job: &JobDescriptor, profile: &ClusterProfile) -> Result<Box<dyn JobPolicy>> {
        let factory = self
            .factories
            .get(&job.maintainer)
            .ok_or_else(|| Error::UnknownMaintainer(job.maintainer.clone()))?;
        factory(job, profile)
    }
}
