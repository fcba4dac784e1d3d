//! Built-in maintainer policies.
//!
//! `BatchPolicy` drives the Slurm connector through submission and status
//! polling; `ContainerPolicy` composes it, rewriting the job command into a
//! `singularity exec` invocation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::ClusterProfile;
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::job::JobDescriptor;
use crate::maintainer::{HookError, JobContext, JobPolicy, MaintainerRegistry};
use crate::remote::RemoteShell;
use crate::slurm::{SlurmConnector, SlurmStatus, is_failure_state, is_terminal_state};
use crate::store::{JobStore, JobUpdate};

/// Maintainer policy for plain batch jobs.
///
/// The connector is built lazily on the first init attempt because the pooled
/// shell only exists once the job is admitted. Until a submission succeeds the
/// connector is rebuilt on every attempt so a half-finished upload never
/// leaks state into the retry.
pub struct BatchPolicy {
    store: Arc<dyn JobStore>,
    base_dir: String,
    modules: Vec<String>,
    /// Overrides the job command when set; used by [`ContainerPolicy`].
    command: Option<String>,
    connector: Option<SlurmConnector>,
}

impl BatchPolicy {
    pub fn new(store: Arc<dyn JobStore>, profile: &ClusterProfile) -> Self {
        Self {
            store,
            base_dir: profile.base_dir.clone(),
            modules: profile.modules.clone(),
            command: None,
            connector: None,
        }
    }

    fn command_for(&self, job: &JobDescriptor) -> String {
        self.command.clone().unwrap_or_else(|| job.command.clone())
    }

    /// Forward freshly appended remote stdout/stderr as job log lines.
    async fn forward_tails(&mut self, ctx: &JobContext) {
        let Some(connector) = self.connector.as_mut() else {
            return;
        };
        if let Ok(Some(tail)) = connector.stdout_tail().await {
            for line in tail.lines() {
                ctx.log(line);
            }
        }
        if let Ok(Some(tail)) = connector.stderr_tail().await {
            for line in tail.lines() {
                ctx.log(format!("[stderr] {line}"));
            }
        }
    }

    async fn finish(&self, ctx: &JobContext, kind: EventKind, message: String) -> Result<()> {
        self.store
            .update(
                &ctx.job().id,
                JobUpdate {
                    finished_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        ctx.emit(kind, message);
        Ok(())
    }
}

#[async_trait]
impl JobPolicy for BatchPolicy {
    async fn on_init(&mut self, ctx: &JobContext, shell: &Arc<dyn RemoteShell>) -> Result<()> {
        let job = ctx.job();
        let mut connector = SlurmConnector::new(shell.clone(), job.clone(), &self.base_dir);
        connector.register_modules(self.modules.iter().cloned());
        connector.prepare(&self.command_for(job), &job.resources);

        match connector.submit().await {
            Ok(submission) => {
                self.store
                    .update(
                        &job.id,
                        JobUpdate {
                            initialized_at: Some(Utc::now()),
                            scheduler_id: Some(submission.scheduler_id.clone()),
                            result_dir: Some(submission.paths.result.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                ctx.emit(
                    EventKind::Init,
                    format!("submitted as scheduler job {}", submission.scheduler_id),
                );
                self.connector = Some(connector);
                Ok(())
            }
            Err(err @ Error::Submission(_)) => {
                ctx.emit(EventKind::SubmissionError, err.to_string());
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn on_maintain(
        &mut self,
        ctx: &JobContext,
        _shell: &Arc<dyn RemoteShell>,
    ) -> Result<(), HookError> {
        // Nothing to poll until a submission succeeded.
        if !ctx.is_init() {
            return Ok(());
        }
        let status = {
            let Some(connector) = self.connector.as_ref() else {
                return Ok(());
            };
            connector.status().await.map_err(|err| {
                if err.is_retryable() {
                    HookError::Retryable(err)
                } else {
                    HookError::Fatal(err)
                }
            })?
        };

        self.forward_tails(ctx).await;

        let outcome = match status {
            SlurmStatus::Reported(state) if is_failure_state(&state) => Some((
                EventKind::Failed,
                format!("scheduler reported terminal state {state}"),
            )),
            SlurmStatus::Reported(state) if is_terminal_state(&state) => Some((
                EventKind::Ended,
                format!("scheduler reported terminal state {state}"),
            )),
            SlurmStatus::Reported(_) => None,
            // The scheduler answered and no longer knows the job. After a
            // successful submission that means it ran and aged out of the
            // listings, so it counts as ended, not as an error.
            SlurmStatus::Unknown => Some((
                EventKind::Ended,
                "job no longer known to the scheduler".to_string(),
            )),
            SlurmStatus::Retry => None,
        };
        if let Some((kind, message)) = outcome {
            self.finish(ctx, kind, message)
                .await
                .map_err(HookError::Retryable)?;
        }
        Ok(())
    }

    async fn on_cancel(&mut self, ctx: &JobContext, _shell: &Arc<dyn RemoteShell>) -> Result<()> {
        let Some(connector) = self.connector.as_ref() else {
            return Err(Error::InvalidArgument(
                "cancel before a successful submission".into(),
            ));
        };
        connector.cancel().await?;
        // The terminal event arrives through the next status poll, which will
        // see the CANCELLED state.
        ctx.log("cancellation requested, scancel issued");
        Ok(())
    }

    async fn on_pause(&mut self, _ctx: &JobContext, _shell: &Arc<dyn RemoteShell>) -> Result<()> {
        match self.connector.as_ref() {
            Some(connector) => connector.pause().await,
            None => Err(Error::InvalidArgument("pause before submission".into())),
        }
    }

    async fn on_resume(&mut self, _ctx: &JobContext, _shell: &Arc<dyn RemoteShell>) -> Result<()> {
        match self.connector.as_ref() {
            Some(connector) => connector.resume().await,
            None => Err(Error::InvalidArgument("resume before submission".into())),
        }
    }
}

/// Parameter naming the container image a [`ContainerPolicy`] job runs in.
pub const CONTAINER_IMAGE_PARAMETER: &str = "container_image";

/// Maintainer policy for containerized jobs. Wraps [`BatchPolicy`] with the
/// command rewritten to run inside the image named by the job's
/// `container_image` parameter, with the cluster's configured bind paths
/// mounted and its container runtime module loaded. A missing image is a
/// construction-time error so the job fails at admission instead of on the
/// cluster.
pub struct ContainerPolicy {
    inner: BatchPolicy,
}

impl ContainerPolicy {
    pub fn new(
        store: Arc<dyn JobStore>,
        job: &JobDescriptor,
        profile: &ClusterProfile,
    ) -> Result<Self> {
        let image = job
            .parameters
            .get(CONTAINER_IMAGE_PARAMETER)
            .filter(|image| !image.trim().is_empty())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "container job '{}' has no '{CONTAINER_IMAGE_PARAMETER}' parameter",
                    job.id
                ))
            })?;
        let mut inner = BatchPolicy::new(store, profile);
        let binds = if profile.container_binds.is_empty() {
            String::new()
        } else {
            format!(" --bind {}", profile.container_binds.join(","))
        };
        inner.command = Some(format!("singularity exec{binds} {image} {}", job.command));
        if let Some(module) = &profile.container_module {
            inner.modules.push(module.clone());
        }
        Ok(Self { inner })
    }
}

#[async_trait]
impl JobPolicy for ContainerPolicy {
    async fn on_init(&mut self, ctx: &JobContext, shell: &Arc<dyn RemoteShell>) -> Result<()> {
        self.inner.on_init(ctx, shell).await
    }

    async fn on_maintain(
        &mut self,
        ctx: &JobContext,
        shell: &Arc<dyn RemoteShell>,
    ) -> Result<(), HookError> {
        self.inner.on_maintain(ctx, shell).await
    }

    async fn on_cancel(&mut self, ctx: &JobContext, shell: &Arc<dyn RemoteShell>) -> Result<()> {
        self.inner.on_cancel(ctx, shell).await
    }

    async fn on_pause(&mut self, ctx: &JobContext, shell: &Arc<dyn RemoteShell>) -> Result<()> {
        self.inner.on_pause(ctx, shell).await
    }

    async fn on_resume(&mut self, ctx: &JobContext, shell: &Arc<dyn RemoteShell>) -> Result<()> {
        self.inner.on_resume(ctx, shell).await
    }
}

/// Registry with the built-in maintainer types `batch` and `container`.
pub fn builtin_registry(store: Arc<dyn JobStore>) -> MaintainerRegistry {
    let mut registry = MaintainerRegistry::new();
    let batch_store = store.clone();
    registry.register(
        "batch",
        Arc::new(move |_job, profile| {
            Ok(Box::new(BatchPolicy::new(batch_store.clone(), profile)) as Box<dyn JobPolicy>)
        }),
    );
    registry.register(
        "container",
        Arc::new(move |job, profile| {
            Ok(Box::new(ContainerPolicy::new(store.clone(), job, profile)?) as Box<dyn JobPolicy>)
        }),
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ExecOutput;
    use crate::store::MemoryJobStore;
    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use std::sync::Mutex;

    /// Canned replies per command prefix; prefixes in `failing` error out at
    /// the transport level instead of answering.
    #[derive(Default)]
    struct FakeShell {
        replies: Mutex<HashMap<String, ExecOutput>>,
        failing: Mutex<HashSet<String>>,
        execs: Mutex<Vec<String>>,
    }

    impl FakeShell {
        fn reply(&self, prefix: &str, stdout: &str, exit_code: i32) {
            self.replies.lock().unwrap().insert(
                prefix.to_string(),
                ExecOutput {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    exit_code,
                },
            );
        }

        fn fail(&self, prefix: &str) {
            self.failing.lock().unwrap().insert(prefix.to_string());
        }

        fn executed(&self) -> Vec<String> {
            self.execs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteShell for FakeShell {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            true
        }

        async fn exec(&self, cmd: &str) -> Result<ExecOutput> {
            self.execs.lock().unwrap().push(cmd.to_string());
            if self
                .failing
                .lock()
                .unwrap()
                .iter()
                .any(|prefix| cmd.starts_with(prefix.as_str()))
            {
                return Err(Error::Connector("connection dropped".into()));
            }
            let replies = self.replies.lock().unwrap();
            let reply = replies
                .iter()
                .find(|(prefix, _)| cmd.starts_with(prefix.as_str()))
                .map(|(_, out)| out.clone());
            Ok(reply.unwrap_or_else(|| ExecOutput {
                exit_code: 1,
                ..Default::default()
            }))
        }

        async fn put_file(&self, _content: &[u8], _remote_path: &str) -> Result<()> {
            Ok(())
        }

        async fn put_directory(&self, _local: &Path, _remote_dir: &str) -> Result<()> {
            Ok(())
        }

        async fn make_dir(&self, _remote_dir: &str) -> Result<()> {
            Ok(())
        }

        async fn dispose(&self) {}
    }

    fn profile() -> ClusterProfile {
        ClusterProfile {
            name: "lumi".into(),
            host: "lumi.example.org".into(),
            port: 22,
            shared_credential: true,
            capacity: 2,
            base_dir: "/scratch/batchd".into(),
            modules: vec!["python/3.12".into()],
            container_binds: vec![],
            container_module: None,
            ceiling: None,
            allowed_users: vec![],
            denied_users: vec![],
            keepalive_secs: 60,
        }
    }

    fn job() -> JobDescriptor {
        let mut job = JobDescriptor::new("j1", "lumi", "batch", "./run.sh");
        job.user = "alice".into();
        job
    }

    fn shell(fake: Arc<FakeShell>) -> Arc<dyn RemoteShell> {
        fake
    }

    async fn submitted_policy(fake: &Arc<FakeShell>) -> (BatchPolicy, JobContext, Arc<MemoryJobStore>) {
        fake.reply("sbatch", "Submitted batch job 4242\n", 0);
        let store = Arc::new(MemoryJobStore::default());
        let mut policy = BatchPolicy::new(store.clone(), &profile());
        let ctx = JobContext::new(job());
        policy.on_init(&ctx, &shell(fake.clone())).await.unwrap();
        (policy, ctx, store)
    }

    #[tokio::test]
    async fn init_submits_and_stamps_the_store() {
        let fake = Arc::new(FakeShell::default());
        let (_policy, ctx, store) = submitted_policy(&fake).await;

        assert!(ctx.is_init());
        let events = ctx.drain_events();
        assert_eq!(events.last().unwrap().kind, EventKind::Init);

        let update = store.get("j1").unwrap();
        assert!(update.initialized_at.is_some());
        assert_eq!(update.scheduler_id.as_deref(), Some("4242"));
        assert_eq!(update.result_dir.as_deref(), Some("/scratch/batchd/j1/result"));
    }

    #[tokio::test]
    async fn rejected_submission_emits_the_error_event() {
        let fake = Arc::new(FakeShell::default());
        fake.reply("sbatch", "sbatch: ERROR invalid account\n", 0);
        let store = Arc::new(MemoryJobStore::default());
        let mut policy = BatchPolicy::new(store.clone(), &profile());
        let ctx = JobContext::new(job());

        let err = policy.on_init(&ctx, &shell(fake)).await.unwrap_err();
        assert!(matches!(err, Error::Submission(_)));
        assert!(!ctx.is_init());

        let events = ctx.drain_events();
        assert_eq!(events.last().unwrap().kind, EventKind::SubmissionError);
        assert!(store.get("j1").is_none());
    }

    #[tokio::test]
    async fn running_then_completed_ends_the_job() {
        let fake = Arc::new(FakeShell::default());
        let (mut policy, ctx, store) = submitted_policy(&fake).await;

        fake.reply("squeue", "JOBID PART NAME USER ST TIME\n4242 std j1 alice R 1:00\n", 0);
        policy.on_maintain(&ctx, &shell(fake.clone())).await.unwrap();
        assert!(!ctx.is_end());

        fake.reply("squeue", "", 1);
        fake.reply(
            "sacct",
            "JobID Partition Account AllocCPUS State\n4242 std acc 4 COMPLETED\n",
            0,
        );
        policy.on_maintain(&ctx, &shell(fake.clone())).await.unwrap();
        assert!(ctx.is_end());
        let events = ctx.drain_events();
        assert_eq!(events.last().unwrap().kind, EventKind::Ended);
        assert!(store.get("j1").unwrap().finished_at.is_some());
    }

    #[tokio::test]
    async fn failure_states_fail_the_job() {
        let fake = Arc::new(FakeShell::default());
        let (mut policy, ctx, _store) = submitted_policy(&fake).await;

        fake.reply(
            "sacct",
            "JobID Partition Account AllocCPUS State\n4242 std acc 4 TIMEOUT\n",
            0,
        );
        policy.on_maintain(&ctx, &shell(fake)).await.unwrap();
        let events = ctx.drain_events();
        assert_eq!(events.last().unwrap().kind, EventKind::Failed);
    }

    #[tokio::test]
    async fn unknown_after_submission_counts_as_ended() {
        let fake = Arc::new(FakeShell::default());
        let (mut policy, ctx, _store) = submitted_policy(&fake).await;

        // the scheduler answers, but the id is gone from the listing
        fake.reply("squeue", "JOBID PART NAME USER ST TIME\n", 0);
        policy.on_maintain(&ctx, &shell(fake)).await.unwrap();
        assert!(ctx.is_end());
        let events = ctx.drain_events();
        assert_eq!(events.last().unwrap().kind, EventKind::Ended);
    }

    #[tokio::test]
    async fn silent_scheduler_is_a_noop() {
        let fake = Arc::new(FakeShell::default());
        let (mut policy, ctx, _store) = submitted_policy(&fake).await;
        ctx.drain_events();

        // both status commands exit nonzero with no output
        policy.on_maintain(&ctx, &shell(fake)).await.unwrap();
        assert!(!ctx.is_end());
        assert!(ctx.drain_events().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_during_poll_is_absorbed() {
        let fake = Arc::new(FakeShell::default());
        let (mut policy, ctx, _store) = submitted_policy(&fake).await;
        ctx.drain_events();

        // a dropped connection folds into the ambiguous retry outcome, the
        // same as a scheduler that answers nothing
        fake.fail("squeue");
        fake.fail("sacct");
        policy.on_maintain(&ctx, &shell(fake)).await.unwrap();
        assert!(!ctx.is_end());
        assert!(ctx.drain_events().is_empty());
    }

    #[tokio::test]
    async fn remote_output_is_forwarded_as_logs() {
        let fake = Arc::new(FakeShell::default());
        let (mut policy, ctx, _store) = submitted_policy(&fake).await;

        fake.reply("squeue", "JOBID PART NAME USER ST TIME\n4242 std j1 alice R 1:00\n", 0);
        fake.reply("cat /scratch/batchd/j1/result/job.stdout", "epoch 1\nepoch 2\n", 0);
        policy.on_maintain(&ctx, &shell(fake.clone())).await.unwrap();
        assert_eq!(ctx.drain_logs(), vec!["epoch 1", "epoch 2"]);

        // unchanged output is not repeated
        policy.on_maintain(&ctx, &shell(fake)).await.unwrap();
        assert!(ctx.drain_logs().is_empty());
    }

    #[tokio::test]
    async fn cancel_issues_scancel() {
        let fake = Arc::new(FakeShell::default());
        let (mut policy, ctx, _store) = submitted_policy(&fake).await;
        ctx.drain_events();

        fake.reply("scancel", "", 0);
        policy.on_cancel(&ctx, &shell(fake.clone())).await.unwrap();
        assert!(fake.executed().contains(&"scancel 4242".to_string()));
        // the terminal event comes from the next poll, not from cancel
        assert!(ctx.drain_events().is_empty());
    }

    #[tokio::test]
    async fn container_policy_wraps_the_command() {
        let fake = Arc::new(FakeShell::default());
        fake.reply("sbatch", "Submitted batch job 7\n", 0);
        let store = Arc::new(MemoryJobStore::default());
        let mut job = job();
        job.maintainer = "container".into();
        job.parameters
            .insert(CONTAINER_IMAGE_PARAMETER.into(), "train.sif".into());

        let mut policy = ContainerPolicy::new(store, &job, &profile()).unwrap();
        let ctx = JobContext::new(job);
        policy.on_init(&ctx, &shell(fake)).await.unwrap();

        let script = policy
            .inner
            .connector
            .as_ref()
            .and_then(|c| c.submission())
            .map(|s| s.script.clone())
            .unwrap();
        assert!(script.contains("singularity exec train.sif ./run.sh"));
    }

    #[tokio::test]
    async fn container_policy_applies_binds_and_runtime_module() {
        let fake = Arc::new(FakeShell::default());
        fake.reply("sbatch", "Submitted batch job 8\n", 0);
        let store = Arc::new(MemoryJobStore::default());
        let mut job = job();
        job.maintainer = "container".into();
        job.parameters
            .insert(CONTAINER_IMAGE_PARAMETER.into(), "train.sif".into());

        let mut cluster = profile();
        cluster.container_binds = vec!["/scratch".into(), "/projects".into()];
        cluster.container_module = Some("apptainer".into());

        let mut policy = ContainerPolicy::new(store, &job, &cluster).unwrap();
        let ctx = JobContext::new(job);
        policy.on_init(&ctx, &shell(fake)).await.unwrap();

        let script = policy
            .inner
            .connector
            .as_ref()
            .and_then(|c| c.submission())
            .map(|s| s.script.clone())
            .unwrap();
        assert!(
            script.contains("singularity exec --bind /scratch,/projects train.sif ./run.sh")
        );
        assert!(script.contains("module load apptainer\n"));
        // the cluster's regular modules still load ahead of the runtime one
        assert!(script.contains("module load python/3.12\n"));
    }

    #[test]
    fn container_policy_requires_an_image() {
        let store = Arc::new(MemoryJobStore::default());
        let err = ContainerPolicy::new(store, &job(), &profile()).err().unwrap();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn builtin_registry_resolves_both_types() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::default());
        let registry = builtin_registry(store);
        assert!(registry.build(&job(), &profile()).is_ok());

        let mut container = job();
        container.maintainer = "container".into();
        // no image parameter: construction fails at admission
        assert!(registry.build(&container, &profile()).is_err());

        let mut unknown = job();
        unknown.maintainer = "mpi".into();
        assert!(matches!(
            registry.build(&unknown, &profile()),
            Err(Error::UnknownMaintainer(_))
        ));
    }
}
