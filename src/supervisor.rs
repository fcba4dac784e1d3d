//! Top-level orchestration: per-cluster admission, worker tasks and the
//! master tick loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use crate::config::{ClusterProfile, EngineConfig};
use crate::error::{Error, Result};
use crate::event::{EventKind, EventSink, JobEvent};
use crate::job::JobDescriptor;
use crate::maintainer::{LifecycleConfig, Maintainer, MaintainerRegistry};
use crate::pool::{BackoffPolicy, ConnectionPool, PoolKey};
use crate::queue::{JobQueue, MemoryQueue};
use crate::remote::{RemoteShell, ShellConfig, ShellFactory};
use crate::slurm::units;
use crate::store::{CredentialResolver, JobStore, JobUpdate};

/// Mutable per-cluster scheduling state. The running map and cancel-pending
/// set are only touched under their locks, never across an await.
struct ClusterState {
    profile: ClusterProfile,
    queue: Arc<dyn JobQueue>,
    running: Mutex<HashMap<String, Arc<Maintainer>>>,
    cancel_pending: Mutex<HashSet<String>>,
}

/// Owns the connection pool, the cluster states and the maintainer registry.
/// One instance per daemon; everything it hands to worker tasks is shared
/// through `Arc`s, so the supervisor itself never needs to be.
pub struct Supervisor {
    config: EngineConfig,
    clusters: HashMap<String, Arc<ClusterState>>,
    pool: Arc<ConnectionPool>,
    registry: Arc<MaintainerRegistry>,
    store: Arc<dyn JobStore>,
    resolver: Arc<dyn CredentialResolver>,
    sink: Arc<dyn EventSink>,
}

impl Supervisor {
    pub fn new(
        config: EngineConfig,
        registry: MaintainerRegistry,
        store: Arc<dyn JobStore>,
        resolver: Arc<dyn CredentialResolver>,
        sink: Arc<dyn EventSink>,
        factory: Arc<dyn ShellFactory>,
    ) -> Self {
        let clusters = config
            .clusters
            .iter()
            .map(|profile| {
                (
                    profile.name.clone(),
                    Arc::new(ClusterState {
                        profile: profile.clone(),
                        queue: Arc::new(MemoryQueue::default()) as Arc<dyn JobQueue>,
                        running: Mutex::new(HashMap::new()),
                        cancel_pending: Mutex::new(HashSet::new()),
                    }),
                )
            })
            .collect();
        Self {
            config,
            clusters,
            pool: Arc::new(ConnectionPool::new(factory, BackoffPolicy::default())),
            registry: Arc::new(registry),
            store,
            resolver,
            sink,
        }
    }

    /// Validate and enqueue a job. Ceiling violations, unknown clusters and
    /// user-list violations are rejected here and never enter scheduling.
    pub async fn push_job(&self, mut job: JobDescriptor) -> Result<()> {
        let state = self
            .clusters
            .get(&job.cluster)
            .ok_or_else(|| Error::UnknownCluster(job.cluster.clone()))?;
        if !state.profile.permits(&job.user) {
            return Err(Error::UserNotAllowed {
                user: job.user.clone(),
                cluster: job.cluster.clone(),
            });
        }
        units::validate_resources(&job.resources, state.profile.ceiling.as_ref())?;

        job.queued_at = Some(Utc::now());
        self.sink
            .events(vec![JobEvent::new(
                &job.id,
                EventKind::Queued,
                format!("queued on {}", job.cluster),
            )])
            .await;
        state.queue.push(job).await
    }

    /// Mark a job for cancellation. Returns the cluster the job was found on;
    /// an unknown id is not an error, just `None`. The actual cancellation is
    /// applied by the job's worker once the job has been submitted, or at
    /// admission if it is still queued.
    pub async fn cancel_job(&self, job_id: &str) -> Option<String> {
        for (name, state) in &self.clusters {
            let known = state.queue.contains(job_id).await
                || state.running.lock().unwrap().contains_key(job_id);
            if known {
                state
                    .cancel_pending
                    .lock()
                    .unwrap()
                    .insert(job_id.to_string());
                return Some(name.clone());
            }
        }
        None
    }

    pub fn running_count(&self, cluster: &str) -> usize {
        self.clusters
            .get(cluster)
            .map(|s| s.running.lock().unwrap().len())
            .unwrap_or(0)
    }

    pub async fn queue_len(&self, cluster: &str) -> usize {
        match self.clusters.get(cluster) {
            Some(state) => state.queue.len().await,
            None => 0,
        }
    }

    /// Run forever on the configured tick.
    pub async fn run(&self) {
        self.register_shared_entries().await;
        let mut tick = tokio::time::interval(self.config.tick);
        loop {
            tick.tick().await;
            self.tick().await;
        }
    }

    /// One admission pass over every cluster.
    pub async fn tick(&self) {
        for state in self.clusters.values() {
            self.admit_ready(state).await;
        }
    }

    /// Pre-create the shared pool entries so refcounting starts from a known
    /// registered entry. A resolver failure here is not fatal; the entry is
    /// created lazily at first admission instead.
    async fn register_shared_entries(&self) {
        for state in self.clusters.values() {
            if !state.profile.shared_credential {
                continue;
            }
            match self.resolver.resolve("", &state.profile.name).await {
                Ok(credential) => {
                    let config = shell_config(&state.profile, credential);
                    self.pool
                        .register(PoolKey::Cluster(state.profile.name.clone()), config)
                        .await;
                }
                Err(err) => {
                    tracing::warn!(
                        cluster = %state.profile.name,
                        "cannot resolve shared credential at startup: {err}"
                    );
                }
            }
        }
    }

    async fn admit_ready(&self, state: &Arc<ClusterState>) {
        loop {
            let spare = {
                let running = state.running.lock().unwrap();
                state.profile.capacity.saturating_sub(running.len())
            };
            if spare == 0 {
                return;
            }
            let job = match state.queue.shift().await {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(cluster = %state.profile.name, "queue shift failed: {err}");
                    return;
                }
            };
            self.admit(state, job).await;
        }
    }

    async fn admit(&self, state: &Arc<ClusterState>, job: JobDescriptor) {
        if state.cancel_pending.lock().unwrap().remove(&job.id) {
            self.finish_unstarted(&job, EventKind::Ended, "cancelled before admission".into())
                .await;
            return;
        }

        // Policy construction and credential resolution happen before any
        // pool slot is taken; a failure here is terminal for the job but
        // never occupies capacity.
        let policy = match self.registry.build(&job, &state.profile) {
            Ok(policy) => policy,
            Err(err) => {
                self.finish_unstarted(
                    &job,
                    EventKind::InitError,
                    format!("cannot construct maintainer: {err}"),
                )
                .await;
                return;
            }
        };
        let credential = match self.credential_for(&job, &state.profile).await {
            Ok(credential) => credential,
            Err(err) => {
                self.finish_unstarted(
                    &job,
                    EventKind::InitError,
                    format!("cannot resolve credential: {err}"),
                )
                .await;
                return;
            }
        };

        let key = if state.profile.shared_credential {
            PoolKey::Cluster(state.profile.name.clone())
        } else {
            PoolKey::Job(job.id.clone())
        };
        let shell = self
            .pool
            .acquire(&key, shell_config(&state.profile, credential))
            .await;

        let maintainer = Arc::new(Maintainer::new(
            job.clone(),
            policy,
            LifecycleConfig {
                init_retry_limit: self.config.init_retry_limit,
                maintain_timeout: self.config.maintain_timeout,
            },
        ));
        state
            .running
            .lock()
            .unwrap()
            .insert(job.id.clone(), maintainer.clone());
        maintainer.ctx().emit(
            EventKind::Registered,
            format!("admitted on {}", state.profile.name),
        );
        tracing::info!(job = %job.id, cluster = %state.profile.name, pool_key = %key, "job admitted");

        tokio::spawn(worker(
            state.clone(),
            self.pool.clone(),
            self.store.clone(),
            self.sink.clone(),
            maintainer,
            shell,
            key,
            self.config.maintain_interval,
        ));
    }

    /// Shared-credential clusters log in with the cluster's service
    /// credential; dedicated clusters use the credential named on the job.
    async fn credential_for(
        &self,
        job: &JobDescriptor,
        profile: &ClusterProfile,
    ) -> Result<crate::store::Credential> {
        if profile.shared_credential {
            self.resolver.resolve("", &profile.name).await
        } else {
            self.resolver.resolve(&job.credential_id, &profile.name).await
        }
    }

    /// Terminal path for jobs that never reached a worker.
    async fn finish_unstarted(&self, job: &JobDescriptor, kind: EventKind, message: String) {
        self.sink
            .events(vec![JobEvent::new(&job.id, kind, message)])
            .await;
        let update = JobUpdate {
            finished_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(err) = self.store.update(&job.id, update).await {
            tracing::warn!(job = %job.id, "failed to stamp finish time: {err}");
        }
    }
}

fn shell_config(profile: &ClusterProfile, credential: crate::store::Credential) -> ShellConfig {
    ShellConfig {
        host: profile.host.clone(),
        port: profile.port,
        credential,
        keepalive_secs: profile.keepalive_secs,
    }
}

/// Per-job worker task. Runs the maintainer lifecycle on the configured
/// interval until the job is terminal, then tears down its pool reference
/// and scheduling entries.
#[allow(clippy::too_many_arguments)]
async fn worker(
    state: Arc<ClusterState>,
    pool: Arc<ConnectionPool>,
    store: Arc<dyn JobStore>,
    sink: Arc<dyn EventSink>,
    maintainer: Arc<Maintainer>,
    shell: Arc<dyn RemoteShell>,
    key: PoolKey,
    interval: Duration,
) {
    let job_id = maintainer.ctx().job().id.clone();
    let cluster = state.profile.name.clone();

    loop {
        match pool.ensure_connected(&cluster, &shell).await {
            Ok(()) => {
                if maintainer.is_init() {
                    maintainer.maintain(&shell).await;
                } else {
                    maintainer.init(&shell).await;
                }

                let wants_cancel = state.cancel_pending.lock().unwrap().contains(&job_id);
                if wants_cancel && !maintainer.is_end() {
                    match maintainer.cancel(&shell).await {
                        Ok(true) => {
                            state.cancel_pending.lock().unwrap().remove(&job_id);
                        }
                        // not submitted yet; tried again next iteration
                        Ok(false) => {}
                        Err(err) => {
                            tracing::warn!(job = %job_id, "cancel attempt failed: {err}");
                        }
                    }
                }
            }
            Err(err) => {
                maintainer.ctx().emit(EventKind::Failed, err.to_string());
            }
        }

        drain(&sink, &job_id, &maintainer).await;
        if maintainer.is_end() {
            break;
        }
        tokio::time::sleep(interval).await;
    }

    pool.release(&key).await;
    let update = JobUpdate {
        finished_at: Some(Utc::now()),
        ..Default::default()
    };
    if let Err(err) = store.update(&job_id, update).await {
        tracing::warn!(job = %job_id, "failed to stamp finish time: {err}");
    }
    state.running.lock().unwrap().remove(&job_id);
    state.cancel_pending.lock().unwrap().remove(&job_id);
    tracing::info!(job = %job_id, cluster = %cluster, "job finished");
}

/// Forward everything the maintainer buffered since the last drain. Each
/// event and log line passes through exactly once.
async fn drain(sink: &Arc<dyn EventSink>, job_id: &str, maintainer: &Maintainer) {
    let events = maintainer.dump_events();
    if !events.is_empty() {
        sink.events(events).await;
    }
    let logs = maintainer.dump_logs();
    if !logs.is_empty() {
        sink.logs(job_id, logs).await;
    }
}
