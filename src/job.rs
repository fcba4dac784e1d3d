use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Requested resources for a single batch job. All fields are optional;
/// defaults are applied when the submission script is rendered and ceilings
/// are enforced before the job enters a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub nodes: Option<u32>,
    pub tasks: Option<u32>,
    pub cpus_per_task: Option<u32>,
    /// Total memory, Slurm storage syntax (e.g. "4G").
    pub memory: Option<String>,
    pub memory_per_cpu: Option<String>,
    pub gpus: Option<u32>,
    pub gpus_per_node: Option<u32>,
    /// Slurm time syntax (e.g. "02:30:00" or "1-00:00:00").
    pub walltime: Option<String>,
    pub partition: Option<String>,
    pub mail_user: Option<String>,
    pub mail_type: Option<String>,
}

/// A job as the engine sees it. The durable record lives in the external job
/// store; this is the transient in-memory copy held while queued or running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: String,
    /// Target cluster name, matching a configured [`crate::config::ClusterProfile`].
    pub cluster: String,
    /// Maintainer type name, resolved through the registry at admission.
    pub maintainer: String,
    /// Opaque reference handed to the credential resolver.
    pub credential_id: String,
    /// Submitting user, checked against the cluster allow/deny lists.
    pub user: String,
    /// Command executed by the rendered batch script.
    pub command: String,
    /// Local folder uploaded to the remote executable path, if any.
    #[serde(default)]
    pub executable_dir: Option<PathBuf>,
    /// Local folder uploaded to the remote data path, if any.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub initialized_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobDescriptor {
    pub fn new(
        id: impl Into<String>,
        cluster: impl Into<String>,
        maintainer: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            cluster: cluster.into(),
            maintainer: maintainer.into(),
            credential_id: String::new(),
            user: String::new(),
            command: command.into(),
            executable_dir: None,
            data_dir: None,
            parameters: HashMap::new(),
            environment: HashMap::new(),
            resources: ResourceSpec::default(),
            queued_at: None,
            initialized_at: None,
            finished_at: None,
        }
    }
}

/// Monotonic job states. A job only ever moves forward through this sequence;
/// cancellation does not introduce extra states, it lands the job in `Ended`
/// or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobState {
    Queued,
    Registered,
    Initializing,
    Running,
    Ended,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Ended | JobState::Failed)
    }
}
