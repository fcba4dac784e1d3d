use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Named subset of job fields the engine is allowed to write back.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub initialized_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub scheduler_id: Option<String>,
    pub result_dir: Option<String>,
}

impl JobUpdate {
    pub fn merge(&mut self, other: JobUpdate) {
        if other.initialized_at.is_some() {
            self.initialized_at = other.initialized_at;
        }
        if other.finished_at.is_some() {
            self.finished_at = other.finished_at;
        }
        if other.scheduler_id.is_some() {
            self.scheduler_id = other.scheduler_id;
        }
        if other.result_dir.is_some() {
            self.result_dir = other.result_dir;
        }
    }
}

/// The external job store. The engine only ever updates a named subset of
/// fields; reads go through the in-memory [`crate::job::JobDescriptor`] copy.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn update(&self, job_id: &str, update: JobUpdate) -> Result<()>;
}

/// Credential material for one cluster login.
#[derive(Debug, Clone)]
pub enum Credential {
    Password { username: String, password: String },
    Key { username: String, key_path: String },
}

impl Credential {
    pub fn username(&self) -> &str {
        match self {
            Credential::Password { username, .. } => username,
            Credential::Key { username, .. } => username,
        }
    }
}

/// Resolves the credential reference on a job into usable login material.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, credential_id: &str, cluster: &str) -> Result<Credential>;
}

/// In-memory job store used by tests and the daemon scaffold.
#[derive(Default)]
pub struct MemoryJobStore {
    updates: Mutex<HashMap<String, JobUpdate>>,
}

impl MemoryJobStore {
    pub fn get(&self, job_id: &str) -> Option<JobUpdate> {
        self.updates.lock().unwrap().get(job_id).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn update(&self, job_id: &str, update: JobUpdate) -> Result<()> {
        self.updates
            .lock()
            .unwrap()
            .entry(job_id.to_string())
            .or_default()
            .merge(update);
        Ok(())
    }
}

/// Resolver that hands out one fixed credential. Enough for the daemon
/// scaffold and for tests; production deployments plug in their own resolver.
pub struct StaticCredentialResolver {
    credential: Credential,
}

impl StaticCredentialResolver {
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, _credential_id: &str, _cluster: &str) -> Result<Credential> {
        Ok(self.credential.clone())
    }
}
