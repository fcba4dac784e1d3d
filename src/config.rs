use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::slurm::units::ResourceCeiling;

const APP_DIR_NAME: &str = "batchd";
const CONFIG_FILE_NAME: &str = "batchd.toml";

const DEFAULT_TICK_SECS: u64 = 1;
const DEFAULT_MAINTAIN_INTERVAL_SECS: u64 = 3;
const DEFAULT_MAINTAIN_TIMEOUT_SECS: u64 = 48 * 3600;
const DEFAULT_INIT_RETRY_LIMIT: u32 = 3;
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_KEEPALIVE_SECS: u64 = 60;

/// One remote cluster as configured by the administrator. Immutable after
/// startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterProfile {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared-credential ("community") clusters reuse one refcounted
    /// connection across jobs; dedicated clusters get one per job.
    #[serde(default)]
    pub shared_credential: bool,
    /// Maximum concurrently running jobs on this cluster.
    pub capacity: usize,
    /// Remote base directory; every job gets a subdirectory keyed by its id.
    pub base_dir: String,
    /// Environment modules loaded in every batch script on this cluster.
    #[serde(default)]
    pub modules: Vec<String>,
    /// Host paths bind-mounted into container jobs.
    #[serde(default)]
    pub container_binds: Vec<String>,
    /// Environment module providing the container runtime, loaded for
    /// container jobs only.
    #[serde(default)]
    pub container_module: Option<String>,
    #[serde(default)]
    pub ceiling: Option<ResourceCeiling>,
    /// Empty list means all users are allowed.
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub denied_users: Vec<String>,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

impl ClusterProfile {
    pub fn permits(&self, user: &str) -> bool {
        if self.denied_users.iter().any(|u| u == user) {
            return false;
        }
        self.allowed_users.is_empty() || self.allowed_users.iter().any(|u| u == user)
    }
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_keepalive() -> u64 {
    DEFAULT_KEEPALIVE_SECS
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    tick_secs: Option<u64>,
    maintain_interval_secs: Option<u64>,
    maintain_timeout_secs: Option<u64>,
    init_retry_limit: Option<u32>,
    #[serde(default)]
    clusters: Vec<ClusterProfile>,
}

/// Engine configuration, merged from the config file and built-in defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick: Duration,
    pub maintain_interval: Duration,
    pub maintain_timeout: Duration,
    pub init_retry_limit: u32,
    pub clusters: Vec<ClusterProfile>,
    pub config_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(DEFAULT_TICK_SECS),
            maintain_interval: Duration::from_secs(DEFAULT_MAINTAIN_INTERVAL_SECS),
            maintain_timeout: Duration::from_secs(DEFAULT_MAINTAIN_TIMEOUT_SECS),
            init_retry_limit: DEFAULT_INIT_RETRY_LIMIT,
            clusters: Vec::new(),
            config_path: None,
        }
    }
}

pub fn load(config_path_override: Option<PathBuf>) -> Result<EngineConfig> {
    let required = config_path_override.is_some();
    let config_path = match config_path_override {
        Some(path) => Some(expand_path(path)),
        None => default_config_path().ok(),
    };

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };

    Ok(EngineConfig {
        tick: Duration::from_secs(file_config.tick_secs.unwrap_or(DEFAULT_TICK_SECS)),
        maintain_interval: Duration::from_secs(
            file_config
                .maintain_interval_secs
                .unwrap_or(DEFAULT_MAINTAIN_INTERVAL_SECS),
        ),
        maintain_timeout: Duration::from_secs(
            file_config
                .maintain_timeout_secs
                .unwrap_or(DEFAULT_MAINTAIN_TIMEOUT_SECS),
        ),
        init_retry_limit: file_config
            .init_retry_limit
            .unwrap_or(DEFAULT_INIT_RETRY_LIMIT),
        clusters: file_config.clusters,
        config_path,
    })
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn profile_permits_honors_allow_and_deny_lists() {
        let mut profile = ClusterProfile {
            name: "lumi".into(),
            host: "lumi.example.org".into(),
            port: 22,
            shared_credential: true,
            capacity: 4,
            base_dir: "/scratch/batchd".into(),
            modules: vec![],
            container_binds: vec![],
            container_module: None,
            ceiling: None,
            allowed_users: vec![],
            denied_users: vec!["mallory".into()],
            keepalive_secs: 60,
        };
        assert!(profile.permits("alice"));
        assert!(!profile.permits("mallory"));

        profile.allowed_users = vec!["alice".into()];
        assert!(profile.permits("alice"));
        assert!(!profile.permits("bob"));
    }

    #[test]
    fn config_file_parses_clusters_and_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
tick_secs = 2
init_retry_limit = 5

[[clusters]]
name = "lumi"
host = "lumi.example.org"
shared_credential = true
capacity = 8
base_dir = "/scratch/batchd"
modules = ["singularity"]
container_binds = ["/scratch", "/projects"]
container_module = "singularity"

[clusters.ceiling]
cpus_per_task = 50
walltime = "04:00:00"
"#
        )
        .unwrap();

        let config = load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.tick, Duration::from_secs(2));
        assert_eq!(config.init_retry_limit, 5);
        assert_eq!(config.maintain_interval, Duration::from_secs(3));
        assert_eq!(config.clusters.len(), 1);

        let cluster = &config.clusters[0];
        assert_eq!(cluster.port, 22);
        assert!(cluster.shared_credential);
        assert_eq!(cluster.capacity, 8);
        assert_eq!(cluster.container_binds, vec!["/scratch", "/projects"]);
        assert_eq!(cluster.container_module.as_deref(), Some("singularity"));
        assert_eq!(
            cluster.ceiling.as_ref().unwrap().cpus_per_task,
            Some(50)
        );
        assert!(cluster.permits("anyone"));
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        assert!(load(Some(PathBuf::from("/nonexistent/batchd.toml"))).is_err());
    }
}
