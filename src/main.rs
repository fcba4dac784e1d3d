use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use batchd::config;
use batchd::event::TracingSink;
use batchd::logging;
use batchd::policy::builtin_registry;
use batchd::ssh::SshShellFactory;
use batchd::store::{Credential, JobStore, MemoryJobStore, StaticCredentialResolver};
use batchd::supervisor::Supervisor;

#[derive(Debug, Parser)]
#[command(name = "batchd", version, about = "Batch job engine for remote HPC clusters")]
struct Opts {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging (overridden by BATCHD_LOG).
    #[arg(short, long)]
    verbose: bool,
}

/// Login material for the scaffolded credential resolver. Deployments with a
/// real secret store replace [`StaticCredentialResolver`] entirely.
fn credential_from_env() -> anyhow::Result<Credential> {
    let username = env::var("BATCHD_SSH_USER").context("BATCHD_SSH_USER is not set")?;
    if let Ok(key_path) = env::var("BATCHD_SSH_KEY") {
        return Ok(Credential::Key { username, key_path });
    }
    let password = env::var("BATCHD_SSH_PASSWORD")
        .context("neither BATCHD_SSH_KEY nor BATCHD_SSH_PASSWORD is set")?;
    Ok(Credential::Password { username, password })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    logging::init(opts.verbose);

    let config = config::load(opts.config)?;
    match &config.config_path {
        Some(path) => tracing::info!("config loaded from {}", path.display()),
        None => tracing::info!("no config file, using built-in defaults"),
    }
    if config.clusters.is_empty() {
        tracing::warn!("no clusters configured, nothing will be scheduled");
    } else {
        for cluster in &config.clusters {
            tracing::info!(
                cluster = %cluster.name,
                host = %cluster.host,
                capacity = cluster.capacity,
                shared = cluster.shared_credential,
                "cluster configured"
            );
        }
    }

    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::default());
    let resolver = Arc::new(StaticCredentialResolver::new(credential_from_env()?));
    let registry = builtin_registry(store.clone());

    let supervisor = Supervisor::new(
        config,
        registry,
        store,
        resolver,
        Arc::new(TracingSink),
        Arc::new(SshShellFactory),
    );

    tracing::info!("batchd started");
    supervisor.run().await;
    Ok(())
}
