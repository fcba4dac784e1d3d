use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::store::Credential;

/// Captured output of one remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

/// Parameters for establishing a remote shell connection.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub host: String,
    pub port: u16,
    pub credential: Credential,
    /// TCP keepalives to keep long connections healthy.
    pub keepalive_secs: u64,
}

/// Remote command execution and transfer boundary. One instance corresponds
/// to one authenticated session; shared-credential clusters reuse a single
/// instance across jobs, so every remote path an implementation touches must
/// be job-scoped by the caller.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn is_connected(&self) -> bool;
    async fn exec(&self, cmd: &str) -> Result<ExecOutput>;
    async fn put_file(&self, content: &[u8], remote_path: &str) -> Result<()>;
    async fn put_directory(&self, local_dir: &Path, remote_dir: &str) -> Result<()>;
    async fn make_dir(&self, remote_dir: &str) -> Result<()>;
    async fn dispose(&self);
}

/// Seam for injecting shell implementations; tests swap in recording fakes.
pub trait ShellFactory: Send + Sync {
    fn build(&self, config: ShellConfig) -> Arc<dyn RemoteShell>;
}
