//! russh-backed [`RemoteShell`] implementation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use russh::client::{AuthResult, Config};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::remote::{ExecOutput, RemoteShell, ShellConfig, ShellFactory};
use crate::store::Credential;

/// Minimal russh client handler. We rely on default implementations.
/// TODO: add actual server key verification
#[derive(Clone, Debug, Default)]
struct ClientHandler;

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// One long-lived authenticated SSH session. Commands are serialized behind
/// the handle mutex; channel use is one-at-a-time.
pub struct SshShell {
    config: ShellConfig,
    ssh_config: Arc<Config>,
    handle: Mutex<Option<russh::client::Handle<ClientHandler>>>,
}

impl SshShell {
    pub fn new(config: ShellConfig) -> Self {
        let ssh_config = Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            keepalive_interval: Some(Duration::from_secs(config.keepalive_secs)),
            channel_buffer_size: 64,
            window_size: 1024 * 1024,
            ..Default::default()
        };
        Self {
            config,
            ssh_config: Arc::new(ssh_config),
            handle: Mutex::new(None),
        }
    }

    async fn establish(&self) -> Result<()> {
        let mut guard = self.handle.lock().await;
        let reusable = matches!(guard.as_ref(), Some(h) if !h.is_closed());
        if reusable {
            return Ok(());
        }

        let addr = (self.config.host.as_str(), self.config.port);
        tracing::info!(
            host = %self.config.host,
            user = %self.config.credential.username(),
            "establishing ssh connection"
        );
        let mut handle = russh::client::connect(self.ssh_config.clone(), addr, ClientHandler)
            .await
            .context("SSH connect failed")?;

        let result = match &self.config.credential {
            Credential::Key { username, key_path } => {
                let key = russh::keys::load_secret_key(key_path, None)
                    .with_context(|| format!("failed to load secret key at {key_path}"))?;
                let key = Arc::new(key);
                // Prefer SHA-256 for RSA if applicable (ignored for non-RSA keys)
                let pk = PrivateKeyWithHashAlg::new(
                    key,
                    handle.best_supported_rsa_hash().await?.flatten(),
                );
                handle.authenticate_publickey(username.clone(), pk).await?
            }
            Credential::Password { username, password } => {
                handle
                    .authenticate_password(username.clone(), password.clone())
                    .await?
            }
        };
        match result {
            AuthResult::Success => {}
            AuthResult::Failure { .. } => {
                return Err(anyhow!(
                    "authentication failed for {}@{}",
                    self.config.credential.username(),
                    self.config.host
                ));
            }
        }

        *guard = Some(handle);
        Ok(())
    }

    async fn exec_capture(&self, cmd: &str) -> Result<ExecOutput> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or_else(|| anyhow!("SSH handle lost"))?;
        let mut chan = handle
            .channel_open_session()
            .await
            .context("open session")?;
        tracing::debug!("executing '{cmd}'");
        chan.exec(true, cmd).await.context("exec request")?;

        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut code: i32 = 0;
        while let Some(msg) = chan.wait().await {
            match msg {
                ChannelMsg::Data { data } => out.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => err.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => code = exit_status as i32,
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        let _ = chan.close().await;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
            exit_code: code,
        })
    }

    async fn sftp(&self) -> Result<SftpSession> {
        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| anyhow!("SSH handle lost before opening SFTP"))?;
        let channel = handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;
        Ok(sftp)
    }

    async fn ensure_remote_dir(&self, sftp: &SftpSession, remote_dir: &str) -> Result<()> {
        for cur in remote_ancestors(remote_dir) {
            match sftp.metadata(&cur).await {
                Ok(meta) => {
                    if !meta.is_dir() {
                        return Err(anyhow!("remote path exists but is not a directory: {cur}"));
                    }
                }
                Err(_) => {
                    sftp.create_dir(&cur)
                        .await
                        .with_context(|| format!("creating path {cur}"))?;
                }
            }
        }
        Ok(())
    }

    async fn write_remote_file(
        &self,
        sftp: &SftpSession,
        content: &[u8],
        remote_path: &str,
    ) -> Result<()> {
        if let Some(parent) = parent_dir(remote_path) {
            self.ensure_remote_dir(sftp, &parent).await?;
        }
        let mut file = sftp
            .open_with_flags(
                remote_path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .with_context(|| format!("opening remote file {remote_path}"))?;
        file.write_all(content)
            .await
            .with_context(|| format!("writing remote file {remote_path}"))?;
        file.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn connect(&self) -> crate::Result<()> {
        self.establish().await.map_err(crate::Error::from)
    }

    async fn is_connected(&self) -> bool {
        let guard = self.handle.lock().await;
        matches!(guard.as_ref(), Some(h) if !h.is_closed())
    }

    async fn exec(&self, cmd: &str) -> crate::Result<ExecOutput> {
        self.exec_capture(cmd).await.map_err(crate::Error::from)
    }

    async fn put_file(&self, content: &[u8], remote_path: &str) -> crate::Result<()> {
        let sftp = self.sftp().await?;
        self.write_remote_file(&sftp, content, remote_path)
            .await
            .map_err(crate::Error::from)
    }

    async fn put_directory(&self, local_dir: &Path, remote_dir: &str) -> crate::Result<()> {
        let sftp = self.sftp().await?;
        self.ensure_remote_dir(&sftp, remote_dir).await?;
        for entry in WalkDir::new(local_dir) {
            let entry = entry.map_err(|e| anyhow!("walking {}: {e}", local_dir.display()))?;
            let rel = entry
                .path()
                .strip_prefix(local_dir)
                .map_err(|e| anyhow!("stripping prefix: {e}"))?;
            if rel.as_os_str().is_empty() {
                continue;
            }
            let remote_path = join_remote(remote_dir, rel);
            if entry.file_type().is_dir() {
                self.ensure_remote_dir(&sftp, &remote_path).await?;
            } else if entry.file_type().is_file() {
                let content = tokio::fs::read(entry.path()).await?;
                self.write_remote_file(&sftp, &content, &remote_path).await?;
            }
        }
        Ok(())
    }

    async fn make_dir(&self, remote_dir: &str) -> crate::Result<()> {
        let sftp = self.sftp().await?;
        self.ensure_remote_dir(&sftp, remote_dir)
            .await
            .map_err(crate::Error::from)
    }

    async fn dispose(&self) {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.take() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
        }
    }
}

/// Default factory handing out russh-backed shells.
#[derive(Default)]
pub struct SshShellFactory;

impl ShellFactory for SshShellFactory {
    fn build(&self, config: ShellConfig) -> Arc<dyn RemoteShell> {
        Arc::new(SshShell::new(config))
    }
}

/// Cumulative prefixes of an absolute remote path: "/a/b/c" -> /a, /a/b, /a/b/c.
fn remote_ancestors(remote_dir: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for part in remote_dir.split('/').filter(|p| !p.is_empty()) {
        cur.push('/');
        cur.push_str(part);
        out.push(cur.clone());
    }
    out
}

fn parent_dir(remote_path: &str) -> Option<String> {
    let idx = remote_path.rfind('/')?;
    if idx == 0 { None } else { Some(remote_path[..idx].to_string()) }
}

fn join_remote(remote_dir: &str, rel: &Path) -> String {
    let mut out = remote_dir.trim_end_matches('/').to_string();
    for comp in rel.components() {
        out.push('/');
        out.push_str(&comp.as_os_str().to_string_lossy());
    }
    out
}
