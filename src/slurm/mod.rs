//! Slurm connector: batch-script submission and status polling over a
//! pooled remote shell.

pub mod script;
pub mod units;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::job::{JobDescriptor, ResourceSpec};
use crate::remote::RemoteShell;

/// Job-scoped locations on the remote cluster. Every path is derived from
/// the job id so that jobs sharing a pooled connection never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePaths {
    pub root: String,
    pub executable: String,
    pub data: String,
    pub result: String,
}

impl RemotePaths {
    pub fn for_job(base: &str, job_id: &str) -> Self {
        let root = format!("{}/{}", base.trim_end_matches('/'), job_id);
        Self {
            executable: format!("{root}/executable"),
            data: format!("{root}/data"),
            result: format!("{root}/result"),
            root,
        }
    }
}

/// Outcome of one status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlurmStatus {
    /// State token as reported by the scheduler (`R`, `PD`, `COMPLETED`, ...).
    Reported(String),
    /// The scheduler answered but the job id was absent from the listing.
    Unknown,
    /// Neither status command yielded output. Explicitly ambiguous; the
    /// caller must treat it as neither success nor failure.
    Retry,
}

/// Normalize a state token: strip `+`/`:`/`(` suffixes and uppercase.
fn normalize_state(state: &str) -> String {
    state
        .split(['+', ':', '('])
        .next()
        .unwrap_or(state)
        .trim()
        .to_ascii_uppercase()
}

/// Terminal states, both sacct words and squeue short codes.
pub fn is_terminal_state(state: &str) -> bool {
    matches!(
        normalize_state(state).as_str(),
        "COMPLETED"
            | "CANCELLED"
            | "FAILED"
            | "TIMEOUT"
            | "NODE_FAIL"
            | "PREEMPTED"
            | "BOOT_FAIL"
            | "OUT_OF_MEMORY"
            | "DEADLINE"
            | "SPECIAL_EXIT"
            | "REVOKED"
            | "CD"
            | "CA"
            | "F"
            | "TO"
            | "NF"
            | "PR"
            | "BF"
            | "OOM"
            | "DL"
            | "SE"
            | "RV"
    )
}

/// Terminal states that did not complete cleanly.
pub fn is_failure_state(state: &str) -> bool {
    let token = normalize_state(state);
    is_terminal_state(&token) && !matches!(token.as_str(), "COMPLETED" | "CD")
}

/// Everything retained after a successful submission: the scheduler-assigned
/// id, the rendered script and the job-scoped remote paths.
#[derive(Debug, Clone)]
pub struct SlurmSubmission {
    pub scheduler_id: String,
    pub script: String,
    pub paths: RemotePaths,
}

/// Executes the submission and status protocol for one job over a pooled
/// connection. The connection may be shared with other jobs; everything this
/// connector touches remotely lives under its job-scoped [`RemotePaths`].
pub struct SlurmConnector {
    shell: Arc<dyn RemoteShell>,
    job: JobDescriptor,
    paths: RemotePaths,
    modules: Vec<String>,
    script: Option<String>,
    submission: Option<SlurmSubmission>,
    stdout_seen: usize,
    stderr_seen: usize,
}

impl SlurmConnector {
    pub fn new(shell: Arc<dyn RemoteShell>, job: JobDescriptor, remote_base: &str) -> Self {
        let paths = RemotePaths::for_job(remote_base, &job.id);
        Self {
            shell,
            job,
            paths,
            modules: Vec::new(),
            script: None,
            submission: None,
            stdout_seen: 0,
            stderr_seen: 0,
        }
    }

    pub fn paths(&self) -> &RemotePaths {
        &self.paths
    }

    pub fn submission(&self) -> Option<&SlurmSubmission> {
        self.submission.as_ref()
    }

    /// Accumulate environment-module load directives for the batch script.
    pub fn register_modules<I, S>(&mut self, modules: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules.extend(modules.into_iter().map(Into::into));
    }

    /// Merge the resource spec over submission defaults and render the batch
    /// script. Renders only; [`SlurmConnector::submit`] performs the upload.
    pub fn prepare(&mut self, cmd: &str, spec: &ResourceSpec) -> &str {
        let merged = script::with_defaults(spec);
        let rendered = script::render_sbatch(&self.job.id, cmd, &merged, &self.modules, &self.paths);
        self.script = Some(rendered);
        self.script.as_deref().unwrap_or_default()
    }

    /// Upload the job payload and submit it to the scheduler.
    ///
    /// Any `ERROR`/`WARN` in sbatch's stdout, or anything at all on stderr,
    /// counts as a submission failure. Otherwise the scheduler id is the last
    /// whitespace-delimited token of stdout.
    pub async fn submit(&mut self) -> Result<&SlurmSubmission> {
        let script = self
            .script
            .clone()
            .ok_or_else(|| Error::InvalidArgument("submit() called before prepare()".into()))?;

        match &self.job.executable_dir {
            Some(local) => {
                self.shell
                    .put_directory(local, &self.paths.executable)
                    .await?
            }
            None => self.shell.make_dir(&self.paths.executable).await?,
        }

        self.shell
            .put_file(script.as_bytes(), &format!("{}/job.sbatch", self.paths.root))
            .await?;
        let metadata = script::render_job_json(&self.job, &self.paths);
        self.shell
            .put_file(
                serde_json::to_vec_pretty(&metadata)?.as_slice(),
                &format!("{}/job.json", self.paths.root),
            )
            .await?;
        let env_file = script::render_job_env(&self.job, &self.paths);
        self.shell
            .put_file(env_file.as_bytes(), &format!("{}/job.env", self.paths.root))
            .await?;

        match &self.job.data_dir {
            Some(local) => self.shell.put_directory(local, &self.paths.data).await?,
            None => self.shell.make_dir(&self.paths.data).await?,
        }
        self.shell.make_dir(&self.paths.result).await?;

        let submit_cmd = format!("sbatch --chdir {} {}/job.sbatch", self.paths.root, self.paths.root);
        let out = self.shell.exec(&submit_cmd).await?;
        if out.stdout.contains("ERROR")
            || out.stdout.contains("WARN")
            || !out.stderr.trim().is_empty()
        {
            return Err(Error::Submission(format!(
                "sbatch reported a problem: stdout='{}' stderr='{}'",
                out.stdout.trim(),
                out.stderr.trim()
            )));
        }
        let scheduler_id = script::parse_job_id(&out.stdout).ok_or_else(|| {
            Error::Submission(format!("no job id in sbatch output '{}'", out.stdout.trim()))
        })?;

        tracing::info!(job = %self.job.id, scheduler_id, "submitted batch job");
        self.submission = Some(SlurmSubmission {
            scheduler_id,
            script,
            paths: self.paths.clone(),
        });
        Ok(self.submission.as_ref().unwrap())
    }

    fn scheduler_id(&self) -> Result<&str> {
        self.submission
            .as_ref()
            .map(|s| s.scheduler_id.as_str())
            .ok_or_else(|| Error::InvalidArgument("job has not been submitted".into()))
    }

    /// Poll the live queue first, then accounting. See [`SlurmStatus`].
    pub async fn status(&self) -> Result<SlurmStatus> {
        let id = self.scheduler_id()?.to_string();

        // The sacct column list is pinned so the state sits four tokens
        // after the job id, same as squeue's default layout.
        for cmd in [
            format!("squeue --job {id}"),
            format!("sacct --job {id} --format JobID,Partition,Account,AllocCPUS,State"),
        ] {
            let Ok(out) = self.shell.exec(&cmd).await else {
                continue;
            };
            if !out.ok() || out.stdout.trim().is_empty() {
                continue;
            }
            return Ok(match script::find_status_token(&out.stdout, &id) {
                Some(token) => SlurmStatus::Reported(token),
                None => SlurmStatus::Unknown,
            });
        }
        Ok(SlurmStatus::Retry)
    }

    pub async fn cancel(&self) -> Result<()> {
        let id = self.scheduler_id()?;
        self.control(&format!("scancel {id}")).await
    }

    pub async fn pause(&self) -> Result<()> {
        let id = self.scheduler_id()?;
        self.control(&format!("scontrol suspend {id}")).await
    }

    pub async fn resume(&self) -> Result<()> {
        let id = self.scheduler_id()?;
        self.control(&format!("scontrol resume {id}")).await
    }

    async fn control(&self, cmd: &str) -> Result<()> {
        let out = self.shell.exec(cmd).await?;
        if !out.ok() {
            return Err(Error::Connector(format!(
                "'{cmd}' exited {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// New content of the redirected stdout file since the last read.
    pub async fn stdout_tail(&mut self) -> Result<Option<String>> {
        let path = format!("{}/job.stdout", self.paths.result);
        let seen = self.stdout_seen;
        let (tail, seen) = self.read_tail(&path, seen).await;
        self.stdout_seen = seen;
        Ok(tail)
    }

    /// New content of the redirected stderr file since the last read.
    pub async fn stderr_tail(&mut self) -> Result<Option<String>> {
        let path = format!("{}/job.stderr", self.paths.result);
        let seen = self.stderr_seen;
        let (tail, seen) = self.read_tail(&path, seen).await;
        self.stderr_seen = seen;
        Ok(tail)
    }

    async fn read_tail(&self, path: &str, seen: usize) -> (Option<String>, usize) {
        // The file may not exist until the job starts; that is not an error.
        let Ok(out) = self.shell.exec(&format!("cat {path}")).await else {
            return (None, seen);
        };
        if !out.ok() || out.stdout.len() <= seen {
            return (None, seen);
        }
        // The offset may not land on a character boundary if the file was
        // rewritten since the last read; start over from the top then.
        let tail = match out.stdout.get(seen..) {
            Some(rest) => rest.to_string(),
            None => out.stdout.clone(),
        };
        (Some(tail), out.stdout.len())
    }
}
