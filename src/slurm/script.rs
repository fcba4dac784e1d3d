//! Batch-script rendering and scheduler-output parsing.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::job::{JobDescriptor, ResourceSpec};

use super::RemotePaths;

// Submission defaults applied when the caller leaves a field empty.
const DEFAULT_WALLTIME: &str = "00:10:00";
const DEFAULT_NODES: u32 = 1;
const DEFAULT_TASKS: u32 = 1;
const DEFAULT_CPUS_PER_TASK: u32 = 1;

/// Merge a requested spec over the submission defaults.
pub fn with_defaults(spec: &ResourceSpec) -> ResourceSpec {
    let mut merged = spec.clone();
    merged.nodes = Some(spec.nodes.unwrap_or(DEFAULT_NODES));
    merged.tasks = Some(spec.tasks.unwrap_or(DEFAULT_TASKS));
    merged.cpus_per_task = Some(spec.cpus_per_task.unwrap_or(DEFAULT_CPUS_PER_TASK));
    merged.walltime = Some(
        spec.walltime
            .clone()
            .unwrap_or_else(|| DEFAULT_WALLTIME.to_string()),
    );
    merged
}

/// Render the sbatch script for one job. `spec` must already be merged over
/// defaults; stdout and stderr are redirected into the result folder so they
/// can be read back during polling.
pub fn render_sbatch(
    job_name: &str,
    cmd: &str,
    spec: &ResourceSpec,
    modules: &[String],
    paths: &RemotePaths,
) -> String {
    let mut script = String::new();
    script.push_str("#!/bin/bash\n");
    let _ = writeln!(script, "#SBATCH --job-name={job_name}");
    let _ = writeln!(script, "#SBATCH --nodes={}", spec.nodes.unwrap_or(DEFAULT_NODES));
    let _ = writeln!(script, "#SBATCH --ntasks={}", spec.tasks.unwrap_or(DEFAULT_TASKS));
    let _ = writeln!(
        script,
        "#SBATCH --cpus-per-task={}",
        spec.cpus_per_task.unwrap_or(DEFAULT_CPUS_PER_TASK)
    );
    let _ = writeln!(
        script,
        "#SBATCH --time={}",
        spec.walltime.as_deref().unwrap_or(DEFAULT_WALLTIME)
    );
    let _ = writeln!(script, "#SBATCH --error={}/job.stderr", paths.result);
    let _ = writeln!(script, "#SBATCH --output={}/job.stdout", paths.result);

    if let Some(memory) = &spec.memory {
        let _ = writeln!(script, "#SBATCH --mem={memory}");
    }
    if let Some(memory_per_cpu) = &spec.memory_per_cpu {
        let _ = writeln!(script, "#SBATCH --mem-per-cpu={memory_per_cpu}");
    }
    if let Some(gpus) = spec.gpus {
        let _ = writeln!(script, "#SBATCH --gpus={gpus}");
    }
    if let Some(gpus_per_node) = spec.gpus_per_node {
        let _ = writeln!(script, "#SBATCH --gpus-per-node={gpus_per_node}");
    }
    if let Some(partition) = &spec.partition {
        let _ = writeln!(script, "#SBATCH --partition={partition}");
    }
    if let Some(mail_user) = &spec.mail_user {
        let _ = writeln!(script, "#SBATCH --mail-user={mail_user}");
        let mail_type = spec.mail_type.as_deref().unwrap_or("ALL");
        let _ = writeln!(script, "#SBATCH --mail-type={mail_type}");
    }

    for module in modules {
        let _ = writeln!(script, "module load {module}");
    }
    let _ = writeln!(script, "{cmd}");
    script
}

/// sbatch reports the assigned id as the last whitespace-delimited token of
/// its stdout ("Submitted batch job 4242").
pub fn parse_job_id(stdout: &str) -> Option<String> {
    stdout
        .split_whitespace()
        .last()
        .filter(|tok| !tok.is_empty())
        .map(str::to_string)
}

/// Locate `job_id` in a whitespace-tokenized scheduler listing and return the
/// status field four positions after it. Both `squeue` (JOBID PARTITION NAME
/// USER ST ...) and `sacct` output put the state there.
pub fn find_status_token(output: &str, job_id: &str) -> Option<String> {
    let tokens: Vec<&str> = output.split_whitespace().collect();
    let idx = tokens.iter().position(|tok| *tok == job_id)?;
    tokens.get(idx + 4).map(|tok| tok.to_string())
}

/// Render the `job.env` companion file: one `KEY="value"` line per field,
/// nested maps flattened as `key_subkey="value"`. Consumed by user job
/// scripts, so the order is kept deterministic.
pub fn render_job_env(job: &JobDescriptor, paths: &RemotePaths) -> String {
    let mut out = String::new();
    let mut push = |key: &str, value: &str| {
        let _ = writeln!(out, "{key}=\"{value}\"");
    };
    push("id", &job.id);
    push("cluster", &job.cluster);
    push("maintainer", &job.maintainer);
    push("user", &job.user);
    push("command", &job.command);
    push("executable_path", &paths.executable);
    push("data_path", &paths.data);
    push("result_path", &paths.result);
    for (key, value) in sorted(&job.parameters) {
        push(&format!("parameters_{key}"), value);
    }
    for (key, value) in sorted(&job.environment) {
        push(&format!("environment_{key}"), value);
    }
    out
}

/// Structured job metadata written next to the batch script as `job.json`.
pub fn render_job_json(job: &JobDescriptor, paths: &RemotePaths) -> serde_json::Value {
    serde_json::json!({
        "id": job.id,
        "cluster": job.cluster,
        "maintainer": job.maintainer,
        "user": job.user,
        "command": job.command,
        "parameters": sorted(&job.parameters).into_iter().collect::<BTreeMap<_, _>>(),
        "environment": sorted(&job.environment).into_iter().collect::<BTreeMap<_, _>>(),
        "resources": job.resources,
        "paths": {
            "executable": paths.executable,
            "data": paths.data,
            "result": paths.result,
        },
    })
}

fn sorted(map: &std::collections::HashMap<String, String>) -> Vec<(&String, &String)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> RemotePaths {
        RemotePaths::for_job("/scratch/batchd", "j1")
    }

    fn directive_value<'a>(script: &'a str, flag: &str) -> Option<&'a str> {
        let prefix = format!("#SBATCH --{flag}=");
        script
            .lines()
            .find_map(|line| line.strip_prefix(prefix.as_str()))
    }

    #[test]
    fn defaults_fill_missing_fields_only() {
        let merged = with_defaults(&ResourceSpec {
            nodes: Some(4),
            ..Default::default()
        });
        assert_eq!(merged.nodes, Some(4));
        assert_eq!(merged.tasks, Some(1));
        assert_eq!(merged.cpus_per_task, Some(1));
        assert_eq!(merged.walltime.as_deref(), Some("00:10:00"));
    }

    #[test]
    fn rendered_script_round_trips_resource_values() {
        let spec = with_defaults(&ResourceSpec {
            nodes: Some(2),
            tasks: Some(8),
            cpus_per_task: Some(4),
            walltime: Some("02:00:00".into()),
            memory: Some("16G".into()),
            partition: Some("gpu_std".into()),
            ..Default::default()
        });
        let script = render_sbatch("j1", "./run.sh", &spec, &["python/3.12".into()], &paths());

        assert!(script.starts_with("#!/bin/bash\n"));
        assert_eq!(directive_value(&script, "nodes"), Some("2"));
        assert_eq!(directive_value(&script, "ntasks"), Some("8"));
        assert_eq!(directive_value(&script, "cpus-per-task"), Some("4"));
        assert_eq!(directive_value(&script, "time"), Some("02:00:00"));
        assert_eq!(directive_value(&script, "mem"), Some("16G"));
        assert_eq!(directive_value(&script, "partition"), Some("gpu_std"));
        assert_eq!(
            directive_value(&script, "output"),
            Some("/scratch/batchd/j1/result/job.stdout")
        );
        assert!(script.contains("module load python/3.12\n"));
        assert!(script.ends_with("./run.sh\n"));
    }

    #[test]
    fn optional_directives_are_omitted() {
        let spec = with_defaults(&ResourceSpec::default());
        let script = render_sbatch("j1", "true", &spec, &[], &paths());
        assert!(!script.contains("--mem"));
        assert!(!script.contains("--gpus"));
        assert!(!script.contains("--partition"));
        assert!(!script.contains("--mail"));
        assert!(!script.contains("module load"));
    }

    #[test]
    fn job_id_is_last_token() {
        assert_eq!(parse_job_id("Submitted batch job 4242\n").as_deref(), Some("4242"));
        assert_eq!(parse_job_id("4242").as_deref(), Some("4242"));
        assert_eq!(parse_job_id("   \n"), None);
    }

    #[test]
    fn status_token_is_four_after_the_id() {
        let squeue = "JOBID PARTITION NAME USER ST TIME NODES\n\
                      4242 gpu_std j1 alice R 1:02 2\n";
        assert_eq!(find_status_token(squeue, "4242").as_deref(), Some("R"));
        assert_eq!(find_status_token(squeue, "9999"), None);
        // id present but the line is truncated before the status field
        assert_eq!(find_status_token("4242 gpu_std j1", "4242"), None);
    }

    #[test]
    fn job_env_flattens_nested_maps() {
        let mut job = JobDescriptor::new("j1", "lumi", "batch", "./run.sh");
        job.user = "alice".into();
        job.parameters.insert("alpha".into(), "0.5".into());
        job.parameters.insert("beta".into(), "2".into());
        job.environment.insert("OMP_NUM_THREADS".into(), "4".into());

        let env = render_job_env(&job, &paths());
        assert!(env.contains("id=\"j1\"\n"));
        assert!(env.contains("parameters_alpha=\"0.5\"\n"));
        assert!(env.contains("parameters_beta=\"2\"\n"));
        assert!(env.contains("environment_OMP_NUM_THREADS=\"4\"\n"));
        assert!(env.contains("result_path=\"/scratch/batchd/j1/result\"\n"));
        // deterministic ordering of flattened keys
        let alpha = env.find("parameters_alpha").unwrap();
        let beta = env.find("parameters_beta").unwrap();
        assert!(alpha < beta);
    }

    #[test]
    fn job_json_carries_paths_and_resources() {
        let mut job = JobDescriptor::new("j1", "lumi", "batch", "./run.sh");
        job.resources.nodes = Some(2);
        let value = render_job_json(&job, &paths());
        assert_eq!(value["id"], "j1");
        assert_eq!(value["paths"]["result"], "/scratch/batchd/j1/result");
        assert_eq!(value["resources"]["nodes"], 2);
    }
}
