//! Storage and walltime arithmetic for resource-ceiling enforcement.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::ResourceSpec;

/// Parse a Slurm storage value into bytes, decimal units: "10G" is
/// 10_000_000_000, "500M" is 500_000_000, "10K" is 10_000. A bare number is
/// taken as bytes.
pub fn parse_storage(raw: &str) -> Result<u64> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(Error::InvalidArgument("empty storage value".into()));
    }
    let (digits, multiplier) = match s.chars().last() {
        Some('K' | 'k') => (&s[..s.len() - 1], 1_000u64),
        Some('M' | 'm') => (&s[..s.len() - 1], 1_000_000),
        Some('G' | 'g') => (&s[..s.len() - 1], 1_000_000_000),
        Some('T' | 't') => (&s[..s.len() - 1], 1_000_000_000_000),
        _ => (s, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid storage value '{raw}'")))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::InvalidArgument(format!("storage value '{raw}' is out of range")))
}

/// Sum of `value * scale` terms, `None` on overflow.
fn scaled_sum(parts: &[(u64, u64)]) -> Option<u64> {
    let mut total: u64 = 0;
    for (value, scale) in parts {
        total = total.checked_add(value.checked_mul(*scale)?)?;
    }
    Some(total)
}

/// Parse a Slurm time string into seconds. The interpretation depends on the
/// field count, following sbatch's `--time` syntax:
/// `MM`, `MM:SS`, `HH:MM:SS`, `DD-HH`, `DD-HH:MM`, `DD-HH:MM:SS`.
pub fn parse_walltime(raw: &str) -> Result<u64> {
    let s = raw.trim();
    let invalid = || Error::InvalidArgument(format!("invalid time value '{raw}'"));

    let (days, rest) = match s.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().map_err(|_| invalid())?, rest),
        None => (0, s),
    };
    let mut fields = Vec::with_capacity(3);
    for part in rest.split(':') {
        fields.push(part.parse::<u64>().map_err(|_| invalid())?);
    }

    let seconds = if s.contains('-') {
        match fields.as_slice() {
            [h] => scaled_sum(&[(*h, 3600)]),
            [h, m] => scaled_sum(&[(*h, 3600), (*m, 60)]),
            [h, m, sec] => scaled_sum(&[(*h, 3600), (*m, 60), (*sec, 1)]),
            _ => return Err(invalid()),
        }
    } else {
        match fields.as_slice() {
            [m] => scaled_sum(&[(*m, 60)]),
            [m, sec] => scaled_sum(&[(*m, 60), (*sec, 1)]),
            [h, m, sec] => scaled_sum(&[(*h, 3600), (*m, 60), (*sec, 1)]),
            _ => return Err(invalid()),
        }
    }
    .ok_or_else(invalid)?;
    scaled_sum(&[(days, 86_400), (seconds, 1)]).ok_or_else(invalid)
}

pub fn compare_storage(a: &str, b: &str) -> Result<Ordering> {
    Ok(parse_storage(a)?.cmp(&parse_storage(b)?))
}

pub fn compare_walltime(a: &str, b: &str) -> Result<Ordering> {
    Ok(parse_walltime(a)?.cmp(&parse_walltime(b)?))
}

/// Administrator-supplied upper bounds per resource field. Absent fields fall
/// back to the engine-wide defaults below.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCeiling {
    pub nodes: Option<u32>,
    pub tasks: Option<u32>,
    pub cpus_per_task: Option<u32>,
    pub memory: Option<String>,
    pub memory_per_cpu: Option<String>,
    pub gpus: Option<u32>,
    pub gpus_per_node: Option<u32>,
    pub walltime: Option<String>,
}

// Fixed default ceilings. An administrator ceiling can only tighten these,
// never widen them.
const DEFAULT_NODES: u32 = 256;
const DEFAULT_TASKS: u32 = 512;
const DEFAULT_CPUS_PER_TASK: u32 = 128;
const DEFAULT_MEMORY: &str = "2000G";
const DEFAULT_MEMORY_PER_CPU: &str = "64G";
const DEFAULT_GPUS: u32 = 64;
const DEFAULT_GPUS_PER_NODE: u32 = 16;
const DEFAULT_WALLTIME: &str = "30-00:00:00";

fn check_numeric(
    field: &'static str,
    requested: Option<u32>,
    supplied: Option<u32>,
    default: u32,
) -> Result<()> {
    let limit = supplied.map_or(default, |s| s.min(default));
    match requested {
        Some(req) if req > limit => Err(Error::ResourceCeiling {
            field,
            requested: req.to_string(),
            limit: limit.to_string(),
        }),
        _ => Ok(()),
    }
}

fn check_storage(
    field: &'static str,
    requested: Option<&str>,
    supplied: Option<&str>,
    default: &str,
) -> Result<()> {
    let default_bytes = parse_storage(default)?;
    let limit_bytes = match supplied {
        Some(s) => parse_storage(s)?.min(default_bytes),
        None => default_bytes,
    };
    if let Some(req) = requested {
        let req_bytes = parse_storage(req)?;
        if req_bytes > limit_bytes {
            return Err(Error::ResourceCeiling {
                field,
                requested: req.to_string(),
                limit: format!("{limit_bytes} bytes"),
            });
        }
    }
    Ok(())
}

fn check_walltime(requested: Option<&str>, supplied: Option<&str>, default: &str) -> Result<()> {
    let default_secs = parse_walltime(default)?;
    let limit_secs = match supplied {
        Some(s) => parse_walltime(s)?.min(default_secs),
        None => default_secs,
    };
    if let Some(req) = requested {
        let req_secs = parse_walltime(req)?;
        if req_secs > limit_secs {
            return Err(Error::ResourceCeiling {
                field: "walltime",
                requested: req.to_string(),
                limit: format!("{limit_secs}s"),
            });
        }
    }
    Ok(())
}

/// Reject a resource request that exceeds the cluster ceiling. Each governed
/// field is checked against the fixed default clamped to any administrator-
/// supplied value; the first violation is returned. Runs synchronously before
/// a job is queued, so violations never enter scheduling.
pub fn validate_resources(requested: &ResourceSpec, ceiling: Option<&ResourceCeiling>) -> Result<()> {
    let empty = ResourceCeiling::default();
    let ceiling = ceiling.unwrap_or(&empty);

    check_numeric("nodes", requested.nodes, ceiling.nodes, DEFAULT_NODES)?;
    check_numeric("tasks", requested.tasks, ceiling.tasks, DEFAULT_TASKS)?;
    check_numeric(
        "cpus_per_task",
        requested.cpus_per_task,
        ceiling.cpus_per_task,
        DEFAULT_CPUS_PER_TASK,
    )?;
    check_storage(
        "memory",
        requested.memory.as_deref(),
        ceiling.memory.as_deref(),
        DEFAULT_MEMORY,
    )?;
    check_storage(
        "memory_per_cpu",
        requested.memory_per_cpu.as_deref(),
        ceiling.memory_per_cpu.as_deref(),
        DEFAULT_MEMORY_PER_CPU,
    )?;
    check_numeric("gpus", requested.gpus, ceiling.gpus, DEFAULT_GPUS)?;
    check_numeric(
        "gpus_per_node",
        requested.gpus_per_node,
        ceiling.gpus_per_node,
        DEFAULT_GPUS_PER_NODE,
    )?;
    check_walltime(
        requested.walltime.as_deref(),
        ceiling.walltime.as_deref(),
        DEFAULT_WALLTIME,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_values_parse_decimal() {
        assert_eq!(parse_storage("2G").unwrap(), 2_000_000_000);
        assert_eq!(parse_storage("500M").unwrap(), 500_000_000);
        assert_eq!(parse_storage("10K").unwrap(), 10_000);
        assert_eq!(parse_storage("10G").unwrap(), 10_000_000_000);
        assert_eq!(parse_storage("1T").unwrap(), 1_000_000_000_000);
        assert_eq!(parse_storage("4096").unwrap(), 4096);
        assert!(parse_storage("G").is_err());
        assert!(parse_storage("ten gigs").is_err());
    }

    #[test]
    fn walltime_field_count_rules() {
        assert_eq!(parse_walltime("90").unwrap(), 5400);
        assert_eq!(parse_walltime("1-02").unwrap(), 93_600);
        assert_eq!(parse_walltime("02:30:00").unwrap(), 9000);
        assert_eq!(parse_walltime("02:30").unwrap(), 150); // MM:SS
        assert_eq!(parse_walltime("1-02:30").unwrap(), 95_400); // DD-HH:MM
        assert_eq!(parse_walltime("2-00:00:30").unwrap(), 172_830);
        assert!(parse_walltime("1:2:3:4").is_err());
        assert!(parse_walltime("soon").is_err());
    }

    #[test]
    fn out_of_range_values_are_rejected_not_wrapped() {
        assert!(parse_storage("20000000000G").is_err());
        assert!(parse_storage(&format!("{}K", u64::MAX)).is_err());
        assert!(parse_walltime("999999999999999999-00").is_err());
        assert!(parse_walltime(&format!("{}:00:00", u64::MAX)).is_err());

        // surfaces as a rejection to the caller, never a panic or a wrapped
        // value that would slip under the ceiling
        let requested = ResourceSpec {
            memory: Some("20000000000G".into()),
            ..Default::default()
        };
        assert!(validate_resources(&requested, None).is_err());
    }

    #[test]
    fn comparators_order_mixed_units() {
        assert_eq!(compare_storage("1G", "500M").unwrap(), Ordering::Greater);
        assert_eq!(compare_storage("1000M", "1G").unwrap(), Ordering::Equal);
        assert_eq!(compare_walltime("90", "01:00:00").unwrap(), Ordering::Greater);
        assert_eq!(compare_walltime("1-00", "24:00:00").unwrap(), Ordering::Equal);
    }

    #[test]
    fn ceiling_rejects_and_accepts() {
        let ceiling = ResourceCeiling {
            cpus_per_task: Some(50),
            ..Default::default()
        };

        let mut requested = ResourceSpec {
            cpus_per_task: Some(80),
            ..Default::default()
        };
        let err = validate_resources(&requested, Some(&ceiling)).unwrap_err();
        match err {
            Error::ResourceCeiling { field, requested, limit } => {
                assert_eq!(field, "cpus_per_task");
                assert_eq!(requested, "80");
                assert_eq!(limit, "50");
            }
            other => panic!("unexpected error: {other}"),
        }

        requested.cpus_per_task = Some(40);
        validate_resources(&requested, Some(&ceiling)).unwrap();
    }

    #[test]
    fn supplied_ceiling_cannot_widen_defaults() {
        // An administrator value above the fixed default clamps down to it.
        let ceiling = ResourceCeiling {
            nodes: Some(100_000),
            ..Default::default()
        };
        let requested = ResourceSpec {
            nodes: Some(300),
            ..Default::default()
        };
        assert!(validate_resources(&requested, Some(&ceiling)).is_err());
    }

    #[test]
    fn storage_and_time_fields_are_governed() {
        let ceiling = ResourceCeiling {
            memory: Some("16G".into()),
            walltime: Some("04:00:00".into()),
            ..Default::default()
        };
        let over_memory = ResourceSpec {
            memory: Some("32G".into()),
            ..Default::default()
        };
        assert!(validate_resources(&over_memory, Some(&ceiling)).is_err());

        let over_time = ResourceSpec {
            walltime: Some("1-00:00:00".into()),
            ..Default::default()
        };
        assert!(validate_resources(&over_time, Some(&ceiling)).is_err());

        let fits = ResourceSpec {
            memory: Some("8G".into()),
            walltime: Some("03:00:00".into()),
            ..Default::default()
        };
        validate_resources(&fits, Some(&ceiling)).unwrap();
    }

    #[test]
    fn absent_fields_pass_against_defaults() {
        validate_resources(&ResourceSpec::default(), None).unwrap();
    }
}
