//! Scheduling and execution engine for batch jobs on remote HPC clusters.
//!
//! The engine accepts job descriptors, queues them per cluster, admits them
//! into capacity-bounded pools, and drives each admitted job through a
//! polling lifecycle against a remote batch scheduler (Slurm) reached over a
//! pooled SSH connection. The HTTP surface, persistent job storage and
//! credential issuance live outside this crate and are consumed through the
//! traits in [`store`], [`queue`] and [`event`].

pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod logging;
pub mod maintainer;
pub mod policy;
pub mod pool;
pub mod queue;
pub mod remote;
pub mod slurm;
pub mod ssh;
pub mod store;
pub mod supervisor;

pub use error::{Error, Result};
pub use job::{JobDescriptor, JobState, ResourceSpec};
pub use supervisor::Supervisor;
