use thiserror::Error as ThisError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod codes {
    pub const CONNECTOR_ERROR: &str = "connector_error";
    pub const SUBMISSION_REJECTED: &str = "submission_rejected";
    pub const UNSUPPORTED_OPERATION: &str = "unsupported_operation";
    pub const CONNECTIVITY_FAILURE: &str = "connectivity_failure";
    pub const RESOURCE_CEILING: &str = "resource_ceiling";
    pub const UNKNOWN_MAINTAINER: &str = "unknown_maintainer";
    pub const UNKNOWN_CLUSTER: &str = "unknown_cluster";
    pub const USER_NOT_ALLOWED: &str = "user_not_allowed";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const TRANSPORT_ERROR: &str = "transport_error";
    pub const LOCAL_ERROR: &str = "local_error";
}

#[derive(Debug, ThisError)]
pub enum Error {
    /// A remote command or transfer failed after the connection was up.
    #[error("remote command failed: {0}")]
    Connector(String),

    /// The batch scheduler refused the submission.
    #[error("submission rejected: {0}")]
    Submission(String),

    /// A lifecycle hook the maintainer type does not implement. This is a
    /// configuration error, not a transient fault.
    #[error("operation '{0}' is not supported by this maintainer type")]
    Unsupported(&'static str),

    /// Connection establishment exhausted its backoff budget.
    #[error("cannot connect to cluster '{cluster}' after {attempts} attempts ({waited_secs}s of backoff)")]
    Connectivity {
        cluster: String,
        attempts: u32,
        waited_secs: u64,
    },

    /// A requested resource field exceeds the administrator ceiling.
    /// Raised before the job ever reaches a queue.
    #[error("requested {field}={requested} exceeds the ceiling {limit}")]
    ResourceCeiling {
        field: &'static str,
        requested: String,
        limit: String,
    },

    #[error("unknown maintainer type '{0}'")]
    UnknownMaintainer(String),

    #[error("unknown cluster '{0}'")]
    UnknownCluster(String),

    #[error("user '{user}' is not allowed on cluster '{cluster}'")]
    UserNotAllowed { user: String, cluster: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// SSH transport failure, distinct from a remote command that ran and
    /// returned an error.
    #[error("transport error: {0}")]
    Transport(anyhow::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::Connector(_) => codes::CONNECTOR_ERROR,
            Error::Submission(_) => codes::SUBMISSION_REJECTED,
            Error::Unsupported(_) => codes::UNSUPPORTED_OPERATION,
            Error::Connectivity { .. } => codes::CONNECTIVITY_FAILURE,
            Error::ResourceCeiling { .. } => codes::RESOURCE_CEILING,
            Error::UnknownMaintainer(_) => codes::UNKNOWN_MAINTAINER,
            Error::UnknownCluster(_) => codes::UNKNOWN_CLUSTER,
            Error::UserNotAllowed { .. } => codes::USER_NOT_ALLOWED,
            Error::InvalidArgument(_) => codes::INVALID_ARGUMENT,
            Error::Transport(_) => codes::TRANSPORT_ERROR,
            Error::Io(_) | Error::Json(_) => codes::LOCAL_ERROR,
        }
    }

    /// True for failures worth retrying on the next worker iteration.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connector(_) | Error::Transport(_))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Connector("x".into()).code(), "connector_error");
        assert_eq!(Error::Unsupported("pause").code(), "unsupported_operation");
        assert_eq!(
            Error::Connectivity {
                cluster: "c".into(),
                attempts: 4,
                waited_secs: 120
            }
            .code(),
            "connectivity_failure"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::Connector("squeue died".into()).is_retryable());
        assert!(!Error::Unsupported("resume").is_retryable());
        assert!(
            !Error::ResourceCeiling {
                field: "cpus_per_task",
                requested: "80".into(),
                limit: "50".into()
            }
            .is_retryable()
        );
    }
}
