use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the job engine to the supervising caller.
///
/// Failures inside a running job never show up here: they are recorded in the
/// job's status (`exception` state) and its exceptions log instead.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("invalid job id {0:?}: must start with a letter or '_' and contain only letters, digits, '_', '-', '.' or '@'")]
    InvalidJobId(String),

    #[error("background job {0} is already running")]
    AlreadyRunning(String),

    #[error("background job {0} already finished")]
    NotActive(String),

    #[error("background job {0} cannot be stopped")]
    NotStoppable(String),

    #[error("cannot delete background job {0}: it is running and cannot be stopped")]
    DeleteProtected(String),

    #[error("unknown job class {0:?}")]
    UnknownJobClass(String),

    #[error("failed to launch background job {job_id}: {reason}")]
    Launch { job_id: String, reason: String },

    #[error("lock {path} failed: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("{op} {path} failed: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt status file {path}: {source}")]
    CorruptStatus {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl JobError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        JobError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}
