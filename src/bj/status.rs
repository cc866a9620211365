use crate::bj::error::JobError;
use crate::bj::lock::FileLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const STATUS_FILE: &str = "jobstatus.json";
pub const PROGRESS_UPDATE_FILE: &str = "progress_update";
pub const RESULT_MESSAGE_FILE: &str = "result_message";
pub const EXCEPTIONS_FILE: &str = "exceptions";

pub(crate) const WAITING_FOR_FIRST_UPDATE: &str = "Waiting for first status update from the job";

/// Seconds since the epoch, the unit of `started` and `duration`.
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Initialized,
    Running,
    Finished,
    Stopped,
    Exception,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Initialized => "initialized",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::Stopped => "stopped",
            JobState::Exception => "exception",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Initialized | JobState::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lines of the three job log files. Never stored in the status file itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogInfo {
    #[serde(rename = "JobProgressUpdate", default)]
    pub progress_update: Vec<String>,
    #[serde(rename = "JobResult", default)]
    pub result: Vec<String>,
    #[serde(rename = "JobException", default)]
    pub exception: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    /// Unix seconds.
    pub started: f64,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub ppid: Option<u32>,
    /// Seconds.
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub loginfo: LogInfo,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_true")]
    pub stoppable: bool,
    #[serde(default = "default_true")]
    pub deletable: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub estimated_duration: Option<f64>,
    #[serde(default)]
    pub logfile_path: String,
    #[serde(default)]
    pub lock_wato: bool,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
}

fn default_true() -> bool {
    true
}

impl JobStatus {
    pub fn initialized(started: f64) -> Self {
        Self {
            state: JobState::Initialized,
            started,
            pid: None,
            ppid: None,
            duration: 0.0,
            loginfo: LogInfo::default(),
            title: String::new(),
            stoppable: true,
            deletable: true,
            user: None,
            estimated_duration: None,
            logfile_path: String::new(),
            lock_wato: false,
            host_name: String::new(),
            acknowledged_by: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

/// Partial status record for [`JobStatusStore::update`]. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ppid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
}

impl StatusUpdate {
    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Consumer-facing view of one job, recomputed on every request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub exists: bool,
    pub is_active: bool,
    pub has_exception: bool,
    pub acknowledged_by: Option<String>,
    pub may_stop: bool,
    pub may_delete: bool,
}

/// Reads and writes the status record of one job working directory.
#[derive(Debug, Clone)]
pub struct JobStatusStore {
    work_dir: PathBuf,
}

impl JobStatusStore {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn status_path(&self) -> PathBuf {
        self.work_dir.join(STATUS_FILE)
    }

    pub fn progress_update_path(&self) -> PathBuf {
        self.work_dir.join(PROGRESS_UPDATE_FILE)
    }

    pub fn result_message_path(&self) -> PathBuf {
        self.work_dir.join(RESULT_MESSAGE_FILE)
    }

    pub fn exceptions_path(&self) -> PathBuf {
        self.work_dir.join(EXCEPTIONS_FILE)
    }

    pub fn exists(&self) -> bool {
        self.status_path().is_file()
    }

    /// Load the status record with the log files merged in.
    ///
    /// The status lock is held until the logs are merged, so a concurrent
    /// [`JobStatusStore::update`] is never observed half-applied.
    pub fn read(&self) -> Result<JobStatus, JobError> {
        let path = self.status_path();
        if !path.exists() {
            return Ok(Self::waiting_for_first_update());
        }

        let mut lock = FileLock::new(&path);
        match lock.acquire() {
            Ok(()) => {}
            Err(JobError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                // Work dir removed between the existence check and the open.
                return Ok(Self::waiting_for_first_update());
            }
            Err(e) => return Err(e),
        }

        let raw = read_locked(&mut lock)?;
        let mut status = if raw.iter().all(u8::is_ascii_whitespace) {
            // Created but not yet written: fall back to the file's mtime as start time.
            let started = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or_else(unix_now);
            JobStatus::initialized(started)
        } else {
            serde_json::from_slice::<JobStatus>(&raw).map_err(|e| JobError::CorruptStatus {
                path: path.clone(),
                source: e,
            })?
        };
        status.loginfo = self.read_loginfo();
        lock.release()?;
        Ok(status)
    }

    /// Overwrite the status file with `status` (the log lines are not persisted here).
    pub fn write(&self, status: &JobStatus) -> Result<(), JobError> {
        let mut value = serde_json::to_value(status).map_err(|e| JobError::Serialize {
            what: "job status",
            source: e,
        })?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("loginfo");
        }
        let mut lock = FileLock::locked(self.status_path())?;
        write_locked(&mut lock, &value)?;
        lock.release()
    }

    /// Merge `partial` into the persisted record. No-op once the job was deleted.
    pub fn update(&self, partial: &StatusUpdate) -> Result<(), JobError> {
        if !self.work_dir.is_dir() {
            return Ok(());
        }
        let path = self.status_path();
        let mut lock = FileLock::new(&path);
        match lock.acquire() {
            Ok(()) => {}
            Err(JobError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let raw = read_locked(&mut lock)?;
        let mut record: serde_json::Map<String, serde_json::Value> =
            if raw.iter().all(u8::is_ascii_whitespace) {
                serde_json::Map::new()
            } else {
                serde_json::from_slice(&raw).map_err(|e| JobError::CorruptStatus {
                    path: path.clone(),
                    source: e,
                })?
            };
        let partial = serde_json::to_value(partial).map_err(|e| JobError::Serialize {
            what: "status update",
            source: e,
        })?;
        if let serde_json::Value::Object(fields) = partial {
            record.extend(fields);
        }
        write_locked(&mut lock, &serde_json::Value::Object(record))?;
        lock.release()
    }

    pub fn read_loginfo(&self) -> LogInfo {
        LogInfo {
            progress_update: read_lines(&self.progress_update_path()),
            result: read_lines(&self.result_message_path()),
            exception: read_lines(&self.exceptions_path()),
        }
    }

    fn waiting_for_first_update() -> JobStatus {
        let mut status = JobStatus::initialized(unix_now());
        status.loginfo.progress_update = vec![WAITING_FOR_FIRST_UPDATE.to_string()];
        status
    }
}

fn read_locked(lock: &mut FileLock) -> Result<Vec<u8>, JobError> {
    let path = lock.path().to_path_buf();
    let Some(file) = lock.file_mut() else {
        return Ok(Vec::new());
    };
    let mut buf = Vec::new();
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_end(&mut buf))
        .map_err(|e| JobError::io("read", path, e))?;
    Ok(buf)
}

// In-place rewrite: the flock lives on this inode, so it must never be replaced by a rename.
fn write_locked(lock: &mut FileLock, value: &serde_json::Value) -> Result<(), JobError> {
    let path = lock.path().to_path_buf();
    let mut body = serde_json::to_vec_pretty(value).map_err(|e| JobError::Serialize {
        what: "job status",
        source: e,
    })?;
    body.push(b'\n');
    let Some(file) = lock.file_mut() else {
        return Ok(());
    };
    file.set_len(0)
        .and_then(|_| file.seek(SeekFrom::Start(0)))
        .and_then(|_| file.write_all(&body))
        .and_then(|_| file.flush())
        .map_err(|e| JobError::io("write", path, e))
}

/// Lines of an append-only log; a missing file is an empty log.
/// A partially written last line is returned as-is.
fn read_lines(path: &Path) -> Vec<String> {
    match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    }
}
