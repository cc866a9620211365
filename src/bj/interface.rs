use crate::bj::error::JobError;
use crate::bj::process::Terminated;
use crate::bj::status::{EXCEPTIONS_FILE, PROGRESS_UPDATE_FILE, RESULT_MESSAGE_FILE};
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// What a job's target function gets to talk to the outside world.
///
/// Progress lines go to the live progress stream (the same file the worker's
/// stdout/stderr are redirected to), results and exceptions to their own logs.
#[derive(Debug)]
pub struct BackgroundProcessInterface {
    job_id: String,
    work_dir: PathBuf,
    progress: File,
    stop_requested: Arc<AtomicBool>,
}

impl BackgroundProcessInterface {
    pub(crate) fn new(
        job_id: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        progress: File,
        stop_requested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            work_dir: work_dir.into(),
            progress,
            stop_requested,
        }
    }

    /// Interface writing straight into `work_dir`'s logs, without a surrounding worker.
    pub fn for_work_dir(job_id: impl Into<String>, work_dir: impl Into<PathBuf>) -> Result<Self, JobError> {
        let work_dir = work_dir.into();
        let progress = open_append(&work_dir.join(PROGRESS_UPDATE_FILE))
            .map_err(|e| JobError::io("open progress log", work_dir.join(PROGRESS_UPDATE_FILE), e))?;
        Ok(Self::new(job_id, work_dir, progress, Arc::new(AtomicBool::new(false))))
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// A second handle on the progress stream, e.g. for a child command's stdout.
    pub fn progress_stream(&self) -> io::Result<File> {
        self.progress.try_clone()
    }

    pub fn send_progress_update(&self, text: &str, with_timestamp: bool) {
        let line = if with_timestamp {
            format!("{} {text}", Local::now().format("%H:%M:%S"))
        } else {
            text.to_string()
        };
        if let Err(e) = write_line(&self.progress, &line) {
            tracing::warn!(job_id = %self.job_id, "progress_update_failed err={e}");
        }
    }

    pub fn send_result_message(&self, text: &str) {
        let path = self.work_dir.join(RESULT_MESSAGE_FILE);
        if let Err(e) = open_append(&path).and_then(|f| write_line(&f, text)) {
            tracing::warn!(job_id = %self.job_id, "result_message_failed path={} err={e}", path.display());
        }
    }

    pub fn send_exception(&self, text: &str) {
        if let Err(e) = write_line(&self.progress, text) {
            tracing::warn!(job_id = %self.job_id, "progress_update_failed err={e}");
        }
        let path = self.work_dir.join(EXCEPTIONS_FILE);
        if let Err(e) = open_append(&path).and_then(|f| write_line(&f, text)) {
            tracing::warn!(job_id = %self.job_id, "exception_log_failed path={} err={e}", path.display());
        }
    }

    /// True once a stop request (honoured SIGTERM) reached this process.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Cooperative termination point for long-running targets: `job.check_terminated()?`.
    pub fn check_terminated(&self) -> Result<(), Terminated> {
        if self.stop_requested() {
            Err(Terminated)
        } else {
            Ok(())
        }
    }
}

pub(crate) fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn write_line(mut f: &File, text: &str) -> io::Result<()> {
    let mut line = String::with_capacity(text.len() + 1);
    line.push_str(text);
    if !line.ends_with('\n') {
        line.push('\n');
    }
    f.write_all(line.as_bytes())
}
