use crate::bj::error::JobError;
use crate::bj::identity::UserContext;
use crate::bj::job::{BackgroundJob, JobEngine};
use crate::bj::registry::JobClass;
use crate::bj::status::{JobState, StatusSnapshot, unix_now};
use std::fs;
use std::io;
use std::sync::Arc;

/// Enumeration and cleanup over all job working directories of a base dir.
/// The directory listing is the only index of jobs.
#[derive(Debug, Clone)]
pub struct BackgroundJobManager {
    engine: Arc<JobEngine>,
}

impl BackgroundJobManager {
    pub fn new(engine: Arc<JobEngine>) -> Self {
        Self { engine }
    }

    /// Ids of all jobs, optionally only those of one class (by prefix). Sorted.
    pub fn get_all_job_ids(&self, class: Option<&dyn JobClass>) -> Result<Vec<String>, JobError> {
        let base = self.engine.base_dir();
        let entries = match fs::read_dir(base) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(JobError::io("list", base, e)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| JobError::io("list", base, e))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(class) = class {
                if !name.starts_with(class.job_prefix()) {
                    continue;
                }
            }
            if BackgroundJob::validate_job_id(&name).is_err() {
                continue;
            }
            ids.push(name);
        }
        ids.sort();
        Ok(ids)
    }

    pub fn get_running_job_ids(&self, class: Option<&dyn JobClass>) -> Result<Vec<String>, JobError> {
        let mut running = Vec::new();
        for id in self.get_all_job_ids(class)? {
            if self.engine.job(&id)?.is_active()? {
                running.push(id);
            }
        }
        Ok(running)
    }

    /// Snapshots of every job `user` may see. Jobs whose status cannot be read are skipped.
    pub fn get_status_snapshots(
        &self,
        class: Option<&dyn JobClass>,
        user: &dyn UserContext,
    ) -> Result<Vec<StatusSnapshot>, JobError> {
        let mut out = Vec::new();
        for id in self.get_all_job_ids(class)? {
            let job = self.engine.job(&id)?;
            match job.is_visible(user) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(job_id = %id, "attempt=snapshot outcome=skipped err={e}");
                    continue;
                }
            }
            match job.get_status_snapshot(user) {
                Ok(snap) => out.push(snap),
                Err(e) => tracing::warn!(job_id = %id, "attempt=snapshot outcome=skipped err={e}"),
            }
        }
        Ok(out)
    }

    /// Delete old and excess jobs of each class. Never fails; returns how many jobs were deleted.
    pub fn do_housekeeping<'a>(&self, classes: impl IntoIterator<Item = &'a dyn JobClass>) -> usize {
        let mut deleted = 0;
        for class in classes {
            match self.housekeep_class(class) {
                Ok(n) => deleted += n,
                Err(e) => tracing::warn!(
                    class = class.ident(),
                    "attempt=housekeeping outcome=error err={e}"
                ),
            }
        }
        deleted
    }

    fn housekeep_class(&self, class: &dyn JobClass) -> Result<usize, JobError> {
        let max_age = class.housekeeping_max_age().as_secs_f64();
        let max_count = class.housekeeping_max_count();

        let mut all = Vec::new();
        for id in self.get_all_job_ids(Some(class))? {
            let job = self.engine.job(&id)?;
            match job.get_status() {
                Ok(status) => all.push((job, status)),
                Err(e) => tracing::warn!(job_id = %id, "attempt=housekeeping outcome=skipped err={e}"),
            }
        }
        // Newest first; the newest job is always kept.
        all.sort_by(|a, b| b.1.started.total_cmp(&a.1.started));

        let now = unix_now();
        let mut remaining = all.len();
        let mut deleted = 0;
        for (job, status) in all.iter().skip(1).rev() {
            if status.state == JobState::Running {
                continue;
            }
            if remaining > max_count || now - status.started > max_age {
                tracing::info!(
                    job_id = %job.job_id(),
                    "attempt=housekeeping_delete remaining={remaining} max_count={max_count}"
                );
                match job.delete() {
                    Ok(()) => {
                        remaining -= 1;
                        deleted += 1;
                    }
                    Err(e) => tracing::warn!(
                        job_id = %job.job_id(),
                        "attempt=housekeeping_delete outcome=error err={e}"
                    ),
                }
            }
        }
        Ok(deleted)
    }
}
