use crate::bj::config::JobsConfig;
use crate::bj::error::JobError;
use crate::bj::identity::{Permission, UserContext};
use crate::bj::liveness;
use crate::bj::lock::FileLock;
use crate::bj::process::{self, JobTarget, WorkerCommand};
use crate::bj::registry::JobRegistry;
use crate::bj::status::{JobState, JobStatus, JobStatusStore, StatusSnapshot, StatusUpdate, unix_now};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

static JOB_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\d\W][-\w.@]*$").unwrap_or_else(|e| unreachable!("job id pattern: {e}"))
});

/// Everything a job handle needs besides its id: configuration, the class registry and
/// the command that becomes the worker process.
#[derive(Debug)]
pub struct JobEngine {
    cfg: JobsConfig,
    registry: Arc<JobRegistry>,
    worker: WorkerCommand,
}

impl JobEngine {
    pub fn new(cfg: JobsConfig, registry: Arc<JobRegistry>, worker: WorkerCommand) -> Self {
        Self { cfg, registry, worker }
    }

    pub fn config(&self) -> &JobsConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn worker(&self) -> &WorkerCommand {
        &self.worker
    }

    pub fn base_dir(&self) -> &Path {
        &self.cfg.base_dir
    }

    pub fn job(self: &Arc<Self>, job_id: &str) -> Result<BackgroundJob, JobError> {
        BackgroundJob::new(self, job_id)
    }
}

/// Creation-time metadata written into the initial status record.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialStatusArgs {
    pub title: String,
    pub stoppable: bool,
    pub deletable: bool,
    pub user: Option<String>,
    /// Falls back to the previous run's duration when that run finished.
    pub estimated_duration: Option<f64>,
    pub logfile_path: String,
    pub lock_wato: bool,
    pub host_name: String,
}

impl Default for InitialStatusArgs {
    fn default() -> Self {
        Self {
            title: "Background job".to_string(),
            stoppable: true,
            deletable: true,
            user: None,
            estimated_duration: None,
            logfile_path: String::new(),
            lock_wato: false,
            host_name: String::new(),
        }
    }
}

/// Supervisor-side handle on one job id. Cheap to create; all state lives in the
/// job's working directory.
#[derive(Debug, Clone)]
pub struct BackgroundJob {
    job_id: String,
    work_dir: PathBuf,
    store: JobStatusStore,
    engine: Arc<JobEngine>,
}

impl BackgroundJob {
    pub fn new(engine: &Arc<JobEngine>, job_id: &str) -> Result<Self, JobError> {
        Self::validate_job_id(job_id)?;
        let work_dir = engine.base_dir().join(job_id);
        Ok(Self {
            job_id: job_id.to_string(),
            store: JobStatusStore::new(&work_dir),
            work_dir,
            engine: Arc::clone(engine),
        })
    }

    /// The id becomes a directory name, so it must be a plain identifier.
    pub fn validate_job_id(job_id: &str) -> Result<(), JobError> {
        if JOB_ID_RE.is_match(job_id) {
            Ok(())
        } else {
            Err(JobError::InvalidJobId(job_id.to_string()))
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn store(&self) -> &JobStatusStore {
        &self.store
    }

    pub fn exists(&self) -> bool {
        self.work_dir.is_dir() && self.store.exists()
    }

    pub fn is_active(&self) -> Result<bool, JobError> {
        if !self.exists() {
            return Ok(false);
        }
        let status = self.get_status()?;
        Ok(self.active_from(&status))
    }

    pub fn is_stoppable(&self) -> Result<bool, JobError> {
        Ok(self.store.read()?.stoppable)
    }

    pub fn is_deletable(&self) -> Result<bool, JobError> {
        Ok(self.store.read()?.deletable)
    }

    fn active_from(&self, status: &JobStatus) -> bool {
        self.exists() && status.is_active() && self.verify_running(status)
    }

    fn verify_running(&self, status: &JobStatus) -> bool {
        if status.state == JobState::Initialized {
            // The worker may not have recorded its pid yet.
            let age = unix_now() - status.started;
            if age < self.engine.cfg.init_grace_period().as_secs_f64() {
                return true;
            }
        }
        match status.pid {
            Some(pid) => pid_is_job_process(pid),
            None => false,
        }
    }

    fn is_foreign(status: &JobStatus, user: &dyn UserContext) -> bool {
        status.user.as_deref() != user.user_id()
    }

    pub fn is_visible(&self, user: &dyn UserContext) -> Result<bool, JobError> {
        let status = self.store.read()?;
        Ok(user.may(Permission::SeeForeignJobs) || !Self::is_foreign(&status, user))
    }

    pub fn may_stop(&self, user: &dyn UserContext) -> Result<bool, JobError> {
        let status = self.get_status()?;
        Ok(self.may_stop_from(&status, self.active_from(&status), user))
    }

    pub fn may_delete(&self, user: &dyn UserContext) -> Result<bool, JobError> {
        let status = self.get_status()?;
        Ok(self.may_delete_from(&status, self.active_from(&status), user))
    }

    fn may_stop_from(&self, status: &JobStatus, active: bool, user: &dyn UserContext) -> bool {
        if !status.stoppable || !user.may(Permission::StopJobs) {
            return false;
        }
        if Self::is_foreign(status, user) && !user.may(Permission::StopForeignJobs) {
            return false;
        }
        active
    }

    fn may_delete_from(&self, status: &JobStatus, active: bool, user: &dyn UserContext) -> bool {
        if !status.deletable || (!status.stoppable && active) {
            return false;
        }
        if !user.may(Permission::DeleteJobs) {
            return false;
        }
        !Self::is_foreign(status, user) || user.may(Permission::DeleteForeignJobs)
    }

    /// Persisted status, corrected for a worker that died while `running`, with a live
    /// duration for one that is still running.
    pub fn get_status(&self) -> Result<JobStatus, JobError> {
        let mut status = self.store.read()?;
        if status.state == JobState::Running {
            if self.verify_running(&status) {
                status.duration = (unix_now() - status.started).max(0.0);
            } else {
                status.state = JobState::Stopped;
            }
        }
        Ok(status)
    }

    pub fn get_status_snapshot(&self, user: &dyn UserContext) -> Result<StatusSnapshot, JobError> {
        let status = self.get_status()?;
        let is_active = self.active_from(&status);
        Ok(StatusSnapshot {
            job_id: self.job_id.clone(),
            exists: self.exists(),
            is_active,
            has_exception: status.state == JobState::Exception,
            acknowledged_by: status.acknowledged_by.clone(),
            may_stop: self.may_stop_from(&status, is_active, user),
            may_delete: self.may_delete_from(&status, is_active, user),
            status,
        })
    }

    pub fn acknowledge(&self, user_id: &str) -> Result<(), JobError> {
        self.store.update(&StatusUpdate {
            acknowledged_by: Some(user_id.to_string()),
            ..StatusUpdate::default()
        })
    }

    /// Start the job in a detached worker process. Returns once the worker was spawned.
    pub fn start(&self, target: JobTarget, initial: InitialStatusArgs) -> Result<(), JobError> {
        let Some(class) = self.engine.registry.get(&target.class) else {
            return Err(JobError::UnknownJobClass(target.class));
        };
        let cfg = &self.engine.cfg;
        fs::create_dir_all(&cfg.base_dir).map_err(|e| JobError::io("create", &cfg.base_dir, e))?;
        if let Some(parent) = cfg.init_lock.parent() {
            fs::create_dir_all(parent).map_err(|e| JobError::io("create", parent, e))?;
        }

        let mut init_lock = FileLock::locked(&cfg.init_lock)?;
        if self.is_active()? {
            return Err(JobError::AlreadyRunning(self.job_id.clone()));
        }

        let estimated_duration = match initial.estimated_duration {
            Some(d) => Some(d),
            None => self.previous_duration(),
        };
        match fs::remove_dir_all(&self.work_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(JobError::io("remove", &self.work_dir, e)),
        }
        fs::create_dir_all(&self.work_dir).map_err(|e| JobError::io("create", &self.work_dir, e))?;
        target.write(&self.work_dir)?;

        let mut status = JobStatus::initialized(unix_now());
        status.title = initial.title;
        status.stoppable = initial.stoppable && class.stoppable();
        status.deletable = initial.deletable;
        status.user = initial.user;
        status.estimated_duration = estimated_duration;
        status.logfile_path = initial.logfile_path;
        status.lock_wato = initial.lock_wato;
        status.host_name = initial.host_name;
        self.store.write(&status)?;

        tracing::info!(job_id = %self.job_id, "attempt=start class={}", target.class);
        match process::launch(&self.engine.worker, &self.job_id, &self.work_dir, &cfg.config_lock) {
            Ok(launcher_pid) => {
                self.store.update(&StatusUpdate {
                    ppid: Some(launcher_pid),
                    ..StatusUpdate::default()
                })?;
            }
            Err(e) => {
                tracing::error!(job_id = %self.job_id, "attempt=start outcome=launch_failed err={e}");
                let _ = fs::write(self.store.exceptions_path(), format!("{e}\n"));
                let _ = self.store.update(&StatusUpdate::state(JobState::Exception));
                return Err(e);
            }
        }
        init_lock.release()
    }

    fn previous_duration(&self) -> Option<f64> {
        if !self.exists() {
            return None;
        }
        match self.store.read() {
            Ok(prev) if prev.state == JobState::Finished => Some(prev.duration),
            _ => None,
        }
    }

    /// Terminate the worker and record the job as stopped.
    ///
    /// A job still `initialized` has no pid to signal yet. Its status is set to stopped,
    /// but a worker that comes up afterwards overwrites it and runs to completion.
    pub fn stop(&self) -> Result<(), JobError> {
        if !self.is_active()? {
            return Err(JobError::NotActive(self.job_id.clone()));
        }
        let status = self.get_status()?;
        if !status.stoppable {
            return Err(JobError::NotStoppable(self.job_id.clone()));
        }
        self.terminate(&status);
        let duration = (unix_now() - status.started).max(0.0);
        self.store
            .update(&StatusUpdate::state(JobState::Stopped).with_duration(duration))
    }

    pub fn delete(&self) -> Result<(), JobError> {
        let status = self.get_status()?;
        if !status.stoppable && self.active_from(&status) {
            return Err(JobError::DeleteProtected(self.job_id.clone()));
        }
        self.terminate(&status);
        match fs::remove_dir_all(&self.work_dir) {
            Ok(()) => {
                tracing::info!(job_id = %self.job_id, "attempt=delete outcome=removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JobError::io("remove", &self.work_dir, e)),
        }
    }

    /// SIGTERM, then SIGKILL once the grace period is over. Every signal goes out only
    /// while the pid still belongs to a job process.
    fn terminate(&self, status: &JobStatus) {
        let Some(pid) = status.pid else {
            return;
        };
        if !pid_is_job_process(pid) {
            return;
        }
        let cfg = &self.engine.cfg;
        let target = Pid::from_raw(pid as i32);
        tracing::info!(job_id = %self.job_id, "attempt=signal sig=SIGTERM pid={pid}");
        match kill(target, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return,
            Err(e) => tracing::warn!(job_id = %self.job_id, "outcome=signal_failed sig=SIGTERM pid={pid} err={e}"),
        }

        let t0 = Instant::now();
        let deadline = t0 + cfg.stop_grace_period();
        loop {
            if !pid_is_job_process(pid) {
                tracing::info!(
                    job_id = %self.job_id,
                    "outcome=grace_exit elapsed_ms={}",
                    t0.elapsed().as_millis()
                );
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(cfg.stop_poll_interval());
        }

        tracing::warn!(
            job_id = %self.job_id,
            "outcome=grace_expired stop_grace_period_ms={} decision=kill pid={pid}",
            cfg.stop_grace_period_ms
        );
        match kill(target, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(job_id = %self.job_id, "outcome=signal_failed sig=SIGKILL pid={pid} err={e}"),
        }
    }

    /// Poll until the job is no longer active. `Ok(false)` when `timeout` ran out first.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> Result<bool, JobError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if !self.is_active()? {
                return Ok(true);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(false);
            }
            std::thread::sleep(self.engine.cfg.wait_poll_interval());
        }
    }
}

fn pid_is_job_process(pid: u32) -> bool {
    liveness::process_info(pid).is_some_and(|p| liveness::is_correct_process(&p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bj::identity::StaticUser;
    use crate::bj::interface::BackgroundProcessInterface;
    use crate::bj::registry::JobClass;
    use std::process::{Child, Command};
    use tempfile::TempDir;

    struct Noop;

    impl JobClass for Noop {
        fn ident(&self) -> &str {
            "noop"
        }
        fn job_prefix(&self) -> &str {
            "noop-"
        }
        fn gui_title(&self) -> String {
            "Nothing".to_string()
        }
        fn run(&self, _job: &BackgroundProcessInterface, _args: &serde_json::Value) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn engine_with(dir: &TempDir, worker: &str) -> Arc<JobEngine> {
        let mut reg = JobRegistry::new();
        reg.register(Arc::new(Noop)).unwrap();
        Arc::new(JobEngine::new(
            JobsConfig::with_base_dir(dir.path().join("jobs")),
            Arc::new(reg),
            WorkerCommand::new(worker, Vec::<String>::new()),
        ))
    }

    fn engine(dir: &TempDir) -> Arc<JobEngine> {
        engine_with(dir, "true")
    }

    fn put_status(job: &BackgroundJob, edit: impl FnOnce(&mut JobStatus)) {
        fs::create_dir_all(job.work_dir()).unwrap();
        let mut status = JobStatus::initialized(unix_now());
        edit(&mut status);
        job.store().write(&status).unwrap();
    }

    fn sleeper() -> Child {
        Command::new("sleep").arg("30").spawn().unwrap()
    }

    #[test]
    fn job_id_validation() {
        for ok in ["a", "_x", "noop-1", "host.example@site", "Ünïcode_job"] {
            assert!(BackgroundJob::validate_job_id(ok).is_ok(), "{ok}");
        }
        for bad in ["", "1abc", "../etc", "a b", "-x", "a/b", ".hidden"] {
            assert!(
                matches!(BackgroundJob::validate_job_id(bad), Err(JobError::InvalidJobId(_))),
                "{bad}"
            );
        }
        let dir = TempDir::new().unwrap();
        assert!(BackgroundJob::new(&engine(&dir), "../etc").is_err());
    }

    #[test]
    fn missing_job_does_not_exist() {
        let dir = TempDir::new().unwrap();
        let job = engine(&dir).job("noop-1").unwrap();
        assert!(!job.exists());
        assert!(!job.is_active().unwrap());
    }

    #[test]
    fn reused_pid_is_not_our_job() {
        let dir = TempDir::new().unwrap();
        let job = engine(&dir).job("noop-1").unwrap();
        let mut child = sleeper();
        let pid = child.id();
        put_status(&job, |s| {
            s.state = JobState::Running;
            s.pid = Some(pid);
        });

        assert!(!job.is_active().unwrap());
        assert_eq!(job.get_status().unwrap().state, JobState::Stopped);
        // Never signaled: the unrelated process is untouched.
        assert!(matches!(job.stop(), Err(JobError::NotActive(_))));
        job.delete().unwrap();
        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn initialized_jobs_get_a_grace_window() {
        let dir = TempDir::new().unwrap();
        let job = engine(&dir).job("noop-1").unwrap();
        put_status(&job, |_| {});
        assert!(job.is_active().unwrap());

        put_status(&job, |s| s.started -= 60.0);
        assert!(!job.is_active().unwrap());
    }

    #[test]
    fn stop_refuses_non_stoppable_job() {
        let dir = TempDir::new().unwrap();
        let job = engine(&dir).job("noop-1").unwrap();
        put_status(&job, |s| s.stoppable = false);

        assert!(matches!(job.stop(), Err(JobError::NotStoppable(_))));
        assert_eq!(job.get_status().unwrap().state, JobState::Initialized);
    }

    #[test]
    fn delete_protects_running_non_stoppable_job() {
        let dir = TempDir::new().unwrap();
        let job = engine(&dir).job("noop-1").unwrap();
        put_status(&job, |s| s.stoppable = false);

        assert!(matches!(job.delete(), Err(JobError::DeleteProtected(_))));
        assert!(job.exists());
    }

    #[test]
    fn delete_removes_finished_job() {
        let dir = TempDir::new().unwrap();
        let job = engine(&dir).job("noop-1").unwrap();
        put_status(&job, |s| {
            s.state = JobState::Finished;
            s.stoppable = false;
        });
        fs::write(job.store().progress_update_path(), "done\n").unwrap();

        job.delete().unwrap();
        assert!(!job.exists());
        assert!(!job.work_dir().exists());
        // Deleting again is fine.
        job.delete().unwrap();
    }

    #[test]
    fn acknowledge_keeps_state() {
        let dir = TempDir::new().unwrap();
        let job = engine(&dir).job("noop-1").unwrap();
        put_status(&job, |s| s.state = JobState::Exception);
        job.acknowledge("cmkadmin").unwrap();

        let snap = job.get_status_snapshot(&StaticUser::admin("cmkadmin")).unwrap();
        assert!(snap.has_exception);
        assert!(!snap.is_active);
        assert_eq!(snap.acknowledged_by.as_deref(), Some("cmkadmin"));
        assert_eq!(snap.status.state, JobState::Exception);
    }

    #[test]
    fn foreign_jobs_need_extra_permissions() {
        let dir = TempDir::new().unwrap();
        let job = engine(&dir).job("noop-1").unwrap();
        put_status(&job, |s| s.user = Some("alice".to_string()));

        let owner = StaticUser::new(Some("alice"), [Permission::StopJobs, Permission::DeleteJobs]);
        let other = StaticUser::new(Some("bob"), [Permission::StopJobs, Permission::DeleteJobs]);
        let admin = StaticUser::admin("root");

        assert!(job.is_visible(&owner).unwrap());
        assert!(!job.is_visible(&other).unwrap());
        assert!(job.is_visible(&admin).unwrap());

        assert!(job.may_stop(&owner).unwrap());
        assert!(!job.may_stop(&other).unwrap());
        assert!(job.may_stop(&admin).unwrap());
        assert!(job.may_delete(&owner).unwrap());
        assert!(!job.may_delete(&other).unwrap());

        // Nothing left to stop once the job is done.
        put_status(&job, |s| {
            s.user = Some("alice".to_string());
            s.state = JobState::Finished;
        });
        assert!(!job.may_stop(&owner).unwrap());
        assert!(job.may_delete(&owner).unwrap());
    }

    #[test]
    fn start_writes_initial_status_and_target() {
        let dir = TempDir::new().unwrap();
        let job = engine(&dir).job("noop-1").unwrap();
        put_status(&job, |s| {
            s.state = JobState::Finished;
            s.duration = 42.0;
        });
        fs::write(job.store().exceptions_path(), "old\n").unwrap();

        let initial = InitialStatusArgs {
            title: "Nothing at all".to_string(),
            user: Some("alice".to_string()),
            ..InitialStatusArgs::default()
        };
        job.start(JobTarget::new("noop", serde_json::json!({"n": 1})), initial)
            .unwrap();

        let status = job.get_status().unwrap();
        assert_eq!(status.state, JobState::Initialized);
        assert_eq!(status.title, "Nothing at all");
        assert_eq!(status.user.as_deref(), Some("alice"));
        assert_eq!(status.estimated_duration, Some(42.0));
        assert!(status.ppid.is_some());
        assert!(status.loginfo.exception.is_empty());
        let target = JobTarget::read(job.work_dir()).unwrap();
        assert_eq!(target.class, "noop");

        // Still inside the initialization window.
        assert!(matches!(
            job.start(JobTarget::new("noop", serde_json::Value::Null), InitialStatusArgs::default()),
            Err(JobError::AlreadyRunning(_))
        ));
    }

    #[test]
    fn start_rejects_unknown_class() {
        let dir = TempDir::new().unwrap();
        let job = engine(&dir).job("noop-1").unwrap();
        let err = job
            .start(JobTarget::new("nope", serde_json::Value::Null), InitialStatusArgs::default())
            .unwrap_err();
        assert!(matches!(err, JobError::UnknownJobClass(_)));
        assert!(!job.exists());
    }

    #[test]
    fn failed_launcher_is_reported() {
        let dir = TempDir::new().unwrap();
        let job = engine_with(&dir, "false").job("noop-1").unwrap();
        let err = job
            .start(JobTarget::new("noop", serde_json::Value::Null), InitialStatusArgs::default())
            .unwrap_err();
        assert!(matches!(err, JobError::Launch { .. }), "{err}");
        let status = job.get_status().unwrap();
        assert_eq!(status.state, JobState::Exception);
        assert!(!status.loginfo.exception.is_empty());
    }

    #[test]
    fn wait_times_out_on_active_job() {
        let dir = TempDir::new().unwrap();
        let job = engine(&dir).job("noop-1").unwrap();
        put_status(&job, |_| {});
        assert!(!job.wait_for_completion(Some(Duration::from_millis(10))).unwrap());

        put_status(&job, |s| s.state = JobState::Finished);
        assert!(job.wait_for_completion(None).unwrap());
    }
}
