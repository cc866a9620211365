//! Launcher and worker side of a background job.
//!
//! `BackgroundJob::start` spawns the configured worker command with role `launcher`.
//! The launcher re-executes itself with role `process` in a new session, with stdio on
//! `/dev/null` and inherited descriptors closed, then exits. The orphaned worker renames
//! itself, initializes its environment, runs the job class target and records the outcome.

use crate::bj::error::JobError;
use crate::bj::interface::{BackgroundProcessInterface, open_append};
use crate::bj::liveness::{self, PROCESS_NAME};
use crate::bj::lock::FileLock;
use crate::bj::logging;
use crate::bj::registry::JobRegistry;
use crate::bj::status::{JobState, JobStatusStore, PROGRESS_UPDATE_FILE, StatusUpdate, unix_now};
use serde::{Deserialize, Serialize};
use signal_hook::consts::SIGTERM;
use signal_hook::iterator::Signals;
use std::os::fd::AsRawFd as _;
use std::os::unix::process::CommandExt as _;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const ENV_ROLE: &str = "CMK_JOB_ROLE";
pub const ENV_JOB_ID: &str = "CMK_JOB_ID";
pub const ENV_WORK_DIR: &str = "CMK_JOB_WORK_DIR";
pub const ENV_CONFIG_LOCK: &str = "CMK_JOB_CONFIG_LOCK";

pub const ROLE_LAUNCHER: &str = "launcher";
pub const ROLE_PROCESS: &str = "process";

pub const TARGET_FILE: &str = "jobtarget.json";

/// How long a honoured SIGTERM waits for the target to unwind before the job is
/// finalized as `stopped` and the process exits regardless.
const UNWIND_WINDOW: Duration = Duration::from_secs(2);
const UNWIND_POLL: Duration = Duration::from_millis(50);
const MAX_FD_SWEEP: i32 = 65_536;

/// Raised by a target (usually via `check_terminated()?`) once a stop request arrived.
/// Only the worker's run loop interprets it, as the `stopped` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("job was terminated")]
pub struct Terminated;

/// What the worker executes: a registered job class and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTarget {
    pub class: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl JobTarget {
    pub fn new(class: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            class: class.into(),
            args,
        }
    }

    pub(crate) fn write(&self, work_dir: &Path) -> Result<(), JobError> {
        let path = work_dir.join(TARGET_FILE);
        let body = serde_json::to_vec_pretty(self).map_err(|e| JobError::Serialize {
            what: "job target",
            source: e,
        })?;
        std::fs::write(&path, body).map_err(|e| JobError::io("write", path, e))
    }

    pub(crate) fn read(work_dir: &Path) -> anyhow::Result<Self> {
        let path = work_dir.join(TARGET_FILE);
        let raw = std::fs::read(&path).map_err(|e| anyhow::anyhow!("read {}: {e}", path.display()))?;
        serde_json::from_slice(&raw).map_err(|e| anyhow::anyhow!("parse {}: {e}", path.display()))
    }
}

/// Program (plus leading args) that, when started with the job environment set,
/// ends up in [`run_from_env`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The running executable's hidden `job-process` subcommand.
    pub fn current_exe() -> anyhow::Result<Self> {
        let exe = std::env::current_exe().map_err(|e| anyhow::anyhow!("resolve current executable: {e}"))?;
        Ok(Self::new(exe, ["job-process"]))
    }
}

/// Run the launcher for `job_id` and wait for it. The launcher returns as soon as the
/// detached worker is spawned.
pub(crate) fn launch(
    worker: &WorkerCommand,
    job_id: &str,
    work_dir: &Path,
    config_lock: &Path,
) -> Result<u32, JobError> {
    let launch_err = |reason: String| JobError::Launch {
        job_id: job_id.to_string(),
        reason,
    };
    let mut child = Command::new(&worker.program)
        .args(&worker.args)
        .env(ENV_ROLE, ROLE_LAUNCHER)
        .env(ENV_JOB_ID, job_id)
        .env(ENV_WORK_DIR, work_dir)
        .env(ENV_CONFIG_LOCK, config_lock)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .spawn()
        .map_err(|e| {
            launch_err(format!(
                "spawn program={} kind={:?} os_error={:?} err={e}",
                worker.program.display(),
                e.kind(),
                e.raw_os_error()
            ))
        })?;
    let launcher_pid = child.id();
    let status = child
        .wait()
        .map_err(|e| launch_err(format!("wait launcher pid={launcher_pid} err={e}")))?;
    if !status.success() {
        let code = status.code().map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
        return Err(launch_err(format!("launcher pid={launcher_pid} exit_code={code}")));
    }
    tracing::debug!(job_id, "attempt=launch outcome=ok launcher_pid={launcher_pid}");
    Ok(launcher_pid)
}

/// Entry point for processes started by [`launch`]. Returns the exit code, or `None`
/// when the current process was not started as part of a job.
pub fn run_from_env(registry: &JobRegistry) -> Option<i32> {
    let role = std::env::var(ENV_ROLE).ok()?;
    match role.as_str() {
        ROLE_LAUNCHER => Some(run_launcher()),
        ROLE_PROCESS => Some(run_worker(registry)),
        other => {
            eprintln!("cmk-jobs: unknown {ENV_ROLE}={other:?}");
            Some(2)
        }
    }
}

fn run_launcher() -> i32 {
    let exe = match std::env::current_exe() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("cmk-jobs launcher: resolve current executable: {e}");
            return 1;
        }
    };
    let fd_limit = open_fd_limit();
    let mut cmd = Command::new(&exe);
    cmd.args(std::env::args_os().skip(1))
        .env(ENV_ROLE, ROLE_PROCESS)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // Child side: new session, then drop every descriptor the worker should not inherit.
    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            close_inherited_fds(fd_limit);
            Ok(())
        });
    }
    match cmd.spawn() {
        // Not waited for: the worker is re-parented once this process exits.
        Ok(child) => {
            drop(child);
            0
        }
        Err(e) => {
            eprintln!(
                "cmk-jobs launcher: spawn program={} kind={:?} os_error={:?} err={e}",
                exe.display(),
                e.kind(),
                e.raw_os_error()
            );
            1
        }
    }
}

fn open_fd_limit() -> i32 {
    let n = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if n <= 0 {
        1024
    } else {
        (n as i64).min(MAX_FD_SWEEP as i64) as i32
    }
}

// Runs between fork and exec: only async-signal-safe calls.
// Close-on-exec descriptors are left alone; exec closes them (including std's error pipe).
fn close_inherited_fds(limit: i32) {
    for fd in 3..limit {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags >= 0 && flags & libc::FD_CLOEXEC == 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Target returned; the final state depends on whether exceptions were logged.
    Completed,
    Stopped,
    Exception,
}

/// Records the final state exactly once, whichever of run loop and signal watcher gets there first.
struct Finalizer {
    job_id: String,
    store: JobStatusStore,
    done: Mutex<bool>,
}

impl Finalizer {
    fn new(job_id: &str, store: JobStatusStore) -> Self {
        Self {
            job_id: job_id.to_string(),
            store,
            done: Mutex::new(false),
        }
    }

    fn is_done(&self) -> bool {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false when the job had already been finalized.
    fn finish(&self, outcome: Outcome) -> bool {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        if *done {
            return false;
        }
        *done = true;

        let status = self.store.read();
        let started = status.as_ref().map(|s| s.started).unwrap_or_else(|_| unix_now());
        let state = match outcome {
            Outcome::Stopped => JobState::Stopped,
            Outcome::Exception => JobState::Exception,
            Outcome::Completed => match &status {
                Ok(s) if !s.loginfo.exception.is_empty() => JobState::Exception,
                Ok(_) => JobState::Finished,
                Err(_) => JobState::Exception,
            },
        };
        let duration = (unix_now() - started).max(0.0);
        match self.store.update(&StatusUpdate::state(state).with_duration(duration)) {
            Ok(()) => tracing::info!(
                job_id = %self.job_id,
                "attempt=finalize outcome={state} duration_s={duration:.2}"
            ),
            Err(e) => tracing::error!(job_id = %self.job_id, "attempt=finalize outcome=error state={state} err={e}"),
        }
        true
    }
}

struct WorkerEnv {
    iface: BackgroundProcessInterface,
    target: JobTarget,
    // Held for the lifetime of the process when the job asked for it.
    _config_lock: Option<FileLock>,
}

fn run_worker(registry: &JobRegistry) -> i32 {
    let (job_id, work_dir) = match (std::env::var(ENV_JOB_ID), std::env::var_os(ENV_WORK_DIR)) {
        (Ok(id), Some(dir)) => (id, PathBuf::from(dir)),
        _ => {
            eprintln!("cmk-jobs worker: {ENV_JOB_ID} and {ENV_WORK_DIR} must be set");
            return 2;
        }
    };
    let config_lock = std::env::var_os(ENV_CONFIG_LOCK).map(PathBuf::from);

    let store = JobStatusStore::new(&work_dir);
    let finalizer = Arc::new(Finalizer::new(&job_id, store.clone()));
    let stop = Arc::new(AtomicBool::new(false));

    let env = match init_environment(
        &job_id,
        &work_dir,
        config_lock.as_deref(),
        &store,
        &finalizer,
        &stop,
    ) {
        Ok(env) => env,
        Err(e) => {
            tracing::error!(job_id = %job_id, "attempt=init_environment outcome=error err={e:#}");
            finalizer.finish(Outcome::Exception);
            return 1;
        }
    };

    let outcome = match registry.get(&env.target.class) {
        Some(class) => run_target(&env, class.as_ref()),
        None => {
            let e = JobError::UnknownJobClass(env.target.class.clone());
            tracing::error!(job_id = %job_id, "attempt=run outcome=error err={e}");
            env.iface.send_exception(&e.to_string());
            Outcome::Exception
        }
    };
    finalizer.finish(outcome);
    0
}

/// A worker that keeps its original name is invisible to every liveness check.
fn name_worker_process(name: &str) -> anyhow::Result<()> {
    liveness::set_process_name(name).map_err(|e| anyhow::anyhow!("set process name {name:?}: {e}"))
}

fn init_environment(
    job_id: &str,
    work_dir: &Path,
    config_lock: Option<&Path>,
    store: &JobStatusStore,
    finalizer: &Arc<Finalizer>,
    stop: &Arc<AtomicBool>,
) -> anyhow::Result<WorkerEnv> {
    nix::unistd::alarm::cancel();

    let progress_path = work_dir.join(PROGRESS_UPDATE_FILE);
    let progress = open_append(&progress_path)
        .map_err(|e| anyhow::anyhow!("open {}: {e}", progress_path.display()))?;
    for fd in [libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(progress.as_raw_fd(), fd) } < 0 {
            anyhow::bail!("dup2 progress log onto fd {fd}: {}", std::io::Error::last_os_error());
        }
    }
    logging::init_worker_tracing();

    // Before anything records our pid: liveness checks match on this name.
    name_worker_process(PROCESS_NAME)?;

    // ppid stays as recorded by the supervisor: the launcher pid, long gone by now.
    let pid = std::process::id();
    store.update(&StatusUpdate {
        state: Some(JobState::Running),
        pid: Some(pid),
        ..StatusUpdate::default()
    })?;
    tracing::info!(job_id, "attempt=init outcome=running pid={pid}");

    spawn_sigterm_watcher(job_id, store.clone(), Arc::clone(finalizer), Arc::clone(stop))?;

    let lock_wato = store.read().map(|s| s.lock_wato)?;
    let config_lock = match (lock_wato, config_lock) {
        (true, Some(path)) => {
            tracing::debug!(job_id, "attempt=config_lock path={}", path.display());
            Some(FileLock::locked(path)?)
        }
        (true, None) => anyhow::bail!("job requires the configuration lock but {ENV_CONFIG_LOCK} is not set"),
        (false, _) => None,
    };

    let target = JobTarget::read(work_dir)?;
    let iface = BackgroundProcessInterface::new(job_id, work_dir, progress, Arc::clone(stop));
    Ok(WorkerEnv {
        iface,
        target,
        _config_lock: config_lock,
    })
}

fn spawn_sigterm_watcher(
    job_id: &str,
    store: JobStatusStore,
    finalizer: Arc<Finalizer>,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGTERM]).map_err(|e| anyhow::anyhow!("register SIGTERM handler: {e}"))?;
    let job_id = job_id.to_string();
    std::thread::Builder::new()
        .name("sigterm-watch".to_string())
        .spawn(move || {
            for _ in signals.forever() {
                // The flag may have changed since start; the persisted value decides.
                let stoppable = store.read().map(|s| s.stoppable).unwrap_or(true);
                if !stoppable {
                    tracing::warn!(job_id = %job_id, "signal=SIGTERM outcome=ignored reason=not_stoppable");
                    continue;
                }
                tracing::info!(job_id = %job_id, "signal=SIGTERM outcome=terminate_requested");
                stop.store(true, Ordering::SeqCst);

                let deadline = Instant::now() + UNWIND_WINDOW;
                while Instant::now() < deadline {
                    if finalizer.is_done() {
                        return;
                    }
                    std::thread::sleep(UNWIND_POLL);
                }
                if finalizer.finish(Outcome::Stopped) {
                    tracing::warn!(
                        job_id = %job_id,
                        "signal=SIGTERM outcome=forced_exit unwind_window_ms={}",
                        UNWIND_WINDOW.as_millis()
                    );
                    std::process::exit(0);
                }
                return;
            }
        })
        .map_err(|e| anyhow::anyhow!("spawn signal watcher: {e}"))?;
    Ok(())
}

fn run_target(env: &WorkerEnv, class: &dyn crate::bj::registry::JobClass) -> Outcome {
    let iface = &env.iface;
    let job_id = iface.job_id();
    tracing::info!(job_id, "attempt=run class={}", env.target.class);
    match panic::catch_unwind(AssertUnwindSafe(|| class.run(iface, &env.target.args))) {
        Ok(Ok(())) if iface.stop_requested() => Outcome::Stopped,
        Ok(Ok(())) => Outcome::Completed,
        Ok(Err(e)) if e.downcast_ref::<Terminated>().is_some() => {
            tracing::info!(job_id, "attempt=run outcome=terminated");
            Outcome::Stopped
        }
        Ok(Err(e)) => {
            tracing::error!(job_id, "attempt=run outcome=exception err={e:#}");
            iface.send_exception(&format!("Exception while processing job: {e:#}"));
            Outcome::Completed
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            tracing::error!(job_id, "attempt=run outcome=panic msg={msg}");
            iface.send_exception(&format!("Exception while processing job: {msg}"));
            Outcome::Completed
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bj::status::JobStatus;
    use tempfile::TempDir;

    fn store_with(dir: &TempDir, exceptions: &[&str]) -> JobStatusStore {
        let store = JobStatusStore::new(dir.path());
        let mut status = JobStatus::initialized(unix_now() - 3.0);
        status.state = JobState::Running;
        store.write(&status).unwrap();
        if !exceptions.is_empty() {
            std::fs::write(store.exceptions_path(), exceptions.join("\n")).unwrap();
        }
        store
    }

    #[test]
    fn terminated_survives_anyhow_round_trip() {
        let e: anyhow::Error = Terminated.into();
        assert!(e.downcast_ref::<Terminated>().is_some());
        let other = anyhow::anyhow!("boom");
        assert!(other.downcast_ref::<Terminated>().is_none());
    }

    #[test]
    fn completed_without_exceptions_is_finished() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, &[]);
        let fin = Finalizer::new("j", store.clone());
        assert!(fin.finish(Outcome::Completed));
        let status = store.read().unwrap();
        assert_eq!(status.state, JobState::Finished);
        assert!(status.duration >= 3.0);
    }

    #[test]
    fn completed_with_exceptions_is_exception() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, &["it broke"]);
        let fin = Finalizer::new("j", store.clone());
        fin.finish(Outcome::Completed);
        assert_eq!(store.read().unwrap().state, JobState::Exception);
    }

    #[test]
    fn unusable_process_name_fails_worker_init() {
        let err = name_worker_process("cmk\0job").unwrap_err();
        assert!(err.to_string().contains("set process name"), "{err}");
    }

    #[test]
    fn finalization_happens_once() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, &[]);
        let fin = Finalizer::new("j", store.clone());
        assert!(!fin.is_done());
        assert!(fin.finish(Outcome::Stopped));
        assert!(fin.is_done());
        assert!(!fin.finish(Outcome::Completed));
        assert_eq!(store.read().unwrap().state, JobState::Stopped);
    }

    #[test]
    fn target_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let target = JobTarget::new("backup", serde_json::json!({"argv": ["-v"]}));
        target.write(dir.path()).unwrap();
        assert_eq!(JobTarget::read(dir.path()).unwrap(), target);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let r: std::thread::Result<()> = panic::catch_unwind(|| panic!("kaputt {}", 3));
        assert_eq!(panic_message(r.unwrap_err().as_ref()), "kaputt 3");
        let r: std::thread::Result<()> = panic::catch_unwind(|| std::panic::panic_any(7u8));
        assert_eq!(panic_message(r.unwrap_err().as_ref()), "panic with non-string payload");
    }

    #[test]
    fn fd_limit_is_bounded() {
        let n = open_fd_limit();
        assert!(n > 3 && n <= MAX_FD_SWEEP);
    }

    #[test]
    fn without_role_nothing_runs() {
        if std::env::var_os(ENV_ROLE).is_none() {
            assert_eq!(run_from_env(&JobRegistry::new()), None);
        }
    }
}
