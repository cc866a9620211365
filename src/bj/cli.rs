use crate::bj::config::{self, JobsConfig};
use crate::bj::identity::{LocalUser, UserContext as _};
use crate::bj::job::{InitialStatusArgs, JobEngine};
use crate::bj::manager::BackgroundJobManager;
use crate::bj::process::{self, JobTarget, WorkerCommand};
use crate::bj::registry::{JobClass, JobRegistry};
use crate::bj::status::{StatusSnapshot, unix_now};
use crate::bj::{build_info, logging};
use anyhow::Context as _;
use chrono::{Local, TimeZone as _};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "cmk-jobs", version, about = "background job control")]
pub struct Args {
    /// Path to the jobs config YAML (defaults apply without one)
    #[arg(short = 'c', long = "config", env = "CMK_JOBS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// List jobs (default)
    List {
        /// Only jobs of this class
        #[arg(long = "class")]
        class: Option<String>,
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Show the status of one job
    Status {
        job_id: String,
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Show the progress, result and exception logs of a job
    Logs {
        job_id: String,
        /// Number of lines to show per log
        #[arg(short = 'n', default_value_t = 50)]
        n: usize,
    },
    /// Start a job of a configured class
    Run {
        class: String,
        /// Job id; the class prefix is added when missing
        job_id: String,
        /// Job argument, `key=value` (value parsed as JSON when possible). Repeatable.
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,
        #[arg(long = "title")]
        title: Option<String>,
        /// Ignore SIGTERM and refuse `stop` while running
        #[arg(long = "not-stoppable")]
        not_stoppable: bool,
        /// Hold the configuration lock while the job runs
        #[arg(long = "lock-config")]
        lock_config: bool,
        /// Wait until the job is done
        #[arg(short = 'w', long = "wait")]
        wait: bool,
        /// Extra command line arguments for command based classes
        #[arg(last = true)]
        argv: Vec<String>,
    },
    /// Stop a running job (SIGTERM, SIGKILL after the grace period)
    Stop { job_id: String },
    /// Stop (if needed) and delete a job
    Delete { job_id: String },
    /// Acknowledge a job's exception
    Ack { job_id: String },
    /// Wait until a job is no longer active
    Wait {
        job_id: String,
        /// Give up after this long, e.g. 30s or 5m
        #[arg(short = 't', long = "timeout")]
        timeout: Option<String>,
    },
    /// Remove old and excess jobs of every class
    Housekeeping,
    /// List the configured job classes
    Classes,
    /// Print version and build information
    Version,
    #[command(hide = true)]
    JobProcess,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Registry of every class the binary knows: the ones declared in the config file.
pub fn build_registry(cfg: &JobsConfig) -> anyhow::Result<JobRegistry> {
    let mut reg = JobRegistry::new();
    for class in cfg.legacy_job_classes()? {
        reg.register(Arc::new(class))?;
    }
    Ok(reg)
}

fn worker_command(config: Option<&PathBuf>) -> anyhow::Result<WorkerCommand> {
    let mut worker = WorkerCommand::current_exe()?;
    if let Some(path) = config {
        let abs = std::fs::canonicalize(path).with_context(|| format!("resolve {}", path.display()))?;
        let mut args = vec!["-c".to_string(), abs.to_string_lossy().into_owned()];
        args.append(&mut worker.args);
        worker.args = args;
    }
    Ok(worker)
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = config::load_or_default(args.config.as_deref())?;
    let registry = Arc::new(build_registry(&cfg)?);

    if let Some(Cmd::JobProcess) = args.cmd {
        let code = process::run_from_env(&registry).unwrap_or_else(|| {
            eprintln!("job-process is started by cmk-jobs itself, not by hand");
            2
        });
        std::process::exit(code);
    }
    logging::init_cli_tracing();

    let engine = Arc::new(JobEngine::new(cfg, Arc::clone(&registry), worker_command(args.config.as_ref())?));
    let manager = BackgroundJobManager::new(Arc::clone(&engine));
    let user = LocalUser::current(&engine.config().admin_users);

    match args.cmd.unwrap_or(Cmd::List {
        class: None,
        format: OutputFormat::Text,
    }) {
        Cmd::List { class, format } => {
            let class = match class {
                Some(ident) => Some(
                    registry
                        .get(&ident)
                        .with_context(|| format!("unknown job class {ident:?}"))?,
                ),
                None => None,
            };
            let snaps = manager.get_status_snapshots(class.as_deref(), &user)?;
            match format {
                OutputFormat::Text => println!("{}", render_table(&snaps)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snaps)?),
            }
            Ok(())
        }
        Cmd::Status { job_id, format } => {
            let job = engine.job(&job_id)?;
            anyhow::ensure!(job.exists(), "background job {job_id} does not exist");
            anyhow::ensure!(job.is_visible(&user)?, "background job {job_id} belongs to another user");
            let snap = job.get_status_snapshot(&user)?;
            match format {
                OutputFormat::Text => println!("{}", render_status(&snap)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snap)?),
            }
            Ok(())
        }
        Cmd::Logs { job_id, n } => {
            let job = engine.job(&job_id)?;
            anyhow::ensure!(job.exists(), "background job {job_id} does not exist");
            anyhow::ensure!(job.is_visible(&user)?, "background job {job_id} belongs to another user");
            let logs = job.store().read_loginfo();
            for (name, lines) in [
                ("progress", &logs.progress_update),
                ("result", &logs.result),
                ("exceptions", &logs.exception),
            ] {
                if lines.is_empty() {
                    continue;
                }
                println!("==> {name} <==");
                for line in &lines[lines.len().saturating_sub(n)..] {
                    println!("{line}");
                }
            }
            Ok(())
        }
        Cmd::Run {
            class,
            job_id,
            args: kv,
            title,
            not_stoppable,
            lock_config,
            wait,
            argv,
        } => {
            let job_class = registry
                .get(&class)
                .with_context(|| format!("unknown job class {class:?}"))?;
            let job_id = if job_id.starts_with(job_class.job_prefix()) {
                job_id
            } else {
                format!("{}{job_id}", job_class.job_prefix())
            };
            let mut job_args = parse_job_args(&kv)?;
            if !argv.is_empty() {
                job_args.insert("argv".to_string(), serde_json::json!(argv));
            }
            let job = engine.job(&job_id)?;
            job.start(
                JobTarget::new(class, serde_json::Value::Object(job_args)),
                InitialStatusArgs {
                    title: title.unwrap_or_else(|| job_class.gui_title()),
                    stoppable: job_class.stoppable() && !not_stoppable,
                    user: user_id(&user),
                    lock_wato: lock_config,
                    host_name: hostname(),
                    ..InitialStatusArgs::default()
                },
            )?;
            println!("started {job_id}");
            if wait {
                job.wait_for_completion(None)?;
                println!("{}", render_status(&job.get_status_snapshot(&user)?));
            }
            Ok(())
        }
        Cmd::Stop { job_id } => {
            let job = engine.job(&job_id)?;
            anyhow::ensure!(job.may_stop(&user)?, "not permitted to stop background job {job_id}");
            job.stop()?;
            println!("stopped {job_id}");
            Ok(())
        }
        Cmd::Delete { job_id } => {
            let job = engine.job(&job_id)?;
            anyhow::ensure!(job.exists(), "background job {job_id} does not exist");
            anyhow::ensure!(job.may_delete(&user)?, "not permitted to delete background job {job_id}");
            job.delete()?;
            println!("deleted {job_id}");
            Ok(())
        }
        Cmd::Ack { job_id } => {
            let job = engine.job(&job_id)?;
            anyhow::ensure!(job.exists(), "background job {job_id} does not exist");
            let who = user_id(&user).unwrap_or_else(|| "-".to_string());
            job.acknowledge(&who)?;
            println!("acknowledged {job_id} by {who}");
            Ok(())
        }
        Cmd::Wait { job_id, timeout } => {
            let timeout = match timeout {
                Some(t) => Some(Duration::from_millis(
                    config::parse_duration_ms(&t).map_err(|e| anyhow::anyhow!("--timeout: {e}"))?,
                )),
                None => None,
            };
            let job = engine.job(&job_id)?;
            if !job.wait_for_completion(timeout)? {
                anyhow::bail!("background job {job_id} still running after timeout");
            }
            println!("{}", render_status(&job.get_status_snapshot(&user)?));
            Ok(())
        }
        Cmd::Housekeeping => {
            let classes: Vec<Arc<dyn JobClass>> = registry.classes().cloned().collect();
            let deleted = manager.do_housekeeping(classes.iter().map(|c| c.as_ref()));
            println!("housekeeping deleted {deleted} job(s)");
            Ok(())
        }
        Cmd::Classes => {
            for class in registry.classes() {
                println!(
                    "{} prefix={} max_count={} max_age={}",
                    class.ident(),
                    class.job_prefix(),
                    class.housekeeping_max_count(),
                    fmt_duration_s(class.housekeeping_max_age().as_secs_f64()),
                );
            }
            Ok(())
        }
        Cmd::Version => {
            println!("{}", build_info::banner());
            Ok(())
        }
        // Exits before dispatch.
        Cmd::JobProcess => Ok(()),
    }
}

fn user_id(user: &LocalUser) -> Option<String> {
    user.user_id().map(str::to_string)
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}

fn parse_job_args(kv: &[String]) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
    let mut out = serde_json::Map::new();
    for item in kv {
        let (k, v) = item
            .split_once('=')
            .with_context(|| format!("--arg {item:?}: expected KEY=VALUE"))?;
        let k = k.trim();
        anyhow::ensure!(!k.is_empty(), "--arg {item:?}: empty key");
        let value = serde_json::from_str(v).unwrap_or_else(|_| serde_json::Value::String(v.to_string()));
        out.insert(k.to_string(), value);
    }
    Ok(out)
}

fn fmt_started(started: f64) -> String {
    Local
        .timestamp_millis_opt((started * 1000.0) as i64)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn fmt_duration_s(secs: f64) -> String {
    if !secs.is_finite() || secs < 0.0 {
        return "-".to_string();
    }
    let mut s = secs.round() as u64;
    let days = s / 86_400;
    s %= 86_400;
    let hours = s / 3_600;
    s %= 3_600;
    let mins = s / 60;
    let secs = s % 60;
    if days > 0 {
        format!("{days}d{hours:02}h")
    } else if hours > 0 {
        format!("{hours}h{mins:02}m")
    } else if mins > 0 {
        format!("{mins}m{secs:02}s")
    } else {
        format!("{secs}s")
    }
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

fn render_status(snap: &StatusSnapshot) -> String {
    let s = &snap.status;
    let mut lines = vec![
        format!("job_id:     {}", snap.job_id),
        format!("title:      {}", s.title),
        format!("state:      {}", s.state),
        format!("active:     {}", yes_no(snap.is_active)),
        format!("started:    {}", fmt_started(s.started)),
        format!("duration:   {}", fmt_duration_s(s.duration)),
        format!("pid:        {}", s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())),
        format!("user:       {}", s.user.as_deref().unwrap_or("-")),
        format!("stoppable:  {}", yes_no(s.stoppable)),
        format!("deletable:  {}", yes_no(s.deletable)),
    ];
    if let Some(est) = s.estimated_duration {
        lines.push(format!("estimated:  {}", fmt_duration_s(est)));
    }
    if snap.has_exception {
        lines.push(format!(
            "exception:  acknowledged_by={}",
            snap.acknowledged_by.as_deref().unwrap_or("-")
        ));
    }
    if let Some(last) = s.loginfo.result.last() {
        lines.push(format!("result:     {last}"));
    }
    lines.join("\n")
}

fn render_table(snaps: &[StatusSnapshot]) -> String {
    if snaps.is_empty() {
        return "(no jobs)".to_string();
    }

    fn pad(s: &str, width: usize) -> String {
        let len = s.chars().count();
        if len >= width {
            return s.to_string();
        }
        let mut out = String::with_capacity(width);
        out.push_str(s);
        out.push_str(&" ".repeat(width - len));
        out
    }

    fn border(widths: &[usize]) -> String {
        let mut out = String::from("+");
        for w in widths {
            // 1 leading + 1 trailing padding space per cell.
            out.push_str(&"-".repeat(*w + 2));
            out.push('+');
        }
        out
    }

    fn row_line(cols: &[String], widths: &[usize]) -> String {
        let mut out = String::from("|");
        for (i, w) in widths.iter().enumerate() {
            let v = cols.get(i).map(|s| s.as_str()).unwrap_or("");
            out.push(' ');
            out.push_str(&pad(v, *w));
            out.push_str(" |");
        }
        out
    }

    let headers = ["job_id", "state", "active", "started", "duration", "pid", "user", "title"];
    let now = unix_now();
    let rows: Vec<Vec<String>> = snaps
        .iter()
        .map(|snap| {
            let s = &snap.status;
            let state = if snap.has_exception && snap.acknowledged_by.is_none() {
                format!("{}(!)", s.state)
            } else {
                s.state.to_string()
            };
            let duration = if snap.is_active { now - s.started } else { s.duration };
            vec![
                snap.job_id.clone(),
                state,
                yes_no(snap.is_active).to_string(),
                fmt_started(s.started),
                fmt_duration_s(duration),
                s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                s.user.clone().unwrap_or_else(|| "-".to_string()),
                s.title.clone(),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, col) in row.iter().enumerate() {
            widths[i] = widths[i].max(col.chars().count());
        }
    }

    let header_cols: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    let mut out = String::new();
    out.push_str(&border(&widths));
    out.push('\n');
    out.push_str(&row_line(&header_cols, &widths));
    out.push('\n');
    out.push_str(&border(&widths));
    out.push('\n');
    for row in &rows {
        out.push_str(&row_line(row, &widths));
        out.push('\n');
    }
    out.push_str(&border(&widths));
    out
}
