use crate::bj::config::parse_duration_ms;
use crate::bj::interface::BackgroundProcessInterface;
use crate::bj::process::Terminated;
use anyhow::Context as _;
use std::collections::BTreeMap;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_HOUSEKEEPING_MAX_AGE: Duration = Duration::from_secs(7 * 86_400);
pub const DEFAULT_HOUSEKEEPING_MAX_COUNT: usize = 50;

/// A kind of background job: what it runs and how its old jobs are cleaned up.
///
/// Job ids of a class all start with [`JobClass::job_prefix`]; the working
/// directories are the only index of existing jobs.
pub trait JobClass: Send + Sync {
    /// Registry tag, recorded with every started job so the worker can find the class again.
    fn ident(&self) -> &str;

    fn job_prefix(&self) -> &str;

    fn gui_title(&self) -> String;

    fn housekeeping_max_age(&self) -> Duration {
        DEFAULT_HOUSEKEEPING_MAX_AGE
    }

    fn housekeeping_max_count(&self) -> usize {
        DEFAULT_HOUSEKEEPING_MAX_COUNT
    }

    /// Whether jobs of this class may ever be stopped. A job is stoppable only if
    /// both its class and its start arguments allow it.
    fn stoppable(&self) -> bool {
        true
    }

    /// The job's work, executed inside the detached worker process.
    fn run(&self, job: &BackgroundProcessInterface, args: &serde_json::Value) -> anyhow::Result<()>;
}

/// Explicit tag → job class mapping, built once at startup and shared by reference.
#[derive(Clone, Default)]
pub struct JobRegistry {
    classes: BTreeMap<String, Arc<dyn JobClass>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.classes.keys()).finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: Arc<dyn JobClass>) -> anyhow::Result<()> {
        let ident = class.ident().to_string();
        anyhow::ensure!(!ident.trim().is_empty(), "job class ident must not be empty");
        if self.classes.contains_key(&ident) {
            anyhow::bail!("job class {ident:?} registered twice");
        }
        self.classes.insert(ident, class);
        Ok(())
    }

    pub fn get(&self, ident: &str) -> Option<Arc<dyn JobClass>> {
        self.classes.get(ident).cloned()
    }

    pub fn classes(&self) -> impl Iterator<Item = &Arc<dyn JobClass>> {
        self.classes.values()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

const LEGACY_KEYS: &[&str] = &["prefix", "title", "command", "max_age", "max_count", "stoppable"];
const COMMAND_POLL: Duration = Duration::from_millis(200);

/// Job class declared as a plain mapping in the config file (`job_classes:` section).
///
/// The mapping is kept as declared and read through the accessors below. The class
/// runs `command` (plus any `argv` given in the job arguments) with the job's working
/// directory as cwd and its output captured as progress.
#[derive(Debug, Clone)]
pub struct LegacyJobClass {
    ident: String,
    prefix: String,
    spec: serde_yaml::Mapping,
}

impl LegacyJobClass {
    pub fn from_spec(ident: &str, spec: serde_yaml::Mapping) -> anyhow::Result<Self> {
        for key in spec.keys() {
            let k = key.as_str().unwrap_or_default();
            anyhow::ensure!(
                LEGACY_KEYS.contains(&k),
                "job_classes.{ident}: unknown key {key:?} (allowed: {})",
                LEGACY_KEYS.join(", ")
            );
        }
        let class = Self {
            ident: ident.to_string(),
            prefix: match spec.get("prefix") {
                Some(v) => v
                    .as_str()
                    .map(str::to_string)
                    .with_context(|| format!("job_classes.{ident}.prefix must be a string"))?,
                None => format!("{ident}-"),
            },
            spec,
        };
        let command = class
            .spec
            .get("command")
            .and_then(|v| v.as_sequence())
            .with_context(|| format!("job_classes.{ident}.command must be a list"))?;
        anyhow::ensure!(!command.is_empty(), "job_classes.{ident}.command must not be empty");
        for (i, v) in command.iter().enumerate() {
            anyhow::ensure!(
                yaml_scalar(v).is_some(),
                "job_classes.{ident}.command[{i}] must be a string, number or boolean"
            );
        }
        if let Some(v) = class.spec.get("max_age") {
            legacy_duration(v).with_context(|| format!("job_classes.{ident}.max_age"))?;
        }
        if let Some(v) = class.spec.get("max_count") {
            anyhow::ensure!(v.as_u64().is_some(), "job_classes.{ident}.max_count must be a positive integer");
        }
        if let Some(v) = class.spec.get("stoppable") {
            anyhow::ensure!(v.as_bool().is_some(), "job_classes.{ident}.stoppable must be a boolean");
        }
        Ok(class)
    }

    pub fn command(&self) -> Vec<String> {
        match self.spec.get("command").and_then(|v| v.as_sequence()) {
            Some(seq) => seq.iter().filter_map(yaml_scalar).collect(),
            None => Vec::new(),
        }
    }
}

fn yaml_scalar(v: &serde_yaml::Value) -> Option<String> {
    match v {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_scalar(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn legacy_duration(v: &serde_yaml::Value) -> anyhow::Result<Duration> {
    if let Some(ms) = v.as_u64() {
        return Ok(Duration::from_millis(ms));
    }
    match v.as_str() {
        Some(s) => parse_duration_ms(s)
            .map(Duration::from_millis)
            .map_err(|e| anyhow::anyhow!(e)),
        None => anyhow::bail!("expected milliseconds or a duration string like \"7d\""),
    }
}

impl JobClass for LegacyJobClass {
    fn ident(&self) -> &str {
        &self.ident
    }

    fn job_prefix(&self) -> &str {
        &self.prefix
    }

    fn gui_title(&self) -> String {
        self.spec
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.ident)
            .to_string()
    }

    fn housekeeping_max_age(&self) -> Duration {
        self.spec
            .get("max_age")
            .and_then(|v| legacy_duration(v).ok())
            .unwrap_or(DEFAULT_HOUSEKEEPING_MAX_AGE)
    }

    fn housekeeping_max_count(&self) -> usize {
        self.spec
            .get("max_count")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_HOUSEKEEPING_MAX_COUNT)
    }

    fn stoppable(&self) -> bool {
        self.spec
            .get("stoppable")
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    fn run(&self, job: &BackgroundProcessInterface, args: &serde_json::Value) -> anyhow::Result<()> {
        let mut argv = self.command();
        if let Some(extra) = args.get("argv").and_then(|v| v.as_array()) {
            for (i, v) in extra.iter().enumerate() {
                let arg = json_scalar(v).with_context(|| format!("argv[{i}] must be a string, number or boolean"))?;
                argv.push(arg);
            }
        }
        let (program, rest) = argv
            .split_first()
            .with_context(|| format!("job class {} has no command", self.ident))?;

        job.send_progress_update(&format!("Running {}", argv.join(" ")), true);
        let mut child = Command::new(program)
            .args(rest)
            .current_dir(job.work_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::from(job.progress_stream()?))
            .stderr(Stdio::from(job.progress_stream()?))
            .spawn()
            .with_context(|| format!("spawn {program}"))?;

        let status = loop {
            if let Some(status) = child.try_wait().context("wait for command")? {
                break status;
            }
            if job.stop_requested() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Terminated.into());
            }
            std::thread::sleep(COMMAND_POLL);
        };

        if !status.success() {
            let code = status.code().map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
            anyhow::bail!("command {program} failed exit_code={code}");
        }
        job.send_result_message(&format!("{} finished successfully", self.gui_title()));
        Ok(())
    }
}
