use crate::bj::registry::LegacyJobClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// One sub directory per job id lives here.
    pub base_dir: PathBuf,

    /// Lock serializing the start sequence of all jobs sharing `base_dir`.
    pub init_lock: PathBuf,

    /// Global configuration lock, taken by job processes started with `lock_wato`.
    pub config_lock: PathBuf,

    /// How long `stop()` waits after SIGTERM before sending SIGKILL.
    pub stop_grace_period_ms: u64,
    pub stop_poll_interval_ms: u64,

    /// Jobs still `initialized` this long after their start count as active without a pid.
    pub init_grace_period_ms: u64,

    pub wait_poll_interval_ms: u64,

    /// Users allowed to see, stop and delete jobs of other users.
    pub admin_users: Vec<String>,

    /// Job classes declared as plain mappings (see [`LegacyJobClass`]).
    pub job_classes: BTreeMap<String, serde_yaml::Mapping>,
}

impl JobsConfig {
    /// Defaults for a given jobs directory; both locks sit next to it.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let parent = base_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| base_dir.clone());
        Self {
            init_lock: parent.join("background_jobs.lock"),
            config_lock: parent.join("config.lock"),
            base_dir,
            stop_grace_period_ms: default_stop_grace_period_ms(),
            stop_poll_interval_ms: default_stop_poll_interval_ms(),
            init_grace_period_ms: default_init_grace_period_ms(),
            wait_poll_interval_ms: default_wait_poll_interval_ms(),
            admin_users: Vec::new(),
            job_classes: BTreeMap::new(),
        }
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    pub fn init_grace_period(&self) -> Duration {
        Duration::from_millis(self.init_grace_period_ms)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    pub fn legacy_job_classes(&self) -> anyhow::Result<Vec<LegacyJobClass>> {
        self.job_classes
            .iter()
            .map(|(ident, spec)| LegacyJobClass::from_spec(ident, spec.clone()))
            .collect()
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self::with_base_dir(default_base_dir())
    }
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobsConfigFile {
    #[serde(default)]
    jobs: Option<JobsSectionFile>,
    #[serde(default)]
    permissions: Option<PermissionsSectionFile>,
    #[serde(default)]
    job_classes: BTreeMap<String, serde_yaml::Mapping>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobsSectionFile {
    #[serde(default)]
    base_dir: Option<PathBuf>,
    #[serde(default)]
    init_lock: Option<PathBuf>,
    #[serde(default)]
    config_lock: Option<PathBuf>,
    #[serde(default = "default_stop_grace_period_ms", deserialize_with = "deserialize_duration_ms")]
    stop_grace_period: u64,
    #[serde(default = "default_stop_poll_interval_ms", deserialize_with = "deserialize_duration_ms")]
    stop_poll_interval: u64,
    #[serde(default = "default_init_grace_period_ms", deserialize_with = "deserialize_duration_ms")]
    init_grace_period: u64,
    #[serde(default = "default_wait_poll_interval_ms", deserialize_with = "deserialize_duration_ms")]
    wait_poll_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PermissionsSectionFile {
    #[serde(default)]
    admin_users: Vec<String>,
}

fn default_base_dir() -> PathBuf {
    match std::env::var_os("OMD_ROOT") {
        Some(root) if !root.is_empty() => PathBuf::from(root).join("var/check_mk/background_jobs"),
        _ => "/tmp/cmk-jobs/background_jobs".into(),
    }
}
fn default_stop_grace_period_ms() -> u64 {
    10_000
}
fn default_stop_poll_interval_ms() -> u64 {
    100
}
fn default_init_grace_period_ms() -> u64 {
    5_000
}
fn default_wait_poll_interval_ms() -> u64 {
    500
}

fn deserialize_duration_ms<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom("duration must be a positive integer (ms)")),
        serde_yaml::Value::String(s) => parse_duration_ms(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "duration must be an integer milliseconds or string like \"10s\"",
        )),
    }
}

/// Parse `1500ms`, `10s`, `1.5m`, `2h`, `7d` into milliseconds.
pub fn parse_duration_ms(s: &str) -> Result<u64, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty duration".to_string());
    }
    let idx = t
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map(|(i, _)| i)
        .unwrap_or(t.len());
    if idx == 0 {
        return Err(format!("invalid duration: {s}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s.parse().map_err(|e| format!("invalid duration number: {e}"))?;
    let unit = unit_s.trim().to_ascii_lowercase();
    let mult: f64 = match unit.as_str() {
        "ms" => 1.0,
        "s" | "" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        "d" => 86_400_000.0,
        _ => return Err(format!("unknown duration unit {unit_s:?} (use ms/s/m/h/d)")),
    };
    Ok((num * mult).round() as u64)
}

pub fn load_jobs_config(config_path: &Path) -> anyhow::Result<JobsConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    let file_cfg: JobsConfigFile = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?;

    // Relative paths are relative to the config file.
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    let resolve = |p: PathBuf| if p.is_relative() { base.join(p) } else { p };

    let mut cfg = JobsConfig::default();
    if let Some(jobs) = file_cfg.jobs {
        if let Some(dir) = jobs.base_dir {
            let derived = JobsConfig::with_base_dir(resolve(dir));
            cfg.base_dir = derived.base_dir;
            cfg.init_lock = derived.init_lock;
            cfg.config_lock = derived.config_lock;
        }
        if let Some(p) = jobs.init_lock {
            cfg.init_lock = resolve(p);
        }
        if let Some(p) = jobs.config_lock {
            cfg.config_lock = resolve(p);
        }
        anyhow::ensure!(jobs.stop_poll_interval > 0, "jobs.stop_poll_interval must be > 0");
        anyhow::ensure!(jobs.wait_poll_interval > 0, "jobs.wait_poll_interval must be > 0");
        cfg.stop_grace_period_ms = jobs.stop_grace_period;
        cfg.stop_poll_interval_ms = jobs.stop_poll_interval;
        cfg.init_grace_period_ms = jobs.init_grace_period;
        cfg.wait_poll_interval_ms = jobs.wait_poll_interval;
    }
    if let Some(perms) = file_cfg.permissions {
        for u in &perms.admin_users {
            anyhow::ensure!(!u.trim().is_empty(), "permissions.admin_users must not contain empty names");
        }
        cfg.admin_users = perms.admin_users;
    }
    cfg.job_classes = file_cfg.job_classes;
    // Surface broken class declarations at load time rather than at first use.
    cfg.legacy_job_classes()?;

    Ok(cfg)
}

/// `-c/--config` wins, then `CMK_JOBS_CONFIG`; without either the defaults apply.
pub fn load_or_default(config_path: Option<&Path>) -> anyhow::Result<JobsConfig> {
    if let Some(p) = config_path {
        return load_jobs_config(p);
    }
    match std::env::var_os("CMK_JOBS_CONFIG") {
        Some(p) if !p.is_empty() => load_jobs_config(Path::new(&p)),
        _ => Ok(JobsConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_cfg(dir: &TempDir, body: &str) -> PathBuf {
        let p = dir.path().join("jobs.yaml");
        std::fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn duration_strings() {
        assert_eq!(parse_duration_ms("1500ms"), Ok(1500));
        assert_eq!(parse_duration_ms("10s"), Ok(10_000));
        assert_eq!(parse_duration_ms("1.5m"), Ok(90_000));
        assert_eq!(parse_duration_ms("7d"), Ok(604_800_000));
        assert_eq!(parse_duration_ms("3"), Ok(3000));
        assert!(parse_duration_ms("").is_err());
        assert!(parse_duration_ms("s").is_err());
        assert!(parse_duration_ms("5 weeks").is_err());
    }

    #[test]
    fn base_dir_derives_lock_paths() {
        let cfg = JobsConfig::with_base_dir("/srv/site/var/background_jobs");
        assert_eq!(cfg.init_lock, PathBuf::from("/srv/site/var/background_jobs.lock"));
        assert_eq!(cfg.config_lock, PathBuf::from("/srv/site/var/config.lock"));
        assert_eq!(cfg.stop_grace_period(), Duration::from_secs(10));
        assert_eq!(cfg.init_grace_period(), Duration::from_secs(5));
        assert_eq!(cfg.stop_poll_interval(), Duration::from_millis(100));
        assert_eq!(cfg.wait_poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn loads_file_and_resolves_relative_paths() {
        let dir = TempDir::new().unwrap();
        let p = write_cfg(
            &dir,
            "jobs:\n  base_dir: var/jobs\n  stop_grace_period: 2s\n  wait_poll_interval: 50\npermissions:\n  admin_users: [cmkadmin]\njob_classes:\n  backup:\n    command: [true]\n    max_count: 2\n",
        );
        let cfg = load_jobs_config(&p).unwrap();
        assert_eq!(cfg.base_dir, dir.path().join("var/jobs"));
        assert_eq!(cfg.init_lock, dir.path().join("var/background_jobs.lock"));
        assert_eq!(cfg.stop_grace_period_ms, 2000);
        assert_eq!(cfg.wait_poll_interval_ms, 50);
        assert_eq!(cfg.admin_users, vec!["cmkadmin"]);
        let classes = cfg.legacy_job_classes().unwrap();
        assert_eq!(classes.len(), 1);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = TempDir::new().unwrap();
        let p = write_cfg(&dir, "jobs:\n  base_dirr: /x\n");
        let err = load_jobs_config(&p).unwrap_err();
        assert!(err.to_string().contains("failed to parse config"), "{err}");
    }

    #[test]
    fn broken_job_class_fails_load() {
        let dir = TempDir::new().unwrap();
        let p = write_cfg(&dir, "job_classes:\n  broken:\n    title: no command\n");
        assert!(load_jobs_config(&p).is_err());
    }
}
