//! Quick setup stages and actions, run as background jobs.
//!
//! A quick setup validates the submitted form data, then computes either a recap of
//! the stage or runs the final action. Step progress is reported through tagged lines
//! in the job's progress log; the outcome is stored as `quick_setup_result.json` in the
//! job's working directory, where the initiating request picks it up.

use crate::bj::error::JobError;
use crate::bj::interface::BackgroundProcessInterface;
use crate::bj::job::{BackgroundJob, InitialStatusArgs, JobEngine};
use crate::bj::process::JobTarget;
use crate::bj::registry::JobClass;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

pub const JOB_CLASS_IDENT: &str = "quick_setup";
pub const JOB_PREFIX: &str = "quick_setup-";
pub const RESULT_FILE: &str = "quick_setup_result.json";
pub const PROGRESS_TAG: &str = "[quick-setup-progress]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Active,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStep {
    pub step_name: String,
    pub title: String,
    pub status: StepStatus,
}

pub trait ProgressLogger {
    fn log_new_progress_step(&mut self, step_name: &str, title: &str);
    fn update_progress_step_status(&mut self, step_name: &str, status: StepStatus);
}

/// Forwards step changes into the job's progress log as `[quick-setup-progress] {json}` lines.
pub struct JobProgressLogger<'a> {
    job: &'a BackgroundProcessInterface,
    titles: BTreeMap<String, String>,
}

impl<'a> JobProgressLogger<'a> {
    pub fn new(job: &'a BackgroundProcessInterface) -> Self {
        Self {
            job,
            titles: BTreeMap::new(),
        }
    }

    fn emit(&self, step: &ProgressStep) {
        match serde_json::to_string(step) {
            Ok(json) => self.job.send_progress_update(&format!("{PROGRESS_TAG} {json}"), false),
            Err(e) => tracing::warn!(job_id = self.job.job_id(), "progress_step_encode_failed err={e}"),
        }
    }
}

impl ProgressLogger for JobProgressLogger<'_> {
    fn log_new_progress_step(&mut self, step_name: &str, title: &str) {
        self.titles.insert(step_name.to_string(), title.to_string());
        self.emit(&ProgressStep {
            step_name: step_name.to_string(),
            title: title.to_string(),
            status: StepStatus::Active,
        });
    }

    fn update_progress_step_status(&mut self, step_name: &str, status: StepStatus) {
        let title = self.titles.get(step_name).cloned().unwrap_or_default();
        self.emit(&ProgressStep {
            step_name: step_name.to_string(),
            title,
            status,
        });
    }
}

/// Current state of every step found in `lines`, in order of first appearance.
pub fn parse_progress_steps<S: AsRef<str>>(lines: &[S]) -> Vec<ProgressStep> {
    let mut steps: Vec<ProgressStep> = Vec::new();
    for line in lines {
        let Some(json) = line.as_ref().strip_prefix(PROGRESS_TAG) else {
            continue;
        };
        let Ok(step) = serde_json::from_str::<ProgressStep>(json.trim()) else {
            continue;
        };
        match steps.iter_mut().find(|s| s.step_name == step.step_name) {
            Some(existing) => {
                existing.status = step.status;
                if !step.title.is_empty() {
                    existing.title = step.title;
                }
            }
            None => steps.push(step),
        }
    }
    steps
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    #[serde(default)]
    pub field: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            field: field.map(str::to_string),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundJobException {
    pub message: String,
    pub traceback: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuickSetupResult {
    #[serde(default)]
    pub validation_errors: Vec<ValidationError>,
    #[serde(default)]
    pub recap: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub redirect_url: Option<String>,
    #[serde(default)]
    pub background_job_exception: Option<BackgroundJobException>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickSetupMode {
    /// Validate a stage and compute its recap.
    Stage,
    /// Validate everything and run the final action.
    Action,
}

impl QuickSetupMode {
    fn as_str(&self) -> &'static str {
        match self {
            QuickSetupMode::Stage => "stage",
            QuickSetupMode::Action => "action",
        }
    }
}

/// Job arguments of a quick setup run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickSetupRequest {
    pub quick_setup_id: String,
    pub mode: QuickSetupMode,
    #[serde(default)]
    pub form_data: serde_json::Value,
}

pub type Validator = Box<dyn Fn(&serde_json::Value) -> Vec<ValidationError> + Send + Sync>;
pub type RecapFn =
    Box<dyn Fn(&serde_json::Value, &mut dyn ProgressLogger) -> anyhow::Result<Vec<serde_json::Value>> + Send + Sync>;
/// Returns the URL to redirect to once the action is done.
pub type ActionFn = Box<dyn Fn(&serde_json::Value, &mut dyn ProgressLogger) -> anyhow::Result<String> + Send + Sync>;

pub struct QuickSetup {
    id: String,
    title: String,
    validators: Vec<Validator>,
    recap: Option<RecapFn>,
    action: Option<ActionFn>,
}

impl std::fmt::Debug for QuickSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuickSetup")
            .field("id", &self.id)
            .field("validators", &self.validators.len())
            .field("recap", &self.recap.is_some())
            .field("action", &self.action.is_some())
            .finish()
    }
}

impl QuickSetup {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            validators: Vec::new(),
            recap: None,
            action: None,
        }
    }

    pub fn validator(mut self, v: impl Fn(&serde_json::Value) -> Vec<ValidationError> + Send + Sync + 'static) -> Self {
        self.validators.push(Box::new(v));
        self
    }

    pub fn recap(
        mut self,
        f: impl Fn(&serde_json::Value, &mut dyn ProgressLogger) -> anyhow::Result<Vec<serde_json::Value>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.recap = Some(Box::new(f));
        self
    }

    pub fn action(
        mut self,
        f: impl Fn(&serde_json::Value, &mut dyn ProgressLogger) -> anyhow::Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.action = Some(Box::new(f));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Validation, then recap or action. Errors of the recap/action steps propagate.
    pub fn execute(
        &self,
        mode: QuickSetupMode,
        form_data: &serde_json::Value,
        logger: &mut dyn ProgressLogger,
    ) -> anyhow::Result<QuickSetupResult> {
        let mut result = QuickSetupResult::default();

        logger.log_new_progress_step("validation", "Validating input");
        result.validation_errors = self.validators.iter().flat_map(|v| v(form_data)).collect();
        if !result.validation_errors.is_empty() {
            logger.update_progress_step_status("validation", StepStatus::Error);
            return Ok(result);
        }
        logger.update_progress_step_status("validation", StepStatus::Completed);

        match mode {
            QuickSetupMode::Stage => {
                let Some(recap) = &self.recap else {
                    result.recap = Some(Vec::new());
                    return Ok(result);
                };
                logger.log_new_progress_step("recap", "Computing recap");
                match recap(form_data, logger) {
                    Ok(widgets) => {
                        logger.update_progress_step_status("recap", StepStatus::Completed);
                        result.recap = Some(widgets);
                    }
                    Err(e) => {
                        logger.update_progress_step_status("recap", StepStatus::Error);
                        return Err(e);
                    }
                }
            }
            QuickSetupMode::Action => {
                let action = self
                    .action
                    .as_ref()
                    .with_context(|| format!("quick setup {} has no action", self.id))?;
                logger.log_new_progress_step("action", "Saving configuration");
                match action(form_data, logger) {
                    Ok(url) => {
                        logger.update_progress_step_status("action", StepStatus::Completed);
                        result.redirect_url = Some(url);
                    }
                    Err(e) => {
                        logger.update_progress_step_status("action", StepStatus::Error);
                        return Err(e);
                    }
                }
            }
        }
        Ok(result)
    }
}

/// Quick setups by id, built once at startup.
#[derive(Debug, Default)]
pub struct QuickSetupRegistry {
    setups: BTreeMap<String, Arc<QuickSetup>>,
}

impl QuickSetupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, setup: QuickSetup) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.setups.contains_key(setup.id()),
            "quick setup {:?} registered twice",
            setup.id()
        );
        self.setups.insert(setup.id().to_string(), Arc::new(setup));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<QuickSetup>> {
        self.setups.get(id).cloned()
    }
}

/// Job class running [`QuickSetupRequest`]s against a [`QuickSetupRegistry`].
#[derive(Debug, Clone)]
pub struct QuickSetupJobClass {
    setups: Arc<QuickSetupRegistry>,
}

impl QuickSetupJobClass {
    pub fn new(setups: Arc<QuickSetupRegistry>) -> Self {
        Self { setups }
    }
}

impl JobClass for QuickSetupJobClass {
    fn ident(&self) -> &str {
        JOB_CLASS_IDENT
    }

    fn job_prefix(&self) -> &str {
        JOB_PREFIX
    }

    fn gui_title(&self) -> String {
        "Quick setup".to_string()
    }

    fn run(&self, job: &BackgroundProcessInterface, args: &serde_json::Value) -> anyhow::Result<()> {
        let request: QuickSetupRequest =
            serde_json::from_value(args.clone()).context("decode quick setup request")?;
        let setup = self
            .setups
            .get(&request.quick_setup_id)
            .with_context(|| format!("unknown quick setup {:?}", request.quick_setup_id))?;

        let mut logger = JobProgressLogger::new(job);
        let outcome = setup.execute(request.mode, &request.form_data, &mut logger);
        let result = match &outcome {
            Ok(result) => result.clone(),
            Err(e) => QuickSetupResult {
                background_job_exception: Some(BackgroundJobException {
                    message: e.to_string(),
                    traceback: format!("{e:?}"),
                }),
                ..QuickSetupResult::default()
            },
        };
        let path = job.work_dir().join(RESULT_FILE);
        let body = serde_json::to_vec_pretty(&result).context("encode quick setup result")?;
        std::fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;

        outcome.map(|_| {
            job.send_result_message(&format!("{} ({}) done", setup.title(), request.mode.as_str()));
        })
    }
}

pub fn quick_setup_job_id(quick_setup_id: &str, mode: QuickSetupMode) -> String {
    format!("{JOB_PREFIX}{quick_setup_id}-{}", mode.as_str())
}

/// Start a quick setup run; poll the returned job, then [`load_quick_setup_result`].
pub fn start_quick_setup_job(
    engine: &Arc<JobEngine>,
    request: &QuickSetupRequest,
    user: Option<&str>,
) -> Result<BackgroundJob, JobError> {
    let job = engine.job(&quick_setup_job_id(&request.quick_setup_id, request.mode))?;
    let args = serde_json::to_value(request).map_err(|e| JobError::Serialize {
        what: "quick setup request",
        source: e,
    })?;
    job.start(
        JobTarget::new(JOB_CLASS_IDENT, args),
        InitialStatusArgs {
            title: format!("Quick setup {}", request.quick_setup_id),
            // A half-applied action is worse than a slow one.
            stoppable: request.mode == QuickSetupMode::Stage,
            user: user.map(str::to_string),
            ..InitialStatusArgs::default()
        },
    )?;
    Ok(job)
}

/// `None` while the job has not written a result (yet).
pub fn load_quick_setup_result(job: &BackgroundJob) -> anyhow::Result<Option<QuickSetupResult>> {
    let path = job.work_dir().join(RESULT_FILE);
    match std::fs::read(&path) {
        Ok(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .with_context(|| format!("parse {}", path.display())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bj::status::JobStatusStore;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder(Vec<(String, StepStatus)>);

    impl ProgressLogger for Recorder {
        fn log_new_progress_step(&mut self, step_name: &str, _title: &str) {
            self.0.push((step_name.to_string(), StepStatus::Active));
        }
        fn update_progress_step_status(&mut self, step_name: &str, status: StepStatus) {
            self.0.push((step_name.to_string(), status));
        }
    }

    fn host_setup() -> QuickSetup {
        QuickSetup::new("aws", "Amazon Web Services")
            .validator(|form| match form.get("host").and_then(|v| v.as_str()) {
                Some(h) if !h.is_empty() => Vec::new(),
                _ => vec![ValidationError::new(Some("host"), "host is required")],
            })
            .recap(|form, _| Ok(vec![json!({"text": format!("host {}", form["host"])})]))
            .action(|form, _| {
                anyhow::ensure!(form["host"] != "broken", "cannot save host");
                Ok("/setup/hosts".to_string())
            })
    }

    #[test]
    fn validation_errors_stop_the_pipeline() {
        let mut rec = Recorder::default();
        let result = host_setup()
            .execute(QuickSetupMode::Action, &json!({}), &mut rec)
            .unwrap();
        assert_eq!(result.validation_errors.len(), 1);
        assert_eq!(result.redirect_url, None);
        assert_eq!(
            rec.0,
            vec![
                ("validation".to_string(), StepStatus::Active),
                ("validation".to_string(), StepStatus::Error)
            ]
        );
    }

    #[test]
    fn stage_computes_recap_and_action_redirects() {
        let mut rec = Recorder::default();
        let setup = host_setup();
        let form = json!({"host": "srv01"});
        let stage = setup.execute(QuickSetupMode::Stage, &form, &mut rec).unwrap();
        assert_eq!(stage.recap.unwrap().len(), 1);

        let action = setup.execute(QuickSetupMode::Action, &form, &mut rec).unwrap();
        assert_eq!(action.redirect_url.as_deref(), Some("/setup/hosts"));

        let err = setup
            .execute(QuickSetupMode::Action, &json!({"host": "broken"}), &mut rec)
            .unwrap_err();
        assert!(err.to_string().contains("cannot save host"));
        assert_eq!(rec.0.last(), Some(&("action".to_string(), StepStatus::Error)));
    }

    #[test]
    fn progress_lines_parse_back_into_steps() {
        let dir = TempDir::new().unwrap();
        let iface = BackgroundProcessInterface::for_work_dir("quick_setup-x", dir.path()).unwrap();
        let mut logger = JobProgressLogger::new(&iface);
        logger.log_new_progress_step("validation", "Validating input");
        iface.send_progress_update("unrelated line", true);
        logger.update_progress_step_status("validation", StepStatus::Completed);
        logger.log_new_progress_step("action", "Saving");

        let lines = JobStatusStore::new(dir.path()).read_loginfo().progress_update;
        let steps = parse_progress_steps(&lines);
        assert_eq!(
            steps,
            vec![
                ProgressStep {
                    step_name: "validation".to_string(),
                    title: "Validating input".to_string(),
                    status: StepStatus::Completed,
                },
                ProgressStep {
                    step_name: "action".to_string(),
                    title: "Saving".to_string(),
                    status: StepStatus::Active,
                },
            ]
        );
    }

    #[test]
    fn job_class_writes_result_file_even_on_failure() {
        let dir = TempDir::new().unwrap();
        let mut setups = QuickSetupRegistry::new();
        setups.register(host_setup()).unwrap();
        assert!(setups.register(host_setup()).is_err());
        let class = QuickSetupJobClass::new(Arc::new(setups));
        let iface = BackgroundProcessInterface::for_work_dir("quick_setup-aws-action", dir.path()).unwrap();

        let args = serde_json::to_value(QuickSetupRequest {
            quick_setup_id: "aws".to_string(),
            mode: QuickSetupMode::Action,
            form_data: json!({"host": "broken"}),
        })
        .unwrap();
        assert!(class.run(&iface, &args).is_err());

        let raw = std::fs::read(dir.path().join(RESULT_FILE)).unwrap();
        let result: QuickSetupResult = serde_json::from_slice(&raw).unwrap();
        let exc = result.background_job_exception.unwrap();
        assert!(exc.message.contains("cannot save host"));
        assert!(result.redirect_url.is_none());
    }

    #[test]
    fn job_ids_are_valid_identifiers() {
        let id = quick_setup_job_id("aws", QuickSetupMode::Stage);
        assert_eq!(id, "quick_setup-aws-stage");
        assert!(BackgroundJob::validate_job_id(&id).is_ok());
    }
}
