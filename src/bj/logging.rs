use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Filter directives, e.g. `CMK_JOBS_LOG=debug` or `CMK_JOBS_LOG=cmk_jobs=trace`.
pub const LOG_ENV: &str = "CMK_JOBS_LOG";

fn env_filter(default: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy()
}

pub fn init_cli_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(LevelFilter::WARN))
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

/// Worker processes log into their progress stream (stderr is redirected there), so no colors.
pub fn init_worker_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(LevelFilter::INFO))
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
