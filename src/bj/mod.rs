pub mod build_info;
pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod interface;
pub mod job;
pub mod liveness;
pub mod lock;
pub mod logging;
pub mod manager;
pub mod process;
pub mod quick_setup;
pub mod registry;
pub mod status;

pub use error::JobError;
pub use interface::BackgroundProcessInterface;
pub use identity::{LocalUser, Permission, StaticUser, UserContext};
pub use job::{BackgroundJob, InitialStatusArgs, JobEngine};
pub use manager::BackgroundJobManager;
pub use process::{JobTarget, Terminated, WorkerCommand};
pub use registry::{JobClass, JobRegistry};
pub use status::{JobState, JobStatus, JobStatusStore, StatusSnapshot, StatusUpdate};

pub fn main() -> anyhow::Result<()> {
    cli::run()
}
