//! Execution backends — run a check and deliver its output asynchronously.
//!
//! - `docker` — runs each check as a container through a [`docker::ContainerDriver`]
//! - `driver` — the bollard-backed driver talking to the local Docker daemon
//! - `addr` — discovery of the address checks use to call back the agent

pub mod addr;
pub mod docker;
pub mod driver;

use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::RunError;
use crate::job::JobParams;

pub use addr::agent_addr;
pub use docker::{ContainerDriver, ContainerSpec, DockerBackend, LogFrame};
pub use driver::DockerDriver;

/// Environment variables every check container receives.
pub const CHECK_ID_VAR: &str = "VULCAN_CHECK_ID";
pub const CHECKTYPE_NAME_VAR: &str = "VULCAN_CHECKTYPE_NAME";
pub const CHECKTYPE_VERSION_VAR: &str = "VULCAN_CHECKTYPE_VERSION";
pub const CHECK_TARGET_VAR: &str = "VULCAN_CHECK_TARGET";
pub const CHECK_ASSET_TYPE_VAR: &str = "VULCAN_CHECK_ASSET_TYPE";
pub const CHECK_OPTIONS_VAR: &str = "VULCAN_CHECK_OPTIONS";
pub const AGENT_ADDRESS_VAR: &str = "VULCAN_AGENT_ADDRESS";

/// Output of a run: combined stdout/stderr, or the reason it failed.
pub type RunResult = Result<Vec<u8>, RunError>;

/// Parameters of a single run, derived from [`JobParams`].
#[derive(Debug, Clone)]
pub struct RunParams {
    pub check_id: String,
    pub checktype_name: String,
    pub checktype_version: String,
    pub image: String,
    pub target: String,
    pub assettype: String,
    pub options: String,
    pub required_vars: Vec<String>,
    pub timeout: Duration,
}

impl RunParams {
    pub fn from_job(job: &JobParams, default_timeout: Duration) -> Self {
        let (checktype_name, checktype_version) = job.checktype();
        Self {
            check_id: job.check_id.clone(),
            checktype_name,
            checktype_version,
            image: job.image.clone(),
            target: job.target.clone(),
            assettype: job.assettype.clone(),
            options: job.options.clone(),
            required_vars: job.required_vars.clone(),
            timeout: job.effective_timeout(default_timeout),
        }
    }
}

/// Runs checks. `run` returns immediately; the result arrives exactly once
/// on the returned channel.
pub trait Backend: Send + Sync {
    fn run(&self, params: RunParams, cancel: CancellationToken) -> oneshot::Receiver<RunResult>;
}
