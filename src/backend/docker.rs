//! Docker backend — runs each check as a container.
//!
//! Per check the backend walks `[pull] → create → start → wait → logs`, and
//! once the container exists it is always force-removed before the result is
//! delivered, whichever step failed. Job state lives only inside the spawned
//! run task, so concurrent checks share nothing but the driver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    AGENT_ADDRESS_VAR, Backend, CHECK_ASSET_TYPE_VAR, CHECK_ID_VAR, CHECK_OPTIONS_VAR,
    CHECK_TARGET_VAR, CHECKTYPE_NAME_VAR, CHECKTYPE_VERSION_VAR, RunParams, RunResult,
};
use crate::config::CheckVars;
use crate::error::{DriverError, RunError};
use crate::retry::Retryer;

/// Grace period given to a container stopped because its check was
/// cancelled or timed out.
pub const ABORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Container configuration built for one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub hostname: String,
    /// `NAME=value` entries.
    pub env: Vec<String>,
}

/// One demultiplexed chunk of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFrame {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Operations the backend needs from a container runtime.
#[async_trait]
pub trait ContainerDriver: Send + Sync + 'static {
    /// Create a container named `name`, returning its id.
    async fn create(&self, spec: &ContainerSpec, name: &str) -> Result<String, DriverError>;

    async fn start(&self, id: &str) -> Result<(), DriverError>;

    /// Block until the container exits, returning its exit code.
    async fn wait(&self, id: &str) -> Result<i64, DriverError>;

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), DriverError>;

    async fn remove(&self, id: &str, force: bool) -> Result<(), DriverError>;

    /// Stdout and stderr of the container, split into frames.
    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<LogFrame, DriverError>>;

    async fn pull(&self, image: &str) -> Result<(), DriverError>;
}

/// Backend running checks through a [`ContainerDriver`].
pub struct DockerBackend<D> {
    driver: Arc<D>,
    agent_addr: Arc<str>,
    check_vars: Arc<CheckVars>,
    /// Set when a private registry is configured; images are pulled first.
    pull_retryer: Option<Retryer>,
}

impl<D> Clone for DockerBackend<D> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            agent_addr: Arc::clone(&self.agent_addr),
            check_vars: Arc::clone(&self.check_vars),
            pull_retryer: self.pull_retryer.clone(),
        }
    }
}

impl<D: ContainerDriver> DockerBackend<D> {
    pub fn new(driver: Arc<D>, agent_addr: impl Into<String>, check_vars: CheckVars) -> Self {
        Self {
            driver,
            agent_addr: Arc::from(agent_addr.into()),
            check_vars: Arc::new(check_vars),
            pull_retryer: None,
        }
    }

    /// Pull every image before running it, retrying with `retryer`.
    pub fn with_pull(mut self, retryer: Retryer) -> Self {
        self.pull_retryer = Some(retryer);
        self
    }

    async fn run_check(&self, params: &RunParams, cancel: &CancellationToken) -> RunResult {
        if let Some(retryer) = &self.pull_retryer {
            let pull =
                retryer.with_retries_until("PullImage", cancel, || self.driver.pull(&params.image));
            let pulled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(params)),
                res = pull => res,
            };
            pulled.map_err(|source| RunError::Pull {
                check_id: params.check_id.clone(),
                image: params.image.clone(),
                source,
            })?;
        }

        // No container for a check aborted before it got one.
        if cancel.is_cancelled() {
            return Err(cancelled(params));
        }

        let spec = self.container_spec(params);
        let id = self
            .driver
            .create(&spec, &params.check_id)
            .await
            .map_err(|source| RunError::Create {
                check_id: params.check_id.clone(),
                source,
            })?;

        let result = self.run_container(&id, params, cancel).await;

        if let Err(e) = self.driver.remove(&id, true).await {
            error!(check_id = %params.check_id, error = %e, "Error removing container");
        }
        result
    }

    async fn run_container(
        &self,
        id: &str,
        params: &RunParams,
        cancel: &CancellationToken,
    ) -> RunResult {
        self.driver
            .start(id)
            .await
            .map_err(|source| RunError::Start {
                check_id: params.check_id.clone(),
                source,
            })?;

        let exit_code = tokio::select! {
            res = self.driver.wait(id) => res.map_err(|source| RunError::Wait {
                check_id: params.check_id.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                self.stop(id, &params.check_id).await;
                return Err(cancelled(params));
            }
            _ = tokio::time::sleep(params.timeout) => {
                self.stop(id, &params.check_id).await;
                return Err(RunError::Timeout {
                    check_id: params.check_id.clone(),
                    timeout: params.timeout,
                });
            }
        };
        debug!(check_id = %params.check_id, exit_code, "Container exited");

        read_container_logs(self.driver.logs(id))
            .await
            .map_err(|source| RunError::Logs {
                check_id: params.check_id.clone(),
                source,
            })
    }

    /// Stop request issued outside the check's cancellation.
    async fn stop(&self, id: &str, check_id: &str) {
        if let Err(e) = self.driver.stop(id, ABORT_TIMEOUT).await {
            warn!(check_id, error = %e, "Error stopping container");
        }
    }

    fn container_spec(&self, params: &RunParams) -> ContainerSpec {
        debug!(
            check_id = %params.check_id,
            required_vars = ?params.required_vars,
            "Fetching check variables from configuration"
        );
        let mut env = vec![
            format!("{CHECK_ID_VAR}={}", params.check_id),
            format!("{CHECKTYPE_NAME_VAR}={}", params.checktype_name),
            format!("{CHECKTYPE_VERSION_VAR}={}", params.checktype_version),
            format!("{CHECK_TARGET_VAR}={}", params.target),
            format!("{CHECK_ASSET_TYPE_VAR}={}", params.assettype),
            format!("{CHECK_OPTIONS_VAR}={}", params.options),
            format!("{AGENT_ADDRESS_VAR}={}", self.agent_addr),
        ];
        env.extend(check_env(&params.required_vars, &self.check_vars));

        ContainerSpec {
            image: params.image.clone(),
            hostname: params.check_id.clone(),
            env,
        }
    }
}

impl<D: ContainerDriver> Backend for DockerBackend<D> {
    fn run(&self, params: RunParams, cancel: CancellationToken) -> oneshot::Receiver<RunResult> {
        let (tx, rx) = oneshot::channel();
        let backend = self.clone();

        tokio::spawn(async move {
            info!(check_id = %params.check_id, image = %params.image, "Running check");
            let result = backend.run_check(&params, &cancel).await;
            if tx.send(result).is_err() {
                debug!(check_id = %params.check_id, "Run result receiver dropped");
            }
        });

        rx
    }
}

fn cancelled(params: &RunParams) -> RunError {
    RunError::Cancelled {
        check_id: params.check_id.clone(),
    }
}

/// Resolve required variables as `NAME=value`; unknown names get an empty value.
pub fn check_env(required_vars: &[String], vars: &CheckVars) -> Vec<String> {
    required_vars
        .iter()
        .map(|name| format!("{name}={}", vars.get(name).map(String::as_str).unwrap_or("")))
        .collect()
}

/// Split frames into stdout and stderr and join them with a newline.
pub async fn read_container_logs(
    mut frames: BoxStream<'_, Result<LogFrame, DriverError>>,
) -> Result<Vec<u8>, DriverError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Some(frame) = frames.next().await {
        match frame? {
            LogFrame::Stdout(bytes) => stdout.extend_from_slice(&bytes),
            LogFrame::Stderr(bytes) => stderr.extend_from_slice(&bytes),
        }
    }
    stdout.push(b'\n');
    stdout.extend_from_slice(&stderr);
    Ok(stdout)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, Clone, Copy)]
    enum WaitBehavior {
        Exit(i64),
        Block,
    }

    struct FakeDriver {
        calls: Mutex<Vec<&'static str>>,
        spec: Mutex<Option<ContainerSpec>>,
        wait: WaitBehavior,
        fail_create: bool,
        fail_start: bool,
        fail_logs: bool,
        pull_failures: AtomicU32,
        block_pull: bool,
    }

    impl FakeDriver {
        fn new(wait: WaitBehavior) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                spec: Mutex::new(None),
                wait,
                fail_create: false,
                fail_start: false,
                fail_logs: false,
                pull_failures: AtomicU32::new(0),
                block_pull: false,
            }
        }

        fn record(&self, op: &'static str) {
            self.calls.lock().unwrap().push(op);
        }

        fn count(&self, op: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| **c == op).count()
        }

        fn op_error(op: &'static str) -> DriverError {
            DriverError::Operation {
                operation: op,
                target: "c1".to_string(),
                message: "boom".to_string(),
            }
        }
    }

    #[async_trait]
    impl ContainerDriver for FakeDriver {
        async fn create(&self, spec: &ContainerSpec, _name: &str) -> Result<String, DriverError> {
            self.record("create");
            if self.fail_create {
                return Err(Self::op_error("create"));
            }
            *self.spec.lock().unwrap() = Some(spec.clone());
            Ok("container-1".to_string())
        }

        async fn start(&self, _id: &str) -> Result<(), DriverError> {
            self.record("start");
            if self.fail_start {
                return Err(Self::op_error("start"));
            }
            Ok(())
        }

        async fn wait(&self, _id: &str) -> Result<i64, DriverError> {
            self.record("wait");
            match self.wait {
                WaitBehavior::Exit(code) => Ok(code),
                WaitBehavior::Block => std::future::pending().await,
            }
        }

        async fn stop(&self, _id: &str, grace: Duration) -> Result<(), DriverError> {
            assert_eq!(grace, ABORT_TIMEOUT);
            self.record("stop");
            Ok(())
        }

        async fn remove(&self, _id: &str, force: bool) -> Result<(), DriverError> {
            assert!(force);
            self.record("remove");
            Ok(())
        }

        fn logs<'a>(&'a self, _id: &'a str) -> BoxStream<'a, Result<LogFrame, DriverError>> {
            self.record("logs");
            let mut frames = vec![
                Ok(LogFrame::Stdout(b"out-1 ".to_vec())),
                Ok(LogFrame::Stderr(b"err".to_vec())),
                Ok(LogFrame::Stdout(b"out-2".to_vec())),
            ];
            if self.fail_logs {
                frames.push(Err(Self::op_error("logs")));
            }
            futures::stream::iter(frames).boxed()
        }

        async fn pull(&self, _image: &str) -> Result<(), DriverError> {
            self.record("pull");
            if self.block_pull {
                std::future::pending::<()>().await;
            }
            let remaining = self.pull_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.pull_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Self::op_error("pull"));
            }
            Ok(())
        }
    }

    fn params() -> RunParams {
        RunParams {
            check_id: "c1".to_string(),
            checktype_name: "nmap".to_string(),
            checktype_version: "1.2".to_string(),
            image: "checks/nmap:1.2".to_string(),
            target: "example.com".to_string(),
            assettype: "Hostname".to_string(),
            options: "{}".to_string(),
            required_vars: vec!["TOKEN".to_string(), "MISSING".to_string()],
            timeout: Duration::from_secs(60),
        }
    }

    fn backend(driver: &Arc<FakeDriver>) -> DockerBackend<FakeDriver> {
        let vars = HashMap::from([("TOKEN".to_string(), "t0k".to_string())]);
        DockerBackend::new(Arc::clone(driver), "172.17.0.1:8080", vars)
    }

    #[tokio::test]
    async fn successful_run_concatenates_output_and_removes_once() {
        let driver = Arc::new(FakeDriver::new(WaitBehavior::Exit(0)));
        let rx = backend(&driver).run(params(), CancellationToken::new());

        let output = rx.await.unwrap().unwrap();
        assert_eq!(output, b"out-1 out-2\nerr".to_vec());
        assert_eq!(driver.count("remove"), 1);
        assert_eq!(driver.count("stop"), 0);
        assert_eq!(driver.count("pull"), 0);

        let spec = driver.spec.lock().unwrap().clone().unwrap();
        assert_eq!(spec.hostname, "c1");
        assert!(spec.env.contains(&"VULCAN_CHECK_ID=c1".to_string()));
        assert!(spec.env.contains(&"VULCAN_CHECKTYPE_NAME=nmap".to_string()));
        assert!(spec.env.contains(&"VULCAN_AGENT_ADDRESS=172.17.0.1:8080".to_string()));
        assert!(spec.env.contains(&"TOKEN=t0k".to_string()));
        assert!(spec.env.contains(&"MISSING=".to_string()));
    }

    #[tokio::test]
    async fn non_zero_exit_still_collects_logs() {
        let driver = Arc::new(FakeDriver::new(WaitBehavior::Exit(2)));
        let rx = backend(&driver).run(params(), CancellationToken::new());
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(driver.count("logs"), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_and_removes_container() {
        let driver = Arc::new(FakeDriver::new(WaitBehavior::Block));
        let token = CancellationToken::new();
        let rx = backend(&driver).run(params(), token.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, RunError::Cancelled { .. }));
        assert_eq!(driver.count("stop"), 1);
        assert_eq!(driver.count("remove"), 1);
        assert_eq!(driver.count("logs"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_stops_and_removes_container() {
        let driver = Arc::new(FakeDriver::new(WaitBehavior::Block));
        let mut p = params();
        p.timeout = Duration::from_secs(2);
        let rx = backend(&driver).run(p, CancellationToken::new());

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, RunError::Timeout { timeout, .. } if timeout == Duration::from_secs(2)));
        assert_eq!(driver.count("stop"), 1);
        assert_eq!(driver.count("remove"), 1);
    }

    #[tokio::test]
    async fn create_failure_needs_no_cleanup() {
        let mut driver = FakeDriver::new(WaitBehavior::Exit(0));
        driver.fail_create = true;
        let driver = Arc::new(driver);

        let err = backend(&driver)
            .run(params(), CancellationToken::new())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RunError::Create { .. }));
        assert_eq!(driver.count("remove"), 0);
    }

    #[tokio::test]
    async fn start_failure_removes_container() {
        let mut driver = FakeDriver::new(WaitBehavior::Exit(0));
        driver.fail_start = true;
        let driver = Arc::new(driver);

        let err = backend(&driver)
            .run(params(), CancellationToken::new())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RunError::Start { .. }));
        assert!(err.to_string().contains("c1"));
        assert_eq!(driver.count("remove"), 1);
    }

    #[tokio::test]
    async fn log_failure_fails_run_and_removes_container() {
        let mut driver = FakeDriver::new(WaitBehavior::Exit(0));
        driver.fail_logs = true;
        let driver = Arc::new(driver);

        let err = backend(&driver)
            .run(params(), CancellationToken::new())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RunError::Logs { .. }));
        assert_eq!(driver.count("remove"), 1);
    }

    #[tokio::test]
    async fn pull_is_retried_when_registry_configured() {
        let driver = FakeDriver::new(WaitBehavior::Exit(0));
        driver.pull_failures.store(2, Ordering::SeqCst);
        let driver = Arc::new(driver);

        let result = backend(&driver)
            .with_pull(Retryer::new(3, Duration::from_millis(1)))
            .run(params(), CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(driver.count("pull"), 3);
        assert_eq!(driver.count("create"), 1);
    }

    #[tokio::test]
    async fn exhausted_pull_fails_before_create() {
        let driver = FakeDriver::new(WaitBehavior::Exit(0));
        driver.pull_failures.store(10, Ordering::SeqCst);
        let driver = Arc::new(driver);

        let err = backend(&driver)
            .with_pull(Retryer::new(1, Duration::from_millis(1)))
            .run(params(), CancellationToken::new())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RunError::Pull { .. }));
        assert_eq!(driver.count("pull"), 2);
        assert_eq!(driver.count("create"), 0);
    }

    #[tokio::test]
    async fn aborted_before_pull_is_cancelled_without_container() {
        let driver = FakeDriver::new(WaitBehavior::Exit(0));
        driver.pull_failures.store(10, Ordering::SeqCst);
        let driver = Arc::new(driver);
        let token = CancellationToken::new();
        token.cancel();

        let err = backend(&driver)
            .with_pull(Retryer::new(5, Duration::from_millis(1)))
            .run(params(), token)
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RunError::Cancelled { .. }));
        assert!(err.is_cancellation());
        assert_eq!(driver.count("create"), 0);
        assert_eq!(driver.count("remove"), 0);
    }

    #[tokio::test]
    async fn cancel_during_pull_interrupts_it() {
        let mut driver = FakeDriver::new(WaitBehavior::Exit(0));
        driver.block_pull = true;
        let driver = Arc::new(driver);
        let token = CancellationToken::new();
        let rx = backend(&driver)
            .with_pull(Retryer::new(1, Duration::from_millis(1)))
            .run(params(), token.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(driver.count("pull"), 1);
        token.cancel();

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, RunError::Cancelled { .. }));
        assert_eq!(driver.count("create"), 0);
    }

    #[tokio::test]
    async fn empty_streams_still_join_with_newline() {
        let frames = futures::stream::empty().boxed();
        assert_eq!(read_container_logs(frames).await.unwrap(), b"\n".to_vec());
    }
}
