use std::ffi::OsStr;
use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use scan_agent::aborted::AbortedChecks;
use scan_agent::api::{ApiState, api_routes};
use scan_agent::backend::{DockerBackend, DockerDriver, agent_addr};
use scan_agent::config::{AgentConfig, AgentSettings};
use scan_agent::error::{Error, ShutdownError};
use scan_agent::queue::{QueueReader, StdinSource};
use scan_agent::report::HttpReporter;
use scan_agent::runner::{JobRunner, RunnerDeps};
use scan_agent::shutdown::{ApiServer, Coordinator, StopReason, wait_for_signal};

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match AgentSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Flushes buffered file logs on drop.
    let _guard = init_tracing(&settings.agent);

    eprintln!("🛰️  Scan agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Concurrent jobs: {}", settings.agent.concurrent_jobs);
    eprintln!("   API: http://0.0.0.0:{}", settings.api.port);

    match run(settings).await {
        Ok(reason) => {
            info!(?reason, "Exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Agent failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &AgentConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match &config.log_file {
        Some(file) => {
            let path = Path::new(file);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path.file_name().unwrap_or(OsStr::new("scan-agent.log"));
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

async fn run(settings: AgentSettings) -> Result<StopReason, Error> {
    let addr = agent_addr(&settings.api.iface, settings.api.port)?;
    info!(agent_address = %addr, "Resolved agent address");

    // ── Backend ─────────────────────────────────────────────────────────
    let driver = Arc::new(DockerDriver::connect(&settings.registry)?);
    let mut backend = DockerBackend::new(driver, addr, settings.check_vars.clone());
    if settings.registry.server.is_some() {
        backend = backend.with_pull(settings.registry.pull_retryer());
    }

    // ── Collaborators ───────────────────────────────────────────────────
    let retryer = settings.retry.retryer();
    let aborted = settings
        .aborted_checks_url
        .as_deref()
        .map(|url| AbortedChecks::new(url, retryer.clone()))
        .transpose()?
        .map(Arc::new);
    let reporter = Arc::new(HttpReporter::new(&settings.report, retryer)?);

    let runner = Arc::new(JobRunner::new(
        RunnerDeps {
            backend: Arc::new(backend),
            aborted,
            state: reporter.clone(),
            uploader: reporter,
        },
        settings.agent.concurrent_jobs,
        settings.agent.default_timeout,
        CancellationToken::new(),
    ));

    // ── Intake and API ──────────────────────────────────────────────────
    let reader = QueueReader::new(Arc::new(StdinSource::new()), Arc::clone(&runner));
    let router = api_routes(ApiState {
        runner,
        activity: reader.activity(),
    });
    let server = ApiServer::bind(SocketAddr::from(([0, 0, 0, 0], settings.api.port)), router)
        .await
        .map_err(ShutdownError::Server)?;

    let cancel = CancellationToken::new();
    let idle = tokio::spawn(
        reader
            .idle_tracker(settings.agent.max_no_msgs_interval)
            .track(cancel.clone()),
    );
    let reader = reader.start_reading(cancel.clone());

    let coordinator = Coordinator::new(cancel, idle, reader, server, settings.api.shutdown_timeout);
    Ok(coordinator.run(wait_for_signal()).await?)
}
