//! Shutdown coordinator — stops the agent on a signal or when the queue goes quiet.
//!
//! Whichever comes first, an operator signal or the idle tracker firing,
//! cancels the read loop once. The coordinator then drains in order: idle
//! tracker, queue reader (and every check it already dequeued), API listener.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{QueueError, ShutdownError};
use crate::queue::IdleOutcome;

/// Why the agent stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Signal,
    Idle,
}

/// HTTP server running in its own task with graceful shutdown.
pub struct ApiServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<io::Result<()>>,
}

impl ApiServer {
    /// Bind `addr` and start serving `router`.
    pub async fn bind(addr: SocketAddr, router: Router) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await
            })
        };

        info!(%local_addr, "API listening");
        Ok(Self {
            local_addr,
            shutdown,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait up to `timeout` for in-flight
    /// requests and the serve task.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<(), ShutdownError> {
        self.shutdown.cancel();
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Err(_) => {
                self.handle.abort();
                Err(ShutdownError::ListenerTimeout { timeout })
            }
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(ShutdownError::Server(e)),
            Ok(Err(e)) => Err(ShutdownError::Panicked {
                task: "api server",
                reason: e.to_string(),
            }),
        }
    }
}

/// Everything the coordinator stops, in drain order.
pub struct Coordinator {
    read_cancel: CancellationToken,
    idle: JoinHandle<IdleOutcome>,
    reader: JoinHandle<Result<(), QueueError>>,
    server: ApiServer,
    shutdown_timeout: Duration,
}

impl Coordinator {
    /// `read_cancel` must be the token both `idle` and `reader` were started with.
    pub fn new(
        read_cancel: CancellationToken,
        idle: JoinHandle<IdleOutcome>,
        reader: JoinHandle<Result<(), QueueError>>,
        server: ApiServer,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            read_cancel,
            idle,
            reader,
            server,
            shutdown_timeout,
        }
    }

    /// Wait for `signal` or idleness, then drain every component.
    ///
    /// Only an unclean listener shutdown is returned as an error; drain
    /// problems elsewhere are logged.
    pub async fn run<S>(self, signal: S) -> Result<StopReason, ShutdownError>
    where
        S: Future<Output = ()>,
    {
        let Self {
            read_cancel,
            mut idle,
            reader,
            server,
            shutdown_timeout,
        } = self;
        tokio::pin!(signal);

        let idle_outcome = tokio::select! {
            _ = &mut signal => None,
            outcome = &mut idle => Some(outcome),
        };
        let (reason, idle_done) = match idle_outcome {
            None => (StopReason::Signal, false),
            Some(Ok(IdleOutcome::Idle)) => (StopReason::Idle, true),
            Some(other) => {
                error!(outcome = ?other, "Idle tracker stopped unexpectedly");
                signal.await;
                (StopReason::Signal, true)
            }
        };
        info!(?reason, "Stopping queue reading");
        read_cancel.cancel();

        if !idle_done && let Err(e) = idle.await {
            error!(error = %e, "Idle tracker task failed");
        }

        match reader.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => error!(error = %e, "Queue reader finished with error"),
            Err(e) => error!(error = %e, "Queue reader task failed"),
        }

        server.shutdown(shutdown_timeout).await?;
        info!("Agent stopped");
        Ok(reason)
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::routing::get;

    use super::*;
    use crate::queue::{Message, MessageSource, QueueReader};
    use crate::report::CheckStatus;
    use crate::runner::tests::{Outcome, RecordingReporter, ScriptedBackend, job_message, runner};

    /// Hands out a single message, then stays empty.
    struct OneShotSource(std::sync::Mutex<Option<Message>>);

    #[async_trait]
    impl MessageSource for OneShotSource {
        async fn receive(&self) -> Result<Option<Message>, QueueError> {
            Ok(self.0.lock().unwrap().take())
        }

        async fn delete(&self, _message: &Message) -> Result<(), QueueError> {
            Ok(())
        }
    }

    async fn coordinator(
        outcome: Outcome,
        max_idle: Duration,
    ) -> (Coordinator, SocketAddr, Arc<RecordingReporter>) {
        let router = Router::new().route("/health", get(|| async { "ok" }));
        coordinator_with(outcome, max_idle, router, Duration::from_secs(5)).await
    }

    async fn coordinator_with(
        outcome: Outcome,
        max_idle: Duration,
        router: Router,
        shutdown_timeout: Duration,
    ) -> (Coordinator, SocketAddr, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::default());
        let runner = Arc::new(runner(
            Arc::new(ScriptedBackend::new(outcome)),
            reporter.clone(),
            2,
        ));
        let source = Arc::new(OneShotSource(std::sync::Mutex::new(Some(job_message("c1")))));
        let reader = QueueReader::new(source, runner).with_poll_interval(Duration::from_millis(5));

        let cancel = CancellationToken::new();
        let idle = tokio::spawn(reader.idle_tracker(max_idle).track(cancel.clone()));
        let reader = reader.start_reading(cancel.clone());

        let server = ApiServer::bind("127.0.0.1:0".parse().unwrap(), router)
            .await
            .unwrap();
        let addr = server.local_addr();

        (
            Coordinator::new(cancel, idle, reader, server, shutdown_timeout),
            addr,
            reporter,
        )
    }

    #[tokio::test]
    async fn stops_when_idle_and_closes_listener() {
        let (coordinator, addr, reporter) =
            coordinator(Outcome::Output, Duration::from_millis(100)).await;

        let reason = coordinator.run(std::future::pending()).await.unwrap();

        assert_eq!(reason, StopReason::Idle);
        assert_eq!(reporter.statuses().last(), Some(&CheckStatus::Finished));
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn signal_drains_running_check() {
        let (coordinator, addr, reporter) = coordinator(
            Outcome::Sleep(Duration::from_millis(200)),
            Duration::from_secs(3600),
        )
        .await;

        let body = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");

        let signal = tokio::time::sleep(Duration::from_millis(50));
        let reason = coordinator.run(signal).await.unwrap();

        assert_eq!(reason, StopReason::Signal);
        assert_eq!(
            reporter.statuses(),
            vec![CheckStatus::Running, CheckStatus::Finished]
        );
    }

    #[tokio::test]
    async fn stuck_request_makes_shutdown_unclean() {
        let entered = Arc::new(tokio::sync::Notify::new());
        let router = {
            let entered = Arc::clone(&entered);
            Router::new().route(
                "/stuck",
                get(move || {
                    let entered = Arc::clone(&entered);
                    async move {
                        entered.notify_one();
                        std::future::pending::<()>().await;
                    }
                }),
            )
        };
        let timeout = Duration::from_millis(100);
        let (coordinator, addr, _reporter) =
            coordinator_with(Outcome::Output, Duration::from_secs(3600), router, timeout).await;

        let request = tokio::spawn(reqwest::get(format!("http://{addr}/stuck")));
        entered.notified().await;

        let err = coordinator.run(std::future::ready(())).await.unwrap_err();
        assert!(matches!(err, ShutdownError::ListenerTimeout { timeout: t } if t == timeout));
        request.abort();
    }
}
