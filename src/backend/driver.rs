//! Container driver backed by the local Docker daemon through bollard.

use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
    WaitContainerOptions,
};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use secrecy::ExposeSecret;
use tracing::{debug, info};

use super::docker::{ContainerDriver, ContainerSpec, LogFrame};
use crate::config::RegistryConfig;
use crate::error::DriverError;

/// Driver talking to the Docker daemon.
pub struct DockerDriver {
    docker: Docker,
    credentials: Option<DockerCredentials>,
}

impl DockerDriver {
    /// Connect using the local defaults (`DOCKER_HOST` or the unix socket).
    pub fn connect(registry: &RegistryConfig) -> Result<Self, DriverError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| DriverError::Connect {
            message: e.to_string(),
        })?;
        Ok(Self {
            docker,
            credentials: registry_credentials(registry),
        })
    }
}

fn registry_credentials(registry: &RegistryConfig) -> Option<DockerCredentials> {
    let server = registry.server.as_ref()?;
    Some(DockerCredentials {
        username: Some(registry.user.clone()),
        password: Some(registry.pass.expose_secret().to_string()),
        serveraddress: Some(server.clone()),
        ..Default::default()
    })
}

/// Split an image reference into repository and tag.
///
/// A colon inside the registry host (`registry:5000/app`) is not a tag, and
/// digest references are pulled as a whole.
fn split_image_tag(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag)),
        _ => (image, None),
    }
}

fn is_not_found_error(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn operation_error(operation: &'static str, target: &str, source: BollardError) -> DriverError {
    if is_not_found_error(&source) {
        return DriverError::NotFound {
            target: target.to_string(),
        };
    }
    DriverError::Operation {
        operation,
        target: target.to_string(),
        message: source.to_string(),
    }
}

fn log_frame(item: Result<LogOutput, BollardError>, target: &str) -> Option<Result<LogFrame, DriverError>> {
    match item {
        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
            Some(Ok(LogFrame::Stdout(message.to_vec())))
        }
        Ok(LogOutput::StdErr { message }) => Some(Ok(LogFrame::Stderr(message.to_vec()))),
        Ok(LogOutput::StdIn { .. }) => None,
        Err(e) => Some(Err(operation_error("logs", target, e))),
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn create(&self, spec: &ContainerSpec, name: &str) -> Result<String, DriverError> {
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            env: Some(spec.env.clone()),
            ..ContainerCreateBody::default()
        };
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(name).build()),
                body,
            )
            .await
            .map_err(|e| operation_error("create_container", name, e))?;
        debug!(container = %created.id, name, "Container created");
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), DriverError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| operation_error("start_container", id, e))
    }

    async fn wait(&self, id: &str) -> Result<i64, DriverError> {
        let mut responses = self.docker.wait_container(id, None::<WaitContainerOptions>);
        match responses.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as errors; the check still ran.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(operation_error("wait_container", id, e)),
            None => Err(DriverError::Operation {
                operation: "wait_container",
                target: id.to_string(),
                message: "wait stream ended without a status".to_string(),
            }),
        }
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), DriverError> {
        let t = i32::try_from(grace.as_secs()).unwrap_or(i32::MAX);
        self.docker
            .stop_container(id, Some(StopContainerOptionsBuilder::new().t(t).build()))
            .await
            .map_err(|e| operation_error("stop_container", id, e))
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), DriverError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptionsBuilder::new().force(force).build()),
            )
            .await
            .map_err(|e| operation_error("remove_container", id, e))
    }

    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<LogFrame, DriverError>> {
        let options = LogsOptionsBuilder::new().stdout(true).stderr(true).build();
        self.docker
            .logs(id, Some(options))
            .filter_map(move |item| futures::future::ready(log_frame(item, id)))
            .boxed()
    }

    async fn pull(&self, image: &str) -> Result<(), DriverError> {
        let (from_image, tag) = split_image_tag(image);
        let mut options = CreateImageOptionsBuilder::new().from_image(from_image);
        if let Some(tag) = tag {
            options = options.tag(tag);
        }
        info!(image, "Pulling image");
        self.docker
            .create_image(Some(options.build()), None, self.credentials.clone())
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| operation_error("pull_image", image, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    #[test]
    fn splits_tags_but_not_registry_ports() {
        assert_eq!(split_image_tag("nmap:1.2"), ("nmap", Some("1.2")));
        assert_eq!(
            split_image_tag("registry.local:5000/checks/nmap:1.2"),
            ("registry.local:5000/checks/nmap", Some("1.2"))
        );
        assert_eq!(
            split_image_tag("registry.local:5000/checks/nmap"),
            ("registry.local:5000/checks/nmap", None)
        );
        assert_eq!(split_image_tag("nmap@sha256:abcd"), ("nmap@sha256:abcd", None));
    }

    #[test]
    fn credentials_only_with_registry_server() {
        assert!(registry_credentials(&RegistryConfig::default()).is_none());

        let registry = RegistryConfig {
            server: Some("registry.local".to_string()),
            user: "agent".to_string(),
            pass: SecretString::from("pw".to_string()),
            ..RegistryConfig::default()
        };
        let creds = registry_credentials(&registry).unwrap();
        assert_eq!(creds.serveraddress.as_deref(), Some("registry.local"));
        assert_eq!(creds.username.as_deref(), Some("agent"));
        assert_eq!(creds.password.as_deref(), Some("pw"));
    }

    #[test]
    fn not_found_maps_to_permanent_error() {
        let err = operation_error(
            "pull_image",
            "nmap",
            BollardError::DockerResponseServerError {
                status_code: 404,
                message: "no such image".to_string(),
            },
        );
        assert!(matches!(err, DriverError::NotFound { .. }));
    }

    #[test]
    fn stdin_frames_are_skipped() {
        let frame = log_frame(
            Ok(LogOutput::StdIn {
                message: "x".into(),
            }),
            "c",
        );
        assert!(frame.is_none());
        let frame = log_frame(
            Ok(LogOutput::Console {
                message: "tty".into(),
            }),
            "c",
        );
        assert!(matches!(frame, Some(Ok(LogFrame::Stdout(ref b))) if b == b"tty"));
    }
}
