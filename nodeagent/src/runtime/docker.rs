//! Docker backend: one container per instance, attached to a pre-existing
//! regional bridge network with a static address.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::service::{EndpointIpamConfig, EndpointSettings, HostConfig};
use bollard::Docker;
use futures::{stream, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    InstanceSpec, InstanceState, LogLines, Runtime, RuntimeError, RuntimeInstance,
    INSTANCE_ID_LABEL, MANAGED_LABEL,
};

const STOP_GRACE_SECS: i64 = 10;

pub struct DockerRuntime {
    docker: Docker,
    network: String,
    credentials: Option<DockerCredentials>,
}

impl DockerRuntime {
    /// Connect to the local daemon and remember the registry login used for
    /// pulls. The bridge network must already exist on the host.
    pub fn new(
        network: String,
        registry_host: &str,
        registry_username: &str,
        registry_password: &str,
    ) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;

        let credentials = if registry_username.is_empty() {
            None
        } else {
            Some(DockerCredentials {
                username: Some(registry_username.to_string()),
                password: Some(registry_password.to_string()),
                serveraddress: Some(registry_host.to_string()),
                ..Default::default()
            })
        };

        Ok(Self {
            docker,
            network,
            credentials,
        })
    }

    fn container_name(instance_id: Uuid) -> String {
        format!("zeitwork-{instance_id}")
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        debug!(image, "pulling image");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                self.credentials.clone(),
            )
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    fn summary_to_instance(
        network: &str,
        summary: &bollard::service::ContainerSummary,
    ) -> Option<RuntimeInstance> {
        let labels = summary.labels.as_ref()?;
        let instance_id = labels.get(INSTANCE_ID_LABEL)?.parse().ok()?;

        let ip = summary
            .network_settings
            .as_ref()
            .and_then(|settings| settings.networks.as_ref())
            .and_then(|networks| networks.get(network))
            .and_then(|endpoint| endpoint.ip_address.as_deref())
            .and_then(|ip| ip.parse::<IpAddr>().ok());

        let state = match summary.state.as_deref() {
            Some("running") => InstanceState::Running,
            Some("exited") | Some("dead") | Some("created") => InstanceState::Exited,
            _ => InstanceState::Unknown,
        };

        Some(RuntimeInstance {
            runtime_id: summary.id.clone().unwrap_or_default(),
            instance_id,
            image: summary.image.clone().unwrap_or_default(),
            state,
            ip,
        })
    }

    fn is_not_found(error: &bollard::errors::Error) -> bool {
        matches!(
            error,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }
        )
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn start(&self, spec: &InstanceSpec) -> Result<(), RuntimeError> {
        if let Some(existing) = self.status(spec.id).await? {
            if existing.state == InstanceState::Running {
                debug!(instance = %spec.id, "already running");
                return Ok(());
            }
            // A dead leftover from an earlier attempt; clear it first.
            self.docker
                .remove_container(
                    &existing.runtime_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await?;
        }

        self.pull(&spec.image).await?;

        let name = Self::container_name(spec.id);

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(INSTANCE_ID_LABEL.to_string(), spec.id.to_string());

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();

        let mut endpoints = HashMap::new();
        endpoints.insert(
            self.network.clone(),
            EndpointSettings {
                ipam_config: Some(EndpointIpamConfig {
                    ipv4_address: spec.ip.map(|ip| ip.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(HostConfig {
                network_mode: Some(self.network.clone()),
                nano_cpus: Some(spec.vcpus as i64 * 1_000_000_000),
                memory: Some(spec.memory_mb as i64 * 1024 * 1024),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    ..Default::default()
                }),
                config,
            )
            .await?;
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await?;

        info!(instance = %spec.id, image = %spec.image, "container started");
        Ok(())
    }

    async fn stop(&self, instance_id: Uuid) -> Result<(), RuntimeError> {
        let name = Self::container_name(instance_id);

        match self
            .docker
            .stop_container(&name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => {}
            Err(error) if Self::is_not_found(&error) => {
                debug!(instance = %instance_id, "container already gone");
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        }

        match self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {}
            Err(error) if Self::is_not_found(&error) => {}
            Err(error) => warn!(
                instance = %instance_id,
                error = &error as &dyn std::error::Error,
                "container stopped but could not be removed"
            ),
        }

        info!(instance = %instance_id, "container stopped");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RuntimeInstance>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        );

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(summaries
            .iter()
            .filter_map(|summary| Self::summary_to_instance(&self.network, summary))
            .collect())
    }

    async fn status(&self, instance_id: Uuid) -> Result<Option<RuntimeInstance>, RuntimeError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|instance| instance.instance_id == instance_id))
    }

    async fn logs(&self, instance_id: Uuid, follow: bool) -> Result<LogLines, RuntimeError> {
        let name = Self::container_name(instance_id);

        let stream = self.docker.logs(
            &name,
            Some(LogsOptions::<String> {
                follow,
                stdout: true,
                stderr: true,
                tail: "all".to_string(),
                ..Default::default()
            }),
        );

        Ok(Box::pin(stream.flat_map(|chunk| {
            stream::iter(match chunk {
                Ok(output) => chunk_lines(&output),
                Err(error) => vec![Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    error.to_string(),
                ))],
            })
        })))
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

fn chunk_lines(output: &LogOutput) -> Vec<std::io::Result<String>> {
    let text = match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message }
        | LogOutput::StdIn { message } => String::from_utf8_lossy(message).into_owned(),
    };

    text.lines()
        .filter(|line| !line.is_empty())
        .map(|line| Ok(line.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_embed_the_instance_id() {
        let id = Uuid::from_u128(7);
        assert_eq!(
            DockerRuntime::container_name(id),
            format!("zeitwork-{id}")
        );
    }

    #[test]
    fn multi_line_chunks_split_into_lines() {
        let output = LogOutput::StdOut {
            message: b"one\ntwo\n\nthree\n".to_vec().into(),
        };

        let lines: Vec<String> = chunk_lines(&output).into_iter().map(Result::unwrap).collect();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }
}
