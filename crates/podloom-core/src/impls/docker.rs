//! Docker orchestrator backed by bollard.
//!
//! コンテナは `label` で引きます。1 インスタンスにつきコンテナは 1 つですが、
//! terminate / remove は同じ label を持つものをすべて対象にします。

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, instrument};

use crate::domain::LaunchSpec;
use crate::ports::{
    ContainerHandle, ContainerPhase, ContainerState, Label, Orchestrator, OrchestratorError,
};

impl From<DockerError> for OrchestratorError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::DockerResponseServerError {
                status_code: 404,
                message,
            } => OrchestratorError::NotFound(message),
            DockerError::DockerResponseServerError {
                status_code,
                message,
            } if status_code < 500 => OrchestratorError::Rejected(message),
            DockerError::RequestTimeoutError => OrchestratorError::Timeout,
            other => OrchestratorError::Unavailable(other.to_string()),
        }
    }
}

pub struct DockerOrchestrator {
    docker: Docker,
}

impl DockerOrchestrator {
    /// Connects through the platform default socket (`DOCKER_HOST` is honored).
    pub fn connect() -> Result<Self, OrchestratorError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn container_ids(&self, label: &Label) -> Result<Vec<String>, OrchestratorError> {
        let filters = HashMap::from([("label".to_string(), vec![label.to_string()])]);
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(summaries.into_iter().filter_map(|s| s.id).collect())
    }

    async fn pull(&self, image: &str) -> Result<(), OrchestratorError> {
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_for_each(|info| async move {
                if let Some(status) = info.status {
                    debug!(%status, "pull");
                }
                Ok::<(), DockerError>(())
            })
            .await?;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState, OrchestratorError> {
        let detail = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        let state = detail.state.unwrap_or_default();

        let phase = match state.status {
            _ if state.oom_killed == Some(true) => ContainerPhase::OomKilled,
            Some(ContainerStateStatusEnum::CREATED) => ContainerPhase::Placed,
            Some(
                ContainerStateStatusEnum::RUNNING
                | ContainerStateStatusEnum::PAUSED
                | ContainerStateStatusEnum::RESTARTING,
            ) => ContainerPhase::Running,
            Some(ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD) => {
                ContainerPhase::Exited {
                    code: state.exit_code.unwrap_or(-1),
                }
            }
            _ => ContainerPhase::Unknown,
        };
        let memory_bytes = match phase {
            ContainerPhase::Running => self.memory_usage(id).await,
            _ => None,
        };

        Ok(ContainerState {
            handle: ContainerHandle(id.to_string()),
            phase,
            memory_bytes,
        })
    }

    async fn memory_usage(&self, id: &str) -> Option<u64> {
        let mut stats = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        match stats.next().await {
            Some(Ok(sample)) => sample.memory_stats.usage,
            Some(Err(err)) => {
                debug!(container = id, error = %err, "memory stats unavailable");
                None
            }
            None => None,
        }
    }

    async fn remove_matching(&self, label: &Label, force: bool) -> Result<(), OrchestratorError> {
        for id in self.container_ids(label).await? {
            if !force {
                let state = self.inspect(&id).await?;
                if !matches!(
                    state.phase,
                    ContainerPhase::Exited { .. } | ContainerPhase::OomKilled
                ) {
                    continue;
                }
            }
            match self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(OrchestratorError::from)
            {
                Ok(()) | Err(OrchestratorError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    #[instrument(skip(self, spec), fields(image = %spec.image, label = %label))]
    async fn launch(
        &self,
        spec: &LaunchSpec,
        label: &Label,
    ) -> Result<ContainerHandle, OrchestratorError> {
        self.pull(&spec.image).await?;

        let host_config = HostConfig {
            memory: spec
                .memory_limit_bytes
                .map(|bytes| i64::try_from(bytes).unwrap_or(i64::MAX)),
            binds: spec
                .volume
                .as_ref()
                .map(|v| vec![format!("{}:{}", v.name, v.mount_path)]),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command_line()),
            working_dir: spec.working_dir.clone(),
            env: Some(spec.env()),
            labels: Some(HashMap::from([(
                label.key.clone(),
                label.value.clone(),
            )])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;
        debug!(container = %created.id, "container started");
        Ok(ContainerHandle(created.id))
    }

    async fn list(&self, label: &Label) -> Result<Vec<ContainerState>, OrchestratorError> {
        let mut states = Vec::new();
        for id in self.container_ids(label).await? {
            match self.inspect(&id).await {
                Ok(state) => states.push(state),
                // list と inspect の間に消えた
                Err(OrchestratorError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(states)
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<String, OrchestratorError> {
        let chunks: Vec<_> = self
            .docker
            .logs(
                &handle.0,
                Some(LogsOptions::<String> {
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            )
            .try_collect()
            .await?;
        Ok(chunks.iter().map(ToString::to_string).collect())
    }

    #[instrument(skip(self), fields(label = %label))]
    async fn terminate(&self, label: &Label) -> Result<(), OrchestratorError> {
        self.remove_matching(label, true).await
    }

    async fn remove(&self, label: &Label) -> Result<(), OrchestratorError> {
        self.remove_matching(label, false).await
    }
}
