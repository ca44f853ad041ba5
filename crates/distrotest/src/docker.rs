//! Container runtime client.
//!
//! Every runtime call goes through the object-safe [`ContainerRuntime`]
//! trait so tests can substitute a recording implementation; the
//! production implementation wraps a `bollard::Docker` connection.
//! [`DockerClient`] layers the domain operations the tests need on top
//! of the raw trait.

use crate::error::TestError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, ListImagesOptions};
use bollard::models::{BuildInfo, ContainerCreateResponse, ContainerInspectResponse, ImageSummary};
use bollard::Docker;
use futures::{Stream, StreamExt};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

pub type BuildStream<'a> = Pin<Box<dyn Stream<Item = Result<BuildInfo, DockerError>> + Send + 'a>>;
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<LogOutput, DockerError>> + Send>>;

/// The container runtime API surface the tests require.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), DockerError>;
    async fn list_images(&self) -> Result<Vec<ImageSummary>, DockerError>;
    fn build_image_stream(
        &self,
        options: BuildImageOptions<String>,
        context: Vec<u8>,
    ) -> BuildStream<'_>;
    async fn create_container(
        &self,
        options: CreateContainerOptions<String>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError>;
    async fn start_container(&self, name: &str) -> Result<(), DockerError>;
    async fn inspect_container(&self, name: &str)
        -> Result<ContainerInspectResponse, DockerError>;
    async fn kill_container(&self, name: &str) -> Result<(), DockerError>;
    async fn wait_container(&self, name: &str) -> Result<(), DockerError>;
    async fn remove_container(
        &self,
        name: &str,
        options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError>;
    async fn create_exec(
        &self,
        container: &str,
        options: CreateExecOptions<String>,
    ) -> Result<String, DockerError>;
    async fn start_exec_stream(&self, exec_id: &str) -> Result<OutputStream, DockerError>;
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, DockerError>;
    fn logs_stream(&self, name: &str, options: LogsOptions<String>) -> OutputStream;
}

struct BollardRuntime {
    docker: Docker,
}

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn ping(&self) -> Result<(), DockerError> {
        self.docker.ping().await.map(|_| ())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, DockerError> {
        self.docker
            .list_images(Some(ListImagesOptions::<String>::default()))
            .await
    }

    fn build_image_stream(
        &self,
        options: BuildImageOptions<String>,
        context: Vec<u8>,
    ) -> BuildStream<'_> {
        Box::pin(self.docker.build_image(options, None, Some(context.into())))
    }

    async fn create_container(
        &self,
        options: CreateContainerOptions<String>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError> {
        self.docker.create_container(Some(options), config).await
    }

    async fn start_container(&self, name: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
    }

    async fn inspect_container(
        &self,
        name: &str,
    ) -> Result<ContainerInspectResponse, DockerError> {
        self.docker.inspect_container(name, None).await
    }

    async fn kill_container(&self, name: &str) -> Result<(), DockerError> {
        self.docker
            .kill_container(name, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
    }

    async fn wait_container(&self, name: &str) -> Result<(), DockerError> {
        let mut wait = self
            .docker
            .wait_container(name, None::<WaitContainerOptions<String>>);
        while let Some(result) = wait.next().await {
            match result {
                Ok(_) => {}
                // A killed container reports its non-zero exit status
                // as a wait error; stopping only cares that the
                // container is no longer running.
                Err(DockerError::DockerContainerWaitError { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn remove_container(
        &self,
        name: &str,
        options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError> {
        self.docker.remove_container(name, options).await
    }

    async fn create_exec(
        &self,
        container: &str,
        options: CreateExecOptions<String>,
    ) -> Result<String, DockerError> {
        self.docker
            .create_exec(container, options)
            .await
            .map(|results| results.id)
    }

    async fn start_exec_stream(&self, exec_id: &str) -> Result<OutputStream, DockerError> {
        match self.docker.start_exec(exec_id, None).await? {
            StartExecResults::Attached { output, .. } => Ok(Box::pin(output)),
            StartExecResults::Detached => Ok(Box::pin(futures::stream::empty())),
        }
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, DockerError> {
        Ok(self.docker.inspect_exec(exec_id).await?.exit_code)
    }

    fn logs_stream(&self, name: &str, options: LogsOptions<String>) -> OutputStream {
        Box::pin(self.docker.logs(name, Some(options)))
    }
}

/// Runtime client exposing the operations the distribution tests use.
#[derive(Clone)]
pub struct DockerClient {
    runtime: Arc<dyn ContainerRuntime>,
}

impl DockerClient {
    /// Connect to the local runtime endpoint and verify it responds.
    pub async fn connect() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        let runtime = Arc::new(BollardRuntime { docker });
        runtime.ping().await?;
        info!("Connected to container runtime");
        Ok(Self { runtime })
    }

    /// Construct a client over a custom runtime implementation.
    pub fn with_runtime(runtime: impl ContainerRuntime + 'static) -> Self {
        Self {
            runtime: Arc::new(runtime),
        }
    }

    /// Tag names of every image the runtime currently holds.
    pub async fn image_tags(&self) -> Result<Vec<String>, DockerError> {
        Ok(self
            .runtime
            .list_images()
            .await?
            .into_iter()
            .flat_map(|image| image.repo_tags)
            .collect())
    }

    /// Build an image from a context directory, tagged with `tag`.
    ///
    /// The directory is packed whole into a tar archive and shipped to
    /// the runtime; the Dockerfile is expected at the context root.
    /// Progress lines go to debug logging; an error entry in the build
    /// stream aborts with [`TestError::Build`].
    pub async fn build_image(&self, context: &Path, tag: &str) -> Result<(), TestError> {
        let mut archive = tar::Builder::new(Vec::new());
        archive.append_dir_all(".", context)?;
        let context = archive.into_inner()?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut build = self.runtime.build_image_stream(options, context);
        while let Some(update) = build.next().await {
            let update = update.map_err(|e| TestError::Build(e.to_string()))?;
            if let Some(error) = update.error {
                return Err(TestError::Build(error));
            }
            if let Some(line) = update.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(tag = %tag, "{line}");
                }
            }
        }
        Ok(())
    }

    /// Create a container named `name` from `image`, replacing any
    /// pre-existing container of the same name.
    pub async fn create_or_replace(&self, name: &str, image: &str) -> Result<(), DockerError> {
        match self.remove_container(name).await {
            Ok(()) => {}
            // nothing to replace
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(e),
        }
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let config = Config {
            image: Some(image.to_string()),
            ..Default::default()
        };
        self.runtime
            .create_container(options, config)
            .await
            .map(|_| ())
    }

    pub async fn start_container(&self, name: &str) -> Result<(), DockerError> {
        self.runtime.start_container(name).await
    }

    /// Whether the named container is in a running state.
    pub async fn is_running(&self, name: &str) -> Result<bool, DockerError> {
        let inspect = self.runtime.inspect_container(name).await?;
        Ok(inspect
            .state
            .and_then(|state| state.running)
            .unwrap_or(false))
    }

    /// Start an exec session in `container` and stream its combined
    /// stdout/stderr output.
    pub async fn exec_streamed(
        &self,
        container: &str,
        cmd: Vec<String>,
        env: Vec<String>,
    ) -> Result<(String, OutputStream), DockerError> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec_id = self.runtime.create_exec(container, options).await?;
        let output = self.runtime.start_exec_stream(&exec_id).await?;
        Ok((exec_id, output))
    }

    /// Exit code of a finished exec session; zero when the runtime
    /// reports none.
    pub async fn exec_exit_code(&self, exec_id: &str) -> Result<i64, DockerError> {
        Ok(self.runtime.exec_exit_code(exec_id).await?.unwrap_or(0))
    }

    pub async fn kill_container(&self, name: &str) -> Result<(), DockerError> {
        self.runtime.kill_container(name).await
    }

    pub async fn wait_container(&self, name: &str) -> Result<(), DockerError> {
        self.runtime.wait_container(name).await
    }

    /// Force-remove the named container.
    pub async fn remove_container(&self, name: &str) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.runtime.remove_container(name, Some(options)).await
    }

    /// Historical stdout+stderr of a container, collected into one
    /// string for diagnostics.
    pub async fn container_logs(&self, name: &str) -> Result<String, DockerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.runtime.logs_stream(name, options);
        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            logs.push_str(&String::from_utf8_lossy(&chunk?.into_bytes()));
        }
        Ok(logs)
    }
}
