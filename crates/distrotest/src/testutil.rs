//! Recording [`ContainerRuntime`] used across the crate's tests.

use crate::docker::{BuildStream, ContainerRuntime, OutputStream};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::CreateExecOptions;
use bollard::models::{
    BuildInfo, ContainerCreateResponse, ContainerInspectResponse, ContainerState, ImageSummary,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn server_error(status_code: u16, message: &str) -> DockerError {
    DockerError::DockerResponseServerError {
        status_code,
        message: message.to_string(),
    }
}

#[derive(Default)]
struct Inner {
    operations: Mutex<Vec<String>>,
    images: Mutex<Vec<String>>,
    build_error: Mutex<Option<String>>,
    list_error: Mutex<bool>,
    running: Mutex<bool>,
    container_logs: Mutex<String>,
    exec_outputs: Mutex<VecDeque<Vec<String>>>,
    exec_exit_codes: Mutex<VecDeque<i64>>,
    exec_stream_error: Mutex<bool>,
    missing_container: Mutex<bool>,
    kill_error: Mutex<bool>,
    exec_ids: AtomicUsize,
}

/// In-memory runtime that records every call and plays back scripted
/// exec output. Clones share state, so a test can keep a handle for
/// assertions after moving one into a [`DockerClient`].
///
/// [`DockerClient`]: crate::docker::DockerClient
#[derive(Clone)]
pub(crate) struct MockRuntime {
    inner: Arc<Inner>,
}

impl MockRuntime {
    pub(crate) fn new() -> Self {
        let inner = Inner::default();
        *inner.running.lock() = true;
        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn add_image(&self, tag: &str) {
        self.inner.images.lock().push(tag.to_string());
    }

    pub(crate) fn set_build_error(&self, message: &str) {
        *self.inner.build_error.lock() = Some(message.to_string());
    }

    /// Make image listings fail with a server error.
    pub(crate) fn fail_list_images(&self) {
        *self.inner.list_error.lock() = true;
    }

    pub(crate) fn set_running(&self, running: bool) {
        *self.inner.running.lock() = running;
    }

    pub(crate) fn set_container_logs(&self, logs: &str) {
        *self.inner.container_logs.lock() = logs.to_string();
    }

    /// Queue the chunks one exec session will stream, in order.
    pub(crate) fn push_exec_output(&self, chunks: Vec<String>) {
        self.inner.exec_outputs.lock().push_back(chunks);
    }

    /// Queue the exit code of one exec session; unqueued sessions
    /// report zero.
    pub(crate) fn push_exec_exit_code(&self, code: i64) {
        self.inner.exec_exit_codes.lock().push_back(code);
    }

    /// Make exec streams end with a runtime error after their chunks.
    pub(crate) fn fail_exec_stream(&self) {
        *self.inner.exec_stream_error.lock() = true;
    }

    pub(crate) fn set_container_missing(&self, missing: bool) {
        *self.inner.missing_container.lock() = missing;
    }

    pub(crate) fn fail_kill(&self) {
        *self.inner.kill_error.lock() = true;
    }

    pub(crate) fn operations(&self) -> Vec<String> {
        self.inner.operations.lock().clone()
    }

    pub(crate) fn count_ops(&self, op: &str) -> usize {
        self.inner
            .operations
            .lock()
            .iter()
            .filter(|recorded| recorded.as_str() == op)
            .count()
    }

    fn record(&self, op: String) {
        self.inner.operations.lock().push(op);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<(), DockerError> {
        self.record("ping".to_string());
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, DockerError> {
        self.record("list_images".to_string());
        if *self.inner.list_error.lock() {
            return Err(server_error(500, "image listing unavailable"));
        }
        Ok(self
            .inner
            .images
            .lock()
            .iter()
            .map(|tag| ImageSummary {
                repo_tags: vec![tag.clone()],
                ..Default::default()
            })
            .collect())
    }

    fn build_image_stream(
        &self,
        options: bollard::image::BuildImageOptions<String>,
        _context: Vec<u8>,
    ) -> BuildStream<'_> {
        self.record(format!("build:{}", options.t));
        if let Some(error) = self.inner.build_error.lock().clone() {
            return Box::pin(futures::stream::iter([Ok(BuildInfo {
                error: Some(error),
                ..Default::default()
            })]));
        }
        self.inner.images.lock().push(options.t.clone());
        Box::pin(futures::stream::iter([
            Ok(BuildInfo {
                stream: Some(format!("Step 1/5 : FROM {}\n", options.t)),
                ..Default::default()
            }),
            Ok(BuildInfo {
                stream: Some(format!("Successfully tagged {}\n", options.t)),
                ..Default::default()
            }),
        ]))
    }

    async fn create_container(
        &self,
        options: CreateContainerOptions<String>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError> {
        self.record(format!(
            "create:{}:{}",
            options.name,
            config.image.unwrap_or_default()
        ));
        Ok(ContainerCreateResponse {
            id: "mock-container".to_string(),
            warnings: Vec::new(),
        })
    }

    async fn start_container(&self, name: &str) -> Result<(), DockerError> {
        self.record(format!("start:{name}"));
        Ok(())
    }

    async fn inspect_container(
        &self,
        name: &str,
    ) -> Result<ContainerInspectResponse, DockerError> {
        self.record(format!("inspect:{name}"));
        Ok(ContainerInspectResponse {
            state: Some(ContainerState {
                running: Some(*self.inner.running.lock()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn kill_container(&self, name: &str) -> Result<(), DockerError> {
        self.record(format!("kill:{name}"));
        if *self.inner.kill_error.lock() {
            return Err(server_error(500, "cannot kill container"));
        }
        if *self.inner.missing_container.lock() {
            return Err(server_error(404, "no such container"));
        }
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<(), DockerError> {
        self.record(format!("wait:{name}"));
        Ok(())
    }

    async fn remove_container(
        &self,
        name: &str,
        _options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError> {
        self.record(format!("remove:{name}"));
        if *self.inner.missing_container.lock() {
            return Err(server_error(404, "no such container"));
        }
        Ok(())
    }

    async fn create_exec(
        &self,
        container: &str,
        options: CreateExecOptions<String>,
    ) -> Result<String, DockerError> {
        let cmd = options.cmd.unwrap_or_default().join(" ");
        self.record(format!("exec:{container}:{cmd}"));
        let id = self.inner.exec_ids.fetch_add(1, Ordering::SeqCst);
        Ok(format!("exec-{id}"))
    }

    async fn start_exec_stream(&self, exec_id: &str) -> Result<OutputStream, DockerError> {
        self.record(format!("exec_start:{exec_id}"));
        let chunks = self
            .inner
            .exec_outputs
            .lock()
            .pop_front()
            .unwrap_or_default();
        let mut items: Vec<Result<LogOutput, DockerError>> = chunks
            .into_iter()
            .map(|chunk| {
                Ok(LogOutput::StdOut {
                    message: chunk.into(),
                })
            })
            .collect();
        if *self.inner.exec_stream_error.lock() {
            items.push(Err(server_error(500, "connection reset")));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, DockerError> {
        self.record(format!("exec_inspect:{exec_id}"));
        Ok(Some(
            self.inner.exec_exit_codes.lock().pop_front().unwrap_or(0),
        ))
    }

    fn logs_stream(&self, name: &str, _options: LogsOptions<String>) -> OutputStream {
        self.record(format!("logs:{name}"));
        let logs = self.inner.container_logs.lock().clone();
        Box::pin(futures::stream::iter([Ok(LogOutput::StdOut {
            message: logs.into(),
        })]))
    }
}
