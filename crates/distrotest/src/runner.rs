//! One (distribution, package) test run.
//!
//! A [`DistroTest`] builds (or reuses) the distribution image, starts a
//! container from it, execs the test script against the package, and
//! classifies the script's streamed output. The container is stopped
//! on every path out of [`DistroTest::run`], whatever stage failed.

use crate::config::{package_name, PackageType};
use crate::docker::DockerClient;
use crate::error::TestError;
use crate::image::TestImage;
use crate::ledger::{ErrorLedger, DISTROS_CHECK};
use bollard::errors::Error as DockerError;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Name of the container every test runs in; replaced between pairings.
pub const TEST_CONTAINER: &str = "testing";

/// Everything a single test needs beyond its shared handles.
#[derive(Clone, Debug)]
pub struct DistroTestConfig {
    /// Build context directory (the run's working directory).
    pub path: PathBuf,
    /// The package under test.
    pub installable: PathBuf,
    /// Distro key, e.g. `debian_buster`.
    pub distro: String,
    /// Base image for the distro.
    pub build_image: String,
    /// Base image tag.
    pub build_tag: String,
    /// Test script copied into the build context.
    pub testfile: PathBuf,
    /// Also record a failure when the exec exits non-zero with no
    /// output at all.
    pub fail_on_silent_exit: bool,
}

pub struct DistroTest {
    docker: DockerClient,
    ledger: ErrorLedger,
    exiting: Arc<AtomicBool>,
    installable: PathBuf,
    distro: String,
    image: TestImage,
    fail_on_silent_exit: bool,
}

impl DistroTest {
    pub fn new(
        docker: DockerClient,
        ledger: ErrorLedger,
        exiting: Arc<AtomicBool>,
        config: DistroTestConfig,
    ) -> Self {
        let package_type = PackageType::for_distro(&config.distro);
        let image = TestImage::new(
            docker.clone(),
            config.path,
            config.build_image,
            config.build_tag,
            config.testfile,
            config.distro.clone(),
            package_type,
        );
        Self {
            docker,
            ledger,
            exiting,
            installable: config.installable,
            distro: config.distro,
            image,
            fail_on_silent_exit: config.fail_on_silent_exit,
        }
    }

    pub fn package_filename(&self) -> String {
        self.installable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Package name derived from the filename, e.g. `envoy-1.19`.
    pub fn package_name(&self) -> String {
        package_name(&self.package_filename()).to_string()
    }

    /// The command exec'd inside the container: test script, mounted
    /// package path, package name, distro key.
    fn test_cmd(&self) -> Vec<String> {
        vec![
            self.image.mount_testfile_path(),
            self.image.installable_path(&self.package_filename()),
            self.package_name(),
            self.distro.clone(),
        ]
    }

    fn exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    fn run_message(&self, message: &str, test: Option<&str>) -> String {
        match test {
            Some(test) => format!("[{}/{test}] {message}", self.distro),
            None => format!("[{}] {message}", self.distro),
        }
    }

    /// Record failures in the ledger and log each one.
    fn fail(&self, errors: impl IntoIterator<Item = String>) {
        for entry in errors {
            error!("{entry}");
            self.ledger.record(DISTROS_CHECK, entry);
        }
    }

    /// Build the test image unless it already exists.
    async fn build(&self) -> Result<(), TestError> {
        if self.image.exists().await? {
            return Ok(());
        }
        info!("{}", self.run_message("Building image", None));
        self.image.build().await?;
        info!("{}", self.run_message("Image built", None));
        Ok(())
    }

    /// Create-or-replace the test container, start it, and verify it
    /// is running; the container's logs ride along in the error when
    /// it is not.
    async fn start(&self) -> Result<(), TestError> {
        self.docker
            .create_or_replace(TEST_CONTAINER, &self.image.tag())
            .await?;
        self.docker.start_container(TEST_CONTAINER).await?;
        if !self.docker.is_running(TEST_CONTAINER).await? {
            let logs = self
                .docker
                .container_logs(TEST_CONTAINER)
                .await
                .unwrap_or_default();
            return Err(TestError::Container(self.run_message(
                &format!("Container unable to start\n{logs}"),
                Some(&self.package_name()),
            )));
        }
        info!(
            "{}",
            self.run_message("Container started", Some(&self.package_name()))
        );
        Ok(())
    }

    /// Exec the test command and consume its output stream.
    ///
    /// One-chunk lookahead: the runtime may deliver the final status
    /// line with no trailing delimiter, so a chunk is only handled once
    /// the next one arrives, and the last chunk is dealt with after the
    /// stream ends, where the exit code decides how to treat it.
    async fn exec(&self) -> Result<i64, TestError> {
        let (exec_id, mut output) = self
            .docker
            .exec_streamed(TEST_CONTAINER, self.test_cmd(), Vec::new())
            .await?;

        let mut pending: Option<String> = None;
        while let Some(chunk) = output.next().await {
            let chunk = chunk?;
            if let Some(previous) = pending.take() {
                self.handle_test_output(&previous);
            }
            pending = Some(
                String::from_utf8_lossy(&chunk.into_bytes())
                    .trim()
                    .to_string(),
            );
        }
        let exit_code = self.docker.exec_exit_code(&exec_id).await?;

        match pending {
            Some(last) if exit_code != 0 => {
                // The test process crashed before the harness emitted
                // any control message; anything already ledgered means
                // the harness did run and its failures are recorded.
                if !self.exiting() && !self.ledger.has_errors(DISTROS_CHECK) {
                    self.fail([self.run_message(
                        &format!("Error executing test in container\n{last}"),
                        None,
                    )]);
                }
            }
            Some(last) => self.handle_test_output(&last),
            None if exit_code != 0 && self.fail_on_silent_exit => {
                self.fail([self.run_message("Test exited with failure and no output", None)]);
            }
            None => {}
        }
        Ok(exit_code)
    }

    /// Classify one streamed message from the test container.
    ///
    /// Messages starting with `[{distro}` are control messages; with
    /// `ERROR` they mark a failed sub-test, without they are
    /// informational. Everything else is a raw log forwarded verbatim.
    fn handle_test_output(&self, msg: &str) {
        if !msg.starts_with(&format!("[{}", self.distro)) {
            info!("{msg}");
            return;
        }
        if !msg.contains("ERROR") {
            info!(distro = %self.distro, "{msg}");
            return;
        }
        // header is eg `[debian_buster/envoy-1.19:proxy-responds]`
        let header = msg.split(']').next().unwrap_or(msg).trim_start_matches('[');
        let (testrun, testname) = header.split_once(':').unwrap_or((header, ""));
        self.fail([format!("[{testrun}:{testname}] Test failed")]);
        if let Some((_, detail)) = msg.split_once('\n') {
            error!("{detail}");
        }
    }

    /// Best-effort kill, wait, force-delete of the test container.
    /// Runtime errors come back as a list, never raised, so the
    /// caller's cleanup ordering is preserved.
    pub async fn stop(&self) -> Option<Vec<String>> {
        match self.shutdown_container().await {
            Ok(true) => {
                info!(
                    "{}",
                    self.run_message("Container stopped", Some(&self.package_name()))
                );
                None
            }
            Ok(false) => None,
            Err(e) => Some(vec![e.to_string()]),
        }
    }

    async fn shutdown_container(&self) -> Result<bool, DockerError> {
        match self.docker.kill_container(TEST_CONTAINER).await {
            Ok(()) => {}
            // no container was created for this test
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(false),
            // already stopped; wait and removal still apply
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => {}
            Err(e) => return Err(e),
        }
        self.docker.wait_container(TEST_CONTAINER).await?;
        self.docker.remove_container(TEST_CONTAINER).await?;
        Ok(true)
    }

    /// Run the test to completion.
    ///
    /// Whichever stage fails, the container stop is attempted exactly
    /// once before this returns; stage errors and stop errors are
    /// merged into the returned list, `None` meaning success.
    pub async fn run(&self) -> Option<Vec<String>> {
        let mut errors: Vec<String> = Vec::new();
        if let Err(e) = self.run_stages().await {
            errors.push(e.to_string());
        }
        if let Some(stop_errors) = self.stop().await {
            errors.extend(stop_errors);
        }
        if !self.exiting() {
            self.log_failures();
        }
        (!errors.is_empty()).then_some(errors)
    }

    async fn run_stages(&self) -> Result<(), TestError> {
        self.build().await?;
        self.start().await?;
        self.exec().await?;
        Ok(())
    }

    /// Out-of-band teardown used on interruption; all errors swallowed.
    pub async fn cleanup(&self) {
        if self.stop().await.is_some() {
            debug!(distro = %self.distro, "Ignoring errors while stopping test container");
        }
    }

    /// Log this package's verdict from the ledger entries recorded for
    /// it during the run.
    fn log_failures(&self) {
        let prefix = format!("[{}/{}:", self.distro, self.package_name());
        let failures: Vec<String> = self
            .ledger
            .errors_for(DISTROS_CHECK)
            .iter()
            .filter(|entry| entry.starts_with(&prefix))
            .filter_map(|entry| {
                entry
                    .split(']')
                    .next()
                    .and_then(|header| header.split(':').nth(1))
                    .map(str::to_string)
            })
            .collect();
        if failures.is_empty() {
            info!(
                "{}",
                self.run_message("Package test passed", Some(&self.package_name()))
            );
        } else {
            error!(
                "{}",
                self.run_message(
                    &format!("Package test had failures: {}", failures.join(",")),
                    Some(&self.package_name()),
                )
            );
        }
    }
}
