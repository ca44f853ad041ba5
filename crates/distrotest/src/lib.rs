//! Distribution package testing against a matrix of container images.
//!
//! A [`DistroChecker`] takes a YAML distribution matrix, a packages
//! tarball and a test script, then for every selected distribution
//! builds a test image, boots a container from it and runs the script
//! against each matching package. Failures accumulate in an
//! [`ErrorLedger`] and decide the process exit status.

pub mod config;
pub mod docker;
pub mod error;
pub mod image;
pub mod ledger;
pub mod runner;
#[cfg(test)]
pub(crate) mod testutil;

pub use config::{load_matrix, package_name, DistributionSpec, DistroMatrix, PackageType};
pub use docker::{ContainerRuntime, DockerClient};
pub use error::TestError;
pub use image::TestImage;
pub use ledger::{ErrorLedger, DISTROS_CHECK};
pub use runner::{DistroTest, DistroTestConfig, TEST_CONTAINER};

use anyhow::Context;
use flate2::read::GzDecoder;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, error, info};

/// Inputs of one checker run.
#[derive(Clone, Debug)]
pub struct CheckerConfig {
    /// Test script run inside every container.
    pub testfile: PathBuf,
    /// Tarball holding the `deb/` and `rpm/` package trees.
    pub packages_tarball: PathBuf,
    /// Distros to test; empty means the whole matrix.
    pub distributions: Vec<String>,
    /// Forwarded to every test, see [`DistroTestConfig`].
    pub fail_on_silent_exit: bool,
}

/// Orchestrates distribution tests across the matrix.
///
/// The working directory, runtime connection and package extraction
/// are all lazy; a run that tests nothing touches neither the runtime
/// nor the filesystem. Everything lazily acquired is released in
/// [`DistroChecker::run`] before the status is returned.
pub struct DistroChecker {
    distros: DistroMatrix,
    config: CheckerConfig,
    ledger: ErrorLedger,
    exiting: Arc<AtomicBool>,
    workdir: Option<TempDir>,
    docker: Option<DockerClient>,
    active_test: Option<Arc<DistroTest>>,
    packages_extracted: bool,
}

impl DistroChecker {
    pub fn new(distros: DistroMatrix, config: CheckerConfig) -> Self {
        Self {
            distros,
            config,
            ledger: ErrorLedger::new(),
            exiting: Arc::new(AtomicBool::new(false)),
            workdir: None,
            docker: None,
            active_test: None,
            packages_extracted: false,
        }
    }

    /// Construct with an already-connected runtime client instead of
    /// connecting lazily.
    pub fn with_docker(distros: DistroMatrix, config: CheckerConfig, docker: DockerClient) -> Self {
        Self {
            docker: Some(docker),
            ..Self::new(distros, config)
        }
    }

    /// Flag a signal handler sets to wind the run down after the
    /// current test.
    pub fn exiting_flag(&self) -> Arc<AtomicBool> {
        self.exiting.clone()
    }

    pub fn ledger(&self) -> &ErrorLedger {
        &self.ledger
    }

    fn exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Run every selected distribution test, release acquired
    /// resources and return the process exit status.
    pub async fn run(&mut self) -> i32 {
        if let Err(e) = self.check_distros().await {
            error!("{e:#}");
            self.ledger.record(DISTROS_CHECK, format!("Run aborted: {e:#}"));
        }
        let status = self.on_checks_complete().await;
        self.summary();
        status
    }

    async fn check_distros(&mut self) -> anyhow::Result<()> {
        let selected: Vec<(String, DistributionSpec)> = self
            .distros
            .iter()
            .filter(|(name, _)| {
                self.config.distributions.is_empty() || self.config.distributions.contains(name)
            })
            .map(|(name, spec)| (name.clone(), spec.clone()))
            .collect();
        for (distro, spec) in selected {
            info!("[{distro}] Testing with: {}", self.pkg_names(&distro)?);
            self.distro_test(&distro, &spec).await?;
        }
        Ok(())
    }

    /// Test every matching package against one distribution.
    async fn distro_test(&mut self, distro: &str, spec: &DistributionSpec) -> anyhow::Result<()> {
        for installable in self.pkg_paths(distro)? {
            if self.exiting() {
                return Ok(());
            }
            info!("[{distro}] Testing package: {}", installable.display());
            let test = Arc::new(DistroTest::new(
                self.docker().await?,
                self.ledger.clone(),
                self.exiting.clone(),
                DistroTestConfig {
                    path: self.workdir()?,
                    installable,
                    distro: distro.to_string(),
                    build_image: spec.image.clone(),
                    build_tag: spec.tag.clone(),
                    testfile: self.config.testfile.clone(),
                    fail_on_silent_exit: self.config.fail_on_silent_exit,
                },
            ));
            self.active_test = Some(test.clone());
            if let Some(errors) = test.run().await {
                // Errors raised while winding down are teardown noise,
                // not test verdicts.
                if !self.exiting() {
                    self.ledger.record_all(DISTROS_CHECK, errors);
                }
            }
            self.active_test = None;
        }
        Ok(())
    }

    async fn on_checks_complete(&mut self) -> i32 {
        if let Some(test) = self.active_test.take() {
            test.cleanup().await;
        }
        self.docker = None;
        self.cleanup_workdir();
        i32::from(!self.ledger.is_empty())
    }

    fn summary(&self) {
        let snapshot = self.ledger.snapshot();
        if snapshot.values().all(Vec::is_empty) {
            info!("All distribution tests passed");
            return;
        }
        for (check, errors) in snapshot {
            for entry in errors {
                error!(check = %check, "{entry}");
            }
        }
    }

    async fn docker(&mut self) -> anyhow::Result<DockerClient> {
        if let Some(docker) = &self.docker {
            return Ok(docker.clone());
        }
        let docker = DockerClient::connect().await?;
        self.docker = Some(docker.clone());
        Ok(docker)
    }

    fn workdir(&mut self) -> anyhow::Result<PathBuf> {
        let dir = match self.workdir.take() {
            Some(dir) => dir,
            None => TempDir::new().context("create working directory")?,
        };
        let path = dir.path().to_path_buf();
        self.workdir = Some(dir);
        Ok(path)
    }

    fn cleanup_workdir(&mut self) {
        self.packages_extracted = false;
        if let Some(dir) = self.workdir.take() {
            if let Err(e) = dir.close() {
                debug!("Failed to remove working directory: {e}");
            }
        }
    }

    /// Directory the packages tarball is extracted into, extracting on
    /// first use.
    fn packages_dir(&mut self) -> anyhow::Result<PathBuf> {
        let packages = self.workdir()?.join("packages");
        if !self.packages_extracted {
            extract_tarball(&self.config.packages_tarball, &packages)?;
            self.packages_extracted = true;
        }
        Ok(packages)
    }

    /// Packages in the extracted tree matching the distro's archive
    /// type, in directory order.
    fn pkg_paths(&mut self, distro: &str) -> anyhow::Result<Vec<PathBuf>> {
        let suffix = PackageType::for_distro(distro).suffix;
        let dir = self.packages_dir()?.join(suffix);
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("list packages in {}", dir.display()))?;
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(suffix) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    fn pkg_names(&mut self, distro: &str) -> anyhow::Result<String> {
        Ok(self
            .pkg_paths(distro)?
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| package_name(&name.to_string_lossy()).to_string())
            .collect::<Vec<_>>()
            .join(" "))
    }
}

/// Extract a tarball, gzipped or plain, into `dest`.
fn extract_tarball(tarball: &Path, dest: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::open(tarball)
        .with_context(|| format!("open packages tarball {}", tarball.display()))?;
    let gzipped = matches!(
        tarball.extension().and_then(|ext| ext.to_str()),
        Some("gz") | Some("tgz")
    );
    let unpacked = if gzipped {
        tar::Archive::new(GzDecoder::new(file)).unpack(dest)
    } else {
        tar::Archive::new(file).unpack(dest)
    };
    unpacked.with_context(|| format!("extract packages tarball {}", tarball.display()))
}
