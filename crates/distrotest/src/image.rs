//! Per-distribution test image builds.

use crate::config::PackageType;
use crate::docker::DockerClient;
use crate::error::TestError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Mount point of the extracted package set inside the test container.
pub const MOUNT_INSTALL_DIR: &str = "/tmp/install";

/// A buildable image definition for one distribution.
///
/// The build context is the run's working directory, which already
/// holds the extracted `packages/{deb,rpm}` trees the Dockerfile ADDs;
/// staging only adds the Dockerfile itself and the test script.
pub struct TestImage {
    docker: DockerClient,
    context: PathBuf,
    build_image: String,
    build_tag: String,
    testfile: PathBuf,
    distro: String,
    package_type: &'static PackageType,
}

impl TestImage {
    pub fn new(
        docker: DockerClient,
        context: PathBuf,
        build_image: String,
        build_tag: String,
        testfile: PathBuf,
        distro: String,
        package_type: &'static PackageType,
    ) -> Self {
        Self {
            docker,
            context,
            build_image,
            build_tag,
            testfile,
            distro,
            package_type,
        }
    }

    /// Tag under which the test image is built, `{distro}:latest`.
    pub fn tag(&self) -> String {
        format!("{}:latest", self.distro)
    }

    pub fn testfile_name(&self) -> String {
        self.testfile
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Path of the test script inside the container. Rendered with `/`:
    /// this is a path inside a Linux container, not on the host.
    pub fn mount_testfile_path(&self) -> String {
        format!("/tmp/{}", self.testfile_name())
    }

    /// Path of a package inside the container.
    pub fn installable_path(&self, package_filename: &str) -> String {
        format!("{MOUNT_INSTALL_DIR}/{package_filename}")
    }

    /// Render the Dockerfile. Pure: identical fields produce
    /// byte-identical output.
    pub fn dockerfile(&self) -> String {
        format!(
            "FROM {image}:{tag}\n\
             {env}\n\
             \n\
             ADD {install_dir} {install_mount}\n\
             ADD {test_name} {test_mount}\n\
             RUN {build_command}\n\
             \n\
             CMD [\"tail\", \"-f\", \"/dev/null\"]\n",
            image = self.build_image,
            tag = self.build_tag,
            env = self.package_type.env_directive,
            install_dir = self.package_type.install_dir,
            install_mount = MOUNT_INSTALL_DIR,
            test_name = self.testfile_name(),
            test_mount = self.mount_testfile_path(),
            build_command = self
                .package_type
                .build_command(&self.mount_testfile_path()),
        )
    }

    /// Write the Dockerfile and copy the test script into the build
    /// context.
    pub fn stage(&self) -> Result<(), TestError> {
        let dockerfile = self.dockerfile();
        debug!(distro = %self.distro, "Staging build context:\n{dockerfile}");
        std::fs::write(self.context.join("Dockerfile"), &dockerfile)?;
        std::fs::copy(&self.testfile, self.context.join(self.testfile_name()))?;
        Ok(())
    }

    /// Whether the image for this distribution is already built.
    ///
    /// Listing failures propagate; an absent tag in a successful
    /// listing is the only way this reports `false`.
    pub async fn exists(&self) -> Result<bool, TestError> {
        Ok(self.docker.image_tags().await?.contains(&self.tag()))
    }

    /// Stage artefacts and build the image.
    pub async fn build(&self) -> Result<(), TestError> {
        self.stage()?;
        self.docker.build_image(&self.context, &self.tag()).await
    }

    pub fn context(&self) -> &Path {
        &self.context
    }
}
