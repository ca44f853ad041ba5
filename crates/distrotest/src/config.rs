//! Distribution matrix and package-type configuration.

use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// One entry in the distribution test matrix.
///
/// The YAML field for the base image is named `distro`:
///
/// ```yaml
/// debian_buster:
///   distro: debian
///   tag: buster-slim
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct DistributionSpec {
    /// Base image name, e.g. `debian`.
    #[serde(rename = "distro")]
    pub image: String,
    /// Base image tag, e.g. `buster-slim`.
    pub tag: String,
}

/// The distribution matrix, keyed by distro name.
pub type DistroMatrix = BTreeMap<String, DistributionSpec>;

/// Load the distribution matrix from a YAML file.
pub fn load_matrix(path: &Path) -> anyhow::Result<DistroMatrix> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read distribution matrix {}", path.display()))?;
    serde_yaml::from_str(&text)
        .with_context(|| format!("parse distribution matrix {}", path.display()))
}

/// Fixed data distinguishing the deb and rpm test paths: archive
/// suffix, install directory inside the build context, Dockerfile env
/// directive, and the package-manager bootstrap baked into the image.
#[derive(Debug, PartialEq, Eq)]
pub struct PackageType {
    pub suffix: &'static str,
    pub install_dir: &'static str,
    pub env_directive: &'static str,
    bootstrap: &'static str,
}

pub const DEB: PackageType = PackageType {
    suffix: "deb",
    install_dir: "packages/deb",
    env_directive: "ENV DEBIAN_FRONTEND=noninteractive",
    bootstrap: "apt-get update && apt-get install -y -qq --no-install-recommends curl procps sudo",
};

pub const RPM: PackageType = PackageType {
    suffix: "rpm",
    install_dir: "packages/rpm",
    env_directive: "",
    bootstrap: "yum -y install procps sudo",
};

impl PackageType {
    /// Archive type implied by a distro name: Debian/Ubuntu-family
    /// names take the deb path, everything else rpm.
    pub fn for_distro(name: &str) -> &'static PackageType {
        if name.starts_with("debian") || name.starts_with("ubuntu") {
            &DEB
        } else {
            &RPM
        }
    }

    /// Shell command run during the image build: make the test script
    /// executable and install the tools it needs.
    pub fn build_command(&self, test_mount_path: &str) -> String {
        format!("chmod +x {test_mount_path} && {}", self.bootstrap)
    }
}

/// Package name derived from a filename, e.g. `envoy-1.19` from
/// `envoy-1.19_amd64.deb`.
pub fn package_name(filename: &str) -> &str {
    filename
        .split_once('_')
        .map(|(name, _)| name)
        .unwrap_or(filename)
}
