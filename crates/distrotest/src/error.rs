//! Error types for distribution package tests.

use thiserror::Error;

/// Failure of a single (distribution, package) test.
///
/// Every variant is fatal to the one test it occurred in, never to the
/// run: the orchestrator records the message and moves on to the next
/// pairing.
#[derive(Debug, Error)]
pub enum TestError {
    /// The test image failed to build.
    #[error("{0}")]
    Build(String),

    /// The test container failed to reach a running state.
    #[error("{0}")]
    Container(String),

    /// The container runtime rejected or failed an API call.
    #[error(transparent)]
    Runtime(#[from] bollard::errors::Error),

    /// Filesystem error while staging build artefacts.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
