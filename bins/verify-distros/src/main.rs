//! Verify distribution packages inside per-distro containers.
//!
//! Runs the provided test script against every package in the tarball,
//! once per selected distribution from the YAML matrix. Exits non-zero
//! when any test fails.

use anyhow::Result;
use clap::Parser;
use distrotest::{load_matrix, CheckerConfig, DistroChecker};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "verify-distros")]
#[command(about = "Verify distribution packages inside per-distro containers")]
struct Args {
    /// Test script run inside the distribution containers
    testfile: PathBuf,

    /// YAML configuration with distributions for testing
    config: PathBuf,

    /// Tarball containing packages to test
    packages: PathBuf,

    /// Distribution to test; can be specified multiple times
    #[arg(short, long = "distribution")]
    distribution: Vec<String>,

    /// Fail a test whose script exits non-zero without any output
    #[arg(long)]
    fail_on_silent_exit: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let distros = load_matrix(&args.config)?;

    let mut checker = DistroChecker::new(
        distros,
        CheckerConfig {
            testfile: args.testfile,
            packages_tarball: args.packages,
            distributions: args.distribution,
            fail_on_silent_exit: args.fail_on_silent_exit,
        },
    );

    // First Ctrl+C winds the run down after the current test.
    let exiting = checker.exiting_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing current test before exiting");
            exiting.store(true, Ordering::SeqCst);
        }
    });

    std::process::exit(checker.run().await);
}
