//! Run-wide failure accumulation.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Check name under which distribution test failures are recorded.
pub const DISTROS_CHECK: &str = "distros";

/// Append-only accumulator of per-check failures.
///
/// Handles are cheap to clone and share the same store; one is injected
/// into every test at construction. Entries are never removed during a
/// run; the summary reads them at the end.
#[derive(Clone, Debug, Default)]
pub struct ErrorLedger {
    inner: Arc<Mutex<BTreeMap<String, Vec<String>>>>,
}

impl ErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one failure under `check`.
    pub fn record(&self, check: &str, error: impl Into<String>) {
        self.inner
            .lock()
            .entry(check.to_string())
            .or_default()
            .push(error.into());
    }

    /// Append a batch of failures under `check`, preserving order.
    pub fn record_all(&self, check: &str, errors: impl IntoIterator<Item = String>) {
        let mut inner = self.inner.lock();
        inner
            .entry(check.to_string())
            .or_default()
            .extend(errors);
    }

    /// Failures recorded so far under `check`, in recording order.
    pub fn errors_for(&self, check: &str) -> Vec<String> {
        self.inner.lock().get(check).cloned().unwrap_or_default()
    }

    pub fn has_errors(&self, check: &str) -> bool {
        self.inner
            .lock()
            .get(check)
            .is_some_and(|errors| !errors.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().values().all(Vec::is_empty)
    }

    /// A point-in-time copy of every check's failures.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.inner.lock().clone()
    }
}
