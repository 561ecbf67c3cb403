//! Retry and backoff decisions for failed jobs.
//!
//! The policy only classifies; the dispatcher owns timing.

use std::time::Duration;

use crate::types::BuildKind;

/// Outcome of consulting the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    RetryAfter(Duration),
    /// Retry budget consumed.
    Exhausted,
}

/// Exponential backoff with a cap and a retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Retries allowed before a job is exhausted.
    pub max_retries: u32,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_retries: 5,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(base_delay: Duration, max_retries: u32, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_retries,
            max_delay,
        }
    }

    /// Decide what to do with a job that has been retried `retry_count` times.
    #[must_use]
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count >= self.max_retries {
            return RetryDecision::Exhausted;
        }
        RetryDecision::RetryAfter(self.delay(retry_count))
    }

    /// `min(base * 2^retry_count, cap)`, saturating at the cap.
    #[must_use]
    pub fn delay(&self, retry_count: u32) -> Duration {
        1u32.checked_shl(retry_count)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Failure output that indicates a pure build hit a native toolchain gap.
const OCI_FALLBACK_PATTERNS: &[&str] = &[
    "native dependency",
    "linking failed",
    "cannot find -l",
    "pkg-config",
    "cmake",
    "autoconf",
    "unsupported platform",
    "undefined reference",
    "binary not found",
];

/// Returns the kind a failed build should be retried as, if it should change.
///
/// A pure Nix build that fails on a native toolchain problem is retried as
/// an OCI build; everything else keeps its kind.
#[must_use]
pub fn fallback_kind(kind: BuildKind, error: &str) -> Option<BuildKind> {
    if kind != BuildKind::PureNix {
        return None;
    }
    let error = error.to_lowercase();
    OCI_FALLBACK_PATTERNS
        .iter()
        .any(|pattern| error.contains(pattern))
        .then_some(BuildKind::Oci)
}
