//! Retry and backoff for export attempts.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::metrics::data::ResourceMetrics;
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::Temporality;
use tokio::runtime::Handle;
use tracing::{error, warn};

use crate::error::ExportError;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);
const DEFAULT_MULTIPLIER: f64 = 1.5;

/// How failed export attempts are retried.
///
/// The wait before retry `n` is `initial_backoff * multiplier^(n - 1)`, capped at `max_backoff`.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    /// Creates a policy that never retries: every batch gets exactly one attempt.
    pub fn disabled() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Set the total number of attempts per batch, including the first one.
    ///
    /// Values below 1 are treated as 1.
    ///
    /// Defaults to 5.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the wait before the first retry.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the upper bound on the wait between two attempts.
    ///
    /// Defaults to 5 seconds.
    #[must_use]
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the factor the wait grows by after each retry.
    ///
    /// Values below 1.0 are treated as 1.0.
    ///
    /// Defaults to 1.5.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_nan() { 1.0 } else { multiplier.max(1.0) };
        self
    }

    /// Returns the total number of attempts per batch.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the wait before retry number `retry`, starting at 1.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .map_or(self.max_backoff, |backoff| backoff.min(self.max_backoff))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

/// An exporter that retries failed exports according to a [`RetryPolicy`].
///
/// Exports are driven within the given Tokio runtime, so the wrapped exporter may rely on Tokio timers and I/O even
/// when the pipeline calls it from a plain thread.
///
/// Once the retry budget of a batch is exhausted, the batch is dropped, the failure is logged, and the export is
/// reported as successful: delivery failures never reach the pipeline. The only error passed through is
/// [`OTelSdkError::AlreadyShutdown`].
pub struct RetryingExporter<E> {
    inner: E,
    policy: RetryPolicy,
    runtime: Handle,
}

impl<E> RetryingExporter<E> {
    /// Wraps `inner`, running its exports within `runtime`.
    pub fn new(inner: E, policy: RetryPolicy, runtime: Handle) -> Self {
        Self { inner, policy, runtime }
    }

    /// Returns a reference to the wrapped exporter.
    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Returns the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<E: PushMetricExporter> RetryingExporter<E> {
    async fn export_with_retries(&self, metrics: &ResourceMetrics) -> OTelSdkResult {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 1;

        loop {
            let source = match self.inner.export(metrics).await {
                Ok(()) => return Ok(()),
                Err(OTelSdkError::AlreadyShutdown) => return Err(OTelSdkError::AlreadyShutdown),
                Err(e) => e,
            };

            if attempt >= max_attempts {
                let error = ExportError::Exhausted { attempts: attempt, source };
                error!(%error, "Dropping metrics batch.");
                return Ok(());
            }

            let backoff = self.policy.backoff(attempt);
            let error = ExportError::Attempt { attempt, max_attempts, source };
            warn!(%error, ?backoff, "Retrying metrics export.");

            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

impl<E: PushMetricExporter> PushMetricExporter for RetryingExporter<E> {
    fn export(&self, metrics: &ResourceMetrics) -> impl Future<Output = OTelSdkResult> + Send {
        InRuntime { runtime: self.runtime.clone(), future: Box::pin(self.export_with_retries(metrics)) }
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.inner.force_flush()
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        self.inner.shutdown_with_timeout(timeout)
    }

    fn temporality(&self) -> Temporality {
        self.inner.temporality()
    }
}

impl<E> fmt::Debug for RetryingExporter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryingExporter").field("policy", &self.policy).finish_non_exhaustive()
    }
}

/// Polls a future with the given runtime entered, so Tokio resources can be created from whichever thread polls it.
struct InRuntime<F> {
    runtime: Handle,
    future: Pin<Box<F>>,
}

impl<F: Future> Future for InRuntime<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let _guard = this.runtime.enter();
        this.future.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RetryPolicy;

    #[test]
    fn test_default_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_millis(1500));
        assert_eq!(policy.backoff(3), Duration::from_millis(2250));

        // Capped from here on.
        assert_eq!(policy.backoff(5), Duration::from_secs(5));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_builder_clamps_values() {
        let policy = RetryPolicy::default().with_max_attempts(0).with_multiplier(0.5);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.backoff(1), policy.backoff(4));

        let policy = RetryPolicy::default().with_multiplier(f64::NAN);
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
    }

    #[test]
    fn test_disabled_policy() {
        let policy = RetryPolicy::disabled();
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_constant_backoff() {
        let policy = RetryPolicy::default()
            .with_initial_backoff(Duration::from_millis(10))
            .with_max_backoff(Duration::from_secs(1))
            .with_multiplier(1.0);
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(9) && first <= Duration::from_millis(11));
        for retry in 2..10 {
            assert_eq!(policy.backoff(retry), first);
        }
    }
}
