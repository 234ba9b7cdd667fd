//! Builder client: cache-aware, retrying front end to a [`BuilderService`].

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::bundle::{prepare_response_dir, write_response_bundle};
use super::{BuildRequest, BuilderService, PovRunRequest, TestRunRequest};
use crate::build_cache::{BuildCache, CacheKey, CacheStats};
use crate::domain::{BuildId, BuildResult, PatchCandidate, Phase, Result, RunResult};
use crate::obs;

/// Retry policy for infrastructure failures.
///
/// Build failures, crashes and timeouts are answers, not errors, and are
/// never retried here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = run once).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds).
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: 0,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1))),
        )
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, phase: Phase, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_retries + 1;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                warn!(
                    event = "builder.retry",
                    phase = %phase,
                    attempt = attempt,
                    error = %err,
                );
                tokio::time::sleep(policy.delay(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Builder front end used by the reproducer, the verifier and the gateway.
#[derive(Clone)]
pub struct BuilderClient {
    service: Arc<dyn BuilderService>,
    cache: Arc<BuildCache>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for BuilderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderClient")
            .field("service", &self.service.name())
            .field("retry", &self.retry)
            .finish()
    }
}

impl BuilderClient {
    pub fn new(service: Arc<dyn BuilderService>, cache: Arc<BuildCache>) -> Self {
        Self {
            service,
            cache,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub async fn probe(&self, builder_module: &str) -> Result<()> {
        with_retry(&self.retry, Phase::Setup, || self.service.probe(builder_module)).await
    }

    /// Build `patch`, serving repeated identical successful builds from cache.
    pub async fn apply_patch_and_build(
        &self,
        patch: &PatchCandidate,
        builder_module: &str,
        response_dir: &Path,
    ) -> Result<BuildResult> {
        let key = CacheKey::new(&patch.digest(), builder_module);
        let _in_flight = self.cache.lock(&key).await;

        if let Some(hit) = self.cache.lookup(&key).await {
            obs::emit_build_cache_hit(&patch.digest(), builder_module);
            prepare_response_dir(response_dir).await?;
            write_response_bundle(
                response_dir,
                hit.status,
                hit.build_id.as_ref(),
                &hit.logs,
                true,
            )?;
            return Ok(hit);
        }

        let request = BuildRequest {
            patch,
            builder_module,
            response_dir,
        };
        let result = with_retry(&self.retry, Phase::Build, || {
            self.service.apply_patch_build(&request)
        })
        .await?;

        obs::emit_build_finished(&patch.digest(), builder_module, &result.status);
        if result.is_success() {
            self.cache.store(&key, &result).await?;
        }
        Ok(result)
    }

    /// Replay a POV against `build_id`. Always executed.
    pub async fn run_pov(
        &self,
        build_id: &BuildId,
        pov_path: &Path,
        harness: &str,
        builder_module: &str,
        response_dir: &Path,
    ) -> Result<RunResult> {
        let request = PovRunRequest {
            build_id,
            pov_path,
            harness,
            builder_module,
            response_dir,
        };
        let result =
            with_retry(&self.retry, Phase::Pov, || self.service.run_pov(&request)).await?;
        obs::emit_builder_run_finished(Phase::Pov, build_id, &result.status);
        Ok(result)
    }

    /// Run the test suite against `build_id`. Always executed.
    pub async fn run_test(
        &self,
        build_id: &BuildId,
        builder_module: &str,
        response_dir: &Path,
    ) -> Result<RunResult> {
        let request = TestRunRequest {
            build_id,
            builder_module,
            response_dir,
        };
        let result =
            with_retry(&self.retry, Phase::Test, || self.service.run_test(&request)).await?;
        obs::emit_builder_run_finished(Phase::Test, build_id, &result.status);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PatcherError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_recovers_from_transient_infrastructure_failure() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff_base_ms: 1,
        };
        let calls = AtomicU32::new(0);
        let value = with_retry(&policy, Phase::Build, || async {
            if calls.fetch_add(1, Ordering::Relaxed) < 2 {
                Err(PatcherError::infrastructure(Phase::Build, "503"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_policy() {
        let policy = RetryPolicy {
            max_retries: 1,
            backoff_base_ms: 1,
        };
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&policy, Phase::Pov, || async {
            calls.fetch_add(1, Ordering::Relaxed);
            Err(PatcherError::infrastructure(Phase::Pov, "unreachable"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&RetryPolicy::default(), Phase::Build, || async {
            calls.fetch_add(1, Ordering::Relaxed);
            Err(PatcherError::InvalidConfig("bad".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_base_ms: 100,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }
}
