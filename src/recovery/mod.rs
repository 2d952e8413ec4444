//! Strategy-based recovery with exponential backoff.
//!
//! A [`RecoveryEngine`] holds strategies in registration order. For each
//! error it selects the first strategy whose `check` accepts the error and
//! keeps that selection for the whole run:
//!
//! ```text
//! select ──▶ sleep(initial × multiplier^(i-1)) ──▶ recover ──▶ check again
//!   │                   ▲                             │            │
//!   │                   └──── failed / still present ─┴────────────┘
//!   │                                                  │
//!   └─ no strategy ──▶ NoStrategy        resolved ──▶ cleanup ──▶ Recovered
//! ```
//!
//! Outcomes are returned as [`RecoveryOutcome`] values. Nothing raised by a
//! strategy escapes [`RecoveryEngine::attempt_recovery`].

mod strategy;

pub use strategy::{
    RecoveryAction, RecoveryAttempt, RecoveryFilter, RecoveryOutcome, RecoveryStrategy,
};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::detector::DetectedError;

/// Retry orchestrator with an unbounded attempt history.
///
/// # Example
///
/// ```rust,ignore
/// let engine = RecoveryEngine::new(RecoveryConfig::default());
/// engine
///     .register_strategy(RecoveryStrategy::new("webgl", RestoreContext::new(renderer)))
///     .await;
///
/// match engine.attempt_recovery(&error, &context).await {
///     RecoveryOutcome::Recovered { .. } => {}
///     other => escalate(other),
/// }
/// ```
pub struct RecoveryEngine {
    config: RecoveryConfig,
    strategies: RwLock<Vec<Arc<RecoveryStrategy>>>,
    history: RwLock<Vec<RecoveryAttempt>>,
}

impl RecoveryEngine {
    /// Create an engine with no strategies.
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            strategies: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Backoff and retry configuration.
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Append a strategy. Earlier registrations take precedence.
    pub async fn register_strategy(&self, strategy: RecoveryStrategy) {
        debug!(
            category = %strategy.category,
            max_retries = ?strategy.max_retries,
            "Registered recovery strategy"
        );
        self.strategies.write().await.push(Arc::new(strategy));
    }

    /// Number of registered strategies.
    pub async fn strategy_count(&self) -> usize {
        self.strategies.read().await.len()
    }

    /// Try to recover from `error`.
    ///
    /// Runs up to the selected strategy's retry limit. The backoff sleep only
    /// suspends this task.
    pub async fn attempt_recovery(&self, error: &DetectedError, context: &Value) -> RecoveryOutcome {
        let Some(strategy) = self.select(error).await else {
            warn!(
                pattern_id = %error.pattern_id,
                category = %error.category,
                "No recovery strategy found for error"
            );
            return RecoveryOutcome::NoStrategy;
        };

        let max_retries = strategy
            .max_retries
            .unwrap_or(self.config.default_max_retries);

        info!(
            pattern_id = %error.pattern_id,
            strategy = %strategy.category,
            max_retries = max_retries,
            "Starting recovery"
        );

        for attempt in 1..=max_retries {
            let delay = self.config.delay_for_attempt(attempt);
            debug!(
                strategy = %strategy.category,
                attempt = attempt,
                delay_ms = delay.as_millis(),
                "Waiting before recovery attempt"
            );
            tokio::time::sleep(delay).await;

            let failure = match self.run_recover(&strategy, error, context).await {
                Ok(()) if !check_applies(&strategy, error, true) => None,
                Ok(()) => Some("error condition still present after recovery".to_string()),
                Err(e) => Some(e.to_string()),
            };
            let success = failure.is_none();

            if let Some(reason) = &failure {
                warn!(
                    strategy = %strategy.category,
                    attempt = attempt,
                    reason = %reason,
                    "Recovery attempt failed"
                );
            }

            self.history.write().await.push(RecoveryAttempt {
                timestamp: Utc::now(),
                attempt,
                detection_id: error.detection_id.clone(),
                pattern_id: error.pattern_id.clone(),
                strategy: strategy.category.clone(),
                success,
                delay_ms: delay.as_millis() as u64,
                failure,
            });

            if success {
                let cleanup = AssertUnwindSafe(strategy.action.cleanup(context))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("cleanup panicked")));
                if let Err(e) = cleanup {
                    warn!(
                        strategy = %strategy.category,
                        error = %e,
                        "Recovery cleanup failed"
                    );
                }
                info!(
                    strategy = %strategy.category,
                    attempts = attempt,
                    "Recovery succeeded"
                );
                return RecoveryOutcome::Recovered {
                    strategy: strategy.category.clone(),
                    attempts: attempt,
                };
            }
        }

        warn!(
            strategy = %strategy.category,
            attempts = max_retries,
            pattern_id = %error.pattern_id,
            "Recovery exhausted all attempts"
        );
        RecoveryOutcome::Exhausted {
            strategy: strategy.category.clone(),
            attempts: max_retries,
        }
    }

    /// Recorded attempts matching `filter`, oldest first.
    pub async fn recovery_history(&self, filter: &RecoveryFilter) -> Vec<RecoveryAttempt> {
        self.history
            .read()
            .await
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// Drop all recorded attempts.
    pub async fn clear_history(&self) {
        self.history.write().await.clear();
    }

    // ========================================================================
    // Internal
    // ========================================================================

    async fn select(&self, error: &DetectedError) -> Option<Arc<RecoveryStrategy>> {
        let strategies = self.strategies.read().await.clone();
        strategies
            .into_iter()
            .find(|s| check_applies(s, error, false))
    }

    async fn run_recover(
        &self,
        strategy: &RecoveryStrategy,
        error: &DetectedError,
        context: &Value,
    ) -> anyhow::Result<()> {
        let recover = AssertUnwindSafe(strategy.action.recover(error, context))
            .catch_unwind()
            .map(|result| result.unwrap_or_else(|_| Err(anyhow::anyhow!("recover panicked"))));
        match self.config.attempt_timeout() {
            Some(limit) => tokio::time::timeout(limit, recover).await.map_err(|_| {
                anyhow::anyhow!("recover timed out after {}ms", limit.as_millis())
            })?,
            None => recover.await,
        }
    }
}

/// Run a strategy's `check`, returning `on_panic` if it panics.
fn check_applies(strategy: &RecoveryStrategy, error: &DetectedError, on_panic: bool) -> bool {
    std::panic::catch_unwind(AssertUnwindSafe(|| strategy.action.check(error))).unwrap_or_else(
        |_| {
            warn!(
                strategy = %strategy.category,
                pattern_id = %error.pattern_id,
                "Recovery check panicked"
            );
            on_panic
        },
    )
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Severity;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    fn render_error(message: &str) -> DetectedError {
        DetectedError::new(
            "contextLost",
            Severity::Error,
            "webgl",
            message,
            json!(message),
        )
    }

    /// Fails `failures` times, then resolves the condition.
    struct FlakyRestore {
        failures: u32,
        calls: Arc<AtomicU32>,
        resolved: Arc<AtomicBool>,
        cleaned: Arc<AtomicBool>,
    }

    impl FlakyRestore {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: Arc::new(AtomicU32::new(0)),
                resolved: Arc::new(AtomicBool::new(false)),
                cleaned: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl RecoveryAction for FlakyRestore {
        fn check(&self, error: &DetectedError) -> bool {
            error.category == "webgl" && !self.resolved.load(Ordering::SeqCst)
        }

        async fn recover(&self, _error: &DetectedError, _context: &Value) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                anyhow::bail!("context restore failed (call {})", call);
            }
            self.resolved.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn cleanup(&self, _context: &Value) -> anyhow::Result<()> {
            self.cleaned.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Accepts every error and never fixes anything.
    struct NoOp {
        label: &'static str,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl RecoveryAction for NoOp {
        fn check(&self, _error: &DetectedError) -> bool {
            true
        }

        async fn recover(&self, _error: &DetectedError, _context: &Value) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(label = self.label, "no-op recover");
            Ok(())
        }
    }

    struct Hangs;

    #[async_trait]
    impl RecoveryAction for Hangs {
        fn check(&self, _error: &DetectedError) -> bool {
            true
        }

        async fn recover(&self, _error: &DetectedError, _context: &Value) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Panics in `recover`.
    struct Crashes;

    #[async_trait]
    impl RecoveryAction for Crashes {
        fn check(&self, _error: &DetectedError) -> bool {
            true
        }

        async fn recover(&self, _error: &DetectedError, _context: &Value) -> anyhow::Result<()> {
            panic!("driver reset while restoring context");
        }
    }

    /// Check panics once the condition has been touched.
    struct CheckCrashesAfterRecover {
        recovered: AtomicBool,
    }

    #[async_trait]
    impl RecoveryAction for CheckCrashesAfterRecover {
        fn check(&self, _error: &DetectedError) -> bool {
            if self.recovered.load(Ordering::SeqCst) {
                panic!("renderer state unreadable");
            }
            true
        }

        async fn recover(&self, _error: &DetectedError, _context: &Value) -> anyhow::Result<()> {
            self.recovered.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Resolves on the first call but fails to release its resources.
    struct LeakyCleanup {
        resolved: AtomicBool,
    }

    #[async_trait]
    impl RecoveryAction for LeakyCleanup {
        fn check(&self, _error: &DetectedError) -> bool {
            !self.resolved.load(Ordering::SeqCst)
        }

        async fn recover(&self, _error: &DetectedError, _context: &Value) -> anyhow::Result<()> {
            self.resolved.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn cleanup(&self, _context: &Value) -> anyhow::Result<()> {
            anyhow::bail!("texture pool still locked")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_third_attempt_with_backoff() {
        let engine = RecoveryEngine::new(RecoveryConfig {
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            ..Default::default()
        });
        let action = FlakyRestore::new(2);
        let calls = Arc::clone(&action.calls);
        let cleaned = Arc::clone(&action.cleaned);
        engine
            .register_strategy(RecoveryStrategy::new("webgl", action).max_retries(3))
            .await;

        let start = tokio::time::Instant::now();
        let outcome = engine
            .attempt_recovery(&render_error("context lost"), &json!({}))
            .await;

        assert_eq!(
            outcome,
            RecoveryOutcome::Recovered {
                strategy: "webgl".to_string(),
                attempts: 3
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(cleaned.load(Ordering::SeqCst));
        assert_eq!(start.elapsed(), Duration::from_millis(100 + 200 + 400));

        let history = engine.recovery_history(&RecoveryFilter::new()).await;
        assert_eq!(history.len(), 3);
        let delays: Vec<_> = history.iter().map(|a| a.delay_ms).collect();
        assert_eq!(delays, vec![100, 200, 400]);
        let flags: Vec<_> = history.iter().map(|a| a.success).collect();
        assert_eq!(flags, vec![false, false, true]);
        let indexes: Vec<_> = history.iter().map(|a| a.attempt).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_retries() {
        let engine = RecoveryEngine::default();
        engine
            .register_strategy(RecoveryStrategy::new("webgl", FlakyRestore::new(u32::MAX)).max_retries(2))
            .await;

        let outcome = engine
            .attempt_recovery(&render_error("context lost"), &json!({}))
            .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts(), 2);

        let history = engine.recovery_history(&RecoveryFilter::new()).await;
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|a| !a.success));
        assert!(history.iter().all(|a| a.failure.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_retry_limit_and_delays() {
        let engine = RecoveryEngine::default();
        engine
            .register_strategy(RecoveryStrategy::new("webgl", FlakyRestore::new(u32::MAX)))
            .await;

        let start = tokio::time::Instant::now();
        let outcome = engine
            .attempt_recovery(&render_error("context lost"), &json!({}))
            .await;

        assert_eq!(outcome.attempts(), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(1000 + 1500 + 2250));
    }

    #[tokio::test]
    async fn test_no_strategy_returns_immediately() {
        let engine = RecoveryEngine::default();
        let outcome = engine
            .attempt_recovery(&render_error("context lost"), &json!({}))
            .await;

        assert_eq!(outcome, RecoveryOutcome::NoStrategy);
        assert!(engine.recovery_history(&RecoveryFilter::new()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_still_present_counts_as_failure() {
        let engine = RecoveryEngine::default();
        let calls = Arc::new(AtomicU32::new(0));
        engine
            .register_strategy(
                RecoveryStrategy::new(
                    "noop",
                    NoOp {
                        label: "noop",
                        calls: Arc::clone(&calls),
                    },
                )
                .max_retries(2),
            )
            .await;

        let outcome = engine
            .attempt_recovery(&render_error("context lost"), &json!({}))
            .await;

        assert!(matches!(outcome, RecoveryOutcome::Exhausted { attempts: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let failures = engine
            .recovery_history(&RecoveryFilter::new().success(false))
            .await;
        assert_eq!(failures.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_matching_strategy_is_pinned() {
        let engine = RecoveryEngine::default();
        let first = FlakyRestore::new(1);
        let first_calls = Arc::clone(&first.calls);
        let second_calls = Arc::new(AtomicU32::new(0));

        engine
            .register_strategy(RecoveryStrategy::new("webgl", first))
            .await;
        engine
            .register_strategy(RecoveryStrategy::new(
                "fallback",
                NoOp {
                    label: "fallback",
                    calls: Arc::clone(&second_calls),
                },
            ))
            .await;

        let outcome = engine
            .attempt_recovery(&render_error("context lost"), &json!({}))
            .await;

        assert_eq!(
            outcome,
            RecoveryOutcome::Recovered {
                strategy: "webgl".to_string(),
                attempts: 2
            }
        );
        assert_eq!(first_calls.load(Ordering::SeqCst), 2);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        assert!(engine
            .recovery_history(&RecoveryFilter::new().strategy("fallback"))
            .await
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout() {
        let engine = RecoveryEngine::new(RecoveryConfig {
            initial_delay_ms: 10,
            attempt_timeout_ms: Some(50),
            ..Default::default()
        });
        engine
            .register_strategy(RecoveryStrategy::new("hang", Hangs).max_retries(1))
            .await;

        let outcome = engine
            .attempt_recovery(&render_error("context lost"), &json!({}))
            .await;

        assert!(!outcome.is_success());
        let history = engine.recovery_history(&RecoveryFilter::new()).await;
        assert_eq!(history.len(), 1);
        assert!(history[0]
            .failure
            .as_deref()
            .is_some_and(|f| f.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_filter_by_detection_and_clear() {
        let engine = RecoveryEngine::default();
        engine
            .register_strategy(RecoveryStrategy::new("webgl", FlakyRestore::new(u32::MAX)).max_retries(1))
            .await;

        let a = render_error("first");
        let b = render_error("second");
        engine.attempt_recovery(&a, &json!({})).await;
        engine.attempt_recovery(&b, &json!({})).await;

        let only_a = engine
            .recovery_history(&RecoveryFilter::new().detection_id(a.detection_id.clone()))
            .await;
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].detection_id, a.detection_id);

        engine.clear_history().await;
        assert!(engine.recovery_history(&RecoveryFilter::new()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_recover_records_failed_attempts() {
        let engine = RecoveryEngine::default();
        engine
            .register_strategy(RecoveryStrategy::new("webgl", Crashes).max_retries(2))
            .await;

        let error = render_error("context lost");
        let history = tokio::spawn(async move {
            engine.attempt_recovery(&error, &json!({})).await;
            engine.recovery_history(&RecoveryFilter::new()).await
        })
        .await
        .unwrap();

        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|a| !a.success));
        assert!(history[0]
            .failure
            .as_deref()
            .is_some_and(|f| f.contains("panicked")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_check_counts_as_still_present() {
        let engine = RecoveryEngine::default();
        engine
            .register_strategy(
                RecoveryStrategy::new(
                    "webgl",
                    CheckCrashesAfterRecover {
                        recovered: AtomicBool::new(false),
                    },
                )
                .max_retries(2),
            )
            .await;

        let outcome = engine
            .attempt_recovery(&render_error("context lost"), &json!({}))
            .await;

        assert_eq!(
            outcome,
            RecoveryOutcome::Exhausted {
                strategy: "webgl".to_string(),
                attempts: 2
            }
        );
        assert_eq!(
            engine
                .recovery_history(&RecoveryFilter::new().success(false))
                .await
                .len(),
            2
        );

        // Already recovered, so selection panics and the strategy is skipped
        let again = engine
            .attempt_recovery(&render_error("context lost"), &json!({}))
            .await;
        assert_eq!(again, RecoveryOutcome::NoStrategy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_failure_keeps_success() {
        let engine = RecoveryEngine::default();
        engine
            .register_strategy(RecoveryStrategy::new(
                "webgl",
                LeakyCleanup {
                    resolved: AtomicBool::new(false),
                },
            ))
            .await;

        let outcome = engine
            .attempt_recovery(&render_error("context lost"), &json!({}))
            .await;

        assert_eq!(
            outcome,
            RecoveryOutcome::Recovered {
                strategy: "webgl".to_string(),
                attempts: 1
            }
        );
        let history = engine.recovery_history(&RecoveryFilter::new()).await;
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
    }
}
