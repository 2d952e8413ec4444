//! Recovery strategies, attempts and outcomes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::detector::{DetectedError, DetectionId};

/// The behavior of a recovery strategy.
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    /// Whether this strategy applies to `error` right now.
    ///
    /// Called once to select the strategy and again after every successful
    /// `recover` call; returning `false` at that point means the error
    /// condition is resolved.
    fn check(&self, error: &DetectedError) -> bool;

    /// Try to fix the condition behind `error`.
    async fn recover(&self, error: &DetectedError, context: &Value) -> anyhow::Result<()>;

    /// Runs once after a verified recovery.
    async fn cleanup(&self, _context: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A registered recovery action bound to an error category label.
#[derive(Clone)]
pub struct RecoveryStrategy {
    pub(crate) category: String,
    pub(crate) action: Arc<dyn RecoveryAction>,
    pub(crate) max_retries: Option<u32>,
}

impl RecoveryStrategy {
    /// Create a strategy that uses the engine's default retry limit.
    pub fn new<A>(category: impl Into<String>, action: A) -> Self
    where
        A: RecoveryAction + 'static,
    {
        Self {
            category: category.into(),
            action: Arc::new(action),
            max_retries: None,
        }
    }

    /// Override the number of attempts.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn category(&self) -> &str {
        &self.category
    }
}

impl fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryStrategy")
            .field("category", &self.category)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// One recorded attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub timestamp: DateTime<Utc>,
    /// 1-based attempt index within its recovery run
    pub attempt: u32,
    pub detection_id: DetectionId,
    pub pattern_id: String,
    /// Category label of the strategy that ran
    pub strategy: String,
    pub success: bool,
    /// Backoff slept before this attempt
    pub delay_ms: u64,
    /// Why the attempt failed, if it did
    pub failure: Option<String>,
}

/// Result of [`RecoveryEngine::attempt_recovery`](super::RecoveryEngine::attempt_recovery).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// The strategy's check no longer holds after a recover call.
    Recovered { strategy: String, attempts: u32 },
    /// Every attempt failed.
    Exhausted { strategy: String, attempts: u32 },
    /// No registered strategy applies to the error.
    NoStrategy,
}

impl RecoveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RecoveryOutcome::Recovered { .. })
    }

    /// Attempts made; zero when no strategy matched.
    pub fn attempts(&self) -> u32 {
        match self {
            RecoveryOutcome::Recovered { attempts, .. }
            | RecoveryOutcome::Exhausted { attempts, .. } => *attempts,
            RecoveryOutcome::NoStrategy => 0,
        }
    }
}

/// Exact-match filter over the recovery history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryFilter {
    pub strategy: Option<String>,
    pub pattern_id: Option<String>,
    pub detection_id: Option<DetectionId>,
    pub success: Option<bool>,
    pub attempt: Option<u32>,
}

impl RecoveryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn pattern_id(mut self, pattern_id: impl Into<String>) -> Self {
        self.pattern_id = Some(pattern_id.into());
        self
    }

    pub fn detection_id(mut self, detection_id: DetectionId) -> Self {
        self.detection_id = Some(detection_id);
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn matches(&self, record: &RecoveryAttempt) -> bool {
        self.strategy.as_ref().map_or(true, |s| *s == record.strategy)
            && self
                .pattern_id
                .as_ref()
                .map_or(true, |p| *p == record.pattern_id)
            && self
                .detection_id
                .as_ref()
                .map_or(true, |d| *d == record.detection_id)
            && self.success.map_or(true, |s| s == record.success)
            && self.attempt.map_or(true, |a| a == record.attempt)
    }
}
