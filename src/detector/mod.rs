//! Pattern-based failure classification.
//!
//! The detector scans a context value against every registered
//! [`ErrorPattern`], records each match in a bounded history and hands it to
//! the [`ErrorHandler`] registered for the match's category.
//!
//! # Architecture
//!
//! ```text
//! context ──▶ patterns (in registration order) ──▶ DetectedError*
//!                                                     │
//!                          ┌──────────────────────────┤
//!                          ▼                          ▼
//!                  history (FIFO, bounded)    category handler (spawned)
//! ```
//!
//! Handlers run as spawned tasks. [`ErrorDetector::detect`] returns before
//! they finish; the returned [`Detection`] carries a [`HandlerDispatch`]
//! that can be awaited when the caller needs them settled.

mod types;

pub use types::{
    context_text, DetectedError, DetectionId, DetectionSummary, ErrorPattern, HistoryFilter,
    Matcher, Predicate, Severity,
};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DetectorConfig;

// ============================================================================
// Handlers
// ============================================================================

/// Reacts to detected errors of one category.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Handle a detection. Errors are logged by the detector and go no further.
    async fn handle(&self, error: &DetectedError) -> anyhow::Result<()>;
}

/// Adapter for synchronous handler closures.
struct FnHandler<F>(F);

#[async_trait]
impl<F> ErrorHandler for FnHandler<F>
where
    F: Fn(&DetectedError) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, error: &DetectedError) -> anyhow::Result<()> {
        (self.0)(error)
    }
}

/// Completion handle for the handlers spawned by one `detect` call.
#[derive(Debug, Default)]
pub struct HandlerDispatch {
    handles: Vec<JoinHandle<()>>,
}

impl HandlerDispatch {
    /// Number of handler tasks spawned.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every handler task. A panicking handler is logged.
    pub async fn wait(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Error handler task panicked");
            }
        }
    }
}

/// Result of one `detect` call.
#[derive(Debug)]
pub struct Detection {
    errors: Vec<DetectedError>,
    dispatch: HandlerDispatch,
}

impl Detection {
    /// Every detected error, in pattern registration order.
    pub fn errors(&self) -> &[DetectedError] {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Split into the errors and the handler completion handle.
    pub fn into_parts(self) -> (Vec<DetectedError>, HandlerDispatch) {
        (self.errors, self.dispatch)
    }

    /// Wait for all handlers, then return the errors.
    pub async fn settled(self) -> Vec<DetectedError> {
        self.dispatch.wait().await;
        self.errors
    }
}

// ============================================================================
// Detector
// ============================================================================

#[derive(Default)]
struct DetectorState {
    patterns: Vec<Arc<ErrorPattern>>,
    handlers: HashMap<String, Arc<dyn ErrorHandler>>,
    history: VecDeque<DetectedError>,
}

/// Failure classifier with bounded detection history.
///
/// # Example
///
/// ```rust,ignore
/// let detector = ErrorDetector::new(DetectorConfig::default());
/// detector
///     .register_pattern(
///         ErrorPattern::new("oom", Matcher::regex("(?i)out of memory")?)
///             .severity(Severity::Critical)
///             .category("system"),
///     )
///     .await;
///
/// let detection = detector.detect("Application crashed: out of memory").await;
/// assert_eq!(detection.len(), 1);
/// ```
pub struct ErrorDetector {
    config: DetectorConfig,
    state: RwLock<DetectorState>,
}

impl ErrorDetector {
    /// Create a detector with no patterns or handlers.
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            state: RwLock::new(DetectorState::default()),
        }
    }

    /// Register a pattern. A pattern with the same id is replaced in place.
    pub async fn register_pattern(&self, pattern: ErrorPattern) {
        let mut state = self.state.write().await;
        let pattern = Arc::new(pattern);

        match state.patterns.iter_mut().find(|p| p.id == pattern.id) {
            Some(existing) => {
                debug!(pattern_id = %pattern.id, "Replaced error pattern");
                *existing = pattern;
            }
            None => {
                debug!(
                    pattern_id = %pattern.id,
                    severity = %pattern.severity,
                    category = %pattern.category,
                    "Registered error pattern"
                );
                state.patterns.push(pattern);
            }
        }
    }

    /// Register the handler for a category, replacing any previous one.
    pub async fn register_handler<H>(&self, category: impl Into<String>, handler: H)
    where
        H: ErrorHandler + 'static,
    {
        let category = category.into();
        let replaced = self
            .state
            .write()
            .await
            .handlers
            .insert(category.clone(), Arc::new(handler))
            .is_some();
        debug!(category = %category, replaced = replaced, "Registered error handler");
    }

    /// Register a synchronous closure as the handler for a category.
    pub async fn register_handler_fn<F>(&self, category: impl Into<String>, handler: F)
    where
        F: Fn(&DetectedError) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_handler(category, FnHandler(handler)).await;
    }

    /// Scan `context` against every pattern.
    ///
    /// Matches are appended to history and dispatched to their category
    /// handler. A matcher that fails is logged and counted as no match for
    /// that pattern only.
    pub async fn detect(&self, context: impl Into<Value>) -> Detection {
        let context = context.into();
        let patterns = self.state.read().await.patterns.clone();

        let mut errors = Vec::new();
        for pattern in &patterns {
            match pattern.matcher.matches(&context) {
                Ok(true) => errors.push(DetectedError::from_pattern(pattern, context.clone())),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        pattern_id = %pattern.id,
                        error = %e,
                        "Error pattern matcher failed, treating as no match"
                    );
                }
            }
        }

        if errors.is_empty() {
            return Detection {
                errors,
                dispatch: HandlerDispatch::default(),
            };
        }

        let handlers: Vec<_> = {
            let mut state = self.state.write().await;
            for error in &errors {
                state.history.push_back(error.clone());
                while state.history.len() > self.config.history_capacity {
                    state.history.pop_front();
                }
            }
            errors
                .iter()
                .filter_map(|e| {
                    state
                        .handlers
                        .get(&e.category)
                        .map(|h| (Arc::clone(h), e.clone()))
                })
                .collect()
        };

        for error in &errors {
            info!(
                pattern_id = %error.pattern_id,
                severity = %error.severity,
                category = %error.category,
                "Detected error"
            );
        }

        let handles = handlers
            .into_iter()
            .map(|(handler, error)| {
                tokio::spawn(async move {
                    if let Err(e) = handler.handle(&error).await {
                        error!(
                            category = %error.category,
                            pattern_id = %error.pattern_id,
                            error = %e,
                            "Error handler failed"
                        );
                    }
                })
            })
            .collect();

        Detection {
            errors,
            dispatch: HandlerDispatch { handles },
        }
    }

    /// History entries matching `filter`, oldest first.
    pub async fn history(&self, filter: &HistoryFilter) -> Vec<DetectedError> {
        self.state
            .read()
            .await
            .history
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Drop all history entries.
    pub async fn clear_history(&self) {
        self.state.write().await.history.clear();
    }

    /// Counts per severity and the `limit` most frequent pattern ids over
    /// the history entries matching `filter`. Use
    /// [`HistoryFilter::since`] to summarize a recent window.
    pub async fn summary(&self, filter: &HistoryFilter, limit: usize) -> DetectionSummary {
        let state = self.state.read().await;
        let mut summary = DetectionSummary::default();

        let mut per_pattern: HashMap<&str, usize> = HashMap::new();
        for error in state.history.iter().filter(|e| filter.matches(e)) {
            summary.total += 1;
            *summary.by_severity.entry(error.severity).or_insert(0) += 1;
            *per_pattern.entry(error.pattern_id.as_str()).or_insert(0) += 1;
        }

        let mut top: Vec<_> = per_pattern
            .into_iter()
            .map(|(id, count)| (id.to_string(), count))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(limit);
        summary.top_patterns = top;

        summary
    }

    /// Number of registered patterns.
    pub async fn pattern_count(&self) -> usize {
        self.state.read().await.patterns.len()
    }
}

impl Default for ErrorDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

// ============================================================================
// Tests
// ============================================================================
