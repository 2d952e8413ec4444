//! Core types for failure classification.
//!
//! - [`Severity`]: ordered severity levels
//! - [`Matcher`]: text or predicate matcher for an [`ErrorPattern`]
//! - [`DetectedError`]: one pattern match, stored in the detector history
//! - [`HistoryFilter`]: exact-match query over the history

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DetectionId(pub String);

impl DetectionId {
    /// Create a new unique detection ID.
    pub fn new() -> Self {
        Self(format!("det_{}", uuid::Uuid::new_v4()))
    }
}

impl Default for DetectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DetectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Severity
// ============================================================================

/// Severity of a detected error, ordered `Info < Warn < Error < Critical`.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info = 0,
    Warn = 1,
    #[default]
    Error = 2,
    Critical = 3,
}

impl Severity {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warn" | "warning" => Ok(Severity::Warn),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

// ============================================================================
// Matcher
// ============================================================================

/// Predicate over a structured context. Returning `Err` counts as no match.
pub type Predicate = Arc<dyn Fn(&Value) -> anyhow::Result<bool> + Send + Sync>;

/// How an [`ErrorPattern`] recognizes a context.
#[derive(Clone)]
pub enum Matcher {
    /// Regular expression searched in the context's string form.
    Text(Regex),
    /// Predicate invoked with the structured context.
    Predicate(Predicate),
}

impl Matcher {
    /// Compile a text matcher. Use `(?i)` for case-insensitive matching.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Matcher::Text(Regex::new(pattern)?))
    }

    /// Wrap a predicate.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Matcher::Predicate(Arc::new(f))
    }

    /// Test the matcher against a context. A panicking predicate is
    /// reported as an error.
    pub fn matches(&self, context: &Value) -> anyhow::Result<bool> {
        match self {
            Matcher::Text(regex) => Ok(regex.is_match(&context_text(context))),
            Matcher::Predicate(predicate) => {
                std::panic::catch_unwind(AssertUnwindSafe(|| predicate(context)))
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("predicate panicked")))
            }
        }
    }
}

impl From<Regex> for Matcher {
    fn from(regex: Regex) -> Self {
        Matcher::Text(regex)
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Text(regex) => f.debug_tuple("Text").field(&regex.as_str()).finish(),
            Matcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// String form of a context: a JSON string's contents, otherwise the JSON
/// rendering of the value.
pub fn context_text(context: &Value) -> Cow<'_, str> {
    match context {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        other => Cow::Owned(other.to_string()),
    }
}

// ============================================================================
// Error Pattern
// ============================================================================

/// A registered failure signature.
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub id: String,
    pub matcher: Matcher,
    pub severity: Severity,
    pub category: String,
    pub description: String,
}

impl ErrorPattern {
    /// Create a pattern with severity `error`, category `general` and an
    /// empty description.
    pub fn new(id: impl Into<String>, matcher: Matcher) -> Self {
        Self {
            id: id.into(),
            matcher,
            severity: Severity::default(),
            category: "general".to_string(),
            description: String::new(),
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

// ============================================================================
// Detected Error
// ============================================================================

/// A pattern match against a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedError {
    /// Unique id of this detection
    pub detection_id: DetectionId,
    /// Id of the pattern that matched
    pub pattern_id: String,
    /// When the match happened
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub category: String,
    pub description: String,
    /// The context exactly as it was passed to `detect`
    pub context: Value,
}

impl DetectedError {
    /// Build a detection for a matched pattern.
    pub fn from_pattern(pattern: &ErrorPattern, context: Value) -> Self {
        Self::new(
            pattern.id.clone(),
            pattern.severity,
            pattern.category.clone(),
            pattern.description.clone(),
            context,
        )
    }

    /// Build a detection that did not come from a registered pattern, e.g. a
    /// synthetic error raised by a threshold alert.
    pub fn new(
        pattern_id: impl Into<String>,
        severity: Severity,
        category: impl Into<String>,
        description: impl Into<String>,
        context: Value,
    ) -> Self {
        Self {
            detection_id: DetectionId::new(),
            pattern_id: pattern_id.into(),
            timestamp: Utc::now(),
            severity,
            category: category.into(),
            description: description.into(),
            context,
        }
    }
}

// ============================================================================
// History Query
// ============================================================================

/// Exact-match filter over the detection history. Unset fields match
/// everything; the default filter returns the full history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryFilter {
    pub pattern_id: Option<String>,
    pub severity: Option<Severity>,
    pub category: Option<String>,
    /// Only entries detected at or after this instant
    pub since: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pattern_id(mut self, pattern_id: impl Into<String>) -> Self {
        self.pattern_id = Some(pattern_id.into());
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Whether every set field equals the entry's field and the entry is
    /// not older than `since`.
    pub fn matches(&self, error: &DetectedError) -> bool {
        self.pattern_id
            .as_ref()
            .map_or(true, |id| *id == error.pattern_id)
            && self.severity.map_or(true, |s| s == error.severity)
            && self
                .category
                .as_ref()
                .map_or(true, |c| *c == error.category)
            && self.since.map_or(true, |t| error.timestamp >= t)
    }
}

/// Aggregate view of the detection history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionSummary {
    /// Entries currently in history
    pub total: usize,
    /// Entry count per severity
    pub by_severity: BTreeMap<Severity, usize>,
    /// Most frequent pattern ids, most frequent first
    pub top_patterns: Vec<(String, usize)>,
}
