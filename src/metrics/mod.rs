//! Sliding-window metrics with threshold alerts.
//!
//! Every metric keeps its current value and the most recent `sample_size`
//! samples. When an update pushes the current value above the metric's
//! threshold, every registered [`ThresholdListener`] receives a
//! [`ThresholdEvent`] before `update` returns.
//!
//! The monitor has no sampling loop; hosts push samples from their own
//! timers or request instrumentation.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::config::MetricsConfig;

// ============================================================================
// Events and Listeners
// ============================================================================

/// Emitted when a metric's current value exceeds its threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdEvent {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

/// Receives threshold events.
pub trait ThresholdListener: Send + Sync {
    /// Called synchronously from `update`. An error is logged and does not
    /// affect other listeners.
    fn on_threshold(&self, event: &ThresholdEvent) -> anyhow::Result<()>;
}

struct FnListener<F>(F);

impl<F> ThresholdListener for FnListener<F>
where
    F: Fn(&ThresholdEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_threshold(&self, event: &ThresholdEvent) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

/// Wrap a closure as a shareable listener. Keep the returned `Arc` to remove
/// the listener later.
pub fn listener<F>(f: F) -> Arc<dyn ThresholdListener>
where
    F: Fn(&ThresholdEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnListener(f))
}

fn same_listener(a: &Arc<dyn ThresholdListener>, b: &Arc<dyn ThresholdListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

// ============================================================================
// Metrics
// ============================================================================

/// Options for [`MetricsMonitor::init_metric`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricOptions {
    /// Window capacity; the monitor's default when unset
    pub sample_size: Option<usize>,
    pub threshold: Option<f64>,
}

impl MetricOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = Some(sample_size);
        self
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

#[derive(Debug, Clone)]
struct Metric {
    value: f64,
    samples: VecDeque<f64>,
    sample_size: usize,
    threshold: Option<f64>,
    updated_at: DateTime<Utc>,
}

impl Metric {
    fn new(sample_size: usize, threshold: Option<f64>) -> Self {
        Self {
            value: 0.0,
            samples: VecDeque::with_capacity(sample_size),
            sample_size,
            threshold,
            updated_at: Utc::now(),
        }
    }

    fn record(&mut self, value: f64) {
        self.value = value;
        self.samples.push_back(value);
        while self.samples.len() > self.sample_size {
            self.samples.pop_front();
        }
        self.updated_at = Utc::now();
    }

    fn stats(&self, name: &str) -> MetricStats {
        let count = self.samples.len();
        let (average, min, max) = if count == 0 {
            (0.0, 0.0, 0.0)
        } else {
            let sum: f64 = self.samples.iter().sum();
            let min = self.samples.iter().copied().fold(f64::INFINITY, f64::min);
            let max = self.samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (sum / count as f64, min, max)
        };

        MetricStats {
            name: name.to_string(),
            current: self.value,
            average,
            min,
            max,
            sample_count: count,
            samples: self.samples.iter().copied().collect(),
            threshold: self.threshold,
            updated_at: self.updated_at,
        }
    }
}

/// Statistics over a metric's present window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub name: String,
    /// Most recent value
    pub current: f64,
    /// Mean over the window (0.0 when empty)
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub sample_count: usize,
    /// Window contents, oldest first
    pub samples: Vec<f64>,
    pub threshold: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Monitor
// ============================================================================

#[derive(Default)]
struct MonitorState {
    metrics: HashMap<String, Metric>,
    listeners: Vec<Arc<dyn ThresholdListener>>,
}

/// Sliding-window metric tracker.
///
/// Create one per service and pass it by reference (or `Arc`) to the code
/// that records samples.
///
/// # Example
///
/// ```rust,ignore
/// let monitor = MetricsMonitor::new(MetricsConfig::default());
/// monitor
///     .init_metric("memory", MetricOptions::new().threshold(1000.0))
///     .await;
/// monitor.add_listener(listener(|event| {
///     tracing::warn!(metric = %event.metric, value = event.value, "Threshold exceeded");
///     Ok(())
/// })).await;
///
/// monitor.update("memory", 1200.0).await;
/// ```
pub struct MetricsMonitor {
    config: MetricsConfig,
    state: RwLock<MonitorState>,
}

impl MetricsMonitor {
    /// Create a monitor with no metrics or listeners.
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            state: RwLock::new(MonitorState::default()),
        }
    }

    /// Start tracking `name`. Re-initializing resets the window and value.
    pub async fn init_metric(&self, name: impl Into<String>, options: MetricOptions) {
        let name = name.into();
        let sample_size = options
            .sample_size
            .unwrap_or(self.config.default_sample_size)
            .max(1);

        let replaced = self
            .state
            .write()
            .await
            .metrics
            .insert(name.clone(), Metric::new(sample_size, options.threshold))
            .is_some();

        debug!(
            metric = %name,
            sample_size = sample_size,
            threshold = ?options.threshold,
            replaced = replaced,
            "Initialized metric"
        );
    }

    /// Record a sample. Returns `false` (and does nothing) for a metric that
    /// was never initialized.
    pub async fn update(&self, name: &str, value: f64) -> bool {
        let (event, listeners) = {
            let mut state = self.state.write().await;
            let Some(metric) = state.metrics.get_mut(name) else {
                debug!(metric = %name, "Ignoring update for uninitialized metric");
                return false;
            };
            metric.record(value);

            let event = metric
                .threshold
                .filter(|threshold| value > *threshold)
                .map(|threshold| ThresholdEvent {
                    metric: name.to_string(),
                    value,
                    threshold,
                    timestamp: metric.updated_at,
                });

            match event {
                Some(event) => (Some(event), state.listeners.clone()),
                None => (None, Vec::new()),
            }
        };

        if let Some(event) = event {
            warn!(
                metric = %event.metric,
                value = event.value,
                threshold = event.threshold,
                listeners = listeners.len(),
                "Metric exceeded threshold"
            );
            notify(&listeners, &event);
        }

        true
    }

    /// Statistics for `name`, or `None` if it was never initialized.
    pub async fn stats(&self, name: &str) -> Option<MetricStats> {
        self.state
            .read()
            .await
            .metrics
            .get(name)
            .map(|m| m.stats(name))
    }

    /// Statistics for every metric, sorted by name.
    pub async fn snapshot(&self) -> Vec<MetricStats> {
        let state = self.state.read().await;
        let mut all: Vec<_> = state
            .metrics
            .iter()
            .map(|(name, metric)| metric.stats(name))
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Names of all initialized metrics, sorted.
    pub async fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.read().await.metrics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a listener. Returns `false` if this exact listener is
    /// already registered.
    pub async fn add_listener(&self, listener: Arc<dyn ThresholdListener>) -> bool {
        let mut state = self.state.write().await;
        if state.listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        state.listeners.push(listener);
        true
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub async fn remove_listener(&self, listener: &Arc<dyn ThresholdListener>) -> bool {
        let mut state = self.state.write().await;
        let before = state.listeners.len();
        state.listeners.retain(|l| !same_listener(l, listener));
        state.listeners.len() != before
    }

    /// Number of registered listeners.
    pub async fn listener_count(&self) -> usize {
        self.state.read().await.listeners.len()
    }

    /// Drop every metric, threshold and listener.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        *state = MonitorState::default();
        debug!("Cleared metrics monitor");
    }
}

impl Default for MetricsMonitor {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

/// Deliver `event` to every listener, isolating errors and panics.
fn notify(listeners: &[Arc<dyn ThresholdListener>], event: &ThresholdEvent) {
    for listener in listeners {
        match std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_threshold(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(metric = %event.metric, error = %e, "Threshold listener failed");
            }
            Err(_) => {
                error!(metric = %event.metric, "Threshold listener panicked");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
