//! Healing pipeline.
//!
//! Owns one of each component and wires them into the service control flow:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      HealingPipeline                          │
//! │  ┌────────────┐ fail ┌────────────┐ errors ┌──────────────┐   │
//! │  │   Graph    │─────▶│  Detector  │───────▶│   Recovery   │   │
//! │  └────────────┘      └────────────┘        └──────────────┘   │
//! │                                                   ▲           │
//! │  ┌────────────┐  threshold events (mpsc)          │           │
//! │  │  Metrics   │───────────────────────────────────┘           │
//! │  └────────────┘                                               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Configuration errors from the graph are returned to the caller as-is;
//! only compute failures enter the detect and recover path.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::detector::{DetectedError, ErrorDetector, Severity};
use crate::error::{AppResult, GraphError};
use crate::graph::{Evaluation, GraphEvaluator, ValueMap};
use crate::metrics::{listener, MetricsMonitor, ThresholdEvent, ThresholdListener};
use crate::recovery::{RecoveryEngine, RecoveryOutcome};

/// Category of errors synthesized from threshold events.
pub const THRESHOLD_CATEGORY: &str = "performance";

// ============================================================================
// Outcomes
// ============================================================================

/// What happened after a node failed.
#[derive(Debug, Clone, Serialize)]
pub struct HealingReport {
    /// Node whose compute function failed
    pub node_id: String,
    /// Rendered failure chain
    pub failure: String,
    /// Classified errors with the recovery outcome of each, in detection order
    pub recoveries: Vec<(DetectedError, RecoveryOutcome)>,
}

impl HealingReport {
    /// True when at least one error was classified and every recovery
    /// succeeded.
    pub fn fully_recovered(&self) -> bool {
        !self.recoveries.is_empty() && self.recoveries.iter().all(|(_, o)| o.is_success())
    }
}

/// Result of [`HealingPipeline::run`].
#[derive(Debug)]
pub enum PipelineOutcome {
    /// The evaluation succeeded.
    Computed(Evaluation),
    /// A node failed and every classified error was recovered. Re-run to
    /// produce outputs.
    Recovered(HealingReport),
    /// A node failed and the failure was not classified, or some recovery
    /// did not succeed.
    Unrecovered(HealingReport),
}

impl PipelineOutcome {
    pub fn is_computed(&self) -> bool {
        matches!(self, PipelineOutcome::Computed(_))
    }

    pub fn evaluation(&self) -> Option<&Evaluation> {
        match self {
            PipelineOutcome::Computed(evaluation) => Some(evaluation),
            _ => None,
        }
    }

    pub fn report(&self) -> Option<&HealingReport> {
        match self {
            PipelineOutcome::Computed(_) => None,
            PipelineOutcome::Recovered(report) | PipelineOutcome::Unrecovered(report) => {
                Some(report)
            }
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// The four components and the glue between them.
///
/// Register nodes through [`graph_mut`](Self::graph_mut) before sharing the
/// pipeline; everything else takes `&self`.
pub struct HealingPipeline {
    graph: GraphEvaluator,
    detector: ErrorDetector,
    recovery: Arc<RecoveryEngine>,
    metrics: MetricsMonitor,
    forwarder: RwLock<Option<Arc<dyn ThresholdListener>>>,
}

impl HealingPipeline {
    /// Build every component from `config`.
    pub fn new(config: &Config) -> Self {
        Self {
            graph: GraphEvaluator::new(),
            detector: ErrorDetector::new(config.detector.clone()),
            recovery: Arc::new(RecoveryEngine::new(config.recovery.clone())),
            metrics: MetricsMonitor::new(config.metrics.clone()),
            forwarder: RwLock::new(None),
        }
    }

    pub fn graph(&self) -> &GraphEvaluator {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut GraphEvaluator {
        &mut self.graph
    }

    pub fn detector(&self) -> &ErrorDetector {
        &self.detector
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    pub fn metrics(&self) -> &MetricsMonitor {
        &self.metrics
    }

    /// Evaluate `start_node`; on a compute failure classify it and attempt
    /// recovery for every detected error.
    ///
    /// The classification context is
    /// `{"node": <id>, "error": <failure chain>, "context": <context>}`.
    /// Handlers dispatched by the detector have finished when this returns.
    ///
    /// # Errors
    /// Graph configuration errors (unknown node, missing input or output).
    pub async fn run(
        &self,
        start_node: &str,
        inputs: &ValueMap,
        context: Value,
    ) -> AppResult<PipelineOutcome> {
        let (node_id, source) = match self.graph.evaluate(start_node, inputs).await {
            Ok(evaluation) => return Ok(PipelineOutcome::Computed(evaluation)),
            Err(GraphError::NodeComputation { node_id, source }) => (node_id, source),
            Err(e) => return Err(e.into()),
        };

        let failure = format!("{:#}", source);
        warn!(node_id = %node_id, error = %failure, "Node computation failed, classifying");

        let classification = json!({
            "node": node_id,
            "error": failure,
            "context": context,
        });

        let (errors, dispatch) = self.detector.detect(classification.clone()).await.into_parts();
        if errors.is_empty() {
            debug!(node_id = %node_id, "Failure matched no error pattern");
        }

        let mut recoveries = Vec::with_capacity(errors.len());
        for error in errors {
            let outcome = self.recovery.attempt_recovery(&error, &classification).await;
            recoveries.push((error, outcome));
        }
        dispatch.wait().await;

        let report = HealingReport {
            node_id,
            failure,
            recoveries,
        };

        if report.fully_recovered() {
            info!(
                node_id = %report.node_id,
                errors = report.recoveries.len(),
                "Pipeline recovered from node failure"
            );
            Ok(PipelineOutcome::Recovered(report))
        } else {
            warn!(
                node_id = %report.node_id,
                errors = report.recoveries.len(),
                "Pipeline could not recover from node failure"
            );
            Ok(PipelineOutcome::Unrecovered(report))
        }
    }

    /// Route threshold events into the recovery engine.
    ///
    /// Installs a metrics listener that queues every event; a background
    /// task turns each into a [`threshold_error`] and runs recovery for it,
    /// one at a time. Calling this again replaces the previous forwarder.
    /// The task ends once [`stop_forwarding`](Self::stop_forwarding) or
    /// [`MetricsMonitor::clear`] drops the listener and the queue drains.
    pub async fn forward_thresholds(&self) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ThresholdEvent>();

        let forwarder = listener(move |event| {
            tx.send(event.clone())
                .map_err(|_| anyhow::anyhow!("threshold forwarding task has stopped"))
        });

        self.stop_forwarding().await;
        self.metrics.add_listener(Arc::clone(&forwarder)).await;
        *self.forwarder.write().await = Some(forwarder);

        let recovery = Arc::clone(&self.recovery);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let error = threshold_error(&event);
                let outcome = recovery.attempt_recovery(&error, &error.context).await;
                debug!(
                    metric = %event.metric,
                    success = outcome.is_success(),
                    attempts = outcome.attempts(),
                    "Handled threshold event"
                );
            }
            debug!("Threshold forwarding stopped");
        })
    }

    /// Remove the listener installed by [`forward_thresholds`](Self::forward_thresholds).
    /// Returns `false` if none was installed.
    pub async fn stop_forwarding(&self) -> bool {
        let Some(previous) = self.forwarder.write().await.take() else {
            return false;
        };
        self.metrics.remove_listener(&previous).await
    }
}

impl Default for HealingPipeline {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

/// Synthetic error for a threshold event: pattern id `threshold:<metric>`,
/// category [`THRESHOLD_CATEGORY`], severity `warn`, the event as context.
pub fn threshold_error(event: &ThresholdEvent) -> DetectedError {
    DetectedError::new(
        format!("threshold:{}", event.metric),
        Severity::Warn,
        THRESHOLD_CATEGORY,
        format!(
            "{} at {} exceeded threshold {}",
            event.metric, event.value, event.threshold
        ),
        json!({
            "metric": event.metric,
            "value": event.value,
            "threshold": event.threshold,
            "timestamp": event.timestamp.to_rfc3339(),
        }),
    )
}

// ============================================================================
// Tests
// ============================================================================
