//! # Render Healing
//!
//! Self-healing observability core for an interactive rendering service.
//!
//! ## Components
//!
//! - **Graph Evaluator**: lazily evaluated dataflow graph with a per-call memo
//!   and an opt-in persistent result cache
//! - **Error Detector**: regex and predicate patterns that classify failures
//!   and dispatch category handlers
//! - **Recovery Engine**: category strategies retried with exponential backoff
//!   and verified after every attempt
//! - **Metrics Monitor**: sliding-window statistics with threshold alerts
//! - **Healing Pipeline**: evaluate, classify and recover in one call
//!
//! ## Architecture
//!
//! ```text
//! host service ──▶ HealingPipeline ──▶ GraphEvaluator
//!                        │ compute failure
//!                        ▼
//!                  ErrorDetector ──▶ RecoveryEngine ◀── MetricsMonitor
//!                                                      (threshold events)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use render_healing::{Config, HealingPipeline, Node, PipelineOutcome, ValueMap};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     render_healing::telemetry::init_logging(&config.logging);
//!
//!     let mut pipeline = HealingPipeline::new(&config);
//!     pipeline.graph_mut().register_node(
//!         Node::new("frame").outputs(["pixels"]).compute_fn(render_frame),
//!     )?;
//!
//!     match pipeline.run("frame", &ValueMap::new(), serde_json::Value::Null).await? {
//!         PipelineOutcome::Computed(evaluation) => present(evaluation.outputs()),
//!         other => tracing::warn!(?other, "Frame failed"),
//!     }
//!     Ok(())
//! }
//! ```

/// Configuration loaded from environment variables.
pub mod config;
/// Detection patterns, history and handler dispatch.
pub mod detector;
/// Error types and result aliases.
pub mod error;
/// Dataflow graph evaluation and caching.
pub mod graph;
/// Sliding-window metrics and threshold listeners.
pub mod metrics;
/// Evaluate, classify and recover orchestration.
pub mod pipeline;
/// Strategy-based recovery with exponential backoff.
pub mod recovery;
/// Tracing subscriber setup.
pub mod telemetry;

pub use config::Config;
pub use detector::{DetectedError, ErrorDetector, ErrorPattern, HistoryFilter, Matcher, Severity};
pub use error::{AppError, AppResult, GraphError, GraphResult};
pub use graph::{value_map, Compute, Evaluation, GraphEvaluator, Node, ValueMap};
pub use metrics::{MetricOptions, MetricStats, MetricsMonitor, ThresholdEvent, ThresholdListener};
pub use pipeline::{HealingPipeline, HealingReport, PipelineOutcome};
pub use recovery::{RecoveryAction, RecoveryEngine, RecoveryOutcome, RecoveryStrategy};
