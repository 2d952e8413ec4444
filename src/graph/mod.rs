//! Dataflow graph evaluation.
//!
//! Nodes are registered with declared inputs and outputs and wired together
//! with [`Connection`]s. [`GraphEvaluator::evaluate`] pulls a node's inputs
//! depth-first through its incoming connections and computes what it needs.
//!
//! # Caching
//!
//! Results live in two layers:
//!
//! ```text
//! evaluate() ──▶ call memo (every node, this call only)
//!                     │
//!                     └──▶ persistent cache (cacheable nodes, until clear_cache)
//! ```
//!
//! The call memo guarantees each node is computed at most once per call, so a
//! diamond-shaped dependency observes one consistent upstream result. The
//! persistent cache is only written once the whole evaluation succeeds.

mod node;

pub use node::{value_map, Compute, Connection, Node, ValueMap};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{GraphError, GraphResult, PortKind};

// ============================================================================
// Evaluation Result
// ============================================================================

/// Outcome of one [`GraphEvaluator::evaluate`] call.
#[derive(Debug, Clone)]
pub struct Evaluation {
    target: String,
    outputs: Arc<ValueMap>,
    results: HashMap<String, Arc<ValueMap>>,
    computed: Vec<String>,
    cache_hits: Vec<String>,
}

impl Evaluation {
    /// The node evaluation started from.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Outputs of the start node.
    pub fn outputs(&self) -> &ValueMap {
        &self.outputs
    }

    /// A single output of the start node.
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    /// Outputs of any node resolved during this call.
    pub fn node(&self, node_id: &str) -> Option<&ValueMap> {
        self.results.get(node_id).map(|r| r.as_ref())
    }

    /// Nodes whose compute function ran, in execution order.
    pub fn computed(&self) -> &[String] {
        &self.computed
    }

    /// Nodes served from the persistent cache.
    pub fn cache_hits(&self) -> &[String] {
        &self.cache_hits
    }

    /// Take the start node's outputs.
    pub fn into_outputs(self) -> ValueMap {
        Arc::try_unwrap(self.outputs).unwrap_or_else(|shared| (*shared).clone())
    }
}

/// One step of the resolved execution order.
enum Step {
    Cached(String, Arc<ValueMap>),
    Compute(Arc<Node>),
}

// ============================================================================
// Graph Evaluator
// ============================================================================

/// Node registry, connection table and persistent result cache.
///
/// Registration takes `&mut self`; evaluation only needs `&self`, so a fully
/// wired evaluator can be shared behind an `Arc`.
#[derive(Debug, Default)]
pub struct GraphEvaluator {
    nodes: HashMap<String, Arc<Node>>,
    order: Vec<String>,
    /// Keyed by `(to_node, to_input)`: at most one edge per input.
    incoming: HashMap<(String, String), Connection>,
    cache: RwLock<HashMap<String, Arc<ValueMap>>>,
}

impl GraphEvaluator {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node.
    ///
    /// # Errors
    /// [`GraphError::DuplicateNode`] if the id is already registered.
    pub fn register_node(&mut self, node: Node) -> GraphResult<()> {
        if self.nodes.contains_key(node.id()) {
            return Err(GraphError::DuplicateNode {
                node_id: node.id().to_string(),
            });
        }

        debug!(
            node_id = %node.id(),
            inputs = node.input_names().len(),
            outputs = node.output_names().len(),
            cacheable = node.is_cacheable(),
            "Registered node"
        );

        self.order.push(node.id().to_string());
        self.nodes.insert(node.id().to_string(), Arc::new(node));
        Ok(())
    }

    /// Route `from_node.from_output` into `to_node.to_input`.
    ///
    /// # Errors
    /// - [`GraphError::UnknownNode`] if either endpoint is unregistered
    /// - [`GraphError::UnknownPort`] if a port is not declared on its node
    /// - [`GraphError::DuplicateEdge`] if `to_node.to_input` is already connected
    /// - [`GraphError::CycleDetected`] if the edge would close a cycle
    pub fn connect(
        &mut self,
        from_node: &str,
        from_output: &str,
        to_node: &str,
        to_input: &str,
    ) -> GraphResult<()> {
        let source = self.node(from_node)?;
        let target = self.node(to_node)?;

        if !source.has_output(from_output) {
            return Err(GraphError::UnknownPort {
                node_id: from_node.to_string(),
                kind: PortKind::Output,
                port: from_output.to_string(),
            });
        }
        if !target.has_input(to_input) {
            return Err(GraphError::UnknownPort {
                node_id: to_node.to_string(),
                kind: PortKind::Input,
                port: to_input.to_string(),
            });
        }

        let key = (to_node.to_string(), to_input.to_string());
        if let Some(existing) = self.incoming.get(&key) {
            return Err(GraphError::DuplicateEdge {
                node_id: to_node.to_string(),
                input: to_input.to_string(),
                existing: existing.source_label(),
            });
        }

        if from_node == to_node || self.reaches(to_node, from_node) {
            return Err(GraphError::CycleDetected {
                from_node: from_node.to_string(),
                to_node: to_node.to_string(),
            });
        }

        let connection = Connection::new(from_node, from_output, to_node, to_input);
        debug!(connection = %connection, "Connected nodes");
        self.incoming.insert(key, connection);
        Ok(())
    }

    /// Evaluate `start_node`, pulling unconnected inputs from `external_inputs`.
    ///
    /// # Errors
    /// - [`GraphError::UnknownNode`] if `start_node` is unregistered
    /// - [`GraphError::MissingInput`] if an unconnected input is absent from
    ///   `external_inputs`
    /// - [`GraphError::MissingOutput`] if an upstream node did not emit a
    ///   connected output
    /// - [`GraphError::NodeComputation`] if a compute function fails
    pub async fn evaluate(
        &self,
        start_node: &str,
        external_inputs: &ValueMap,
    ) -> GraphResult<Evaluation> {
        let start = Instant::now();

        let steps = {
            let cache = self.cache.read().await;
            let mut visited = HashSet::new();
            let mut steps = Vec::new();
            self.plan(start_node, external_inputs, &cache, &mut visited, &mut steps)?;
            steps
        };

        let mut memo: HashMap<String, Arc<ValueMap>> = HashMap::new();
        let mut computed = Vec::new();
        let mut cache_hits = Vec::new();
        let mut pending_cache = Vec::new();

        for step in steps {
            match step {
                Step::Cached(node_id, result) => {
                    debug!(node_id = %node_id, "Serving node from persistent cache");
                    cache_hits.push(node_id.clone());
                    memo.insert(node_id, result);
                }
                Step::Compute(node) => {
                    let inputs = self.gather_inputs(&node, external_inputs, &memo)?;
                    let node_start = Instant::now();

                    let outputs = node.run(&inputs).await.map_err(|source| {
                        warn!(
                            node_id = %node.id(),
                            error = %source,
                            "Node computation failed"
                        );
                        GraphError::NodeComputation {
                            node_id: node.id().to_string(),
                            source,
                        }
                    })?;

                    debug!(
                        node_id = %node.id(),
                        elapsed_us = node_start.elapsed().as_micros(),
                        "Computed node"
                    );

                    let outputs = Arc::new(outputs);
                    if node.is_cacheable() {
                        pending_cache.push((node.id().to_string(), Arc::clone(&outputs)));
                    }
                    computed.push(node.id().to_string());
                    memo.insert(node.id().to_string(), outputs);
                }
            }
        }

        if !pending_cache.is_empty() {
            let mut cache = self.cache.write().await;
            cache.extend(pending_cache);
        }

        let outputs = memo
            .get(start_node)
            .cloned()
            .ok_or_else(|| GraphError::UnknownNode {
                node_id: start_node.to_string(),
            })?;

        info!(
            node_id = %start_node,
            computed = computed.len(),
            cache_hits = cache_hits.len(),
            elapsed_us = start.elapsed().as_micros(),
            "Evaluated graph"
        );

        Ok(Evaluation {
            target: start_node.to_string(),
            outputs,
            results: memo,
            computed,
            cache_hits,
        })
    }

    /// Empty the persistent cache. Evaluations already running keep their
    /// call memo.
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        let cleared = cache.len();
        cache.clear();
        debug!(cleared = cleared, "Cleared persistent node cache");
    }

    /// Registered node ids in registration order.
    pub fn node_ids(&self) -> &[String] {
        &self.order
    }

    /// Look up a registered node.
    pub fn get_node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id).map(|n| n.as_ref())
    }

    /// All connections, ordered by target node and input.
    pub fn connections(&self) -> Vec<Connection> {
        let mut connections: Vec<_> = self.incoming.values().cloned().collect();
        connections.sort_by(|a, b| {
            (a.to_node.as_str(), a.to_input.as_str()).cmp(&(b.to_node.as_str(), b.to_input.as_str()))
        });
        connections
    }

    /// Ids of nodes currently held in the persistent cache, sorted.
    pub async fn cached_nodes(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.cache.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ========================================================================
    // Internal
    // ========================================================================

    fn node(&self, node_id: &str) -> GraphResult<&Arc<Node>> {
        self.nodes.get(node_id).ok_or_else(|| GraphError::UnknownNode {
            node_id: node_id.to_string(),
        })
    }

    /// Depth-first post-order of the nodes `node_id` depends on. Cached
    /// cacheable nodes are leaves: their upstream is not visited.
    fn plan(
        &self,
        node_id: &str,
        external_inputs: &ValueMap,
        cache: &HashMap<String, Arc<ValueMap>>,
        visited: &mut HashSet<String>,
        steps: &mut Vec<Step>,
    ) -> GraphResult<()> {
        if !visited.insert(node_id.to_string()) {
            return Ok(());
        }

        let node = self.node(node_id)?;

        if node.is_cacheable() {
            if let Some(result) = cache.get(node_id) {
                steps.push(Step::Cached(node_id.to_string(), Arc::clone(result)));
                return Ok(());
            }
        }

        for input in node.input_names() {
            match self.incoming.get(&(node_id.to_string(), input.clone())) {
                Some(conn) => {
                    self.plan(&conn.from_node, external_inputs, cache, visited, steps)?;
                }
                None if external_inputs.contains_key(input) => {}
                None => {
                    return Err(GraphError::MissingInput {
                        node_id: node_id.to_string(),
                        input: input.clone(),
                    });
                }
            }
        }

        steps.push(Step::Compute(Arc::clone(node)));
        Ok(())
    }

    fn gather_inputs(
        &self,
        node: &Node,
        external_inputs: &ValueMap,
        memo: &HashMap<String, Arc<ValueMap>>,
    ) -> GraphResult<ValueMap> {
        let mut inputs = ValueMap::new();

        for input in node.input_names() {
            let value = match self.incoming.get(&(node.id().to_string(), input.clone())) {
                Some(conn) => memo
                    .get(&conn.from_node)
                    .and_then(|upstream| upstream.get(&conn.from_output))
                    .cloned()
                    .ok_or_else(|| GraphError::MissingOutput {
                        node_id: conn.from_node.clone(),
                        output: conn.from_output.clone(),
                    })?,
                None => external_inputs.get(input).cloned().ok_or_else(|| {
                    GraphError::MissingInput {
                        node_id: node.id().to_string(),
                        input: input.clone(),
                    }
                })?,
            };
            inputs.insert(input.clone(), value);
        }

        Ok(inputs)
    }

    /// Whether `to` is reachable from `from` by following edges downstream.
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut queue = VecDeque::from([from.to_string()]);
        let mut seen = HashSet::new();

        while let Some(current) = queue.pop_front() {
            if current == to {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            queue.extend(
                self.incoming
                    .values()
                    .filter(|c| c.from_node == current)
                    .map(|c| c.to_node.clone()),
            );
        }

        false
    }
}

// ============================================================================
// Tests
// ============================================================================
