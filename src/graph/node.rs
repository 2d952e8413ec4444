//! Node and connection definitions for the dataflow graph.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named values flowing into and out of a node.
pub type ValueMap = serde_json::Map<String, Value>;

/// Build a [`ValueMap`] from `(name, value)` pairs.
pub fn value_map<I, K>(entries: I) -> ValueMap
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    entries.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// A node's computation: input mapping to output mapping.
///
/// Implementations may suspend (e.g. while awaiting external data). No
/// deadline is imposed by the evaluator.
#[async_trait]
pub trait Compute: Send + Sync {
    /// Produce the node's outputs from its resolved inputs.
    async fn compute(&self, inputs: &ValueMap) -> anyhow::Result<ValueMap>;
}

/// Adapter for synchronous closures.
struct FnCompute<F>(F);

#[async_trait]
impl<F> Compute for FnCompute<F>
where
    F: Fn(&ValueMap) -> anyhow::Result<ValueMap> + Send + Sync,
{
    async fn compute(&self, inputs: &ValueMap) -> anyhow::Result<ValueMap> {
        (self.0)(inputs)
    }
}

/// Adapter for closures returning a future over an owned copy of the inputs.
struct AsyncFnCompute<F>(F);

#[async_trait]
impl<F, Fut> Compute for AsyncFnCompute<F>
where
    F: Fn(ValueMap) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ValueMap>> + Send,
{
    async fn compute(&self, inputs: &ValueMap) -> anyhow::Result<ValueMap> {
        (self.0)(inputs.clone()).await
    }
}

/// Forwards inputs unchanged. Used when a node is registered without a
/// computation.
struct Passthrough;

#[async_trait]
impl Compute for Passthrough {
    async fn compute(&self, inputs: &ValueMap) -> anyhow::Result<ValueMap> {
        Ok(inputs.clone())
    }
}

/// A named computation unit with declared inputs and outputs.
///
/// Built with the chained setters and handed to
/// [`GraphEvaluator::register_node`](super::GraphEvaluator::register_node),
/// after which it is never mutated.
///
/// ```rust,ignore
/// let node = Node::new("multiply")
///     .inputs(["a"])
///     .outputs(["result"])
///     .compute_fn(|inputs: &ValueMap| {
///         let a = inputs.get("a").and_then(Value::as_i64).unwrap_or(0);
///         Ok(value_map([("result", json!(a * 2))]))
///     });
/// ```
#[derive(Clone)]
pub struct Node {
    id: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    compute: Arc<dyn Compute>,
    cacheable: bool,
}

impl Node {
    /// Create a node with no ports, a passthrough computation and the
    /// persistent cache disabled.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            compute: Arc::new(Passthrough),
            cacheable: false,
        }
    }

    /// Declare the ordered input names.
    pub fn inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = names.into_iter().map(Into::into).collect();
        self
    }

    /// Declare the ordered output names.
    pub fn outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = names.into_iter().map(Into::into).collect();
        self
    }

    /// Keep this node's result across evaluations until the cache is cleared.
    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Use a [`Compute`] implementation.
    pub fn compute<C: Compute + 'static>(mut self, compute: C) -> Self {
        self.compute = Arc::new(compute);
        self
    }

    /// Use a synchronous closure.
    pub fn compute_fn<F>(self, f: F) -> Self
    where
        F: Fn(&ValueMap) -> anyhow::Result<ValueMap> + Send + Sync + 'static,
    {
        self.compute(FnCompute(f))
    }

    /// Use an async closure. It receives an owned copy of the inputs.
    pub fn compute_async<F, Fut>(self, f: F) -> Self
    where
        F: Fn(ValueMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ValueMap>> + Send + 'static,
    {
        self.compute(AsyncFnCompute(f))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    pub fn output_names(&self) -> &[String] {
        &self.outputs
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub(crate) fn has_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|i| i == name)
    }

    pub(crate) fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o == name)
    }

    pub(crate) async fn run(&self, inputs: &ValueMap) -> anyhow::Result<ValueMap> {
        self.compute.compute(inputs).await
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("cacheable", &self.cacheable)
            .finish_non_exhaustive()
    }
}

/// Directed edge routing one node's output to another node's input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub from_node: String,
    pub from_output: String,
    pub to_node: String,
    pub to_input: String,
}

impl Connection {
    pub fn new(
        from_node: impl Into<String>,
        from_output: impl Into<String>,
        to_node: impl Into<String>,
        to_input: impl Into<String>,
    ) -> Self {
        Self {
            from_node: from_node.into(),
            from_output: from_output.into(),
            to_node: to_node.into(),
            to_input: to_input.into(),
        }
    }

    /// `node.output` label of the source side.
    pub fn source_label(&self) -> String {
        format!("{}.{}", self.from_node, self.from_output)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.from_node, self.from_output, self.to_node, self.to_input
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_map_builder() {
        let map = value_map([("a", json!(1)), ("b", json!("two"))]);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("a"), Some(&json!(1)));
        assert_eq!(map.get("b"), Some(&json!("two")));
    }

    #[test]
    fn test_node_builder() {
        let node = Node::new("scale")
            .inputs(["mesh", "factor"])
            .outputs(["mesh"])
            .cacheable(true);

        assert_eq!(node.id(), "scale");
        assert_eq!(node.input_names(), ["mesh", "factor"]);
        assert!(node.has_input("factor"));
        assert!(!node.has_input("offset"));
        assert!(node.has_output("mesh"));
        assert!(node.is_cacheable());
    }

    #[tokio::test]
    async fn test_default_compute_is_passthrough() {
        let node = Node::new("identity").inputs(["x"]).outputs(["x"]);
        let inputs = value_map([("x", json!(3))]);
        let out = node.run(&inputs).await.unwrap();
        assert_eq!(out, inputs);
    }

    #[tokio::test]
    async fn test_async_compute() {
        let node = Node::new("fetch").outputs(["texture"]).compute_async(|_| async {
            tokio::task::yield_now().await;
            Ok(value_map([("texture", json!("brick.png"))]))
        });
        let out = node.run(&ValueMap::new()).await.unwrap();
        assert_eq!(out.get("texture"), Some(&json!("brick.png")));
    }

    #[test]
    fn test_connection_display() {
        let conn = Connection::new("input", "value", "multiply", "a");
        assert_eq!(conn.to_string(), "input.value -> multiply.a");
        assert_eq!(conn.source_label(), "input.value");
    }
}
