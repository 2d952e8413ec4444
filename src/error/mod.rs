use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),
}

/// Dataflow graph errors.
///
/// Everything except [`GraphError::NodeComputation`] is a configuration
/// error raised by a registration or evaluation call.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Node already registered: {node_id}")]
    DuplicateNode { node_id: String },

    #[error("Input {node_id}.{input} already has an incoming connection from {existing}")]
    DuplicateEdge {
        node_id: String,
        input: String,
        existing: String,
    },

    #[error("Unknown node: {node_id}")]
    UnknownNode { node_id: String },

    #[error("Node {node_id} has no {kind} named '{port}'")]
    UnknownPort {
        node_id: String,
        kind: PortKind,
        port: String,
    },

    #[error("Connection {from_node} -> {to_node} would create a cycle")]
    CycleDetected { from_node: String, to_node: String },

    #[error("Missing input '{input}' for node {node_id}")]
    MissingInput { node_id: String, input: String },

    #[error("Node {node_id} did not produce output '{output}'")]
    MissingOutput { node_id: String, output: String },

    #[error("Computation failed in node {node_id}: {source}")]
    NodeComputation {
        node_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl GraphError {
    /// Whether this error came from a node's compute function rather than
    /// from graph configuration.
    pub fn is_computation(&self) -> bool {
        matches!(self, GraphError::NodeComputation { .. })
    }

    /// Id of the node the error is attributed to, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            GraphError::DuplicateNode { node_id }
            | GraphError::DuplicateEdge { node_id, .. }
            | GraphError::UnknownNode { node_id }
            | GraphError::UnknownPort { node_id, .. }
            | GraphError::MissingInput { node_id, .. }
            | GraphError::MissingOutput { node_id, .. }
            | GraphError::NodeComputation { node_id, .. } => Some(node_id),
            GraphError::CycleDetected { .. } => None,
        }
    }
}

/// Which side of a node a port name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Input,
    Output,
}

impl std::fmt::Display for PortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortKind::Input => write!(f, "input"),
            PortKind::Output => write!(f, "output"),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for graph operations
pub type GraphResult<T> = Result<T, GraphError>;
