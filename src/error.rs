// Errors raised while compiling or rewriting a prompt.
// None of these are retryable; they mean the caller asked for something the graph doesn't have.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("no nodes found for class_type {class_type:?}")]
    NotFound { class_type: String },

    #[error("requested {class_type:?} index {index} but only {count} nodes exist")]
    IndexOutOfRange {
        class_type: String,
        index: usize,
        count: usize,
    },

    #[error("node {node_id:?} is a {actual:?} node, expected {expected:?}")]
    WrongNodeType {
        node_id: String,
        expected: String,
        actual: String,
    },

    #[error("node {node_id:?} does not link a {input} input")]
    UnlinkedInput { node_id: String, input: String },

    #[error("unknown node_id {0:?}")]
    UnknownNodeId(String),

    /// The splice base already depends on the node being rewired.
    #[error("splicing from {base:?} would make node {node_id:?} depend on itself")]
    WouldCreateCycle { node_id: String, base: String },
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
