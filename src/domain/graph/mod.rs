pub mod graph;
pub mod node;

pub use graph::{Edge, EdgeSpec, GraphBuilder, OpDependency, WorkflowGraph};
pub use node::{BinaryOp, BranchNode, ComputationNode, Expr, GraphNode, LabwareNode, NodeKey, OperationNode, UnaryOp, VariableNode};

use crate::domain::ids::ProcessId;
use crate::error::Result;

/// The external process-description parser. The core never interprets the
/// source text itself; it only schedules the graph the parser returns.
pub trait ProcessParser: Send + Sync {
    fn parse(&self, name: &ProcessId, source: &str) -> Result<WorkflowGraph>;
}
