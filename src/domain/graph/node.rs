use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::collections::{HashMap, HashSet};

use crate::domain::device::{DeviceId, DeviceKind, Position};
use crate::domain::ids::{ContainerName, VariableName};
use crate::error::{Error, Result};

new_key_type! {
    /// Arena key of a graph node. Nodes refer to each other by key; there is
    /// no cyclic object graph.
    pub struct NodeKey;
}

// Well-known operation parameter keys. Step payloads are an explicit
// key/value bag; adapters and the executor agree on these names.
pub const PARAM_LID_DEVICE: &str = "lid_device";
pub const PARAM_LID_SLOT: &str = "lid_slot";
pub const PARAM_DEST_SLOT: &str = "dest_slot";
pub const PARAM_TEMPERATURE_K: &str = "temperature_k";

// Built-in operation functions the executor gives commit semantics to.
pub const FCT_MOVE: &str = "move";
pub const FCT_UNLID: &str = "unlid";
pub const FCT_LID: &str = "lid";

/// Entry point of one container into the workflow.
#[derive(Debug, Clone)]
pub struct LabwareNode {
    pub container: ContainerName,
    pub start: Position,
    pub lidded: bool,
    pub labware_type: Option<String>,
}

/// A device operation.
#[derive(Debug, Clone)]
pub struct OperationNode {
    /// Unique within the graph; forms the step id together with the process.
    pub name: String,
    pub fct: String,
    pub device_kind: DeviceKind,
    /// Optional pin to a concrete device; the scheduler must honor it.
    pub device: Option<DeviceId>,
    pub expected_duration: i64,
    pub containers: Vec<ContainerName>,
    pub params: HashMap<String, serde_json::Value>,
    /// Transfer operations change container positions on commit.
    pub is_movement: bool,
    /// Duration stamped by the annotation visitor; falls back to
    /// `expected_duration` when the estimator has too little history.
    pub annotated_duration: Option<i64>,
}

impl OperationNode {
    pub fn planning_duration(&self) -> i64 {
        self.annotated_duration.unwrap_or(self.expected_duration)
    }
}

/// Symbolic output of an operation, unknown until runtime.
#[derive(Debug, Clone)]
pub struct VariableNode {
    pub name: VariableName,
    pub producer: NodeKey,
}

/// Pure function of variables and constants; its result is published under
/// the node's name once all inputs are known.
#[derive(Debug, Clone)]
pub struct ComputationNode {
    pub name: String,
    pub expr: Expr,
}

/// Binary runtime decision. Outgoing edges carry the arm they belong to.
#[derive(Debug, Clone)]
pub struct BranchNode {
    pub name: String,
    pub predicate: Expr,
}

#[derive(Debug, Clone)]
pub enum GraphNode {
    Labware(LabwareNode),
    Operation(OperationNode),
    Variable(VariableNode),
    Computation(ComputationNode),
    Branch(BranchNode),
}

impl GraphNode {
    pub fn name(&self) -> &str {
        match self {
            GraphNode::Labware(n) => n.container.as_str(),
            GraphNode::Operation(n) => &n.name,
            GraphNode::Variable(n) => n.name.as_str(),
            GraphNode::Computation(n) => &n.name,
            GraphNode::Branch(n) => &n.name,
        }
    }

    pub fn as_operation(&self) -> Option<&OperationNode> {
        match self {
            GraphNode::Operation(op) => Some(op),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Expression tree for computations and branch predicates. `Var` resolves
/// against the runtime bindings, which hold both operation outputs and
/// already-evaluated computation results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    Const(serde_json::Value),
    Var(String),
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Var(name.into())
    }

    pub fn number(v: f64) -> Expr {
        Expr::Const(serde_json::json!(v))
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    /// All variable names this expression reads.
    pub fn vars(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        self.collect_vars(&mut out);
        out
    }

    fn collect_vars(&self, out: &mut HashSet<String>) {
        match self {
            Expr::Const(_) => {}
            Expr::Var(name) => {
                out.insert(name.clone());
            }
            Expr::Unary { operand, .. } => operand.collect_vars(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_vars(out);
                rhs.collect_vars(out);
            }
        }
    }

    /// Evaluates against `bindings`.
    ///
    /// # Returns
    /// `Ok(None)` while any referenced variable is still unresolved,
    /// `Ok(Some(value))` once all inputs are known, `Err` on a type error.
    pub fn eval(&self, bindings: &HashMap<String, serde_json::Value>) -> Result<Option<serde_json::Value>> {
        match self {
            Expr::Const(v) => Ok(Some(v.clone())),
            Expr::Var(name) => Ok(bindings.get(name).cloned()),
            Expr::Unary { op, operand } => {
                let Some(v) = operand.eval(bindings)? else { return Ok(None) };
                match op {
                    UnaryOp::Not => {
                        let b = as_bool(&v)?;
                        Ok(Some(serde_json::json!(!b)))
                    }
                    UnaryOp::Neg => {
                        let n = as_number(&v)?;
                        Ok(Some(serde_json::json!(-n)))
                    }
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let Some(l) = lhs.eval(bindings)? else { return Ok(None) };
                let Some(r) = rhs.eval(bindings)? else { return Ok(None) };
                let value = match op {
                    BinaryOp::Add => serde_json::json!(as_number(&l)? + as_number(&r)?),
                    BinaryOp::Sub => serde_json::json!(as_number(&l)? - as_number(&r)?),
                    BinaryOp::Mul => serde_json::json!(as_number(&l)? * as_number(&r)?),
                    BinaryOp::Div => serde_json::json!(as_number(&l)? / as_number(&r)?),
                    BinaryOp::Gt => serde_json::json!(as_number(&l)? > as_number(&r)?),
                    BinaryOp::Ge => serde_json::json!(as_number(&l)? >= as_number(&r)?),
                    BinaryOp::Lt => serde_json::json!(as_number(&l)? < as_number(&r)?),
                    BinaryOp::Le => serde_json::json!(as_number(&l)? <= as_number(&r)?),
                    BinaryOp::Eq => serde_json::json!(l == r),
                    BinaryOp::Ne => serde_json::json!(l != r),
                    BinaryOp::And => serde_json::json!(as_bool(&l)? && as_bool(&r)?),
                    BinaryOp::Or => serde_json::json!(as_bool(&l)? || as_bool(&r)?),
                };
                Ok(Some(value))
            }
        }
    }

    /// Whether the expression contains no variables at all. A branch with a
    /// constant predicate should have been resolved by the parser.
    pub fn is_constant(&self) -> bool {
        self.vars().is_empty()
    }
}

fn as_number(v: &serde_json::Value) -> Result<f64> {
    v.as_f64().ok_or_else(|| Error::GraphError(format!("Expected a number, got {}", v)))
}

fn as_bool(v: &serde_json::Value) -> Result<bool> {
    v.as_bool().ok_or_else(|| Error::GraphError(format!("Expected a boolean, got {}", v)))
}
