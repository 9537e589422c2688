use serde::Deserialize;
use std::collections::HashMap;

use crate::domain::device::{DeviceId, DeviceKind, Position};
use crate::domain::graph::node::{Expr, LabwareNode, OperationNode};
use crate::domain::graph::{EdgeSpec, ProcessParser, WorkflowGraph};
use crate::domain::ids::{ContainerName, ProcessId};
use crate::error::{Error, Result};

/// JSON rendering of a workflow graph, used by the shipped parser. This is
/// a plain serialization of the graph itself; a real process-description
/// language sits outside the core and targets the same builder.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphDto {
    pub labware: Vec<LabwareDto>,
    pub operations: Vec<OperationDto>,
    #[serde(default)]
    pub variables: Vec<VariableDto>,
    #[serde(default)]
    pub computations: Vec<ComputationDto>,
    #[serde(default)]
    pub branches: Vec<BranchDto>,
    #[serde(default)]
    pub edges: Vec<EdgeDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabwareDto {
    pub container: String,
    pub device: String,
    pub slot: u32,
    #[serde(default)]
    pub lidded: bool,
    #[serde(default)]
    pub labware_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationDto {
    pub name: String,
    pub fct: String,
    pub device_kind: DeviceKind,
    #[serde(default)]
    pub device: Option<String>,
    pub expected_duration: i64,
    pub containers: Vec<String>,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub is_movement: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariableDto {
    pub name: String,
    pub producer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComputationDto {
    pub name: String,
    pub expr: Expr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchDto {
    pub name: String,
    pub predicate: Expr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EdgeDto {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub min_wait: i64,
    #[serde(default)]
    pub max_wait: Option<i64>,
    #[serde(default)]
    pub wait_cost: f64,
    /// Present on branch successor edges.
    #[serde(default)]
    pub branch_arm: Option<bool>,
}

impl GraphDto {
    pub fn into_graph(self, process: &ProcessId) -> Result<WorkflowGraph> {
        let mut builder = WorkflowGraph::builder(process.clone());

        for labware in self.labware {
            builder.add_labware(LabwareNode {
                container: ContainerName::new(labware.container),
                start: Position::new(labware.device, labware.slot),
                lidded: labware.lidded,
                labware_type: labware.labware_type,
            })?;
        }

        for op in self.operations {
            builder.add_operation(OperationNode {
                name: op.name,
                fct: op.fct,
                device_kind: op.device_kind,
                device: op.device.map(DeviceId::new),
                expected_duration: op.expected_duration,
                containers: op.containers.into_iter().map(ContainerName::new).collect(),
                params: op.params,
                is_movement: op.is_movement,
                annotated_duration: None,
            })?;
        }

        for variable in self.variables {
            builder.add_variable(variable.name, &variable.producer)?;
        }
        for computation in self.computations {
            builder.add_computation(computation.name, computation.expr)?;
        }
        for branch in self.branches {
            builder.add_branch(branch.name, branch.predicate)?;
        }

        for edge in self.edges {
            let spec = EdgeSpec { container: edge.container.map(ContainerName::new), min_wait: edge.min_wait, max_wait: edge.max_wait, wait_cost: edge.wait_cost };
            match edge.branch_arm {
                Some(arm) => builder.link_branch(&edge.from, &edge.to, arm, spec)?,
                None => builder.link(&edge.from, &edge.to, spec)?,
            }
        }

        builder.build()
    }
}

/// The parser the binary wires into the control gateway.
#[derive(Debug, Default)]
pub struct JsonGraphParser;

impl ProcessParser for JsonGraphParser {
    fn parse(&self, name: &ProcessId, source: &str) -> Result<WorkflowGraph> {
        let dto: GraphDto = serde_json::from_str(source).map_err(Error::DeserializationError)?;
        dto.into_graph(name)
    }
}
