use slotmap::{SecondaryMap, SlotMap};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::domain::device::Position;
use crate::domain::graph::node::{BranchNode, ComputationNode, Expr, GraphNode, LabwareNode, NodeKey, OperationNode, VariableNode};
use crate::domain::ids::{ContainerName, ProcessId, VariableName};
use crate::error::{Error, Result};

/// Attributes of an ordering edge.
#[derive(Debug, Clone)]
pub struct EdgeSpec {
    pub container: Option<ContainerName>,
    /// Minimum idle seconds between the endpoints.
    pub min_wait: i64,
    /// Maximum idle seconds between the endpoints; `None` is unbounded.
    pub max_wait: Option<i64>,
    /// Cost per second of idle time between the endpoints.
    pub wait_cost: f64,
}

impl Default for EdgeSpec {
    fn default() -> Self {
        EdgeSpec { container: None, min_wait: 0, max_wait: None, wait_cost: 0.0 }
    }
}

impl EdgeSpec {
    pub fn for_container(container: impl Into<ContainerName>) -> EdgeSpec {
        EdgeSpec { container: Some(container.into()), ..Default::default() }
    }

    pub fn with_waits(mut self, min_wait: i64, max_wait: Option<i64>) -> Self {
        self.min_wait = min_wait;
        self.max_wait = max_wait;
        self
    }

    pub fn with_wait_cost(mut self, cost: f64) -> Self {
        self.wait_cost = cost;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub from: NodeKey,
    pub to: NodeKey,
    pub container: Option<ContainerName>,
    pub min_wait: i64,
    pub max_wait: Option<i64>,
    pub wait_cost: f64,
    /// `Some(arm)` when this is a branch successor edge.
    pub branch_arm: Option<bool>,
}

/// A scheduling dependency between two operations, with all intermediate
/// variable/computation/branch hops collapsed into effective wait bounds.
#[derive(Debug, Clone)]
pub struct OpDependency {
    pub pred: NodeKey,
    pub min_wait: i64,
    pub max_wait: Option<i64>,
    pub wait_cost: f64,
    pub container: Option<ContainerName>,
}

/// Immutable DAG for one submitted process.
///
/// Nodes live in a flat arena and refer to each other by key. The graph is
/// built once by the external parser through [`GraphBuilder`] and never
/// mutated afterwards; runtime progress (completions, branch decisions,
/// variable values) is tracked by the scheduling instance.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    pub process: ProcessId,
    nodes: SlotMap<NodeKey, GraphNode>,
    name_index: HashMap<String, NodeKey>,
    edges: Vec<Edge>,
    incoming: SecondaryMap<NodeKey, Vec<usize>>,
    outgoing: SecondaryMap<NodeKey, Vec<usize>>,

    /// For every node, the branch arms it unconditionally requires. A node
    /// reachable from both arms of a branch carries no guard for it.
    guards: SecondaryMap<NodeKey, Vec<(NodeKey, bool)>>,
}

impl WorkflowGraph {
    pub fn builder(process: impl Into<ProcessId>) -> GraphBuilder {
        GraphBuilder {
            process: process.into(),
            nodes: SlotMap::with_key(),
            name_index: HashMap::new(),
            edges: Vec::new(),
        }
    }

    pub fn node(&self, key: NodeKey) -> &GraphNode {
        &self.nodes[key]
    }

    pub fn key_by_name(&self, name: &str) -> Option<NodeKey> {
        self.name_index.get(name).copied()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = NodeKey> + '_ {
        self.nodes.keys()
    }

    pub fn operations(&self) -> impl Iterator<Item = (NodeKey, &OperationNode)> {
        self.nodes.iter().filter_map(|(k, n)| n.as_operation().map(|op| (k, op)))
    }

    pub fn labware(&self) -> impl Iterator<Item = (NodeKey, &LabwareNode)> {
        self.nodes.iter().filter_map(|(k, n)| match n {
            GraphNode::Labware(l) => Some((k, l)),
            _ => None,
        })
    }

    pub fn incoming_edges(&self, key: NodeKey) -> impl Iterator<Item = &Edge> {
        self.incoming.get(key).into_iter().flatten().map(|i| &self.edges[*i])
    }

    pub fn outgoing_edges(&self, key: NodeKey) -> impl Iterator<Item = &Edge> {
        self.outgoing.get(key).into_iter().flatten().map(|i| &self.edges[*i])
    }

    pub fn guards(&self, key: NodeKey) -> &[(NodeKey, bool)] {
        self.guards.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Topological order over all nodes. The graph is validated acyclic at
    /// build time, so this always covers every node.
    pub fn topo_order(&self) -> Vec<NodeKey> {
        let mut indegree: SecondaryMap<NodeKey, usize> = SecondaryMap::new();
        for key in self.nodes.keys() {
            indegree.insert(key, self.incoming.get(key).map(|v| v.len()).unwrap_or(0));
        }

        let mut queue: VecDeque<NodeKey> = self.nodes.keys().filter(|k| indegree[*k] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(key) = queue.pop_front() {
            order.push(key);
            for edge in self.outgoing_edges(key) {
                indegree[edge.to] -= 1;
                if indegree[edge.to] == 0 {
                    queue.push_back(edge.to);
                }
            }
        }

        order
    }

    /// Stamps every operation with a duration from the supplied estimator.
    /// Operations the estimator has no answer for keep their declared
    /// `expected_duration`.
    pub fn annotate_durations<F: Fn(&OperationNode) -> Option<i64>>(&mut self, estimate: F) {
        for (_, node) in self.nodes.iter_mut() {
            if let GraphNode::Operation(op) = node {
                op.annotated_duration = estimate(op);
            }
        }
    }

    /// Scheduling dependencies of `key` on other operations: walks backwards
    /// through variable, computation and branch hops, summing `min_wait`,
    /// bounding `max_wait` and accumulating `wait_cost` along each path.
    pub fn operation_dependencies(&self, key: NodeKey) -> Vec<OpDependency> {
        let mut out = Vec::new();
        let mut stack: Vec<(NodeKey, i64, Option<i64>, f64, Option<ContainerName>)> = vec![(key, 0, None, 0.0, None)];
        let mut seen: HashSet<NodeKey> = HashSet::new();

        while let Some((node, min_acc, max_acc, cost_acc, container)) = stack.pop() {
            for edge in self.incoming_edges(node) {
                let min_wait = min_acc + edge.min_wait;
                let max_wait = match (max_acc, edge.max_wait) {
                    (None, None) => None,
                    (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(edge.min_wait)),
                };
                let wait_cost = cost_acc + edge.wait_cost;
                let container = container.clone().or_else(|| edge.container.clone());

                match &self.nodes[edge.from] {
                    GraphNode::Operation(_) => {
                        out.push(OpDependency { pred: edge.from, min_wait, max_wait, wait_cost, container });
                    }
                    GraphNode::Labware(_) => {}
                    _ => {
                        if seen.insert(edge.from) {
                            stack.push((edge.from, min_wait, max_wait, wait_cost, container));
                        }
                    }
                }
            }
        }

        out
    }

    /// Nodes alive under the given branch decisions. An undecided branch
    /// keeps both arms alive (both are materialized until the predicate
    /// resolves).
    pub fn live_nodes(&self, decisions: &HashMap<NodeKey, bool>) -> HashSet<NodeKey> {
        let mut live: HashSet<NodeKey> = HashSet::new();
        let mut queue: VecDeque<NodeKey> = self
            .nodes
            .keys()
            .filter(|k| self.incoming.get(*k).map(|v| v.is_empty()).unwrap_or(true))
            .collect();
        live.extend(queue.iter().copied());

        while let Some(key) = queue.pop_front() {
            for edge in self.outgoing_edges(key) {
                if let Some(arm) = edge.branch_arm {
                    if let Some(taken) = decisions.get(&key) {
                        if *taken != arm {
                            continue;
                        }
                    }
                }
                if live.insert(edge.to) {
                    queue.push_back(edge.to);
                }
            }
        }

        live
    }

    /// The labware starting position of `container`, if it enters here.
    pub fn starting_position(&self, container: &ContainerName) -> Option<Position> {
        self.labware().find(|(_, l)| l.container == *container).map(|(_, l)| l.start.clone())
    }
}

/// Builder the external process parser targets. Node names must be unique
/// within one graph.
pub struct GraphBuilder {
    process: ProcessId,
    nodes: SlotMap<NodeKey, GraphNode>,
    name_index: HashMap<String, NodeKey>,
    edges: Vec<Edge>,
}

impl GraphBuilder {
    pub fn add_labware(&mut self, labware: LabwareNode) -> Result<NodeKey> {
        let name = labware.container.to_string();
        self.insert(name, GraphNode::Labware(labware))
    }

    pub fn add_operation(&mut self, op: OperationNode) -> Result<NodeKey> {
        if op.expected_duration < 0 {
            return Err(Error::GraphError(format!("Operation '{}' has a negative expected duration.", op.name)));
        }
        let name = op.name.clone();
        self.insert(name, GraphNode::Operation(op))
    }

    pub fn add_variable(&mut self, name: impl Into<VariableName>, producer: &str) -> Result<NodeKey> {
        let name = name.into();
        let producer_key = self
            .name_index
            .get(producer)
            .copied()
            .ok_or_else(|| Error::GraphError(format!("Variable '{}' references unknown producer '{}'.", name, producer)))?;
        if self.nodes[producer_key].as_operation().is_none() {
            return Err(Error::GraphError(format!("Variable '{}' must be produced by an operation, '{}' is not one.", name, producer)));
        }

        let key = self.insert(name.to_string(), GraphNode::Variable(VariableNode { name, producer: producer_key }))?;
        self.edges.push(Edge {
            from: producer_key,
            to: key,
            container: None,
            min_wait: 0,
            max_wait: None,
            wait_cost: 0.0,
            branch_arm: None,
        });
        Ok(key)
    }

    pub fn add_computation(&mut self, name: impl Into<String>, expr: Expr) -> Result<NodeKey> {
        let name = name.into();
        self.insert(name.clone(), GraphNode::Computation(ComputationNode { name, expr }))
    }

    /// Adds a branch node. Constant predicates are the parser's job to fold
    /// away and are rejected here.
    pub fn add_branch(&mut self, name: impl Into<String>, predicate: Expr) -> Result<NodeKey> {
        let name = name.into();
        if predicate.is_constant() {
            return Err(Error::GraphError(format!("Branch '{}' has a compile-time constant predicate; resolve it in the parser.", name)));
        }
        self.insert(name.clone(), GraphNode::Branch(BranchNode { name, predicate }))
    }

    /// Ordering edge between two named nodes.
    pub fn link(&mut self, from: &str, to: &str, spec: EdgeSpec) -> Result<()> {
        let (from, to) = (self.key_of(from)?, self.key_of(to)?);
        self.edges.push(Edge {
            from,
            to,
            container: spec.container,
            min_wait: spec.min_wait,
            max_wait: spec.max_wait,
            wait_cost: spec.wait_cost,
            branch_arm: None,
        });
        Ok(())
    }

    /// Successor edge of a branch arm.
    pub fn link_branch(&mut self, branch: &str, to: &str, arm: bool, spec: EdgeSpec) -> Result<()> {
        let (from, to) = (self.key_of(branch)?, self.key_of(to)?);
        if !matches!(self.nodes[from], GraphNode::Branch(_)) {
            return Err(Error::GraphError(format!("'{}' is not a branch node.", branch)));
        }
        self.edges.push(Edge {
            from,
            to,
            container: spec.container,
            min_wait: spec.min_wait,
            max_wait: spec.max_wait,
            wait_cost: spec.wait_cost,
            branch_arm: Some(arm),
        });
        Ok(())
    }

    /// Validates and freezes the graph.
    pub fn build(mut self) -> Result<WorkflowGraph> {
        self.autolink_expressions()?;

        let mut incoming: SecondaryMap<NodeKey, Vec<usize>> = SecondaryMap::new();
        let mut outgoing: SecondaryMap<NodeKey, Vec<usize>> = SecondaryMap::new();
        for key in self.nodes.keys() {
            incoming.insert(key, Vec::new());
            outgoing.insert(key, Vec::new());
        }
        for (i, edge) in self.edges.iter().enumerate() {
            outgoing[edge.from].push(i);
            incoming[edge.to].push(i);
        }

        let graph = WorkflowGraph {
            process: self.process,
            nodes: self.nodes,
            name_index: self.name_index,
            edges: self.edges,
            incoming,
            outgoing,
            guards: SecondaryMap::new(),
        };

        let order = graph.topo_order();
        if order.len() != graph.nodes.len() {
            return Err(Error::GraphError(format!(
                "Workflow graph for process '{}' contains a cycle ({} of {} nodes sortable).",
                graph.process,
                order.len(),
                graph.nodes.len()
            )));
        }

        Self::check_reachability(&graph)?;
        Self::check_branch_arms(&graph)?;

        let mut graph = graph;
        graph.guards = Self::compute_guards(&graph, &order);
        Ok(graph)
    }

    // Dependency edges from the nodes an expression reads into the node
    // holding the expression.
    fn autolink_expressions(&mut self) -> Result<()> {
        let mut new_edges: Vec<(NodeKey, NodeKey)> = Vec::new();

        for (key, node) in self.nodes.iter() {
            let (owner, expr) = match node {
                GraphNode::Computation(c) => (c.name.clone(), &c.expr),
                GraphNode::Branch(b) => (b.name.clone(), &b.predicate),
                _ => continue,
            };
            for var in expr.vars() {
                let source = self
                    .name_index
                    .get(&var)
                    .copied()
                    .ok_or_else(|| Error::GraphError(format!("'{}' reads unknown input '{}'.", owner, var)))?;
                match &self.nodes[source] {
                    GraphNode::Variable(_) | GraphNode::Computation(_) => new_edges.push((source, key)),
                    other => {
                        return Err(Error::GraphError(format!(
                            "'{}' reads '{}', which is a {} node, not a variable or computation.",
                            owner,
                            var,
                            match other {
                                GraphNode::Labware(_) => "labware",
                                GraphNode::Operation(_) => "operation",
                                GraphNode::Branch(_) => "branch",
                                _ => "unexpected",
                            }
                        )));
                    }
                }
            }
        }

        for (from, to) in new_edges {
            if self.edges.iter().any(|e| e.from == from && e.to == to) {
                continue;
            }
            self.edges.push(Edge { from, to, container: None, min_wait: 0, max_wait: None, wait_cost: 0.0, branch_arm: None });
        }
        Ok(())
    }

    fn check_reachability(graph: &WorkflowGraph) -> Result<()> {
        let mut reached: HashSet<NodeKey> = HashSet::new();
        let mut queue: VecDeque<NodeKey> = graph.labware().map(|(k, _)| k).collect();
        reached.extend(queue.iter().copied());

        while let Some(key) = queue.pop_front() {
            for edge in graph.outgoing_edges(key) {
                if reached.insert(edge.to) {
                    queue.push_back(edge.to);
                }
            }
        }

        for (key, op) in graph.operations() {
            if !reached.contains(&key) {
                return Err(Error::GraphError(format!("Operation '{}' is not reachable from any labware node.", op.name)));
            }
        }
        Ok(())
    }

    fn check_branch_arms(graph: &WorkflowGraph) -> Result<()> {
        for (key, node) in graph.nodes.iter() {
            if let GraphNode::Branch(branch) = node {
                let mut true_arms = 0;
                let mut false_arms = 0;
                for edge in graph.outgoing_edges(key) {
                    match edge.branch_arm {
                        Some(true) => true_arms += 1,
                        Some(false) => false_arms += 1,
                        None => {
                            return Err(Error::GraphError(format!("Branch '{}' has a successor edge without an arm marker.", branch.name)));
                        }
                    }
                }
                if true_arms == 0 || false_arms == 0 {
                    return Err(Error::GraphError(format!(
                        "Branch '{}' needs both arms ({} true, {} false successor edges).",
                        branch.name, true_arms, false_arms
                    )));
                }
            }
        }
        Ok(())
    }

    /// Forward pass in topological order. A node's guard set is the
    /// intersection over its incoming paths, so a node joined by both arms
    /// of a branch is guarded by neither.
    fn compute_guards(graph: &WorkflowGraph, order: &[NodeKey]) -> SecondaryMap<NodeKey, Vec<(NodeKey, bool)>> {
        let mut guards: SecondaryMap<NodeKey, Vec<(NodeKey, bool)>> = SecondaryMap::new();

        for &key in order {
            let mut merged: Option<HashSet<(NodeKey, bool)>> = None;

            for edge in graph.incoming_edges(key) {
                let mut path: HashSet<(NodeKey, bool)> = guards.get(edge.from).into_iter().flatten().copied().collect();
                if let Some(arm) = edge.branch_arm {
                    path.insert((edge.from, arm));
                }
                merged = Some(match merged {
                    None => path,
                    Some(acc) => acc.intersection(&path).copied().collect(),
                });
            }

            let mut list: Vec<(NodeKey, bool)> = merged.unwrap_or_default().into_iter().collect();
            list.sort_by_key(|(k, arm)| (*k, *arm));
            guards.insert(key, list);
        }

        guards
    }

    fn insert(&mut self, name: String, node: GraphNode) -> Result<NodeKey> {
        if self.name_index.contains_key(&name) {
            return Err(Error::GraphError(format!("Duplicate node name '{}' in process '{}'.", name, self.process)));
        }
        let key = self.nodes.insert(node);
        self.name_index.insert(name, key);
        Ok(key)
    }

    fn key_of(&self, name: &str) -> Result<NodeKey> {
        self.name_index.get(name).copied().ok_or_else(|| Error::GraphError(format!("Unknown node '{}'.", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::DeviceKind;
    use crate::domain::graph::node::BinaryOp;

    fn op(name: &str, kind: DeviceKind, duration: i64, containers: &[&str]) -> OperationNode {
        OperationNode {
            name: name.to_string(),
            fct: name.split('-').next().unwrap_or(name).to_string(),
            device_kind: kind,
            device: None,
            expected_duration: duration,
            containers: containers.iter().map(|c| ContainerName::new(*c)).collect(),
            params: HashMap::new(),
            is_movement: false,
            annotated_duration: None,
        }
    }

    fn labware(container: &str, device: &str, slot: u32) -> LabwareNode {
        LabwareNode { container: ContainerName::new(container), start: Position::new(device, slot), lidded: false, labware_type: None }
    }

    /// measure -> od -> branch: true arm re-reads, false arm incubates.
    fn branching_graph() -> WorkflowGraph {
        let mut b = WorkflowGraph::builder("proc-1");
        b.add_labware(labware("P1", "Storage", 0)).unwrap();
        b.add_operation(op("measure-1", DeviceKind::PlateReader, 30, &["P1"])).unwrap();
        b.add_operation(op("reread-1", DeviceKind::PlateReader, 30, &["P1"])).unwrap();
        b.add_operation(op("incubate-1", DeviceKind::Incubator, 60, &["P1"])).unwrap();
        b.add_variable("od", "measure-1").unwrap();
        b.add_branch("dense-enough", Expr::binary(BinaryOp::Gt, Expr::var("od"), Expr::number(0.6))).unwrap();
        b.link("P1", "measure-1", EdgeSpec::for_container("P1")).unwrap();
        b.link_branch("dense-enough", "reread-1", true, EdgeSpec::for_container("P1")).unwrap();
        b.link_branch("dense-enough", "incubate-1", false, EdgeSpec::for_container("P1")).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn cycle_is_rejected() {
        let mut b = WorkflowGraph::builder("p");
        b.add_labware(labware("P1", "Storage", 0)).unwrap();
        b.add_operation(op("a", DeviceKind::Incubator, 1, &["P1"])).unwrap();
        b.add_operation(op("b", DeviceKind::Incubator, 1, &["P1"])).unwrap();
        b.link("P1", "a", EdgeSpec::default()).unwrap();
        b.link("a", "b", EdgeSpec::default()).unwrap();
        b.link("b", "a", EdgeSpec::default()).unwrap();

        assert!(matches!(b.build(), Err(Error::GraphError(_))));
    }

    #[test]
    fn unreachable_operation_is_rejected() {
        let mut b = WorkflowGraph::builder("p");
        b.add_labware(labware("P1", "Storage", 0)).unwrap();
        b.add_operation(op("a", DeviceKind::Incubator, 1, &["P1"])).unwrap();
        b.add_operation(op("orphan", DeviceKind::Incubator, 1, &["P1"])).unwrap();
        b.link("P1", "a", EdgeSpec::default()).unwrap();

        assert!(matches!(b.build(), Err(Error::GraphError(_))));
    }

    #[test]
    fn constant_branch_predicate_is_rejected() {
        let mut b = WorkflowGraph::builder("p");
        let err = b.add_branch("always", Expr::binary(BinaryOp::Gt, Expr::number(1.0), Expr::number(0.0))).unwrap_err();
        assert!(matches!(err, Error::GraphError(_)));
    }

    #[test]
    fn branch_needs_both_arms() {
        let mut b = WorkflowGraph::builder("p");
        b.add_labware(labware("P1", "Storage", 0)).unwrap();
        b.add_operation(op("measure-1", DeviceKind::PlateReader, 30, &["P1"])).unwrap();
        b.add_operation(op("next", DeviceKind::Incubator, 30, &["P1"])).unwrap();
        b.add_variable("od", "measure-1").unwrap();
        b.add_branch("check", Expr::binary(BinaryOp::Gt, Expr::var("od"), Expr::number(0.5))).unwrap();
        b.link("P1", "measure-1", EdgeSpec::default()).unwrap();
        b.link_branch("check", "next", true, EdgeSpec::default()).unwrap();

        assert!(matches!(b.build(), Err(Error::GraphError(_))));
    }

    #[test]
    fn guards_mark_exactly_the_arm_subgraphs() {
        let g = branching_graph();
        let branch = g.key_by_name("dense-enough").unwrap();
        let reread = g.key_by_name("reread-1").unwrap();
        let incubate = g.key_by_name("incubate-1").unwrap();
        let measure = g.key_by_name("measure-1").unwrap();

        assert_eq!(g.guards(measure), &[]);
        assert_eq!(g.guards(reread), &[(branch, true)]);
        assert_eq!(g.guards(incubate), &[(branch, false)]);
    }

    #[test]
    fn live_nodes_keep_both_arms_until_decision() {
        let g = branching_graph();
        let reread = g.key_by_name("reread-1").unwrap();
        let incubate = g.key_by_name("incubate-1").unwrap();
        let branch = g.key_by_name("dense-enough").unwrap();

        let undecided = g.live_nodes(&HashMap::new());
        assert!(undecided.contains(&reread) && undecided.contains(&incubate));

        let mut decisions = HashMap::new();
        decisions.insert(branch, false);
        let decided = g.live_nodes(&decisions);
        assert!(!decided.contains(&reread));
        assert!(decided.contains(&incubate));
    }

    #[test]
    fn operation_dependencies_collapse_through_branch_hops() {
        let g = branching_graph();
        let incubate = g.key_by_name("incubate-1").unwrap();
        let measure = g.key_by_name("measure-1").unwrap();

        let deps = g.operation_dependencies(incubate);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].pred, measure);
        assert_eq!(deps[0].container, Some(ContainerName::new("P1")));
    }

    #[test]
    fn wait_bounds_sum_along_direct_edges() {
        let mut b = WorkflowGraph::builder("p");
        b.add_labware(labware("P1", "Storage", 0)).unwrap();
        b.add_operation(op("a", DeviceKind::Incubator, 10, &["P1"])).unwrap();
        b.add_operation(op("b", DeviceKind::PlateReader, 10, &["P1"])).unwrap();
        b.link("P1", "a", EdgeSpec::default()).unwrap();
        b.link("a", "b", EdgeSpec::for_container("P1").with_waits(5, Some(30)).with_wait_cost(2.0)).unwrap();
        let g = b.build().unwrap();

        let deps = g.operation_dependencies(g.key_by_name("b").unwrap());
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].min_wait, 5);
        assert_eq!(deps[0].max_wait, Some(30));
        assert_eq!(deps[0].wait_cost, 2.0);
    }

    #[test]
    fn identical_sources_build_equal_graphs_up_to_keys() {
        let a = branching_graph();
        let b = branching_graph();

        assert_eq!(a.node_count(), b.node_count());
        let mut names_a: Vec<String> = a.keys().map(|k| a.node(k).name().to_string()).collect();
        let mut names_b: Vec<String> = b.keys().map(|k| b.node(k).name().to_string()).collect();
        names_a.sort();
        names_b.sort();
        assert_eq!(names_a, names_b);
    }
}
