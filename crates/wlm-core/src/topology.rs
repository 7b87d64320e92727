//! In-memory parent/child hierarchy of a water network.
//!
//! The hierarchy is a forest rooted at MAINLINE nodes: every node holds at
//! most one parent, water flows parent → child, and a DMA is the subtree
//! under one mainline. The graph is kept as a petgraph `DiGraph` (edges
//! parent → child) with a secondary `parent_of` map so upward walks do not
//! touch the adjacency lists.
//!
//! Cycles must not exist in the parent relation. Every traversal here
//! re-checks that: because in-degree is at most one, re-encountering a
//! visited node during BFS, or revisiting on an upward walk, is always a
//! cycle and fails with [`WlmError::InvariantViolation`].

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{WlmError, WlmResult};
use crate::model::{NetworkId, NetworkNode, NodeId, NodeKind, Partition};

/// A structural finding from [`Topology::validate`].
///
/// Errors make the hierarchy unusable for mass balance; warnings are shapes
/// the detectors tolerate but an operator should look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyIssue {
    /// The network has no nodes at all
    Empty,
    /// No mainline exists, so no DMA can be formed
    NoMainline,
    /// A root node that is not a mainline; water has no way in above it
    NonMainlineRoot { label: String },
    /// A household with downstream nodes; consumption endpoints should be
    /// leaves
    HouseholdWithChildren { label: String },
    /// A mainline below another node; mainlines are supposed to be roots
    ParentedMainline { label: String },
}

impl TopologyIssue {
    pub fn is_error(&self) -> bool {
        matches!(self, TopologyIssue::Empty | TopologyIssue::NoMainline)
    }
}

impl std::fmt::Display for TopologyIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyIssue::Empty => write!(f, "network has no nodes"),
            TopologyIssue::NoMainline => write!(f, "network has no mainline nodes"),
            TopologyIssue::NonMainlineRoot { label } => {
                write!(f, "root node '{label}' is not a mainline")
            }
            TopologyIssue::HouseholdWithChildren { label } => {
                write!(f, "household node '{label}' has children")
            }
            TopologyIssue::ParentedMainline { label } => {
                write!(f, "mainline node '{label}' has a parent")
            }
        }
    }
}

/// The hierarchical topology of one network.
#[derive(Debug, Default)]
pub struct Topology {
    pub graph: DiGraph<NetworkNode, ()>,
    index: HashMap<NodeId, NodeIndex>,
    label_index: HashMap<String, NodeId>,
    parent_of: HashMap<NodeId, NodeId>,
}

impl Topology {
    /// Build a topology from persisted nodes of a single network.
    ///
    /// Fails with `InvariantViolation` when a parent reference points outside
    /// the node set or into another network.
    pub fn from_nodes(network_id: NetworkId, nodes: Vec<NetworkNode>) -> WlmResult<Self> {
        let mut topology = Topology::default();

        for node in &nodes {
            if node.network_id != network_id {
                return Err(WlmError::InvariantViolation(format!(
                    "node '{}' belongs to network {} but topology is for {}",
                    node.label, node.network_id, network_id
                )));
            }
        }

        for node in nodes {
            let id = node.id;
            let label = node.label.clone();
            let idx = topology.graph.add_node(node);
            topology.index.insert(id, idx);
            topology.label_index.insert(label, id);
        }

        let parented: Vec<(NodeId, NodeId)> = topology
            .graph
            .node_weights()
            .filter_map(|n| n.parent_id.map(|p| (n.id, p)))
            .collect();
        for (child, parent) in parented {
            let child_idx = topology.index[&child];
            let parent_idx = *topology.index.get(&parent).ok_or_else(|| {
                WlmError::InvariantViolation(format!(
                    "node {child} references parent {parent} which is not part of the network"
                ))
            })?;
            topology.graph.add_edge(parent_idx, child_idx, ());
            topology.parent_of.insert(child, parent);
        }

        Ok(topology)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, id: NodeId) -> Option<&NetworkNode> {
        self.index.get(&id).map(|idx| &self.graph[*idx])
    }

    pub fn node_by_label(&self, label: &str) -> Option<&NetworkNode> {
        self.label_index.get(label).and_then(|id| self.node(*id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NetworkNode> {
        self.graph.node_weights()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parent_of.get(&id).copied()
    }

    /// Direct children in stable (insertion) order.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let Some(idx) = self.index.get(&id) else {
            return Vec::new();
        };
        let mut children: Vec<NodeId> = self
            .graph
            .neighbors_directed(*idx, Direction::Outgoing)
            .map(|c| self.graph[c].id)
            .collect();
        // petgraph iterates neighbors newest-edge-first; flip for insertion order
        children.reverse();
        children
    }

    pub fn out_degree(&self, id: NodeId) -> usize {
        self.index
            .get(&id)
            .map(|idx| {
                self.graph
                    .neighbors_directed(*idx, Direction::Outgoing)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn mainlines(&self) -> Vec<&NetworkNode> {
        let mut mainlines: Vec<&NetworkNode> = self
            .nodes()
            .filter(|n| n.kind == NodeKind::Mainline)
            .collect();
        mainlines.sort_by(|a, b| a.label.cmp(&b.label));
        mainlines
    }

    /// Walk the parent chain to the nearest MAINLINE, including the node
    /// itself when it is a mainline. `Ok(None)` when the chain ends without
    /// reaching one.
    pub fn find_mainline_for(&self, id: NodeId) -> WlmResult<Option<NodeId>> {
        let mut visited = HashSet::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            if !visited.insert(node_id) {
                return Err(WlmError::InvariantViolation(format!(
                    "cycle in parent chain at node {node_id}"
                )));
            }
            let Some(node) = self.node(node_id) else {
                return Ok(None);
            };
            if node.kind == NodeKind::Mainline {
                return Ok(Some(node_id));
            }
            current = self.parent(node_id);
        }
        Ok(None)
    }

    /// All node ids reachable from a DMA's mainline through the child
    /// relation, including the mainline itself.
    ///
    /// BFS with cycle detection: with in-degree ≤ 1 any revisit is a cycle.
    pub fn dma_members(&self, mainline_id: NodeId) -> WlmResult<HashSet<NodeId>> {
        let Some(start) = self.index.get(&mainline_id) else {
            return Err(WlmError::NotFound(format!(
                "mainline node {mainline_id} not in topology"
            )));
        };

        let mut members = HashSet::new();
        let mut queue = VecDeque::new();
        members.insert(mainline_id);
        queue.push_back(*start);

        while let Some(idx) = queue.pop_front() {
            for child in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                let child_id = self.graph[child].id;
                if !members.insert(child_id) {
                    return Err(WlmError::InvariantViolation(format!(
                        "cycle in child relation at node {child_id}"
                    )));
                }
                queue.push_back(child);
            }
        }

        Ok(members)
    }

    /// Compute basic statistics about the hierarchy.
    pub fn stats(&self) -> TopologyStats {
        let mut stats = TopologyStats::default();
        for node in self.nodes() {
            match node.kind {
                NodeKind::Mainline => stats.num_mainlines += 1,
                NodeKind::Branch => stats.num_branches += 1,
                NodeKind::Junction => stats.num_junctions += 1,
                NodeKind::Household => stats.num_households += 1,
            }
            if node.parent_id.is_none() {
                stats.num_roots += 1;
            }
        }
        stats
    }

    /// Check structural expectations and report every finding.
    pub fn validate(&self) -> Vec<TopologyIssue> {
        if self.is_empty() {
            return vec![TopologyIssue::Empty];
        }

        let mut issues = Vec::new();
        if self.stats().num_mainlines == 0 {
            issues.push(TopologyIssue::NoMainline);
        }

        for node in self.nodes() {
            if node.parent_id.is_none() && node.kind != NodeKind::Mainline {
                issues.push(TopologyIssue::NonMainlineRoot {
                    label: node.label.clone(),
                });
            }
            if node.kind == NodeKind::Household && self.out_degree(node.id) > 0 {
                issues.push(TopologyIssue::HouseholdWithChildren {
                    label: node.label.clone(),
                });
            }
            if node.kind == NodeKind::Mainline && node.parent_id.is_some() {
                issues.push(TopologyIssue::ParentedMainline {
                    label: node.label.clone(),
                });
            }
        }
        issues
    }
}

/// Mainlines that do not yet own a partition, in ascending label order.
///
/// Pure counterpart of the idempotent DMA-creation workflow: callers persist
/// one `Partition` per returned node.
pub fn missing_dmas<'a>(
    topology: &'a Topology,
    partitions: &[Partition],
) -> Vec<&'a NetworkNode> {
    let covered: HashSet<NodeId> = partitions.iter().map(|p| p.mainline_id).collect();
    topology
        .mainlines()
        .into_iter()
        .filter(|m| !covered.contains(&m.id))
        .collect()
}

/// Statistics about a topology's size and shape
#[derive(Debug, Clone, Default)]
pub struct TopologyStats {
    pub num_mainlines: usize,
    pub num_branches: usize,
    pub num_junctions: usize,
    pub num_households: usize,
    pub num_roots: usize,
}

impl TopologyStats {
    pub fn total(&self) -> usize {
        self.num_mainlines + self.num_branches + self.num_junctions + self.num_households
    }
}

impl std::fmt::Display for TopologyStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} nodes ({} mainlines, {} junctions, {} branches, {} households)",
            self.total(),
            self.num_mainlines,
            self.num_junctions,
            self.num_branches,
            self.num_households
        )
    }
}
