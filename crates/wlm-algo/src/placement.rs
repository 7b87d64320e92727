//! Greedy, deterministic sensor auto-placement.
//!
//! Priority: (1) every mainline without a sensor in ascending label order,
//! (2) junctions by outgoing degree descending (label ascending on ties),
//! (3) branches likewise. Labels are `MAIN_<nn>` / `JUNC_<nn>` /
//! `BRANCH_<nn>`, zero-padded, continuing after the highest existing index
//! so repeated placements never collide.

use std::collections::HashMap;

use serde::Serialize;
use tracing::info;

use wlm_core::{
    NetworkId, NetworkNode, NodeId, NodeKind, PartitionId, Sensor, SensorKind, Stores,
    Topology, WlmError, WlmResult,
};

pub const DEFAULT_TARGET_COUNT: usize = 12;
pub const MAX_TARGET_COUNT: usize = 1000;

/// Result of one auto-placement run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementReport {
    pub network_id: NetworkId,
    pub requested: usize,
    pub placed: usize,
    pub sensors: Vec<PlacedSensor>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedSensor {
    pub sensor_label: String,
    pub node_label: String,
    pub kind: SensorKind,
}

/// Chooses sensor locations over the persisted topology.
pub struct SensorPlanner {
    stores: Stores,
}

impl SensorPlanner {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Place up to `target_count` sensors (default 12, must be 1..=1000).
    pub async fn auto_place(
        &self,
        network: NetworkId,
        target_count: Option<usize>,
    ) -> WlmResult<PlacementReport> {
        let requested = target_count.unwrap_or(DEFAULT_TARGET_COUNT);
        if requested == 0 || requested > MAX_TARGET_COUNT {
            return Err(WlmError::InvalidInput(format!(
                "targetCount must be between 1 and {MAX_TARGET_COUNT}, got {requested}"
            )));
        }

        let topology = self.stores.topology(network).await?;
        let existing = self.stores.sensors.sensors_of(network).await?;
        let mut covered: std::collections::HashSet<NodeId> =
            existing.iter().map(|s| s.node_id).collect();

        let partitions = self.stores.partitions.partitions_of(network).await?;
        let partition_by_mainline: HashMap<NodeId, PartitionId> =
            partitions.iter().map(|p| (p.mainline_id, p.id)).collect();

        let mut label_counters = LabelCounters::from_existing(existing.iter().map(|s| s.label.as_str()));

        let mut placed = Vec::new();
        for node in placement_order(&topology) {
            if placed.len() >= requested {
                break;
            }
            if covered.contains(&node.id) {
                continue;
            }

            let (kind, prefix) = match node.kind {
                NodeKind::Mainline => (SensorKind::MainlineFlow, "MAIN"),
                NodeKind::Junction => (SensorKind::BranchJunctionFlow, "JUNC"),
                NodeKind::Branch => (SensorKind::BranchJunctionFlow, "BRANCH"),
                NodeKind::Household => continue,
            };
            let label = label_counters.next(prefix);

            let mut sensor = Sensor::new(network, label.clone(), kind, node.id);
            if let Some(mainline) = topology.find_mainline_for(node.id)? {
                if let Some(partition) = partition_by_mainline.get(&mainline) {
                    sensor = sensor.with_partition(*partition);
                }
            }
            self.stores.sensors.insert_sensor(sensor).await?;
            covered.insert(node.id);
            placed.push(PlacedSensor {
                sensor_label: label,
                node_label: node.label.clone(),
                kind,
            });
        }

        info!(
            network = %network,
            requested,
            placed = placed.len(),
            "sensor auto-placement finished"
        );
        Ok(PlacementReport {
            network_id: network,
            requested,
            placed: placed.len(),
            sensors: placed,
        })
    }
}

/// Nodes in placement priority order.
fn placement_order(topology: &Topology) -> Vec<&NetworkNode> {
    let mut mainlines: Vec<&NetworkNode> = topology
        .nodes()
        .filter(|n| n.kind == NodeKind::Mainline)
        .collect();
    mainlines.sort_by(|a, b| a.label.cmp(&b.label));

    let mut junctions: Vec<&NetworkNode> = topology
        .nodes()
        .filter(|n| n.kind == NodeKind::Junction)
        .collect();
    junctions.sort_by(|a, b| {
        topology
            .out_degree(b.id)
            .cmp(&topology.out_degree(a.id))
            .then_with(|| a.label.cmp(&b.label))
    });

    let mut branches: Vec<&NetworkNode> = topology
        .nodes()
        .filter(|n| n.kind == NodeKind::Branch)
        .collect();
    branches.sort_by(|a, b| {
        topology
            .out_degree(b.id)
            .cmp(&topology.out_degree(a.id))
            .then_with(|| a.label.cmp(&b.label))
    });

    mainlines
        .into_iter()
        .chain(junctions)
        .chain(branches)
        .collect()
}

/// Per-prefix label numbering that resumes after existing sensors.
struct LabelCounters {
    next_index: HashMap<String, u32>,
}

impl LabelCounters {
    fn from_existing<'a>(labels: impl Iterator<Item = &'a str>) -> Self {
        let mut next_index: HashMap<String, u32> = HashMap::new();
        for label in labels {
            if let Some((prefix, suffix)) = label.rsplit_once('_') {
                if let Ok(index) = suffix.parse::<u32>() {
                    let slot = next_index.entry(prefix.to_string()).or_insert(0);
                    *slot = (*slot).max(index);
                }
            }
        }
        Self { next_index }
    }

    fn next(&mut self, prefix: &str) -> String {
        let slot = self.next_index.entry(prefix.to_string()).or_insert(0);
        *slot += 1;
        format!("{prefix}_{:02}", slot)
    }
}
