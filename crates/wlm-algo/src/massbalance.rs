//! Mass-balance leak detection over time-windowed sensor aggregates.
//!
//! Conservation of volumetric flow at a node: what the parent-side sensors
//! feed in minus what the child-side sensors draw out. A positive imbalance
//! beyond the threshold is recorded as a leak detection. DMA scope applies
//! the same idea to a whole partition subtree: mainline inflow against
//! household offtake.
//!
//! The detector is read-only until the final persistence of the detections
//! it found.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use wlm_core::{
    LeakDetection, NetworkId, NodeId, NodeKind, PartitionId, Sensor, SensorId, SensorKind,
    Stores, Topology, WlmError, WlmResult,
};

pub const DEFAULT_THRESHOLD_LPS: f64 = 5.0;
pub const DEFAULT_WINDOW_SECS: i64 = 300;

/// One detection invocation.
#[derive(Debug, Clone)]
pub struct DetectionRequest {
    pub network_id: NetworkId,
    /// Analysis instant; the window is `[timestamp − window, timestamp]`
    pub timestamp: DateTime<Utc>,
    pub threshold_lps: f64,
    pub window_secs: i64,
    /// Restrict to one node's mass balance
    pub node_id: Option<NodeId>,
    /// Restrict to one DMA's mass balance
    pub partition_id: Option<PartitionId>,
}

impl DetectionRequest {
    pub fn new(network_id: NetworkId, timestamp: DateTime<Utc>) -> Self {
        Self {
            network_id,
            timestamp,
            threshold_lps: DEFAULT_THRESHOLD_LPS,
            window_secs: DEFAULT_WINDOW_SECS,
            node_id: None,
            partition_id: None,
        }
    }

    pub fn with_threshold(mut self, threshold_lps: f64) -> Self {
        self.threshold_lps = threshold_lps;
        self
    }

    pub fn with_window(mut self, window_secs: i64) -> Self {
        self.window_secs = window_secs;
        self
    }

    pub fn at_node(mut self, node: NodeId) -> Self {
        self.node_id = Some(node);
        self
    }

    pub fn in_partition(mut self, partition: PartitionId) -> Self {
        self.partition_id = Some(partition);
        self
    }
}

/// Mass-balance detector over the repository state.
pub struct MassBalanceDetector {
    stores: Stores,
}

impl MassBalanceDetector {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Run detection for the requested scope and persist what it finds.
    ///
    /// Without an explicit node or partition, every JUNCTION and BRANCH node
    /// is checked; failures of individual scopes are logged and skipped.
    pub async fn detect(&self, request: &DetectionRequest) -> WlmResult<Vec<LeakDetection>> {
        if request.threshold_lps < 0.0 {
            return Err(WlmError::InvalidInput(format!(
                "threshold must be non-negative, got {}",
                request.threshold_lps
            )));
        }
        if request.window_secs <= 0 {
            return Err(WlmError::InvalidInput(format!(
                "time window must be positive, got {}s",
                request.window_secs
            )));
        }

        let topology = self.stores.topology(request.network_id).await?;
        let sensors = self
            .stores
            .sensors
            .active_sensors_of(request.network_id)
            .await?;
        let means = self.window_means(&sensors, request).await?;
        let sensors_by_node = group_by_node(&sensors);

        let mut detections = Vec::new();

        if let Some(node_id) = request.node_id {
            if topology.node(node_id).is_none() {
                return Err(WlmError::NotFound(format!(
                    "node {node_id} not in network {}",
                    request.network_id
                )));
            }
            if let Some(detection) =
                self.node_balance(request, &topology, &sensors_by_node, &means, node_id, None)?
            {
                detections.push(detection);
            }
        } else if let Some(partition_id) = request.partition_id {
            if let Some(detection) = self
                .dma_balance(request, &topology, &sensors, &means, partition_id)
                .await?
            {
                detections.push(detection);
            }
        } else {
            // Multi-scope sweep over every junction and branch node
            let scopes: Vec<NodeId> = topology
                .nodes()
                .filter(|n| matches!(n.kind, NodeKind::Junction | NodeKind::Branch))
                .map(|n| n.id)
                .collect();
            for node_id in scopes {
                match self.node_balance(
                    request,
                    &topology,
                    &sensors_by_node,
                    &means,
                    node_id,
                    None,
                ) {
                    Ok(Some(detection)) => detections.push(detection),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(node = %node_id, error = %err, "scope detection failed; skipped");
                    }
                }
            }
        }

        for detection in &detections {
            self.stores
                .detections
                .insert_detection(detection.clone())
                .await?;
        }

        Ok(detections)
    }

    /// Arithmetic mean of each sensor's readings over `[T − W, T]`; sensors
    /// with an empty window contribute `None`.
    async fn window_means(
        &self,
        sensors: &[Sensor],
        request: &DetectionRequest,
    ) -> WlmResult<HashMap<SensorId, Option<f64>>> {
        let from = request.timestamp - Duration::seconds(request.window_secs);
        let mut means = HashMap::new();
        for sensor in sensors {
            let readings = self
                .stores
                .readings
                .readings_window(sensor.id, from, request.timestamp, true)
                .await?;
            let mean = if readings.is_empty() {
                None
            } else {
                Some(readings.iter().map(|r| r.flow_lps).sum::<f64>() / readings.len() as f64)
            };
            means.insert(sensor.id, mean);
        }
        Ok(means)
    }

    /// Single-node rule: inflow from sensors on the parent, outflow from
    /// sensors on the children.
    fn node_balance(
        &self,
        request: &DetectionRequest,
        topology: &Topology,
        sensors_by_node: &HashMap<NodeId, Vec<&Sensor>>,
        means: &HashMap<SensorId, Option<f64>>,
        node_id: NodeId,
        partition_id: Option<PartitionId>,
    ) -> WlmResult<Option<LeakDetection>> {
        let mut inflow = 0.0;
        if let Some(parent) = topology.parent(node_id) {
            inflow += sum_means(sensors_by_node.get(&parent), means);
        }

        let mut outflow = 0.0;
        for child in topology.children(node_id) {
            outflow += sum_means(sensors_by_node.get(&child), means);
        }

        let imbalance = inflow - outflow;
        debug!(
            node = %node_id,
            inflow,
            outflow,
            imbalance,
            "node mass balance evaluated"
        );
        Ok(self.to_detection(request, node_id, partition_id, imbalance))
    }

    /// DMA rule: mainline-flow sensors in, household offtake out, both
    /// restricted to the partition's subtree.
    async fn dma_balance(
        &self,
        request: &DetectionRequest,
        topology: &Topology,
        sensors: &[Sensor],
        means: &HashMap<SensorId, Option<f64>>,
        partition_id: PartitionId,
    ) -> WlmResult<Option<LeakDetection>> {
        let partition = self
            .stores
            .partitions
            .partition(partition_id)
            .await?
            .ok_or_else(|| WlmError::NotFound(format!("partition {partition_id}")))?;
        if partition.network_id != request.network_id {
            return Err(WlmError::NotFound(format!(
                "partition {partition_id} not in network {}",
                request.network_id
            )));
        }
        let members = topology.dma_members(partition.mainline_id)?;
        let node_kind: HashMap<NodeId, NodeKind> =
            topology.nodes().map(|n| (n.id, n.kind)).collect();

        let mut inflow = 0.0;
        let mut outflow = 0.0;
        for sensor in sensors {
            if !members.contains(&sensor.node_id) {
                continue;
            }
            if sensor.kind == SensorKind::MainlineFlow {
                inflow += mean_of(means, sensor.id);
            } else if sensor.kind == SensorKind::HouseholdFlow
                || node_kind.get(&sensor.node_id) == Some(&NodeKind::Household)
            {
                outflow += mean_of(means, sensor.id);
            }
        }

        let imbalance = inflow - outflow;
        debug!(
            partition = %partition_id,
            inflow,
            outflow,
            imbalance,
            "DMA mass balance evaluated"
        );
        Ok(self.to_detection(
            request,
            partition.mainline_id,
            Some(partition_id),
            imbalance,
        ))
    }

    fn to_detection(
        &self,
        request: &DetectionRequest,
        node_id: NodeId,
        partition_id: Option<PartitionId>,
        imbalance: f64,
    ) -> Option<LeakDetection> {
        if imbalance > request.threshold_lps {
            Some(LeakDetection::new(
                request.network_id,
                node_id,
                partition_id,
                imbalance,
                request.timestamp,
                request.window_secs,
                request.threshold_lps,
            ))
        } else {
            None
        }
    }
}

fn group_by_node<'a>(sensors: &'a [Sensor]) -> HashMap<NodeId, Vec<&'a Sensor>> {
    let mut by_node: HashMap<NodeId, Vec<&Sensor>> = HashMap::new();
    for sensor in sensors {
        by_node.entry(sensor.node_id).or_default().push(sensor);
    }
    by_node
}

fn sum_means(
    sensors: Option<&Vec<&Sensor>>,
    means: &HashMap<SensorId, Option<f64>>,
) -> f64 {
    sensors
        .map(|list| list.iter().map(|s| mean_of(means, s.id)).sum())
        .unwrap_or(0.0)
}

fn mean_of(means: &HashMap<SensorId, Option<f64>>, sensor: SensorId) -> f64 {
    means.get(&sensor).copied().flatten().unwrap_or(0.0)
}
