//! Repository abstraction over the data model.
//!
//! Persistence proper (database, migrations) is an external collaborator;
//! these traits are the seam it plugs into. Each aggregate gets a small
//! async trait, and [`Stores`] bundles trait objects so orchestration code
//! takes one handle. [`MemoryStore`] implements every trait over tokio
//! `RwLock` maps and backs the CLI and the test suites.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{WlmError, WlmResult};
use crate::model::{
    DetectionId, LeakDetection, Network, NetworkId, NetworkNode, NodeId, Partition, PartitionId,
    Reading, Sensor, SensorId, SensitivityEntry,
};
use crate::topology::Topology;

#[async_trait]
pub trait NetworkRepository: Send + Sync {
    async fn insert_network(&self, network: Network) -> WlmResult<()>;
    async fn network(&self, id: NetworkId) -> WlmResult<Option<Network>>;
}

#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// Insert a batch of nodes. Duplicate `(network_id, label)` pairs,
    /// against stored nodes or within the batch, fail with `Conflict` and
    /// nothing is written.
    async fn insert_nodes(&self, nodes: Vec<NetworkNode>) -> WlmResult<()>;
    /// All nodes of a network in ascending label order.
    async fn nodes_of(&self, network: NetworkId) -> WlmResult<Vec<NetworkNode>>;
    async fn node(&self, id: NodeId) -> WlmResult<Option<NetworkNode>>;
    async fn node_by_label(&self, network: NetworkId, label: &str)
        -> WlmResult<Option<NetworkNode>>;
}

#[async_trait]
pub trait PartitionRepository: Send + Sync {
    /// Insert one partition; a second partition for the same mainline is a
    /// `Conflict`.
    async fn insert_partition(&self, partition: Partition) -> WlmResult<()>;
    async fn partitions_of(&self, network: NetworkId) -> WlmResult<Vec<Partition>>;
    async fn partition(&self, id: PartitionId) -> WlmResult<Option<Partition>>;
}

#[async_trait]
pub trait SensorRepository: Send + Sync {
    /// Insert one sensor; duplicate `(network_id, label)` is a `Conflict`.
    async fn insert_sensor(&self, sensor: Sensor) -> WlmResult<()>;
    async fn sensors_of(&self, network: NetworkId) -> WlmResult<Vec<Sensor>>;
    async fn active_sensors_of(&self, network: NetworkId) -> WlmResult<Vec<Sensor>>;
    async fn sensor(&self, id: SensorId) -> WlmResult<Option<Sensor>>;
    async fn sensor_by_label(&self, network: NetworkId, label: &str)
        -> WlmResult<Option<Sensor>>;
}

#[async_trait]
pub trait ReadingRepository: Send + Sync {
    /// Append a batch of readings; returns the stored count.
    async fn insert_readings(&self, readings: Vec<Reading>) -> WlmResult<usize>;
    /// Readings of one sensor with `from ≤ t ≤ to` (`include_end`) or
    /// `from ≤ t < to`, in timestamp order.
    async fn readings_window(
        &self,
        sensor: SensorId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        include_end: bool,
    ) -> WlmResult<Vec<Reading>>;
}

#[async_trait]
pub trait SensitivityRepository: Send + Sync {
    /// Upsert a batch keyed by `(network_id, leak_node_id, sensor_id)`.
    async fn upsert_entries(&self, entries: Vec<SensitivityEntry>) -> WlmResult<()>;
    async fn entries_of(&self, network: NetworkId) -> WlmResult<Vec<SensitivityEntry>>;
    async fn entry_count(&self, network: NetworkId) -> WlmResult<usize>;
    async fn has_entries(&self, network: NetworkId) -> WlmResult<bool>;
}

#[async_trait]
pub trait DetectionRepository: Send + Sync {
    async fn insert_detection(&self, detection: LeakDetection) -> WlmResult<()>;
    async fn detection(&self, id: DetectionId) -> WlmResult<Option<LeakDetection>>;
    /// Replace a stored detection; `NotFound` when it was never inserted.
    async fn update_detection(&self, detection: LeakDetection) -> WlmResult<()>;
    async fn detections_of(&self, network: NetworkId) -> WlmResult<Vec<LeakDetection>>;
}

/// Bundle of repository handles passed through the engines.
#[derive(Clone)]
pub struct Stores {
    pub networks: Arc<dyn NetworkRepository>,
    pub nodes: Arc<dyn NodeRepository>,
    pub partitions: Arc<dyn PartitionRepository>,
    pub sensors: Arc<dyn SensorRepository>,
    pub readings: Arc<dyn ReadingRepository>,
    pub sensitivity: Arc<dyn SensitivityRepository>,
    pub detections: Arc<dyn DetectionRepository>,
}

impl Stores {
    /// All repositories backed by one shared [`MemoryStore`].
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::default());
        Self {
            networks: store.clone(),
            nodes: store.clone(),
            partitions: store.clone(),
            sensors: store.clone(),
            readings: store.clone(),
            sensitivity: store.clone(),
            detections: store,
        }
    }

    /// Load the full hierarchy of a network into a [`Topology`].
    pub async fn topology(&self, network: NetworkId) -> WlmResult<Topology> {
        let nodes = self.nodes.nodes_of(network).await?;
        Topology::from_nodes(network, nodes)
    }

    /// Partition a sensor reports under: its explicit assignment, or the
    /// DMA of the nearest mainline above its host node.
    pub async fn sensor_partition(&self, sensor: &Sensor) -> WlmResult<Option<PartitionId>> {
        if sensor.partition_id.is_some() {
            return Ok(sensor.partition_id);
        }
        let topology = self.topology(sensor.network_id).await?;
        let Some(mainline) = topology.find_mainline_for(sensor.node_id)? else {
            return Ok(None);
        };
        let partitions = self.partitions.partitions_of(sensor.network_id).await?;
        Ok(partitions
            .into_iter()
            .find(|p| p.mainline_id == mainline)
            .map(|p| p.id))
    }

    /// Node ids of the subtree owned by a partition (§4.A `nodes_in_dma`).
    pub async fn nodes_in_dma(&self, partition: PartitionId) -> WlmResult<HashSet<NodeId>> {
        let partition = self
            .partitions
            .partition(partition)
            .await?
            .ok_or_else(|| WlmError::NotFound(format!("partition {partition}")))?;
        let topology = self.topology(partition.network_id).await?;
        topology.dma_members(partition.mainline_id)
    }
}
