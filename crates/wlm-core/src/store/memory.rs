//! In-memory repository backing for tests, the CLI, and single-process use.
//!
//! State lives in `tokio::sync::RwLock`-guarded maps. Readings are held in a
//! per-sensor `BTreeMap` keyed `(timestamp, reading_id)` so window queries
//! are ordered range scans, matching the `(sensor_id, timestamp)` index the
//! data model calls for.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

use super::{
    DetectionRepository, NetworkRepository, NodeRepository, PartitionRepository,
    ReadingRepository, SensitivityRepository, SensorRepository,
};
use crate::error::{WlmError, WlmResult};
use crate::model::{
    DetectionId, LeakDetection, Network, NetworkId, NetworkNode, NodeId, Partition, PartitionId,
    Reading, ReadingId, Sensor, SensorId, SensitivityEntry,
};

type ReadingKey = (DateTime<Utc>, ReadingId);

#[derive(Default)]
pub struct MemoryStore {
    networks: RwLock<HashMap<NetworkId, Network>>,
    nodes: RwLock<HashMap<NodeId, NetworkNode>>,
    node_labels: RwLock<HashMap<(NetworkId, String), NodeId>>,
    partitions: RwLock<HashMap<PartitionId, Partition>>,
    sensors: RwLock<HashMap<SensorId, Sensor>>,
    sensor_labels: RwLock<HashMap<(NetworkId, String), SensorId>>,
    readings: RwLock<HashMap<SensorId, BTreeMap<ReadingKey, Reading>>>,
    sensitivity: RwLock<HashMap<(NetworkId, NodeId, SensorId), SensitivityEntry>>,
    detections: RwLock<HashMap<DetectionId, LeakDetection>>,
}

#[async_trait]
impl NetworkRepository for MemoryStore {
    async fn insert_network(&self, network: Network) -> WlmResult<()> {
        self.networks.write().await.insert(network.id, network);
        Ok(())
    }

    async fn network(&self, id: NetworkId) -> WlmResult<Option<Network>> {
        Ok(self.networks.read().await.get(&id).cloned())
    }
}

#[async_trait]
impl NodeRepository for MemoryStore {
    async fn insert_nodes(&self, batch: Vec<NetworkNode>) -> WlmResult<()> {
        let mut labels = self.node_labels.write().await;
        let mut seen: HashSet<(NetworkId, String)> = HashSet::new();
        for node in &batch {
            let key = (node.network_id, node.label.clone());
            if labels.contains_key(&key) || !seen.insert(key) {
                return Err(WlmError::Conflict(format!(
                    "node label '{}' already exists in network {}",
                    node.label, node.network_id
                )));
            }
        }
        let mut nodes = self.nodes.write().await;
        for node in batch {
            labels.insert((node.network_id, node.label.clone()), node.id);
            nodes.insert(node.id, node);
        }
        Ok(())
    }

    async fn nodes_of(&self, network: NetworkId) -> WlmResult<Vec<NetworkNode>> {
        let mut nodes: Vec<NetworkNode> = self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.network_id == network)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(nodes)
    }

    async fn node(&self, id: NodeId) -> WlmResult<Option<NetworkNode>> {
        Ok(self.nodes.read().await.get(&id).cloned())
    }

    async fn node_by_label(
        &self,
        network: NetworkId,
        label: &str,
    ) -> WlmResult<Option<NetworkNode>> {
        let id = self
            .node_labels
            .read()
            .await
            .get(&(network, label.to_string()))
            .copied();
        match id {
            Some(id) => self.node(id).await,
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PartitionRepository for MemoryStore {
    async fn insert_partition(&self, partition: Partition) -> WlmResult<()> {
        let mut partitions = self.partitions.write().await;
        let duplicate = partitions.values().any(|p| {
            p.network_id == partition.network_id
                && (p.mainline_id == partition.mainline_id || p.label == partition.label)
        });
        if duplicate {
            return Err(WlmError::Conflict(format!(
                "partition '{}' or its mainline already registered in network {}",
                partition.label, partition.network_id
            )));
        }
        partitions.insert(partition.id, partition);
        Ok(())
    }

    async fn partitions_of(&self, network: NetworkId) -> WlmResult<Vec<Partition>> {
        let mut partitions: Vec<Partition> = self
            .partitions
            .read()
            .await
            .values()
            .filter(|p| p.network_id == network)
            .cloned()
            .collect();
        partitions.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(partitions)
    }

    async fn partition(&self, id: PartitionId) -> WlmResult<Option<Partition>> {
        Ok(self.partitions.read().await.get(&id).cloned())
    }
}

#[async_trait]
impl SensorRepository for MemoryStore {
    async fn insert_sensor(&self, sensor: Sensor) -> WlmResult<()> {
        let mut labels = self.sensor_labels.write().await;
        let key = (sensor.network_id, sensor.label.clone());
        if labels.contains_key(&key) {
            return Err(WlmError::Conflict(format!(
                "sensor label '{}' already exists in network {}",
                sensor.label, sensor.network_id
            )));
        }
        labels.insert(key, sensor.id);
        self.sensors.write().await.insert(sensor.id, sensor);
        Ok(())
    }

    async fn sensors_of(&self, network: NetworkId) -> WlmResult<Vec<Sensor>> {
        let mut sensors: Vec<Sensor> = self
            .sensors
            .read()
            .await
            .values()
            .filter(|s| s.network_id == network)
            .cloned()
            .collect();
        sensors.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(sensors)
    }

    async fn active_sensors_of(&self, network: NetworkId) -> WlmResult<Vec<Sensor>> {
        Ok(self
            .sensors_of(network)
            .await?
            .into_iter()
            .filter(|s| s.is_active)
            .collect())
    }

    async fn sensor(&self, id: SensorId) -> WlmResult<Option<Sensor>> {
        Ok(self.sensors.read().await.get(&id).cloned())
    }

    async fn sensor_by_label(
        &self,
        network: NetworkId,
        label: &str,
    ) -> WlmResult<Option<Sensor>> {
        let id = self
            .sensor_labels
            .read()
            .await
            .get(&(network, label.to_string()))
            .copied();
        match id {
            Some(id) => self.sensor(id).await,
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ReadingRepository for MemoryStore {
    async fn insert_readings(&self, batch: Vec<Reading>) -> WlmResult<usize> {
        let mut readings = self.readings.write().await;
        let count = batch.len();
        for reading in batch {
            readings
                .entry(reading.sensor_id)
                .or_default()
                .insert((reading.timestamp, reading.id), reading);
        }
        Ok(count)
    }

    async fn readings_window(
        &self,
        sensor: SensorId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        include_end: bool,
    ) -> WlmResult<Vec<Reading>> {
        let readings = self.readings.read().await;
        let Some(per_sensor) = readings.get(&sensor) else {
            return Ok(Vec::new());
        };
        let result = per_sensor
            .range((from, ReadingId::nil())..)
            .take_while(|((t, _), _)| if include_end { *t <= to } else { *t < to })
            .map(|(_, r)| r.clone())
            .collect();
        Ok(result)
    }
}

#[async_trait]
impl SensitivityRepository for MemoryStore {
    async fn upsert_entries(&self, entries: Vec<SensitivityEntry>) -> WlmResult<()> {
        let mut sensitivity = self.sensitivity.write().await;
        for entry in entries {
            let key = (entry.network_id, entry.leak_node_id, entry.sensor_id);
            sensitivity.insert(key, entry);
        }
        Ok(())
    }

    async fn entries_of(&self, network: NetworkId) -> WlmResult<Vec<SensitivityEntry>> {
        let mut entries: Vec<SensitivityEntry> = self
            .sensitivity
            .read()
            .await
            .values()
            .filter(|e| e.network_id == network)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            (a.leak_node_id, a.sensor_id).cmp(&(b.leak_node_id, b.sensor_id))
        });
        Ok(entries)
    }

    async fn entry_count(&self, network: NetworkId) -> WlmResult<usize> {
        Ok(self
            .sensitivity
            .read()
            .await
            .values()
            .filter(|e| e.network_id == network)
            .count())
    }

    async fn has_entries(&self, network: NetworkId) -> WlmResult<bool> {
        Ok(self
            .sensitivity
            .read()
            .await
            .values()
            .any(|e| e.network_id == network))
    }
}

#[async_trait]
impl DetectionRepository for MemoryStore {
    async fn insert_detection(&self, detection: LeakDetection) -> WlmResult<()> {
        self.detections
            .write()
            .await
            .insert(detection.id, detection);
        Ok(())
    }

    async fn detection(&self, id: DetectionId) -> WlmResult<Option<LeakDetection>> {
        Ok(self.detections.read().await.get(&id).cloned())
    }

    async fn update_detection(&self, detection: LeakDetection) -> WlmResult<()> {
        let mut detections = self.detections.write().await;
        if !detections.contains_key(&detection.id) {
            return Err(WlmError::NotFound(format!("detection {}", detection.id)));
        }
        detections.insert(detection.id, detection);
        Ok(())
    }

    async fn detections_of(&self, network: NetworkId) -> WlmResult<Vec<LeakDetection>> {
        let mut detections: Vec<LeakDetection> = self
            .detections
            .read()
            .await
            .values()
            .filter(|d| d.network_id == network)
            .cloned()
            .collect();
        detections.sort_by_key(|d| (d.detected_at, d.id));
        Ok(detections)
    }
}
