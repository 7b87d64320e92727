//! Dense sensitivity matrix with id-indexed access.
//!
//! The persisted form is the sparse entry table keyed
//! `(network, leak_node, sensor)`; this view materializes it as a dense
//! candidates × sensors array for scoring. Row and column orders are the
//! sorted id orders, so two materializations of the same entries are
//! identical.

use std::collections::HashMap;

use wlm_core::{NodeId, SensorId, SensitivityEntry};

/// Sensitivity of every sensor to a unit leak at every candidate node.
#[derive(Debug, Clone)]
pub struct SensitivityMatrix {
    /// Row index → candidate leak node
    pub leak_node_ids: Vec<NodeId>,
    /// Column index → sensor
    pub sensor_ids: Vec<SensorId>,
    /// values[row][col] = ΔFlow/ΔLeak, dimensionless
    pub values: Vec<Vec<f64>>,
    node_to_row: HashMap<NodeId, usize>,
    sensor_to_col: HashMap<SensorId, usize>,
}

impl SensitivityMatrix {
    /// Materialize from persisted entries. Missing pairs default to zero.
    pub fn from_entries(entries: &[SensitivityEntry]) -> Self {
        let mut leak_node_ids: Vec<NodeId> =
            entries.iter().map(|e| e.leak_node_id).collect();
        leak_node_ids.sort();
        leak_node_ids.dedup();

        let mut sensor_ids: Vec<SensorId> = entries.iter().map(|e| e.sensor_id).collect();
        sensor_ids.sort();
        sensor_ids.dedup();

        let node_to_row: HashMap<NodeId, usize> = leak_node_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        let sensor_to_col: HashMap<SensorId, usize> = sensor_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();

        let mut values = vec![vec![0.0; sensor_ids.len()]; leak_node_ids.len()];
        for entry in entries {
            let row = node_to_row[&entry.leak_node_id];
            let col = sensor_to_col[&entry.sensor_id];
            values[row][col] = entry.value;
        }

        Self {
            leak_node_ids,
            sensor_ids,
            values,
            node_to_row,
            sensor_to_col,
        }
    }

    /// Sensitivity for a (candidate, sensor) pair.
    pub fn get(&self, node: NodeId, sensor: SensorId) -> Option<f64> {
        let row = self.node_to_row.get(&node)?;
        let col = self.sensor_to_col.get(&sensor)?;
        Some(self.values[*row][*col])
    }

    /// Full row of one candidate, ordered like [`Self::sensor_ids`].
    pub fn row(&self, node: NodeId) -> Option<&[f64]> {
        self.node_to_row
            .get(&node)
            .map(|row| self.values[*row].as_slice())
    }

    pub fn num_candidates(&self) -> usize {
        self.leak_node_ids.len()
    }

    pub fn num_sensors(&self) -> usize {
        self.sensor_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leak_node_ids.is_empty() || self.sensor_ids.is_empty()
    }

    pub fn sensor_index(&self, sensor: SensorId) -> Option<usize> {
        self.sensor_to_col.get(&sensor).copied()
    }
}
