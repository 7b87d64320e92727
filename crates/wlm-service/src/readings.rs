//! Sensor reading ingestion.
//!
//! Readings arrive labelled by sensor; ingestion resolves labels against
//! the sensor registry up front and is all-or-nothing: one unknown label
//! aborts the whole batch with every missing label listed.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use wlm_core::{NetworkId, Reading, ReadingSource, Stores, WlmError, WlmResult};

/// One incoming reading, as hosts submit it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingInput {
    /// Sensor label (`sensor_id` in the wire model)
    pub sensor_id: String,
    /// Flow in L/s
    pub flow_value: f64,
    /// Falls back to the batch timestamp when absent
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ReadingInput {
    pub fn new(sensor_id: impl Into<String>, flow_value: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            flow_value,
            timestamp: None,
        }
    }
}

/// Batch ingestion over the repositories.
pub struct ReadingService {
    stores: Stores,
}

impl ReadingService {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Resolve and store a batch. Fails `InvalidInput` on an empty batch
    /// and `NotFound` (listing all offenders) when any label is unknown.
    pub async fn ingest_batch(
        &self,
        network: NetworkId,
        batch_timestamp: DateTime<Utc>,
        inputs: &[ReadingInput],
        source: ReadingSource,
    ) -> WlmResult<Vec<Reading>> {
        if inputs.is_empty() {
            return Err(WlmError::InvalidInput("readings batch is empty".into()));
        }

        let mut missing = Vec::new();
        let mut readings = Vec::with_capacity(inputs.len());
        for input in inputs {
            match self
                .stores
                .sensors
                .sensor_by_label(network, &input.sensor_id)
                .await?
            {
                Some(sensor) => readings.push(Reading::new(
                    network,
                    sensor.id,
                    input.flow_value,
                    input.timestamp.unwrap_or(batch_timestamp),
                    source,
                )),
                None => missing.push(input.sensor_id.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(WlmError::NotFound(format!(
                "sensors not found: {}",
                missing.join(", ")
            )));
        }

        let count = self.stores.readings.insert_readings(readings.clone()).await?;
        debug!(network = %network, count, "readings stored");
        Ok(readings)
    }
}
