//! Core data model for water-network leak analysis.
//!
//! Every entity carries an opaque unique id (uuid newtype) and is tenanted
//! by a `NetworkId`. Node and sensor kinds are closed enums so dispatch over
//! them is totality-checked at compile time. The [`LeakDetection`] struct
//! owns its status lifecycle; all transitions go through methods that reject
//! illegal moves with [`WlmError::Conflict`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{WlmError, WlmResult};

// Newtype wrappers for IDs for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(Uuid);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(Uuid);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(Uuid);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadingId(Uuid);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionId(Uuid);

macro_rules! impl_id {
    ($name:ident) => {
        impl $name {
            /// Mint a fresh random id.
            #[inline]
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }
            /// The all-zero id; sorts before every minted id.
            #[inline]
            pub const fn nil() -> Self {
                $name(Uuid::nil())
            }
            #[inline]
            pub fn value(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

impl_id!(NetworkId);
impl_id!(NodeId);
impl_id!(PartitionId);
impl_id!(SensorId);
impl_id!(ReadingId);
impl_id!(DetectionId);

/// Hierarchy role of a network node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    /// Root of a DMA subtree; water enters the hierarchy here
    Mainline,
    /// Pass-through segment with a single downstream continuation
    Branch,
    /// Internal split point with multiple children
    Junction,
    /// Consumption endpoint
    Household,
}

impl NodeKind {
    /// True for kinds that can host a synthetic leak candidate.
    pub fn is_leak_candidate(&self) -> bool {
        !matches!(self, NodeKind::Mainline)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            NodeKind::Mainline => "MAINLINE",
            NodeKind::Branch => "BRANCH",
            NodeKind::Junction => "JUNCTION",
            NodeKind::Household => "HOUSEHOLD",
        };
        f.write_str(label)
    }
}

/// Flow-meter placement class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorKind {
    MainlineFlow,
    BranchJunctionFlow,
    HouseholdFlow,
}

/// Origin of a stored reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadingSource {
    Sensor,
    Manual,
    Simulated,
}

/// Severity band assigned to a detection at create time; immutable after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeakSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl LeakSeverity {
    /// Map a positive imbalance (L/s) onto the severity table.
    ///
    /// Callers only reach this once `imbalance > threshold`, so everything at
    /// or below 10 L/s lands in `Low`.
    pub fn from_imbalance(imbalance_lps: f64) -> Self {
        if imbalance_lps > 50.0 {
            LeakSeverity::Critical
        } else if imbalance_lps > 20.0 {
            LeakSeverity::High
        } else if imbalance_lps > 10.0 {
            LeakSeverity::Medium
        } else {
            LeakSeverity::Low
        }
    }
}

impl std::fmt::Display for LeakSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LeakSeverity::Low => "LOW",
            LeakSeverity::Medium => "MEDIUM",
            LeakSeverity::High => "HIGH",
            LeakSeverity::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// Lifecycle state of a leak detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionStatus {
    Detected,
    Confirmed,
    Localized,
    Resolved,
    FalsePositive,
}

/// Logical container tenanting every other entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub id: NetworkId,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Network {
    pub fn new(name: Option<String>) -> Self {
        Self {
            id: NetworkId::new(),
            name,
            created_at: Utc::now(),
        }
    }
}

/// Vertex in the network hierarchy.
///
/// `label` is the human-facing node id from the source file; `epanet_id` is
/// the id under which the hydraulic engine knows this node, absent for nodes
/// that only exist in the logical hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkNode {
    pub id: NodeId,
    pub network_id: NetworkId,
    pub label: String,
    pub kind: NodeKind,
    pub parent_id: Option<NodeId>,
    pub epanet_id: Option<String>,
    pub location: Option<(f64, f64)>,
}

impl NetworkNode {
    pub fn new(network_id: NetworkId, label: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: NodeId::new(),
            network_id,
            label: label.into(),
            kind,
            parent_id: None,
            epanet_id: None,
            location: None,
        }
    }

    pub fn with_parent(mut self, parent: NodeId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn with_epanet_id(mut self, epanet_id: impl Into<String>) -> Self {
        self.epanet_id = Some(epanet_id.into());
        self
    }

    pub fn with_location(mut self, x: f64, y: f64) -> Self {
        self.location = Some((x, y));
        self
    }
}

/// District Metered Area: owns the subtree rooted at one mainline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    pub id: PartitionId,
    pub network_id: NetworkId,
    pub label: String,
    pub mainline_id: NodeId,
}

impl Partition {
    /// DMA label convention derived from the owning mainline's label.
    pub fn label_for_mainline(mainline_label: &str) -> String {
        format!("DMA_{mainline_label}")
    }

    pub fn new(network_id: NetworkId, mainline_id: NodeId, mainline_label: &str) -> Self {
        Self {
            id: PartitionId::new(),
            network_id,
            label: Self::label_for_mainline(mainline_label),
            mainline_id,
        }
    }
}

/// Flow meter attached to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    pub id: SensorId,
    pub network_id: NetworkId,
    pub label: String,
    pub kind: SensorKind,
    pub node_id: NodeId,
    pub partition_id: Option<PartitionId>,
    pub is_active: bool,
}

impl Sensor {
    pub fn new(
        network_id: NetworkId,
        label: impl Into<String>,
        kind: SensorKind,
        node_id: NodeId,
    ) -> Self {
        Self {
            id: SensorId::new(),
            network_id,
            label: label.into(),
            kind,
            node_id,
            partition_id: None,
            is_active: true,
        }
    }

    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition_id = Some(partition);
        self
    }
}

/// A time-stamped flow sample in litres per second.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub id: ReadingId,
    pub network_id: NetworkId,
    pub sensor_id: SensorId,
    pub flow_lps: f64,
    pub timestamp: DateTime<Utc>,
    pub source: ReadingSource,
}

impl Reading {
    pub fn new(
        network_id: NetworkId,
        sensor_id: SensorId,
        flow_lps: f64,
        timestamp: DateTime<Utc>,
        source: ReadingSource,
    ) -> Self {
        Self {
            id: ReadingId::new(),
            network_id,
            sensor_id,
            flow_lps,
            timestamp,
            source,
        }
    }
}

/// One cell of the sensitivity matrix: dimensionless ΔFlow/ΔLeak for a
/// (candidate leak node, sensor) pair. Keyed uniquely by
/// `(network_id, leak_node_id, sensor_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitivityEntry {
    pub network_id: NetworkId,
    pub leak_node_id: NodeId,
    pub sensor_id: SensorId,
    pub value: f64,
}

/// A detected mass-balance violation with its localization lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakDetection {
    pub id: DetectionId,
    pub network_id: NetworkId,
    /// Node the imbalance was computed at (the DMA's mainline for DMA scope)
    pub node_id: NodeId,
    pub partition_id: Option<PartitionId>,
    /// inflow − outflow over the detection window, L/s
    pub flow_imbalance: f64,
    pub severity: LeakSeverity,
    pub status: DetectionStatus,
    pub detected_at: DateTime<Utc>,
    /// Analysis instant the window ends at
    pub timestamp: DateTime<Utc>,
    pub time_window_secs: Option<i64>,
    pub threshold: Option<f64>,
    pub localized_node_id: Option<NodeId>,
    pub localization_score: Option<f64>,
    pub localized_at: Option<DateTime<Utc>>,
}

impl LeakDetection {
    /// Create a fresh detection in `Detected` state; severity is fixed here
    /// and never reassigned.
    pub fn new(
        network_id: NetworkId,
        node_id: NodeId,
        partition_id: Option<PartitionId>,
        flow_imbalance: f64,
        timestamp: DateTime<Utc>,
        time_window_secs: i64,
        threshold: f64,
    ) -> Self {
        Self {
            id: DetectionId::new(),
            network_id,
            node_id,
            partition_id,
            flow_imbalance,
            severity: LeakSeverity::from_imbalance(flow_imbalance),
            status: DetectionStatus::Detected,
            detected_at: Utc::now(),
            timestamp,
            time_window_secs: Some(time_window_secs),
            threshold: Some(threshold),
            localized_node_id: None,
            localization_score: None,
            localized_at: None,
        }
    }

    /// Detection window length, falling back to the 300 s default.
    pub fn window_secs(&self) -> i64 {
        self.time_window_secs.unwrap_or(300)
    }

    /// Record a localization result. Only legal from `Detected`.
    pub fn mark_localized(
        &mut self,
        node: NodeId,
        score: f64,
        at: DateTime<Utc>,
    ) -> WlmResult<()> {
        if self.status != DetectionStatus::Detected {
            return Err(WlmError::Conflict(format!(
                "detection {} cannot be localized from status {:?}",
                self.id, self.status
            )));
        }
        self.status = DetectionStatus::Localized;
        self.localized_node_id = Some(node);
        self.localization_score = Some(score);
        self.localized_at = Some(at);
        Ok(())
    }

    /// Operator confirmation. Only legal from `Detected`.
    pub fn confirm(&mut self) -> WlmResult<()> {
        if self.status != DetectionStatus::Detected {
            return Err(WlmError::Conflict(format!(
                "detection {} cannot be confirmed from status {:?}",
                self.id, self.status
            )));
        }
        self.status = DetectionStatus::Confirmed;
        Ok(())
    }

    /// Close out the detection; legal from any state.
    pub fn resolve(&mut self) {
        self.status = DetectionStatus::Resolved;
    }

    /// Dismiss as a false positive; legal from any state.
    pub fn reject(&mut self) {
        self.status = DetectionStatus::FalsePositive;
    }
}
