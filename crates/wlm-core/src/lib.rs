//! # wlm-core: Water Network Modeling Core
//!
//! Fundamental data structures for water-distribution leak analysis: the
//! tenanted data model, the hierarchical topology, and the repository seam
//! the rest of the workspace builds on.
//!
//! ## Design Philosophy
//!
//! Networks are modeled as **parent/child forests** rooted at MAINLINE
//! nodes:
//! - **Nodes**: Mainline, Junction, Branch, Household (closed enum)
//! - **Edges**: the child relation, water flowing parent → child
//! - **DMAs**: one partition per mainline, owning its subtree
//!
//! The hierarchy lives in a petgraph `DiGraph` with a secondary `parent_of`
//! map, which keeps downward BFS and upward mainline walks independent.
//! Both traversals treat any revisit as a cycle and fail loudly; the
//! parent relation must stay a forest.
//!
//! ## Quick Start
//!
//! ```rust
//! use wlm_core::*;
//!
//! let network_id = NetworkId::new();
//! let mainline = NetworkNode::new(network_id, "M1", NodeKind::Mainline);
//! let branch = NetworkNode::new(network_id, "B1", NodeKind::Branch)
//!     .with_parent(mainline.id);
//! let house = NetworkNode::new(network_id, "H1", NodeKind::Household)
//!     .with_parent(branch.id);
//!
//! let mainline_id = mainline.id;
//! let topology =
//!     Topology::from_nodes(network_id, vec![mainline, branch, house]).unwrap();
//! let dma = topology.dma_members(mainline_id).unwrap();
//! assert_eq!(dma.len(), 3);
//! ```
//!
//! ## Modules
//!
//! - [`model`] - Entities, typed ids, detection lifecycle
//! - [`topology`] - Hierarchy traversal, DMA membership, validation
//! - [`store`] - Async repository traits and the in-memory backing
//! - [`error`] - Unified [`WlmError`] / [`WlmResult`]
//!
//! ## Integration
//!
//! `wlm-io` constructs node batches from EPANET `.inp` files; `wlm-sim`
//! solves the hydraulics; `wlm-algo` runs sensitivity, detection, and
//! localization on top of the [`store::Stores`] bundle.

pub mod error;
pub mod model;
pub mod store;
pub mod topology;

pub use error::{WlmError, WlmResult};
pub use model::{
    DetectionId, DetectionStatus, LeakDetection, LeakSeverity, Network, NetworkId, NetworkNode,
    NodeId, NodeKind, Partition, PartitionId, Reading, ReadingId, ReadingSource, Sensor,
    SensorId, SensorKind, SensitivityEntry,
};
pub use store::{
    DetectionRepository, MemoryStore, NetworkRepository, NodeRepository, PartitionRepository,
    ReadingRepository, SensitivityRepository, SensorRepository, Stores,
};
pub use topology::{missing_dmas, Topology, TopologyIssue, TopologyStats};
