//! # wlm-algo: Leak Analysis Algorithms
//!
//! The three numerical subsystems of the leak platform, plus sensor
//! placement:
//!
//! - [`sensitivity`] - O(N) leak-simulation fan-out producing the
//!   candidate × sensor sensitivity matrix, with process-wide build status
//! - [`massbalance`] - time-windowed conservation checks yielding
//!   [`wlm_core::LeakDetection`] records
//! - [`localize`] - inverse-problem scoring of candidates against the
//!   observed sensor-change vector
//! - [`placement`] - greedy deterministic sensor auto-placement
//!
//! All components operate over the [`wlm_core::Stores`] repository bundle
//! and never talk to the hydraulic engine except through
//! [`wlm_sim::SimulatorAdapter`].

pub mod localize;
pub mod massbalance;
pub mod placement;
pub mod sensitivity;

pub use localize::{
    CandidateScore, LocalizationOutcome, Localizer, DEFAULT_BASELINE_WINDOW_SECS,
    TOP_CANDIDATES,
};
pub use massbalance::{
    DetectionRequest, MassBalanceDetector, DEFAULT_THRESHOLD_LPS, DEFAULT_WINDOW_SECS,
};
pub use placement::{PlacementReport, SensorPlanner, DEFAULT_TARGET_COUNT, MAX_TARGET_COUNT};
pub use sensitivity::{
    BuildCoordinator, BuildProgress, BuildState, MatrixBuildStatus, MatrixStats,
    SensitivityEngine, SensitivityMatrix, PARALLEL_SIMULATIONS, PERSIST_BATCH_SIZE,
    UNIT_LEAK_LPS,
};
