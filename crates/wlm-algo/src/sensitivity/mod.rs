//! Sensitivity matrix generation and access.
//!
//! For every candidate leak node the engine runs one leak-perturbed
//! steady-state simulation against the stored network file and records, per
//! sensor, the dimensionless flow change a unit leak produces. The entries
//! persist sparsely (unique-keyed, order-independent) and materialize as a
//! dense [`SensitivityMatrix`] for scoring.

mod builder;
mod matrix;
mod status;

pub use builder::{
    SensitivityEngine, PARALLEL_SIMULATIONS, PERSIST_BATCH_SIZE, UNIT_LEAK_LPS,
};
pub use matrix::SensitivityMatrix;
pub use status::{BuildCoordinator, BuildProgress, BuildState, MatrixBuildStatus, MatrixStats};
